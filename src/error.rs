//! 错误类型
//!
//! 所有调用边界上的检查都返回 [`ModelError`]，不会因为调用方输入不合法而 panic。

use thiserror::Error;

/// 模型和检索器的错误类型
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ModelError {
    /// 配置错误：维度为 0、d_model 不能被头数整除、dropout 概率越界等
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// 张量或掩码形状不兼容
    #[error("Dimension mismatch in {context}: expected {expected:?}, got {got:?}")]
    DimensionMismatch {
        context: &'static str,
        expected: Vec<usize>,
        got: Vec<usize>,
    },

    /// 索引越界（token id、top-k 的 k 等）
    #[error("Range error: {what} = {value} is outside the valid range {valid}")]
    Range {
        what: &'static str,
        value: usize,
        valid: String,
    },

    /// 参数快照编码/解码失败
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl ModelError {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub(crate) fn dims(context: &'static str, expected: &[usize], got: &[usize]) -> Self {
        Self::DimensionMismatch {
            context,
            expected: expected.to_vec(),
            got: got.to_vec(),
        }
    }
}

impl From<serde_json::Error> for ModelError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<bincode::Error> for ModelError {
    fn from(e: bincode::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ModelError>;
