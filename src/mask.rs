//! 注意力掩码
//!
//! 掩码形状为 [B, Q, S]：`B` 为 1 或 batch，`Q` 为 1 或 query 长度，`S` 必须等于 key 长度。
//! `true` 表示允许关注，`false` 表示屏蔽。

use ndarray::{Array2, Array3};

use crate::error::{ModelError, Result};

/// 可广播到 [batch, heads, seq_q, seq_k] 的布尔掩码
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionMask {
    mask: Array3<bool>,
}

impl AttentionMask {
    /// 从 [B, Q, S] 布尔数组创建掩码
    pub fn new(mask: Array3<bool>) -> Self {
        Self { mask }
    }

    /// 全部允许的掩码 [batch, 1, seq_len]
    pub fn all(batch: usize, seq_len: usize) -> Self {
        Self::new(Array3::from_elem((batch, 1, seq_len), true))
    }

    /// 填充掩码：每个样本只允许关注前 `lengths[b]` 个位置
    ///
    /// 返回形状 [batch, 1, seq_len]
    pub fn padding(lengths: &[usize], seq_len: usize) -> Self {
        let mask = Array3::from_shape_fn((lengths.len(), 1, seq_len), |(b, _, j)| j < lengths[b]);
        Self::new(mask)
    }

    /// 根据填充 token 构建掩码：等于 `pad_id` 的 key 位置被屏蔽
    pub fn from_tokens(tokens: &Array2<usize>, pad_id: usize) -> Self {
        let (batch, seq_len) = tokens.dim();
        let mask = Array3::from_shape_fn((batch, 1, seq_len), |(b, _, j)| tokens[[b, j]] != pad_id);
        Self::new(mask)
    }

    /// 掩码形状
    pub fn shape(&self) -> (usize, usize, usize) {
        self.mask.dim()
    }

    /// 检查掩码能否广播到 [batch, heads, seq_q, seq_k]
    pub fn check(&self, batch: usize, seq_q: usize, seq_k: usize) -> Result<()> {
        let (b, q, s) = self.mask.dim();
        let batch_ok = b == 1 || b == batch;
        let query_ok = q == 1 || q == seq_q;

        if batch_ok && query_ok && s == seq_k {
            Ok(())
        } else {
            Err(ModelError::dims("attention mask", &[batch, seq_q, seq_k], &[b, q, s]))
        }
    }

    /// 第 `b` 个样本中 query `i` 是否可以关注 key `j`（按广播规则取值）
    ///
    /// 调用前需要先通过 [`AttentionMask::check`]。
    pub fn allows(&self, b: usize, i: usize, j: usize) -> bool {
        let (mb, mq, _) = self.mask.dim();
        let b = if mb == 1 { 0 } else { b };
        let i = if mq == 1 { 0 } else { i };
        self.mask[[b, i, j]]
    }

    /// 是否所有位置都允许关注
    pub fn is_all_true(&self) -> bool {
        self.mask.iter().all(|&m| m)
    }

    pub fn as_array(&self) -> &Array3<bool> {
        &self.mask
    }
}

impl From<Array3<bool>> for AttentionMask {
    fn from(mask: Array3<bool>) -> Self {
        Self::new(mask)
    }
}
