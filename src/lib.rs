//! # Mini RAG Transformer
//!
//! 一个从零实现的 Transformer 编码器，加上一个词袋文档检索器，
//! 组成检索增强生成 (RAG) 系统的核心。
//!
//! ## 架构概览
//!
//! ```text
//! Tokens → Embedding × √d_model → Positional Encoding → Dropout →
//!     [Transformer Encoder Layer × N] → Linear → Logits
//!     ├── Multi-Head Self-Attention
//!     ├── Add & Norm
//!     ├── Feed Forward Network
//!     └── Add & Norm
//!
//! Query → DocumentRetriever (cosine / bag-of-words) → Top-k documents
//! ```
//!
//! 训练/推理模式通过 [`Mode`] 显式传入每次前向计算，没有全局状态。
//! 核心不做文件 I/O，参数快照见 [`checkpoint`]。

pub mod error;
pub mod tensor;
pub mod mask;
pub mod layers;
pub mod checkpoint;
pub mod embedding;
pub mod attention;
pub mod transformer;
pub mod retriever;

pub use error::{ModelError, Result};
pub use tensor::TensorExt;
pub use mask::AttentionMask;
pub use layers::{Dropout, FeedForward, LayerNorm, Linear, Mode, ResidualNorm};
pub use checkpoint::{NamedTensor, ParameterSet, Parameterized, StateDict};
pub use embedding::{Embedding, InputEmbedding, PositionalEncoding};
pub use attention::{AttentionParams, MultiHeadAttention, MASK_SENTINEL};
pub use transformer::{EncoderLayer, EncoderOutput, TransformerConfig, TransformerEncoder};
pub use retriever::{DocumentRetriever, RetrievalHit, RetrievalIndex, Vocabulary};

/// 预设配置
pub mod configs {
    use super::TransformerConfig;

    /// 极小模型（单元测试、演示）
    pub fn tiny() -> TransformerConfig {
        TransformerConfig {
            vocab_size: 100,
            d_model: 16,
            n_heads: 2,
            n_layers: 2,
            d_ff: 32,
            max_seq_len: 32,
            dropout: 0.1,
            layer_norm_eps: 1e-6,
        }
    }

    /// 小型模型（用于快速测试）
    pub fn mini() -> TransformerConfig {
        TransformerConfig {
            vocab_size: 1000,
            d_model: 128,
            n_heads: 4,
            n_layers: 2,
            d_ff: 512,
            max_seq_len: 64,
            dropout: 0.1,
            layer_norm_eps: 1e-6,
        }
    }

    /// 基础模型，与 `TransformerConfig::default()` 相同
    pub fn base() -> TransformerConfig {
        TransformerConfig::default()
    }

}
