//! Multi-Head Attention
//!
//! Transformer 的核心组件：允许模型关注输入序列的不同位置。

use ndarray::{s, Array3, Array4, ArrayViewD, ArrayViewMutD, Zip};
use rand::Rng;

use crate::checkpoint::{param_name, Parameterized};
use crate::error::{ModelError, Result};
use crate::layers::{Dropout, Linear, Mode};
use crate::mask::AttentionMask;
use crate::tensor::TensorExt;

/// 被屏蔽位置的注意力分数
///
/// 使用有限的大负数而不是负无穷：整行都被屏蔽时 softmax 得到均匀分布，而不是 NaN。
pub const MASK_SENTINEL: f32 = -1e9;

/// Multi-Head Attention 参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AttentionParams {
    /// 模型维度
    pub d_model: usize,
    /// 注意力头数
    pub n_heads: usize,
    /// 每个头的维度
    pub d_k: usize,
}

impl AttentionParams {
    pub fn new(d_model: usize, n_heads: usize) -> Result<Self> {
        if d_model == 0 || n_heads == 0 {
            return Err(ModelError::config(format!(
                "d_model and n_heads must be positive, got d_model={} n_heads={}",
                d_model, n_heads
            )));
        }
        if d_model % n_heads != 0 {
            return Err(ModelError::config(format!(
                "d_model ({}) must be divisible by n_heads ({})",
                d_model, n_heads
            )));
        }

        Ok(Self {
            d_model,
            n_heads,
            d_k: d_model / n_heads,
        })
    }
}

/// Multi-Head Attention 层
///
/// 将注意力分成多个"头"，每个头在自己的表示子空间中计算缩放点积注意力。
///
/// ```text
/// Input → [Q, K, V] → Split into Heads →
///     [Scaled Dot-Product Attention × N] →
///     Concat Heads → Linear → Output
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MultiHeadAttention {
    params: AttentionParams,
    /// Query 投影: [d_model, d_model]
    w_q: Linear,
    /// Key 投影: [d_model, d_model]
    w_k: Linear,
    /// Value 投影: [d_model, d_model]
    w_v: Linear,
    /// 输出投影: [d_model, d_model]
    w_o: Linear,
    /// 作用在注意力权重上的 dropout
    dropout: Dropout,
}

impl MultiHeadAttention {
    /// 创建新的 Multi-Head Attention 层，投影矩阵使用 Xavier 初始化
    pub fn new<R: Rng + ?Sized>(
        d_model: usize,
        n_heads: usize,
        dropout: Dropout,
        rng: &mut R,
    ) -> Result<Self> {
        let params = AttentionParams::new(d_model, n_heads)?;

        Ok(Self {
            params,
            w_q: Linear::new(d_model, d_model, rng),
            w_k: Linear::new(d_model, d_model, rng),
            w_v: Linear::new(d_model, d_model, rng),
            w_o: Linear::new(d_model, d_model, rng),
            dropout,
        })
    }

    /// 使用外部提供的四个投影创建
    pub fn from_projections(
        n_heads: usize,
        w_q: Linear,
        w_k: Linear,
        w_v: Linear,
        w_o: Linear,
        dropout: Dropout,
    ) -> Result<Self> {
        let d_model = w_q.in_features();
        let params = AttentionParams::new(d_model, n_heads)?;

        for projection in [&w_q, &w_k, &w_v, &w_o] {
            if projection.in_features() != d_model || projection.out_features() != d_model {
                return Err(ModelError::dims(
                    "attention projection",
                    &[d_model, d_model],
                    &[projection.in_features(), projection.out_features()],
                ));
            }
        }

        Ok(Self {
            params,
            w_q,
            w_k,
            w_v,
            w_o,
            dropout,
        })
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `query`: [batch, seq_q, d_model]
    /// - `key`: [batch, seq_k, d_model]
    /// - `value`: [batch, seq_k, d_model]
    /// - `mask`: 可选掩码，可广播到 [batch, heads, seq_q, seq_k]
    ///
    /// # 返回
    /// - 输出 [batch, seq_q, d_model]
    /// - 注意力权重 [batch, heads, seq_q, seq_k]（dropout 之前，每行和为 1）
    pub fn forward(
        &self,
        query: &Array3<f32>,
        key: &Array3<f32>,
        value: &Array3<f32>,
        mask: Option<&AttentionMask>,
        mode: &mut Mode<'_>,
    ) -> Result<(Array3<f32>, Array4<f32>)> {
        let (batch, seq_q, d_q) = query.dim();
        let (batch_k, seq_k, d_k) = key.dim();

        if key.dim() != value.dim() {
            let (vb, vs, vd) = value.dim();
            return Err(ModelError::dims("attention value", &[batch_k, seq_k, d_k], &[vb, vs, vd]));
        }
        if d_q != self.params.d_model {
            return Err(ModelError::dims(
                "attention query",
                &[batch, seq_q, self.params.d_model],
                &[batch, seq_q, d_q],
            ));
        }
        if batch_k != batch || d_k != self.params.d_model {
            return Err(ModelError::dims(
                "attention key",
                &[batch, seq_k, self.params.d_model],
                &[batch_k, seq_k, d_k],
            ));
        }
        if let Some(mask) = mask {
            mask.check(batch, seq_q, seq_k)?;
        }

        // 1. 线性投影并分割成多头
        let q = self.split_heads(&self.w_q.forward(query)?);
        let k = self.split_heads(&self.w_k.forward(key)?);
        let v = self.split_heads(&self.w_v.forward(value)?);

        // 2. 缩放点积注意力
        let (context, attention_weights) = self.scaled_dot_product_attention(&q, &k, &v, mask, mode);

        // 3. 合并多头 + 输出投影
        let output = self.w_o.forward(&self.combine_heads(&context))?;

        Ok((output, attention_weights))
    }

    /// 自注意力：query、key、value 都是 `x`
    pub fn forward_self(
        &self,
        x: &Array3<f32>,
        mask: Option<&AttentionMask>,
        mode: &mut Mode<'_>,
    ) -> Result<(Array3<f32>, Array4<f32>)> {
        self.forward(x, x, x, mask, mode)
    }

    /// 缩放点积注意力
    ///
    /// ```text
    /// Attention(Q, K, V) = softmax(QK^T / √d_k) * V
    /// ```
    ///
    /// 输入均为 [batch, heads, seq, d_k]，掩码已经通过形状检查。
    fn scaled_dot_product_attention(
        &self,
        q: &Array4<f32>,
        k: &Array4<f32>,
        v: &Array4<f32>,
        mask: Option<&AttentionMask>,
        mode: &mut Mode<'_>,
    ) -> (Array4<f32>, Array4<f32>) {
        let (batch, heads, seq_q, d_k) = q.dim();
        let seq_k = k.dim().2;
        let scale = (d_k as f32).sqrt();

        // Q * K^T / √d_k
        let mut scores = Array4::zeros((batch, heads, seq_q, seq_k));
        for b in 0..batch {
            for h in 0..heads {
                let q_bh = q.slice(s![b, h, .., ..]);
                let k_bh = k.slice(s![b, h, .., ..]);
                scores
                    .slice_mut(s![b, h, .., ..])
                    .assign(&(q_bh.dot(&k_bh.t()) / scale));
            }
        }

        if let Some(mask) = mask {
            Zip::indexed(&mut scores).for_each(|(b, _, i, j), score| {
                if !mask.allows(b, i, j) {
                    *score = MASK_SENTINEL;
                }
            });
        }

        let attention_weights = scores.softmax();
        let dropped = self.dropout.forward(attention_weights.clone(), mode);

        // 应用权重到 Value
        let mut context = Array4::zeros((batch, heads, seq_q, d_k));
        for b in 0..batch {
            for h in 0..heads {
                let w_bh = dropped.slice(s![b, h, .., ..]);
                let v_bh = v.slice(s![b, h, .., ..]);
                context.slice_mut(s![b, h, .., ..]).assign(&w_bh.dot(&v_bh));
            }
        }

        (context, attention_weights)
    }

    /// 分割多头：[batch, seq_len, d_model] → [batch, n_heads, seq_len, d_k]
    fn split_heads(&self, x: &Array3<f32>) -> Array4<f32> {
        let (batch, seq_len, _) = x.dim();
        let AttentionParams { n_heads, d_k, .. } = self.params;

        Array4::from_shape_fn((batch, n_heads, seq_len, d_k), |(b, h, i, j)| {
            x[[b, i, h * d_k + j]]
        })
    }

    /// 合并多头：[batch, n_heads, seq_len, d_k] → [batch, seq_len, d_model]
    fn combine_heads(&self, x: &Array4<f32>) -> Array3<f32> {
        let (batch, _, seq_len, _) = x.dim();
        let AttentionParams { d_model, d_k, .. } = self.params;

        Array3::from_shape_fn((batch, seq_len, d_model), |(b, i, j)| x[[b, j / d_k, i, j % d_k]])
    }

    /// 获取参数
    pub fn params(&self) -> &AttentionParams {
        &self.params
    }
}

impl Parameterized for MultiHeadAttention {
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, ArrayViewD<'a, f32>)>) {
        self.w_q.collect_parameters(&param_name(prefix, "w_q"), out);
        self.w_k.collect_parameters(&param_name(prefix, "w_k"), out);
        self.w_v.collect_parameters(&param_name(prefix, "w_v"), out);
        self.w_o.collect_parameters(&param_name(prefix, "w_o"), out);
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ArrayViewMutD<'a, f32>)>,
    ) {
        self.w_q.collect_parameters_mut(&param_name(prefix, "w_q"), out);
        self.w_k.collect_parameters_mut(&param_name(prefix, "w_k"), out);
        self.w_v.collect_parameters_mut(&param_name(prefix, "w_v"), out);
        self.w_o.collect_parameters_mut(&param_name(prefix, "w_o"), out);
    }
}
