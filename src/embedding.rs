//! 嵌入层和位置编码
//!
//! 将离散的 token ID 转换为连续的向量表示，并添加位置信息。

use ndarray::{s, Array2, Array3, ArrayViewD, ArrayViewMutD};
use rand::Rng;

use crate::checkpoint::{param_name, Parameterized};
use crate::error::{ModelError, Result};
use crate::layers::{Dropout, Mode};
use crate::tensor::xavier_uniform;

/// 词嵌入层
///
/// 将 token ID 映射到 d_model 维向量
#[derive(Debug, Clone, PartialEq)]
pub struct Embedding {
    /// 权重矩阵: [vocab_size, d_model]
    weights: Array2<f32>,
}

impl Embedding {
    /// # 参数
    /// - `vocab_size`: 词表大小
    /// - `d_model`: 嵌入维度
    pub fn new<R: Rng + ?Sized>(vocab_size: usize, d_model: usize, rng: &mut R) -> Self {
        Self {
            weights: xavier_uniform((vocab_size, d_model), rng),
        }
    }

    /// 使用外部提供的嵌入表
    pub fn from_weights(weights: Array2<f32>) -> Self {
        Self { weights }
    }

    /// 前向传播
    ///
    /// # 输入
    /// - `tokens`: [batch, seq_len]
    ///
    /// # 输出
    /// - [batch, seq_len, d_model]
    ///
    /// token ID 超出词表范围时返回 `Range` 错误。
    pub fn forward(&self, tokens: &Array2<usize>) -> Result<Array3<f32>> {
        let (batch, seq_len) = tokens.dim();
        let vocab_size = self.vocab_size();

        if let Some(&bad) = tokens.iter().find(|&&id| id >= vocab_size) {
            return Err(ModelError::Range {
                what: "token id",
                value: bad,
                valid: format!("0..{}", vocab_size),
            });
        }

        let mut embedded = Array3::zeros((batch, seq_len, self.d_model()));
        for ((b, i), &token_id) in tokens.indexed_iter() {
            embedded
                .slice_mut(s![b, i, ..])
                .assign(&self.weights.row(token_id));
        }

        Ok(embedded)
    }

    pub fn vocab_size(&self) -> usize {
        self.weights.nrows()
    }

    pub fn d_model(&self) -> usize {
        self.weights.ncols()
    }

    pub fn weights(&self) -> &Array2<f32> {
        &self.weights
    }
}

impl Parameterized for Embedding {
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, ArrayViewD<'a, f32>)>) {
        out.push((param_name(prefix, "weight"), self.weights.view().into_dyn()));
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ArrayViewMutD<'a, f32>)>,
    ) {
        out.push((param_name(prefix, "weight"), self.weights.view_mut().into_dyn()));
    }
}

/// 位置编码
///
/// 为输入序列添加位置信息，使用正弦和余弦函数。
///
/// ```text
/// PE(pos, 2i)   = sin(pos / 10000^(2i/d_model))
/// PE(pos, 2i+1) = cos(pos / 10000^(2i/d_model))
/// ```
///
/// 编码表在构造时计算一次，之后不再修改。
#[derive(Debug, Clone, PartialEq)]
pub struct PositionalEncoding {
    /// 预计算的位置编码: [max_seq_len, d_model]
    pe: Array2<f32>,
    dropout: Dropout,
}

impl PositionalEncoding {
    /// # 参数
    /// - `max_seq_len`: 最大序列长度
    /// - `d_model`: 嵌入维度
    /// - `dropout`: 训练模式下在相加之后应用
    pub fn new(max_seq_len: usize, d_model: usize, dropout: Dropout) -> Result<Self> {
        if max_seq_len == 0 || d_model == 0 {
            return Err(ModelError::config(format!(
                "positional encoding needs positive sizes, got max_seq_len={} d_model={}",
                max_seq_len, d_model
            )));
        }

        let mut pe = Array2::zeros((max_seq_len, d_model));

        for pos in 0..max_seq_len {
            for i in (0..d_model).step_by(2) {
                // pos / 10000^(2i/d_model)，用 f64 计算再截断
                let angle = pos as f64 / 10000f64.powf(i as f64 / d_model as f64);

                pe[[pos, i]] = angle.sin() as f32;
                if i + 1 < d_model {
                    pe[[pos, i + 1]] = angle.cos() as f32;
                }
            }
        }

        Ok(Self { pe, dropout })
    }

    /// 前向传播：将位置编码添加到输入嵌入
    ///
    /// # 输入
    /// - `x`: [batch, seq_len, d_model]
    ///
    /// 序列长度超过编码表范围时返回 `DimensionMismatch`。
    pub fn forward(&self, x: Array3<f32>, mode: &mut Mode<'_>) -> Result<Array3<f32>> {
        let (batch, seq_len, d_model) = x.dim();

        if seq_len > self.max_seq_len() || d_model != self.d_model() {
            return Err(ModelError::dims(
                "positional encoding input",
                &[batch, self.max_seq_len(), self.d_model()],
                &[batch, seq_len, d_model],
            ));
        }

        // 取对应长度的位置编码，沿 batch 广播
        let encoded = x + &self.pe.slice(s![..seq_len, ..]);
        Ok(self.dropout.forward(encoded, mode))
    }

    /// 获取位置编码表
    pub fn encoding(&self) -> &Array2<f32> {
        &self.pe
    }

    pub fn max_seq_len(&self) -> usize {
        self.pe.nrows()
    }

    pub fn d_model(&self) -> usize {
        self.pe.ncols()
    }
}

/// 组合嵌入和位置编码
///
/// ```text
/// x = Dropout(Embedding(tokens) * √d_model + PE)
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct InputEmbedding {
    embedding: Embedding,
    pos_encoding: PositionalEncoding,
}

impl InputEmbedding {
    pub fn new(embedding: Embedding, pos_encoding: PositionalEncoding) -> Result<Self> {
        if embedding.d_model() != pos_encoding.d_model() {
            return Err(ModelError::dims(
                "positional encoding width",
                &[embedding.d_model()],
                &[pos_encoding.d_model()],
            ));
        }

        Ok(Self {
            embedding,
            pos_encoding,
        })
    }

    /// # 输入
    /// - `tokens`: [batch, seq_len] token IDs
    ///
    /// # 输出
    /// - [batch, seq_len, d_model] 包含位置信息的嵌入向量
    pub fn forward(&self, tokens: &Array2<usize>, mode: &mut Mode<'_>) -> Result<Array3<f32>> {
        let (_, seq_len) = tokens.dim();
        if seq_len > self.pos_encoding.max_seq_len() {
            return Err(ModelError::dims(
                "token sequence length",
                &[self.pos_encoding.max_seq_len()],
                &[seq_len],
            ));
        }

        let scale = (self.d_model() as f32).sqrt();
        let embedded = self.embedding.forward(tokens)? * scale;
        self.pos_encoding.forward(embedded, mode)
    }

    pub fn d_model(&self) -> usize {
        self.embedding.d_model()
    }

    pub fn embedding(&self) -> &Embedding {
        &self.embedding
    }

    pub fn pos_encoding(&self) -> &PositionalEncoding {
        &self.pos_encoding
    }
}

impl Parameterized for InputEmbedding {
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, ArrayViewD<'a, f32>)>) {
        self.embedding.collect_parameters(&param_name(prefix, "embedding"), out);
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ArrayViewMutD<'a, f32>)>,
    ) {
        self.embedding
            .collect_parameters_mut(&param_name(prefix, "embedding"), out);
    }
}
