//! 完整的 Transformer Encoder
//!
//! 组合所有组件，构建可用的 Transformer 模型。

use ndarray::{Array2, Array3, Array4, ArrayViewD, ArrayViewMutD, Axis};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::attention::MultiHeadAttention;
use crate::checkpoint::{param_name, Parameterized};
use crate::embedding::{Embedding, InputEmbedding, PositionalEncoding};
use crate::error::{ModelError, Result};
use crate::layers::{Dropout, FeedForward, LayerNorm, Linear, Mode, ResidualNorm};
use crate::mask::AttentionMask;

fn default_layer_norm_eps() -> f32 {
    1e-6
}

/// Transformer 配置
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TransformerConfig {
    /// 词表大小
    pub vocab_size: usize,
    /// 模型维度
    pub d_model: usize,
    /// 注意力头数
    pub n_heads: usize,
    /// Encoder 层数
    pub n_layers: usize,
    /// FFN 隐藏层维度
    pub d_ff: usize,
    /// 最大序列长度
    pub max_seq_len: usize,
    /// Dropout 比率
    pub dropout: f32,
    /// LayerNorm 的 ε
    #[serde(default = "default_layer_norm_eps")]
    pub layer_norm_eps: f32,
}

impl Default for TransformerConfig {
    fn default() -> Self {
        Self {
            vocab_size: 10000,
            d_model: 512,
            n_heads: 8,
            n_layers: 6,
            d_ff: 2048,
            max_seq_len: 512,
            dropout: 0.1,
            layer_norm_eps: default_layer_norm_eps(),
        }
    }
}

impl TransformerConfig {
    /// 校验配置
    pub fn validate(&self) -> Result<()> {
        let sizes = [
            ("vocab_size", self.vocab_size),
            ("d_model", self.d_model),
            ("n_heads", self.n_heads),
            ("n_layers", self.n_layers),
            ("d_ff", self.d_ff),
            ("max_seq_len", self.max_seq_len),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, v)| *v == 0) {
            return Err(ModelError::config(format!("{} must be positive", name)));
        }
        if self.d_model % self.n_heads != 0 {
            return Err(ModelError::config(format!(
                "d_model ({}) must be divisible by n_heads ({})",
                self.d_model, self.n_heads
            )));
        }
        // eps 为 0 时常数行的 LayerNorm 会得到 0/0
        if !self.layer_norm_eps.is_finite() || self.layer_norm_eps <= 0.0 {
            return Err(ModelError::config(format!(
                "layer_norm_eps must be a positive number, got {}",
                self.layer_norm_eps
            )));
        }
        Dropout::new(self.dropout)?;

        Ok(())
    }

    /// 从 JSON 字符串读取并校验配置
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// 每个头的维度
    pub fn d_k(&self) -> usize {
        self.d_model / self.n_heads.max(1)
    }
}

/// 单个 Transformer Encoder 层
///
/// 包含两个子层，每个子层都是后归一化的残差结构：
/// 1. Multi-Head Self-Attention
/// 2. Position-wise Feed-Forward Network
///
/// ```text
/// x → LayerNorm(x + Dropout(Attention(x))) → LayerNorm(x + Dropout(FFN(x))) → output
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct EncoderLayer {
    /// Multi-Head Self-Attention
    self_attention: MultiHeadAttention,
    /// Feed-Forward Network
    feed_forward: FeedForward,
    /// Attention 后的 Residual + Norm
    attn_norm: ResidualNorm,
    /// FFN 后的 Residual + Norm
    ffn_norm: ResidualNorm,
}

impl EncoderLayer {
    pub fn new<R: Rng + ?Sized>(config: &TransformerConfig, rng: &mut R) -> Result<Self> {
        let dropout = Dropout::new(config.dropout)?;

        Ok(Self {
            self_attention: MultiHeadAttention::new(config.d_model, config.n_heads, dropout, rng)?,
            feed_forward: FeedForward::new(config.d_model, config.d_ff, dropout, rng),
            attn_norm: ResidualNorm::new(LayerNorm::new(config.d_model, config.layer_norm_eps), dropout),
            ffn_norm: ResidualNorm::new(LayerNorm::new(config.d_model, config.layer_norm_eps), dropout),
        })
    }

    /// 使用外部提供的子层组装
    pub fn from_parts(
        self_attention: MultiHeadAttention,
        feed_forward: FeedForward,
        attn_norm: ResidualNorm,
        ffn_norm: ResidualNorm,
    ) -> Result<Self> {
        let d_model = self_attention.params().d_model;
        let widths = [
            feed_forward.dimensions().0,
            attn_norm.layer_norm().d_model(),
            ffn_norm.layer_norm().d_model(),
        ];
        if widths.iter().any(|&w| w != d_model) {
            return Err(ModelError::dims("encoder layer sublayers", &[d_model; 3], &widths));
        }

        Ok(Self {
            self_attention,
            feed_forward,
            attn_norm,
            ffn_norm,
        })
    }

    /// 前向传播
    ///
    /// # 参数
    /// - `x`: 输入 [batch, seq_len, d_model]
    /// - `mask`: 可选的注意力掩码
    ///
    /// # 返回
    /// - [batch, seq_len, d_model]
    /// - 本层的注意力权重 [batch, heads, seq_len, seq_len]
    pub fn forward(
        &self,
        x: &Array3<f32>,
        mask: Option<&AttentionMask>,
        mode: &mut Mode<'_>,
    ) -> Result<(Array3<f32>, Array4<f32>)> {
        // 1. Multi-Head Self-Attention + Residual + Norm
        let (attn_output, attention_weights) = self.self_attention.forward_self(x, mask, mode)?;
        let x = self.attn_norm.forward(x, attn_output, mode)?;

        // 2. Feed-Forward + Residual + Norm
        let ffn_output = self.feed_forward.forward(&x, mode)?;
        let output = self.ffn_norm.forward(&x, ffn_output, mode)?;

        Ok((output, attention_weights))
    }

    pub fn self_attention(&self) -> &MultiHeadAttention {
        &self.self_attention
    }
}

impl Parameterized for EncoderLayer {
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, ArrayViewD<'a, f32>)>) {
        self.self_attention
            .collect_parameters(&param_name(prefix, "self_attn"), out);
        self.feed_forward
            .collect_parameters(&param_name(prefix, "feed_forward"), out);
        self.attn_norm.collect_parameters(&param_name(prefix, "attn_norm"), out);
        self.ffn_norm.collect_parameters(&param_name(prefix, "ffn_norm"), out);
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ArrayViewMutD<'a, f32>)>,
    ) {
        self.self_attention
            .collect_parameters_mut(&param_name(prefix, "self_attn"), out);
        self.feed_forward
            .collect_parameters_mut(&param_name(prefix, "feed_forward"), out);
        self.attn_norm
            .collect_parameters_mut(&param_name(prefix, "attn_norm"), out);
        self.ffn_norm
            .collect_parameters_mut(&param_name(prefix, "ffn_norm"), out);
    }
}

/// Encoder 前向传播的结果
#[derive(Debug, Clone)]
pub struct EncoderOutput {
    /// 未归一化的词表 logits [batch, seq_len, vocab_size]
    pub logits: Array3<f32>,
    /// 每一层的注意力权重，按层顺序排列
    pub attention_weights: Vec<Array4<f32>>,
}

/// 完整的 Transformer Encoder
///
/// ```text
/// Input → Embedding × √d_model → Positional Encoding → Dropout →
///     [Encoder Layer × N] → Linear → Logits
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct TransformerEncoder {
    /// 输入嵌入层
    input: InputEmbedding,
    /// Encoder 层堆叠
    layers: Vec<EncoderLayer>,
    /// 输出投影: [d_model, vocab_size]
    output: Linear,
    /// 配置
    config: TransformerConfig,
}

impl TransformerEncoder {
    /// 创建新的 Transformer Encoder，参数由 `rng` 初始化
    pub fn new<R: Rng + ?Sized>(config: TransformerConfig, rng: &mut R) -> Result<Self> {
        config.validate()?;
        let dropout = Dropout::new(config.dropout)?;

        let input = InputEmbedding::new(
            Embedding::new(config.vocab_size, config.d_model, rng),
            PositionalEncoding::new(config.max_seq_len, config.d_model, dropout)?,
        )?;

        let layers = (0..config.n_layers)
            .map(|_| EncoderLayer::new(&config, rng))
            .collect::<Result<Vec<_>>>()?;

        let output = Linear::new(config.d_model, config.vocab_size, rng);

        tracing::debug!(
            vocab_size = config.vocab_size,
            d_model = config.d_model,
            n_heads = config.n_heads,
            n_layers = config.n_layers,
            "built transformer encoder"
        );

        Ok(Self {
            input,
            layers,
            output,
            config,
        })
    }

    /// 使用外部提供的组件组装
    pub fn from_parts(
        config: TransformerConfig,
        input: InputEmbedding,
        layers: Vec<EncoderLayer>,
        output: Linear,
    ) -> Result<Self> {
        config.validate()?;

        if input.d_model() != config.d_model
            || input.embedding().vocab_size() != config.vocab_size
            || input.pos_encoding().max_seq_len() != config.max_seq_len
        {
            return Err(ModelError::dims(
                "input embedding",
                &[config.vocab_size, config.d_model, config.max_seq_len],
                &[
                    input.embedding().vocab_size(),
                    input.d_model(),
                    input.pos_encoding().max_seq_len(),
                ],
            ));
        }
        if layers.len() != config.n_layers {
            return Err(ModelError::config(format!(
                "expected {} encoder layers, got {}",
                config.n_layers,
                layers.len()
            )));
        }
        if output.in_features() != config.d_model || output.out_features() != config.vocab_size {
            return Err(ModelError::dims(
                "output projection",
                &[config.d_model, config.vocab_size],
                &[output.in_features(), output.out_features()],
            ));
        }

        Ok(Self {
            input,
            layers,
            output,
            config,
        })
    }

    /// 编码：返回最后一层的隐藏状态和每层的注意力权重
    ///
    /// # 参数
    /// - `tokens`: [batch, seq_len] token IDs
    /// - `mask`: 可选的注意力掩码，原样传给每一层
    pub fn encode(
        &self,
        tokens: &Array2<usize>,
        mask: Option<&AttentionMask>,
        mode: &mut Mode<'_>,
    ) -> Result<(Array3<f32>, Vec<Array4<f32>>)> {
        let (batch, seq_len) = tokens.dim();
        if let Some(mask) = mask {
            mask.check(batch, seq_len, seq_len)?;
        }

        tracing::debug!(batch, seq_len, training = mode.is_training(), "encoder forward");

        // 1. 嵌入 + 位置编码
        let mut x = self.input.forward(tokens, mode)?;

        // 2. 依次通过所有 Encoder 层
        let mut attention_weights = Vec::with_capacity(self.layers.len());
        for layer in &self.layers {
            let (next, weights) = layer.forward(&x, mask, mode)?;
            x = next;
            attention_weights.push(weights);
        }

        Ok((x, attention_weights))
    }

    /// 前向传播
    ///
    /// # 返回
    /// - logits [batch, seq_len, vocab_size]
    /// - 每层的注意力权重 [batch, heads, seq_len, seq_len]
    pub fn forward(
        &self,
        tokens: &Array2<usize>,
        mask: Option<&AttentionMask>,
        mode: &mut Mode<'_>,
    ) -> Result<EncoderOutput> {
        let (hidden, attention_weights) = self.encode(tokens, mask, mode)?;
        let logits = self.output.forward(&hidden)?;

        Ok(EncoderOutput {
            logits,
            attention_weights,
        })
    }

    /// 推理：每个位置 logits 最大的 token ID
    pub fn predict(
        &self,
        tokens: &Array2<usize>,
        mask: Option<&AttentionMask>,
    ) -> Result<Array2<usize>> {
        let EncoderOutput { logits, .. } = self.forward(tokens, mask, &mut Mode::Inference)?;

        let predictions = logits.map_axis(Axis(2), |row| {
            row.iter()
                .enumerate()
                .fold((0, f32::NEG_INFINITY), |best, (i, &v)| if v > best.1 { (i, v) } else { best })
                .0
        });

        Ok(predictions)
    }

    /// 获取配置
    pub fn config(&self) -> &TransformerConfig {
        &self.config
    }

    pub fn layers(&self) -> &[EncoderLayer] {
        &self.layers
    }

    /// 获取模型信息
    pub fn info(&self) -> String {
        format!(
            "TransformerEncoder(
  vocab_size: {},
  d_model: {},
  n_heads: {},
  n_layers: {},
  d_ff: {},
  max_seq_len: {},
  dropout: {:.2},
  total_params: {},
)",
            self.config.vocab_size,
            self.config.d_model,
            self.config.n_heads,
            self.config.n_layers,
            self.config.d_ff,
            self.config.max_seq_len,
            self.config.dropout,
            self.param_count(),
        )
    }
}

impl Parameterized for TransformerEncoder {
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, ArrayViewD<'a, f32>)>) {
        self.input.collect_parameters(prefix, out);
        for (i, layer) in self.layers.iter().enumerate() {
            layer.collect_parameters(&param_name(prefix, &format!("layers.{}", i)), out);
        }
        self.output.collect_parameters(&param_name(prefix, "output"), out);
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ArrayViewMutD<'a, f32>)>,
    ) {
        self.input.collect_parameters_mut(prefix, out);
        for (i, layer) in self.layers.iter_mut().enumerate() {
            layer.collect_parameters_mut(&param_name(prefix, &format!("layers.{}", i)), out);
        }
        self.output.collect_parameters_mut(&param_name(prefix, "output"), out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::checkpoint::{ParameterSet, StateDict};
    use crate::tensor::TensorExt;
    use ndarray::{arr2, Array1};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn small_config() -> TransformerConfig {
        TransformerConfig {
            vocab_size: 10,
            d_model: 4,
            n_heads: 2,
            n_layers: 1,
            d_ff: 8,
            max_seq_len: 16,
            dropout: 0.1,
            layer_norm_eps: 1e-6,
        }
    }

    fn encoder(config: TransformerConfig, seed: u64) -> TransformerEncoder {
        TransformerEncoder::new(config, &mut StdRng::seed_from_u64(seed)).unwrap()
    }

    fn assert_rows_sum_to_one(weights: &Array4<f32>) {
        for row in weights.lanes(Axis(3)) {
            assert!((row.sum() - 1.0).abs() < 1e-5);
        }
    }

    #[test]
    fn test_config_default() {
        let config = TransformerConfig::default();
        assert_eq!(config.d_model, 512);
        assert_eq!(config.n_heads, 8);
        assert_eq!(config.n_layers, 6);
        assert_eq!(config.d_k(), 64);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let mut config = small_config();
        config.n_heads = 3;
        assert!(matches!(config.validate(), Err(ModelError::Configuration(_))));

        let mut config = small_config();
        config.d_ff = 0;
        assert!(config.validate().is_err());

        let mut config = small_config();
        config.dropout = 1.5;
        assert!(config.validate().is_err());

        assert!(TransformerEncoder::new(config, &mut StdRng::seed_from_u64(0)).is_err());
    }

    #[test]
    fn test_layer_norm_eps_must_be_positive() {
        for eps in [0.0, -1e-6, f32::NAN, f32::INFINITY] {
            let config = TransformerConfig {
                layer_norm_eps: eps,
                ..small_config()
            };
            assert!(matches!(config.validate(), Err(ModelError::Configuration(_))));
            assert!(TransformerEncoder::new(config, &mut StdRng::seed_from_u64(0)).is_err());
        }

        // 常数输入在默认 eps 下不会产生 NaN
        let config = small_config();
        let layer = EncoderLayer::new(&config, &mut StdRng::seed_from_u64(0)).unwrap();
        let x = Array3::from_elem((1, 1, config.d_model), 1.0);
        let (y, _) = layer.forward(&x, None, &mut Mode::Inference).unwrap();
        assert!(y.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_config_json() {
        let json = r#"{
            "vocab_size": 50, "d_model": 8, "n_heads": 2, "n_layers": 2,
            "d_ff": 16, "max_seq_len": 32, "dropout": 0.0
        }"#;
        let config = TransformerConfig::from_json_str(json).unwrap();
        assert_eq!(config.vocab_size, 50);
        assert_eq!(config.layer_norm_eps, 1e-6);

        let round = TransformerConfig::from_json_str(&config.to_json_string().unwrap()).unwrap();
        assert_eq!(round, config);

        let bad = r#"{"vocab_size": 50, "d_model": 9, "n_heads": 2, "n_layers": 1,
                      "d_ff": 16, "max_seq_len": 32, "dropout": 0.0}"#;
        assert!(TransformerConfig::from_json_str(bad).is_err());
    }

    #[test]
    fn test_end_to_end_shapes() {
        let model = encoder(small_config(), 42);
        let tokens = arr2(&[[1, 5, 9]]);

        let output = model.forward(&tokens, None, &mut Mode::Inference).unwrap();

        assert_eq!(output.logits.shape(), &[1, 3, 10]);
        assert_eq!(output.attention_weights.len(), 1);
        assert_eq!(output.attention_weights[0].shape(), &[1, 2, 3, 3]);
        assert_rows_sum_to_one(&output.attention_weights[0]);
    }

    #[test]
    fn test_multi_layer_trace() {
        let config = TransformerConfig {
            n_layers: 3,
            ..small_config()
        };
        let model = encoder(config, 7);
        let tokens = arr2(&[[1, 2, 3, 0], [4, 5, 0, 0]]);
        let mask = AttentionMask::padding(&[4, 2], 4);

        let output = model.forward(&tokens, Some(&mask), &mut Mode::Inference).unwrap();

        assert_eq!(output.attention_weights.len(), 3);
        for weights in &output.attention_weights {
            assert_eq!(weights.shape(), &[2, 2, 4, 4]);
            assert_rows_sum_to_one(weights);
            // 掩码原样传给每一层
            for h in 0..2 {
                for i in 0..4 {
                    assert!(weights[[1, h, i, 2]] < 1e-12);
                    assert!(weights[[1, h, i, 3]] < 1e-12);
                }
            }
        }
    }

    #[test]
    fn test_forward_errors() {
        let model = encoder(small_config(), 42);

        let unknown = arr2(&[[1, 10]]);
        assert!(matches!(
            model.forward(&unknown, None, &mut Mode::Inference),
            Err(ModelError::Range { .. })
        ));

        let too_long = Array2::zeros((1, 17));
        assert!(matches!(
            model.forward(&too_long, None, &mut Mode::Inference),
            Err(ModelError::DimensionMismatch { .. })
        ));

        let tokens = arr2(&[[1, 2, 3]]);
        let mask = AttentionMask::all(1, 4);
        assert!(matches!(
            model.forward(&tokens, Some(&mask), &mut Mode::Inference),
            Err(ModelError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn test_inference_is_deterministic() {
        let model = encoder(small_config(), 42);
        let tokens = arr2(&[[1, 2, 3]]);

        let a = model.forward(&tokens, None, &mut Mode::Inference).unwrap();
        let b = model.forward(&tokens, None, &mut Mode::Inference).unwrap();
        assert_eq!(a.logits, b.logits);
    }

    #[test]
    fn test_training_mode_is_seeded() {
        let config = TransformerConfig {
            dropout: 0.5,
            ..small_config()
        };
        let model = encoder(config, 42);
        let tokens = arr2(&[[1, 2, 3]]);

        let run = |seed: u64| {
            let mut rng = StdRng::seed_from_u64(seed);
            model
                .forward(&tokens, None, &mut Mode::Training(&mut rng))
                .unwrap()
                .logits
        };

        assert_eq!(run(1), run(1));
        assert_ne!(run(1), run(2));

        let inference = model.forward(&tokens, None, &mut Mode::Inference).unwrap();
        assert_ne!(run(1), inference.logits);
    }

    #[test]
    fn test_training_without_dropout_matches_inference() {
        let config = TransformerConfig {
            dropout: 0.0,
            ..small_config()
        };
        let model = encoder(config, 42);
        let tokens = arr2(&[[1, 2, 3]]);

        let mut rng = StdRng::seed_from_u64(5);
        let train = model.forward(&tokens, None, &mut Mode::Training(&mut rng)).unwrap();
        let infer = model.forward(&tokens, None, &mut Mode::Inference).unwrap();
        assert_eq!(train.logits, infer.logits);
    }

    #[test]
    fn test_post_norm_ordering() {
        let d_model = 4;
        let eps = 1e-6;
        let no_dropout = Dropout::new(0.0).unwrap();

        // 单位投影 + 全零 FFN，单个位置时注意力输出等于输入本身
        let layer = EncoderLayer::from_parts(
            MultiHeadAttention::from_projections(
                2,
                Linear::identity(d_model),
                Linear::identity(d_model),
                Linear::identity(d_model),
                Linear::identity(d_model),
                no_dropout,
            )
            .unwrap(),
            FeedForward::from_linears(
                Linear::zeros(d_model, 8),
                Linear::zeros(8, d_model),
                no_dropout,
            )
            .unwrap(),
            ResidualNorm::new(LayerNorm::new(d_model, eps), no_dropout),
            ResidualNorm::new(LayerNorm::new(d_model, eps), no_dropout),
        )
        .unwrap();

        let x = ndarray::arr3(&[[[0.5, -1.0, 2.0, 3.0]]]);
        let (y, _) = layer.forward(&x, None, &mut Mode::Inference).unwrap();

        // 期望: LN(LN(x + x) + 0)
        let gamma = Array1::ones(d_model);
        let beta = Array1::zeros(d_model);
        let first = (&x + &x).layer_norm(&gamma, &beta, eps);
        let expected = first.layer_norm(&gamma, &beta, eps);

        for (a, b) in y.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5);
        }

        // 前归一化会保留残差的原始尺度，这里输出必须是归一化后的
        let mean: f32 = y.sum() / d_model as f32;
        assert!(mean.abs() < 1e-5);
    }

    #[test]
    fn test_post_norm_with_zero_sublayers() {
        let d_model = 4;
        let eps = 1e-6;
        let no_dropout = Dropout::new(0.0).unwrap();

        // 输出投影为零时注意力子层贡献为 0，结果应是 LN(LN(x))
        let layer = EncoderLayer::from_parts(
            MultiHeadAttention::from_projections(
                2,
                Linear::identity(d_model),
                Linear::identity(d_model),
                Linear::identity(d_model),
                Linear::zeros(d_model, d_model),
                no_dropout,
            )
            .unwrap(),
            FeedForward::from_linears(
                Linear::zeros(d_model, 8),
                Linear::zeros(8, d_model),
                no_dropout,
            )
            .unwrap(),
            ResidualNorm::new(LayerNorm::new(d_model, eps), no_dropout),
            ResidualNorm::new(LayerNorm::new(d_model, eps), no_dropout),
        )
        .unwrap();

        let x = ndarray::arr3(&[[[1.0, 2.0, 3.0, 10.0], [-4.0, 0.0, 4.0, 1.0]]]);
        let (y, _) = layer.forward(&x, None, &mut Mode::Inference).unwrap();

        let gamma = Array1::ones(d_model);
        let beta = Array1::zeros(d_model);
        let expected = x
            .layer_norm(&gamma, &beta, eps)
            .layer_norm(&gamma, &beta, eps);

        for (a, b) in y.iter().zip(expected.iter()) {
            assert!((a - b).abs() < 1e-5);
        }
    }

    #[test]
    fn test_encoder_layer_rejects_mismatched_parts() {
        let mut rng = StdRng::seed_from_u64(0);
        let no_dropout = Dropout::new(0.0).unwrap();
        let result = EncoderLayer::from_parts(
            MultiHeadAttention::new(8, 2, no_dropout, &mut rng).unwrap(),
            FeedForward::new(4, 16, no_dropout, &mut rng),
            ResidualNorm::new(LayerNorm::new(8, 1e-6), no_dropout),
            ResidualNorm::new(LayerNorm::new(8, 1e-6), no_dropout),
        );
        assert!(matches!(result, Err(ModelError::DimensionMismatch { .. })));
    }

    #[test]
    fn test_named_parameters_are_ordered() {
        let config = TransformerConfig {
            n_layers: 2,
            ..small_config()
        };
        let model = encoder(config, 1);
        let params = model.named_parameters();

        assert_eq!(params[0].0, "embedding.weight");
        assert_eq!(params[0].1.shape(), &[10, 4]);
        assert_eq!(params[1].0, "layers.0.self_attn.w_q.weight");
        assert_eq!(params.last().unwrap().0, "output.bias");
        assert!(params.iter().any(|(n, _)| n == "layers.1.ffn_norm.gamma"));
        assert!(params.iter().any(|(n, _)| n == "layers.1.feed_forward.linear2.weight"));

        // 枚举顺序稳定
        let again: Vec<String> = model.named_parameters().into_iter().map(|(n, _)| n).collect();
        let names: Vec<String> = params.into_iter().map(|(n, _)| n).collect();
        assert_eq!(names, again);

        // embedding + 2 层 × (4×2 attention + 4 ffn + 4 norm) + output
        assert_eq!(names.len(), 1 + 2 * 16 + 2);
    }

    #[test]
    fn test_state_dict_restores_identical_logits() {
        let source = encoder(small_config(), 1);
        let mut target = encoder(small_config(), 2);
        let tokens = arr2(&[[3, 1, 4], [1, 5, 9]]);

        let before = target.forward(&tokens, None, &mut Mode::Inference).unwrap();
        let expected = source.forward(&tokens, None, &mut Mode::Inference).unwrap();
        assert_ne!(before.logits, expected.logits);

        let bytes = source.state_dict().to_bytes().unwrap();
        target
            .load_state_dict(&ParameterSet::from_bytes(&bytes).unwrap())
            .unwrap();

        let after = target.forward(&tokens, None, &mut Mode::Inference).unwrap();
        assert_eq!(after.logits, expected.logits);
        assert_eq!(target, source);
    }

    #[test]
    fn test_state_dict_rejects_other_architecture() {
        let source = encoder(
            TransformerConfig {
                n_layers: 2,
                ..small_config()
            },
            1,
        );
        let mut target = encoder(small_config(), 2);
        assert!(target.load_state_dict(&source.state_dict()).is_err());
    }

    #[test]
    fn test_predict() {
        let model = encoder(small_config(), 42);
        let tokens = arr2(&[[1, 2, 3]]);

        let predictions = model.predict(&tokens, None).unwrap();
        let logits = model.forward(&tokens, None, &mut Mode::Inference).unwrap().logits;

        assert_eq!(predictions.dim(), (1, 3));
        for i in 0..3 {
            let best = predictions[[0, i]];
            assert!(best < 10);
            for v in 0..10 {
                assert!(logits[[0, i, best]] >= logits[[0, i, v]]);
            }
        }
    }

    #[test]
    fn test_param_count_and_info() {
        let model = encoder(small_config(), 1);
        let expected = 10 * 4 // embedding
            + 4 * (4 * 4 + 4) // attention
            + (4 * 8 + 8) + (8 * 4 + 4) // ffn
            + 2 * (4 + 4) // norms
            + (4 * 10 + 10); // output
        assert_eq!(model.param_count(), expected);
        assert!(model.info().contains(&format!("total_params: {}", expected)));
    }
}
