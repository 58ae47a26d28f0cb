//! Transformer 的基础层
//!
//! 包含 Linear、Layer Normalization、Feed-Forward Network、Dropout 以及
//! 残差连接 + 归一化包装器。所有层都只读参数，前向传播不修改自身状态。

use std::fmt;

use ndarray::{Array, Array1, Array2, Array3, ArrayViewD, ArrayViewMutD, Dimension};
use rand::{Rng, RngCore};

use crate::checkpoint::{param_name, Parameterized};
use crate::error::{ModelError, Result};
use crate::tensor::{xavier_uniform, TensorExt};

/// 前向传播模式
///
/// 训练模式携带显式的随机源，用于 dropout；推理模式下 dropout 为恒等映射。
/// 不存在全局的训练/推理开关。
pub enum Mode<'a> {
    Inference,
    Training(&'a mut dyn RngCore),
}

impl Mode<'_> {
    pub fn is_training(&self) -> bool {
        matches!(self, Mode::Training(_))
    }
}

impl fmt::Debug for Mode<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Inference => write!(f, "Inference"),
            Mode::Training(_) => write!(f, "Training"),
        }
    }
}

/// Dropout 层
///
/// 训练时以概率 p 将元素置零，并把保留的元素放大 1/(1-p) 以保持期望值。
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dropout {
    p: f32,
}

impl Dropout {
    pub fn new(p: f32) -> Result<Self> {
        if !(0.0..1.0).contains(&p) {
            return Err(ModelError::config(format!(
                "dropout probability must be in [0, 1), got {}",
                p
            )));
        }
        Ok(Self { p })
    }

    pub fn p(&self) -> f32 {
        self.p
    }

    pub fn forward<D: Dimension>(&self, x: Array<f32, D>, mode: &mut Mode<'_>) -> Array<f32, D> {
        if self.p == 0.0 {
            return x;
        }

        match mode {
            Mode::Inference => x,
            Mode::Training(rng) => {
                let p = self.p;
                let keep_scale = 1.0 / (1.0 - p);
                x.mapv_into(|v| if rng.gen::<f32>() < p { 0.0 } else { v * keep_scale })
            }
        }
    }
}

/// 线性层
///
/// ```text
/// y = xW + b
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct Linear {
    /// 权重: [in_features, out_features]
    weight: Array2<f32>,
    /// 偏置: [out_features]
    bias: Array1<f32>,
}

impl Linear {
    /// Xavier 初始化权重，偏置为 0
    pub fn new<R: Rng + ?Sized>(in_features: usize, out_features: usize, rng: &mut R) -> Self {
        Self {
            weight: xavier_uniform((in_features, out_features), rng),
            bias: Array1::zeros(out_features),
        }
    }

    /// 使用外部提供的参数创建线性层
    pub fn from_weights(weight: Array2<f32>, bias: Array1<f32>) -> Result<Self> {
        if bias.len() != weight.ncols() {
            return Err(ModelError::dims("linear bias", &[weight.ncols()], &[bias.len()]));
        }
        Ok(Self { weight, bias })
    }

    /// 全零线性层
    pub fn zeros(in_features: usize, out_features: usize) -> Self {
        Self {
            weight: Array2::zeros((in_features, out_features)),
            bias: Array1::zeros(out_features),
        }
    }

    /// 单位映射（方阵权重为单位矩阵，偏置为 0）
    pub fn identity(features: usize) -> Self {
        Self {
            weight: Array2::eye(features),
            bias: Array1::zeros(features),
        }
    }

    pub fn in_features(&self) -> usize {
        self.weight.nrows()
    }

    pub fn out_features(&self) -> usize {
        self.weight.ncols()
    }

    /// 前向传播
    ///
    /// # 输入
    /// - `x`: [batch, seq_len, in_features]
    ///
    /// # 输出
    /// - [batch, seq_len, out_features]
    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let (batch, seq_len, d_in) = x.dim();
        if d_in != self.in_features() {
            return Err(ModelError::dims(
                "linear input",
                &[batch, seq_len, self.in_features()],
                &[batch, seq_len, d_in],
            ));
        }

        let mut out = Array3::zeros((batch, seq_len, self.out_features()));
        for (x_b, mut out_b) in x.outer_iter().zip(out.outer_iter_mut()) {
            out_b.assign(&(x_b.dot(&self.weight) + &self.bias));
        }

        Ok(out)
    }

    pub fn weight(&self) -> &Array2<f32> {
        &self.weight
    }

    pub fn bias(&self) -> &Array1<f32> {
        &self.bias
    }
}

impl Parameterized for Linear {
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, ArrayViewD<'a, f32>)>) {
        out.push((param_name(prefix, "weight"), self.weight.view().into_dyn()));
        out.push((param_name(prefix, "bias"), self.bias.view().into_dyn()));
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ArrayViewMutD<'a, f32>)>,
    ) {
        out.push((param_name(prefix, "weight"), self.weight.view_mut().into_dyn()));
        out.push((param_name(prefix, "bias"), self.bias.view_mut().into_dyn()));
    }
}

/// Layer Normalization
///
/// 对每个位置的所有特征进行归一化，使均值为 0，方差为 1。
///
/// ```text
/// y = γ * ((x - μ) / √(σ² + ε)) + β
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct LayerNorm {
    /// 缩放参数 [d_model]
    gamma: Array1<f32>,
    /// 平移参数 [d_model]
    beta: Array1<f32>,
    /// 防止除零的小常数
    eps: f32,
}

impl LayerNorm {
    /// γ 初始化为 1，β 初始化为 0
    pub fn new(d_model: usize, eps: f32) -> Self {
        Self {
            gamma: Array1::ones(d_model),
            beta: Array1::zeros(d_model),
            eps,
        }
    }

    pub fn d_model(&self) -> usize {
        self.gamma.len()
    }

    pub fn eps(&self) -> f32 {
        self.eps
    }

    /// # 输入
    /// - `x`: [batch, seq_len, d_model]
    pub fn forward(&self, x: &Array3<f32>) -> Result<Array3<f32>> {
        let (batch, seq_len, d) = x.dim();
        if d != self.d_model() {
            return Err(ModelError::dims(
                "layer norm input",
                &[batch, seq_len, self.d_model()],
                &[batch, seq_len, d],
            ));
        }
        Ok(x.layer_norm(&self.gamma, &self.beta, self.eps))
    }
}

impl Parameterized for LayerNorm {
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, ArrayViewD<'a, f32>)>) {
        out.push((param_name(prefix, "gamma"), self.gamma.view().into_dyn()));
        out.push((param_name(prefix, "beta"), self.beta.view().into_dyn()));
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ArrayViewMutD<'a, f32>)>,
    ) {
        out.push((param_name(prefix, "gamma"), self.gamma.view_mut().into_dyn()));
        out.push((param_name(prefix, "beta"), self.beta.view_mut().into_dyn()));
    }
}

/// Feed-Forward Network
///
/// 两层全连接网络，中间使用 ReLU 激活函数。
///
/// ```text
/// FFN(x) = Dropout(ReLU(xW1 + b1))W2 + b2
/// ```
///
/// 每个位置独立计算，位置之间没有交互。
#[derive(Debug, Clone, PartialEq)]
pub struct FeedForward {
    /// [d_model → d_ff]
    linear1: Linear,
    /// [d_ff → d_model]
    linear2: Linear,
    dropout: Dropout,
}

impl FeedForward {
    pub fn new<R: Rng + ?Sized>(d_model: usize, d_ff: usize, dropout: Dropout, rng: &mut R) -> Self {
        Self {
            linear1: Linear::new(d_model, d_ff, rng),
            linear2: Linear::new(d_ff, d_model, rng),
            dropout,
        }
    }

    /// 使用外部提供的两个线性层
    pub fn from_linears(linear1: Linear, linear2: Linear, dropout: Dropout) -> Result<Self> {
        if linear1.out_features() != linear2.in_features()
            || linear1.in_features() != linear2.out_features()
        {
            return Err(ModelError::dims(
                "feed-forward layers",
                &[linear1.in_features(), linear1.out_features(), linear1.in_features()],
                &[linear2.out_features(), linear2.in_features(), linear2.out_features()],
            ));
        }
        Ok(Self {
            linear1,
            linear2,
            dropout,
        })
    }

    pub fn forward(&self, x: &Array3<f32>, mode: &mut Mode<'_>) -> Result<Array3<f32>> {
        let hidden = self.linear1.forward(x)?.relu();
        let hidden = self.dropout.forward(hidden, mode);
        self.linear2.forward(&hidden)
    }

    /// 获取维度 (d_model, d_ff)
    pub fn dimensions(&self) -> (usize, usize) {
        (self.linear1.in_features(), self.linear1.out_features())
    }
}

impl Parameterized for FeedForward {
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, ArrayViewD<'a, f32>)>) {
        self.linear1.collect_parameters(&param_name(prefix, "linear1"), out);
        self.linear2.collect_parameters(&param_name(prefix, "linear2"), out);
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ArrayViewMutD<'a, f32>)>,
    ) {
        self.linear1.collect_parameters_mut(&param_name(prefix, "linear1"), out);
        self.linear2.collect_parameters_mut(&param_name(prefix, "linear2"), out);
    }
}

/// 残差连接 + Layer Norm（后归一化）
///
/// ```text
/// output = LayerNorm(x + Dropout(Sublayer(x)))
/// ```
///
/// 归一化在残差相加之后进行，不能与前归一化互换。
#[derive(Debug, Clone, PartialEq)]
pub struct ResidualNorm {
    layer_norm: LayerNorm,
    dropout: Dropout,
}

impl ResidualNorm {
    pub fn new(layer_norm: LayerNorm, dropout: Dropout) -> Self {
        Self { layer_norm, dropout }
    }

    pub fn forward(
        &self,
        x: &Array3<f32>,
        sublayer_output: Array3<f32>,
        mode: &mut Mode<'_>,
    ) -> Result<Array3<f32>> {
        if x.dim() != sublayer_output.dim() {
            let (a, b, c) = x.dim();
            let (d, e, f) = sublayer_output.dim();
            return Err(ModelError::dims("residual connection", &[a, b, c], &[d, e, f]));
        }

        let residual = x + &self.dropout.forward(sublayer_output, mode);
        self.layer_norm.forward(&residual)
    }

    pub fn layer_norm(&self) -> &LayerNorm {
        &self.layer_norm
    }
}

impl Parameterized for ResidualNorm {
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, ArrayViewD<'a, f32>)>) {
        self.layer_norm.collect_parameters(prefix, out);
    }

    fn collect_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ArrayViewMutD<'a, f32>)>,
    ) {
        self.layer_norm.collect_parameters_mut(prefix, out);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, arr2, arr3};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_dropout_config() {
        assert!(Dropout::new(0.0).is_ok());
        assert!(Dropout::new(0.5).is_ok());
        assert!(matches!(Dropout::new(1.0), Err(ModelError::Configuration(_))));
        assert!(Dropout::new(-0.1).is_err());
    }

    #[test]
    fn test_dropout_inference_is_identity() {
        let dropout = Dropout::new(0.5).unwrap();
        let x = Array3::from_elem((2, 3, 4), 1.5f32);

        let y = dropout.forward(x.clone(), &mut Mode::Inference);
        assert_eq!(x, y);
    }

    #[test]
    fn test_dropout_training_is_seeded() {
        let dropout = Dropout::new(0.5).unwrap();
        let x = Array3::from_elem((2, 8, 8), 1.0f32);

        let mut rng_a = StdRng::seed_from_u64(42);
        let mut rng_b = StdRng::seed_from_u64(42);
        let a = dropout.forward(x.clone(), &mut Mode::Training(&mut rng_a));
        let b = dropout.forward(x.clone(), &mut Mode::Training(&mut rng_b));
        assert_eq!(a, b);

        // 保留的元素被放大为 2.0，丢弃的为 0
        assert!(a.iter().all(|&v| v == 0.0 || (v - 2.0).abs() < 1e-6));
        assert!(a.iter().any(|&v| v == 0.0));
        assert!(a.iter().any(|&v| v > 0.0));
    }

    #[test]
    fn test_linear() {
        let linear = Linear::from_weights(
            arr2(&[[1.0, 0.0], [0.0, 2.0], [1.0, 1.0]]),
            arr1(&[0.5, -0.5]),
        )
        .unwrap();

        let x = arr3(&[[[1.0f32, 1.0, 1.0], [0.0, 1.0, 0.0]]]);
        let y = linear.forward(&x).unwrap();

        assert_eq!(y.dim(), (1, 2, 2));
        assert!((y[[0, 0, 0]] - 2.5).abs() < 1e-6);
        assert!((y[[0, 0, 1]] - 2.5).abs() < 1e-6);
        assert!((y[[0, 1, 1]] - 1.5).abs() < 1e-6);
    }

    #[test]
    fn test_linear_rejects_wrong_width() {
        let linear = Linear::zeros(4, 2);
        let x = Array3::zeros((1, 3, 5));
        assert!(matches!(
            linear.forward(&x),
            Err(ModelError::DimensionMismatch { .. })
        ));
        assert!(Linear::from_weights(Array2::zeros((4, 2)), Array1::zeros(3)).is_err());
    }

    #[test]
    fn test_layer_norm() {
        let ln = LayerNorm::new(4, 1e-6);

        let x = arr3(&[[[1.0, 2.0, 3.0, 4.0], [5.0, 6.0, 7.0, 8.0]]]);
        let y = ln.forward(&x).unwrap();

        assert_eq!(y.shape(), x.shape());

        // 验证每个位置的均值接近 0，方差接近 1
        for i in 0..2 {
            let row: Vec<f32> = (0..4).map(|j| y[[0, i, j]]).collect();
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let variance: f32 = row.iter().map(|&v| v * v).sum::<f32>() / 4.0;

            assert!(mean.abs() < 1e-5, "Mean should be close to 0");
            assert!((variance - 1.0).abs() < 1e-4, "Variance should be close to 1");
        }
    }

    #[test]
    fn test_feed_forward() {
        let mut rng = StdRng::seed_from_u64(42);
        let ffn = FeedForward::new(4, 16, Dropout::new(0.1).unwrap(), &mut rng);

        let x = arr3(&[[[1.0, 0.0, 0.0, 0.0], [0.0, 1.0, 0.0, 0.0]]]);
        let y = ffn.forward(&x, &mut Mode::Inference).unwrap();

        assert_eq!(y.shape(), &[1, 2, 4]);
        assert_eq!(ffn.dimensions(), (4, 16));
    }

    #[test]
    fn test_feed_forward_is_position_wise() {
        let mut rng = StdRng::seed_from_u64(3);
        let ffn = FeedForward::new(4, 8, Dropout::new(0.0).unwrap(), &mut rng);

        let a = arr3(&[[[1.0, 2.0, 3.0, 4.0], [0.5, 0.5, 0.5, 0.5]]]);
        let b = arr3(&[[[1.0, 2.0, 3.0, 4.0], [-9.0, 4.0, 0.0, 1.0]]]);

        let ya = ffn.forward(&a, &mut Mode::Inference).unwrap();
        let yb = ffn.forward(&b, &mut Mode::Inference).unwrap();

        // 第一个位置的输入相同，输出也必须相同
        for j in 0..4 {
            assert_eq!(ya[[0, 0, j]], yb[[0, 0, j]]);
        }
    }

    #[test]
    fn test_feed_forward_relu() {
        let ffn = FeedForward::from_linears(
            Linear::identity(2),
            Linear::identity(2),
            Dropout::new(0.0).unwrap(),
        )
        .unwrap();

        let x = arr3(&[[[-1.0, 2.0]]]);
        let y = ffn.forward(&x, &mut Mode::Inference).unwrap();
        assert_eq!(y, arr3(&[[[0.0, 2.0]]]));

        assert!(FeedForward::from_linears(
            Linear::zeros(2, 3),
            Linear::zeros(4, 2),
            Dropout::new(0.0).unwrap()
        )
        .is_err());
    }

    #[test]
    fn test_residual_norm() {
        let rn = ResidualNorm::new(LayerNorm::new(4, 1e-6), Dropout::new(0.0).unwrap());

        let x = arr3(&[[[1.0, 1.0, 1.0, 1.0], [2.0, 2.0, 2.0, 2.0]]]);
        let sublayer = arr3(&[[[0.5, 0.0, -0.5, 1.0], [-0.5, 0.5, 0.0, 0.0]]]);

        let y = rn.forward(&x, sublayer, &mut Mode::Inference).unwrap();

        assert_eq!(y.shape(), &[1, 2, 4]);

        // 验证归一化效果
        for i in 0..2 {
            let mean: f32 = (0..4).map(|j| y[[0, i, j]]).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
        }

        let bad = Array3::zeros((1, 3, 4));
        assert!(rn.forward(&x, bad, &mut Mode::Inference).is_err());
    }

    #[test]
    fn test_named_parameters() {
        let linear = Linear::zeros(3, 2);
        let names: Vec<String> = linear
            .named_parameters()
            .into_iter()
            .map(|(name, _)| name)
            .collect();
        assert_eq!(names, vec!["weight", "bias"]);

        let ffn = FeedForward::from_linears(
            Linear::zeros(3, 5),
            Linear::zeros(5, 3),
            Dropout::new(0.0).unwrap(),
        )
        .unwrap();
        let params = ffn.named_parameters();
        assert_eq!(params[0].0, "linear1.weight");
        assert_eq!(params[0].1.shape(), &[3, 5]);
        assert_eq!(params[3].0, "linear2.bias");
        assert_eq!(params[3].1.shape(), &[3]);
    }
}
