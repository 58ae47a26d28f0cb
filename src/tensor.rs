//! 张量操作扩展和工具函数
//!
//! 基于 ndarray 实现 Transformer 所需的张量操作。所有归一化类操作都沿最后一个轴进行，
//! 因此同一套实现可以用于 [seq_len, d_model]、[batch, seq_len, d_model]
//! 以及 [batch, heads, seq_q, seq_k] 形状的张量。

use ndarray::{Array, Array1, Array2, Axis, Dimension, Zip};
use num_traits::{Float, NumAssign, NumCast};
use rand::Rng;

/// 张量扩展 trait
pub trait TensorExt<A> {
    /// 沿最后一个轴做数值稳定的 softmax
    fn softmax(&self) -> Self;

    /// 沿最后一个轴做层归一化
    ///
    /// ```text
    /// y = γ * ((x - μ) / √(σ² + ε)) + β
    /// ```
    fn layer_norm(&self, gamma: &Array1<A>, beta: &Array1<A>, eps: A) -> Self;

    /// ReLU 激活函数
    fn relu(&self) -> Self;
}

impl<A, D> TensorExt<A> for Array<A, D>
where
    A: Float + NumAssign,
    D: Dimension,
{
    fn softmax(&self) -> Self {
        let mut out = self.clone();
        if out.ndim() == 0 {
            return out;
        }
        let axis = Axis(out.ndim() - 1);

        for mut lane in out.lanes_mut(axis) {
            // 减去最大值以提高数值稳定性
            let max = lane.fold(A::neg_infinity(), |m, &v| m.max(v));
            lane.mapv_inplace(|v| (v - max).exp());
            let sum = lane.fold(A::zero(), |s, &v| s + v);
            lane.mapv_inplace(|v| v / sum);
        }

        out
    }

    fn layer_norm(&self, gamma: &Array1<A>, beta: &Array1<A>, eps: A) -> Self {
        let mut out = self.clone();
        if out.ndim() == 0 {
            return out;
        }
        let axis = Axis(out.ndim() - 1);

        for mut lane in out.lanes_mut(axis) {
            let n = <A as NumCast>::from(lane.len()).unwrap_or_else(A::one);
            let mean = lane.fold(A::zero(), |s, &v| s + v) / n;
            let var = lane.fold(A::zero(), |s, &v| s + (v - mean) * (v - mean)) / n;
            let std = (var + eps).sqrt();

            Zip::from(&mut lane)
                .and(gamma)
                .and(beta)
                .for_each(|x, &g, &b| *x = (*x - mean) / std * g + b);
        }

        out
    }

    fn relu(&self) -> Self {
        self.mapv(|v| v.max(A::zero()))
    }
}

/// Xavier 均匀初始化
///
/// 随机源由调用方提供，同一个种子总是得到相同的权重。
pub fn xavier_uniform<R: Rng + ?Sized>(shape: (usize, usize), rng: &mut R) -> Array2<f32> {
    let limit = (6.0 / (shape.0 + shape.1).max(1) as f32).sqrt();

    Array2::from_shape_fn(shape, |_| rng.gen_range(-limit..=limit))
}
