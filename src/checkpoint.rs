//! 模型参数的枚举、快照和恢复
//!
//! 核心不做文件 I/O：这里只负责把所有具名参数按确定顺序列出，打包成可序列化的
//! [`ParameterSet`]（JSON 或 bincode 字节），以及把快照写回模型。落盘由外部的
//! 检查点组件负责。

use std::collections::HashMap;

use ndarray::{ArrayD, ArrayViewD, ArrayViewMutD, IxDyn};
use serde::{Deserialize, Serialize};

use crate::error::{ModelError, Result};

/// 拼接参数名：`prefix.name`，prefix 为空时直接返回 `name`
pub fn param_name(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}.{}", prefix, name)
    }
}

/// 拥有具名参数的组件
///
/// 参数的枚举顺序是确定的，与构造顺序一致。
pub trait Parameterized {
    /// 按确定顺序收集只读参数视图
    fn collect_parameters<'a>(&'a self, prefix: &str, out: &mut Vec<(String, ArrayViewD<'a, f32>)>);

    /// 按相同顺序收集可写参数视图
    fn collect_parameters_mut<'a>(
        &'a mut self,
        prefix: &str,
        out: &mut Vec<(String, ArrayViewMutD<'a, f32>)>,
    );

    /// 所有具名参数及其形状
    fn named_parameters(&self) -> Vec<(String, ArrayViewD<'_, f32>)> {
        let mut out = Vec::new();
        self.collect_parameters("", &mut out);
        out
    }

    fn named_parameters_mut(&mut self) -> Vec<(String, ArrayViewMutD<'_, f32>)> {
        let mut out = Vec::new();
        self.collect_parameters_mut("", &mut out);
        out
    }

    /// 参数总数
    fn param_count(&self) -> usize {
        self.named_parameters().iter().map(|(_, p)| p.len()).sum()
    }
}

/// 单个具名张量（行优先展开）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NamedTensor {
    pub name: String,
    pub shape: Vec<usize>,
    pub data: Vec<f32>,
}

impl NamedTensor {
    pub fn from_view(name: impl Into<String>, view: &ArrayViewD<'_, f32>) -> Self {
        Self {
            name: name.into(),
            shape: view.shape().to_vec(),
            data: view.iter().copied().collect(),
        }
    }

    /// 转换为 ndarray 动态维度数组
    pub fn to_array(&self) -> Result<ArrayD<f32>> {
        ArrayD::from_shape_vec(IxDyn(&self.shape), self.data.clone())
            .map_err(|e| ModelError::Serialization(format!("tensor '{}': {}", self.name, e)))
    }

    fn expected_len(&self) -> usize {
        self.shape.iter().product()
    }
}

/// 参数快照
///
/// 模型所有参数按枚举顺序排列，可编码为 JSON（可读）或 bincode（紧凑）。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ParameterSet {
    pub tensors: Vec<NamedTensor>,
}

impl ParameterSet {
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    pub fn get(&self, name: &str) -> Option<&NamedTensor> {
        self.tensors.iter().find(|t| t.name == name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.tensors.iter().map(|t| t.name.as_str())
    }

    /// 所有张量的元素总数
    pub fn total_elements(&self) -> usize {
        self.tensors.iter().map(|t| t.data.len()).sum()
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// 模型状态保存/恢复
///
/// 对所有 [`Parameterized`] 类型自动实现。
pub trait StateDict {
    /// 导出参数快照
    fn state_dict(&self) -> ParameterSet;

    /// 从快照恢复参数
    ///
    /// 先校验名称和形状，全部通过后才写入，失败时模型保持不变。
    fn load_state_dict(&mut self, params: &ParameterSet) -> Result<()>;
}

impl<T: Parameterized> StateDict for T {
    fn state_dict(&self) -> ParameterSet {
        let tensors = self
            .named_parameters()
            .iter()
            .map(|(name, view)| NamedTensor::from_view(name.clone(), view))
            .collect();

        ParameterSet { tensors }
    }

    fn load_state_dict(&mut self, params: &ParameterSet) -> Result<()> {
        let by_name: HashMap<&str, &NamedTensor> =
            params.tensors.iter().map(|t| (t.name.as_str(), t)).collect();

        let targets = self.named_parameters_mut();
        let mut plan = Vec::with_capacity(targets.len());

        for (name, view) in targets {
            let tensor = by_name
                .get(name.as_str())
                .ok_or_else(|| ModelError::config(format!("missing parameter '{}'", name)))?;

            if tensor.shape != view.shape() {
                return Err(ModelError::dims("parameter shape", view.shape(), &tensor.shape));
            }
            if tensor.data.len() != tensor.expected_len() {
                return Err(ModelError::Serialization(format!(
                    "tensor '{}' has {} values for shape {:?}",
                    name,
                    tensor.data.len(),
                    tensor.shape
                )));
            }

            plan.push((view, *tensor));
        }

        if by_name.len() != plan.len() {
            let known: Vec<&str> = plan.iter().map(|(_, t)| t.name.as_str()).collect();
            let extra = by_name
                .keys()
                .find(|name| !known.contains(*name))
                .copied()
                .unwrap_or_default();
            return Err(ModelError::config(format!("unexpected parameter '{}'", extra)));
        }

        let restored = plan.len();
        for (mut view, tensor) in plan {
            let source = ArrayViewD::from_shape(IxDyn(&tensor.shape), &tensor.data)
                .map_err(|e| ModelError::Serialization(e.to_string()))?;
            view.assign(&source);
        }

        tracing::debug!(restored, "restored parameter snapshot");
        Ok(())
    }
}
