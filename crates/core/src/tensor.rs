//! Tensor values and their shape/type descriptors.

use crate::error::GraphError;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Element type of a tensor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit float
    #[default]
    F32,
    /// 16-bit float
    F16,
    /// bfloat16
    BF16,
    /// 32-bit signed integer
    I32,
}

impl std::fmt::Display for DType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DType::F32 => write!(f, "f32"),
            DType::F16 => write!(f, "f16"),
            DType::BF16 => write!(f, "bf16"),
            DType::I32 => write!(f, "i32"),
        }
    }
}

/// Shape and element type of a tensor, without any data.
///
/// This is what a placeholder carries before it is materialized.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TensorMeta {
    /// Dimensions; empty for a scalar
    pub shape: Vec<usize>,
    /// Element type
    #[serde(default)]
    pub dtype: DType,
}

impl TensorMeta {
    /// Create a descriptor.
    pub fn new(shape: impl Into<Vec<usize>>, dtype: DType) -> Self {
        Self {
            shape: shape.into(),
            dtype,
        }
    }

    /// Descriptor of an f32 scalar.
    pub fn scalar() -> Self {
        Self::new(Vec::new(), DType::F32)
    }

    /// Number of elements described.
    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of dimensions.
    pub fn rank(&self) -> usize {
        self.shape.len()
    }
}

impl std::fmt::Display for TensorMeta {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}{:?}", self.dtype, self.shape)
    }
}

/// A concrete tensor. Storage is shared and immutable, so clones are cheap.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "TensorRepr", into = "TensorRepr")]
pub struct Tensor {
    meta: TensorMeta,
    data: Arc<Vec<f32>>,
}

impl Tensor {
    /// Build a tensor, checking the data length against the shape.
    pub fn new(meta: TensorMeta, data: Vec<f32>) -> Result<Self, GraphError> {
        let expected = meta.numel();
        if data.len() != expected {
            return Err(GraphError::DataLength {
                shape: meta.shape.clone(),
                expected,
                actual: data.len(),
            });
        }
        Ok(Self {
            meta,
            data: Arc::new(data),
        })
    }

    /// Build an f32 tensor from a shape and data.
    pub fn from_vec(shape: impl Into<Vec<usize>>, data: Vec<f32>) -> Result<Self, GraphError> {
        Self::new(TensorMeta::new(shape, DType::F32), data)
    }

    /// f32 scalar.
    pub fn scalar(value: f32) -> Self {
        Self {
            meta: TensorMeta::scalar(),
            data: Arc::new(vec![value]),
        }
    }

    /// Shape/type descriptor.
    pub fn meta(&self) -> &TensorMeta {
        &self.meta
    }

    /// Dimensions.
    pub fn shape(&self) -> &[usize] {
        &self.meta.shape
    }

    /// Element type.
    pub fn dtype(&self) -> DType {
        self.meta.dtype
    }

    /// Flat row-major data.
    pub fn data(&self) -> &[f32] {
        &self.data
    }

    /// Bitwise equality, used to compare runs for identical results.
    pub fn bitwise_eq(&self, other: &Tensor) -> bool {
        self.meta == other.meta
            && self.data.len() == other.data.len()
            && self
                .data
                .iter()
                .zip(other.data.iter())
                .all(|(a, b)| a.to_bits() == b.to_bits())
    }
}

#[derive(Serialize, Deserialize)]
struct TensorRepr {
    shape: Vec<usize>,
    #[serde(default)]
    dtype: DType,
    data: Vec<f32>,
}

impl TryFrom<TensorRepr> for Tensor {
    type Error = GraphError;

    fn try_from(repr: TensorRepr) -> Result<Self, Self::Error> {
        Tensor::new(TensorMeta::new(repr.shape, repr.dtype), repr.data)
    }
}

impl From<Tensor> for TensorRepr {
    fn from(tensor: Tensor) -> Self {
        TensorRepr {
            shape: tensor.meta.shape,
            dtype: tensor.meta.dtype,
            data: tensor.data.as_ref().clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tensor_rejects_wrong_length() {
        let err = Tensor::from_vec([2, 2], vec![1.0, 2.0, 3.0]).unwrap_err();
        assert!(matches!(err, GraphError::DataLength { expected: 4, actual: 3, .. }));
    }

    #[test]
    fn test_scalar_meta() {
        let t = Tensor::scalar(3.0);
        assert_eq!(t.meta().rank(), 0);
        assert_eq!(t.meta().numel(), 1);
        assert_eq!(t.data(), &[3.0]);
    }

    #[test]
    fn test_tensor_json_validates_shape() {
        let ok: Tensor = serde_json::from_value(serde_json::json!({
            "shape": [2],
            "data": [1.0, 2.0]
        }))
        .unwrap();
        assert_eq!(ok.shape(), &[2]);
        assert_eq!(ok.dtype(), DType::F32);

        let bad = serde_json::from_value::<Tensor>(serde_json::json!({
            "shape": [3],
            "data": [1.0]
        }));
        assert!(bad.is_err());
    }

    #[test]
    fn test_bitwise_eq_distinguishes_signed_zero() {
        let a = Tensor::from_vec([1], vec![0.0]).unwrap();
        let b = Tensor::from_vec([1], vec![-0.0]).unwrap();
        assert_eq!(a, b);
        assert!(!a.bitwise_eq(&b));
    }

    #[test]
    fn test_meta_display() {
        let meta = TensorMeta::new([2, 3], DType::BF16);
        assert_eq!(meta.to_string(), "bf16[2, 3]");
    }
}
