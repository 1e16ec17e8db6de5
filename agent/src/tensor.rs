//! Byte-backed tensors exchanged between ranks
//!
//! A [`Tensor`] owns its element bytes (little-endian) together with a dtype
//! and shape. A [`TensorMeta`] carries the dtype and shape only; it is what
//! travels over the object channel in place of the real payload.

use crate::errors::{AgentError, Result};
use serde::{Deserialize, Serialize};

/// Element type of a tensor or of model weights/activations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    F32,
    F16,
    BF16,
    I64,
    I32,
    U8,
}

impl DType {
    /// Size of one element in bytes.
    pub fn size(&self) -> usize {
        match self {
            DType::F32 | DType::I32 => 4,
            DType::F16 | DType::BF16 => 2,
            DType::I64 => 8,
            DType::U8 => 1,
        }
    }
}

/// Shape and dtype of a tensor without its data.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TensorMeta {
    pub dtype: DType,
    pub shape: Vec<usize>,
}

impl TensorMeta {
    pub fn new(dtype: DType, shape: Vec<usize>) -> Self {
        Self { dtype, shape }
    }

    /// Number of elements described by the shape.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Number of bytes a materialized tensor with this meta occupies.
    pub fn byte_len(&self) -> usize {
        self.num_elements() * self.dtype.size()
    }
}

/// Tensor data with its dtype and shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    pub dtype: DType,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl Tensor {
    /// Create a tensor from raw little-endian bytes
    ///
    /// # Panics
    /// Panics if the byte length doesn't match the shape and dtype.
    pub fn new(dtype: DType, shape: Vec<usize>, data: Vec<u8>) -> Self {
        let expected_len = shape.iter().product::<usize>() * dtype.size();
        assert_eq!(
            data.len(),
            expected_len,
            "Data length {} doesn't match shape byte size {}",
            data.len(),
            expected_len
        );
        Self { dtype, shape, data }
    }

    /// Allocate a zero-filled tensor matching a placeholder.
    pub fn zeros(meta: &TensorMeta) -> Self {
        Self {
            dtype: meta.dtype,
            shape: meta.shape.clone(),
            data: vec![0u8; meta.byte_len()],
        }
    }

    pub fn from_i64(values: &[i64], shape: Vec<usize>) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::I64, shape, data)
    }

    pub fn from_f32(values: &[f32], shape: Vec<usize>) -> Self {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(DType::F32, shape, data)
    }

    /// Decode the elements as i64 values.
    pub fn to_i64_vec(&self) -> Result<Vec<i64>> {
        if self.dtype != DType::I64 {
            return Err(AgentError::Backend(format!(
                "Expected i64 tensor, got {:?}",
                self.dtype
            )));
        }
        Ok(self
            .data
            .chunks_exact(8)
            .map(|c| i64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
            .collect())
    }

    /// Decode the elements as f32 values.
    pub fn to_f32_vec(&self) -> Result<Vec<f32>> {
        if self.dtype != DType::F32 {
            return Err(AgentError::Backend(format!(
                "Expected f32 tensor, got {:?}",
                self.dtype
            )));
        }
        Ok(self
            .data
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect())
    }

    pub fn meta(&self) -> TensorMeta {
        TensorMeta::new(self.dtype, self.shape.clone())
    }

    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}
