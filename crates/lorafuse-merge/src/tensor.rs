//! Host-side weight tensors.
//!
//! Floating point tensors (`F32`, `F16`, `BF16`) are widened to `f32` on load
//! so the fold math runs in one precision; they are narrowed again to the
//! output dtype when written. Everything else (integer buffers, masks) keeps
//! its raw little-endian bytes and passes through untouched.

use half::{bf16, f16};
use lorafuse_core::{Dtype, LoraFuseError, Result};

/// Tensor payload.
#[derive(Debug, Clone, PartialEq)]
pub enum TensorData {
    /// Floating point values widened to `f32`.
    Float(Vec<f32>),
    /// Non-floating tensor kept verbatim.
    Raw {
        /// Original safetensors dtype.
        dtype: safetensors::Dtype,
        /// Little-endian bytes.
        bytes: Vec<u8>,
    },
}

/// A named tensor's shape and data, independent of any checkpoint file.
#[derive(Debug, Clone, PartialEq)]
pub struct WeightTensor {
    shape: Vec<usize>,
    data: TensorData,
}

impl WeightTensor {
    /// Build a floating tensor from `f32` values.
    pub fn from_f32(shape: Vec<usize>, values: Vec<f32>) -> Result<Self> {
        let expected: usize = shape.iter().product();
        if values.len() != expected {
            return Err(LoraFuseError::Config(format!(
                "{} values do not fill shape {:?}",
                values.len(),
                shape
            )));
        }
        Ok(Self {
            shape,
            data: TensorData::Float(values),
        })
    }

    /// Decode checkpoint bytes.
    pub fn from_bytes(
        name: &str,
        dtype: safetensors::Dtype,
        shape: Vec<usize>,
        bytes: &[u8],
    ) -> Result<Self> {
        let numel: usize = shape.iter().product();
        if bytes.len() != numel * dtype.size() {
            return Err(LoraFuseError::ModelLoad(format!(
                "tensor '{name}' has {} bytes, expected {} for {:?} {:?}",
                bytes.len(),
                numel * dtype.size(),
                dtype,
                shape
            )));
        }

        // Checkpoint data is not guaranteed to be aligned, so decode per element.
        let data = match dtype {
            safetensors::Dtype::F32 => TensorData::Float(
                bytes
                    .chunks_exact(4)
                    .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                    .collect(),
            ),
            safetensors::Dtype::F16 => TensorData::Float(
                bytes
                    .chunks_exact(2)
                    .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect(),
            ),
            safetensors::Dtype::BF16 => TensorData::Float(
                bytes
                    .chunks_exact(2)
                    .map(|c| bf16::from_le_bytes([c[0], c[1]]).to_f32())
                    .collect(),
            ),
            other => TensorData::Raw {
                dtype: other,
                bytes: bytes.to_vec(),
            },
        };

        Ok(Self { shape, data })
    }

    /// Decode a tensor view from a parsed safetensors file.
    pub fn from_view(name: &str, view: &safetensors::tensor::TensorView<'_>) -> Result<Self> {
        Self::from_bytes(name, view.dtype(), view.shape().to_vec(), view.data())
    }

    /// Tensor shape.
    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    /// Number of elements.
    pub fn num_elements(&self) -> usize {
        self.shape.iter().product()
    }

    /// Whether the tensor holds floating point values.
    pub fn is_float(&self) -> bool {
        matches!(self.data, TensorData::Float(_))
    }

    /// Payload.
    pub fn data(&self) -> &TensorData {
        &self.data
    }

    /// Floating point values, if any.
    pub fn values(&self) -> Option<&[f32]> {
        match &self.data {
            TensorData::Float(v) => Some(v),
            TensorData::Raw { .. } => None,
        }
    }

    /// Mutable floating point values, if any.
    pub fn values_mut(&mut self) -> Option<&mut [f32]> {
        match &mut self.data {
            TensorData::Float(v) => Some(v),
            TensorData::Raw { .. } => None,
        }
    }

    /// Dtype the tensor is written with when floats are stored as `dtype`.
    pub fn stored_dtype(&self, dtype: Dtype) -> safetensors::Dtype {
        match &self.data {
            TensorData::Float(_) => dtype.to_safetensors(),
            TensorData::Raw { dtype: raw, .. } => *raw,
        }
    }

    /// Encode for writing, narrowing floats to `dtype`.
    pub fn to_bytes(&self, dtype: Dtype) -> Vec<u8> {
        match &self.data {
            TensorData::Float(values) => match dtype {
                Dtype::Float32 => bytemuck::cast_slice(values).to_vec(),
                Dtype::Float16 => {
                    let halfs: Vec<f16> = values.iter().map(|&v| f16::from_f32(v)).collect();
                    bytemuck::cast_slice(&halfs).to_vec()
                }
                Dtype::BFloat16 => {
                    let halfs: Vec<bf16> = values.iter().map(|&v| bf16::from_f32(v)).collect();
                    bytemuck::cast_slice(&halfs).to_vec()
                }
            },
            TensorData::Raw { bytes, .. } => bytes.clone(),
        }
    }
}

/// Bytes a tensor occupies once written, given its checkpoint dtype.
pub fn stored_size(shape: &[usize], source: safetensors::Dtype, dtype: Dtype) -> u64 {
    let numel: usize = shape.iter().product();
    let width = match Dtype::from_safetensors(source) {
        Some(_) => dtype.size_bytes(),
        None => source.size(),
    };
    (numel * width) as u64
}
