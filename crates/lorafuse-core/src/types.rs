//! Common type definitions.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::LoraFuseError;

/// Floating point storage type for merged weights.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    /// 32-bit floating point.
    Float32,
    /// 16-bit floating point.
    #[default]
    Float16,
    /// Brain floating point (16-bit).
    BFloat16,
}

impl Dtype {
    /// Size of the dtype in bytes.
    #[must_use]
    pub const fn size_bytes(&self) -> usize {
        match self {
            Self::Float32 => 4,
            Self::Float16 | Self::BFloat16 => 2,
        }
    }

    /// Name used in `config.json` (`torch_dtype`) and provenance records.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Float32 => "float32",
            Self::Float16 => "float16",
            Self::BFloat16 => "bfloat16",
        }
    }

    /// The matching safetensors dtype.
    #[must_use]
    pub const fn to_safetensors(&self) -> safetensors::Dtype {
        match self {
            Self::Float32 => safetensors::Dtype::F32,
            Self::Float16 => safetensors::Dtype::F16,
            Self::BFloat16 => safetensors::Dtype::BF16,
        }
    }

    /// Map a safetensors dtype back, if it is one of the floating types we handle.
    #[must_use]
    pub fn from_safetensors(dtype: safetensors::Dtype) -> Option<Self> {
        match dtype {
            safetensors::Dtype::F32 => Some(Self::Float32),
            safetensors::Dtype::F16 => Some(Self::Float16),
            safetensors::Dtype::BF16 => Some(Self::BFloat16),
            _ => None,
        }
    }
}

impl fmt::Display for Dtype {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Dtype {
    type Err = LoraFuseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "float32" | "fp32" | "f32" => Ok(Self::Float32),
            "float16" | "fp16" | "f16" | "half" => Ok(Self::Float16),
            "bfloat16" | "bf16" => Ok(Self::BFloat16),
            other => Err(LoraFuseError::Config(format!("unknown dtype '{other}'"))),
        }
    }
}

/// Byte size in the decimal convention used by `max_shard_size` ("2GB" = 2 * 10^9).
///
/// Binary suffixes (`KiB`, `MiB`, `GiB`) are also accepted.
pub fn parse_byte_size(s: &str) -> crate::Result<u64> {
    let trimmed = s.trim();
    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);

    let value: f64 = number
        .parse()
        .map_err(|_| LoraFuseError::Config(format!("invalid size '{s}'")))?;

    let multiplier: u64 = match unit.trim().to_ascii_uppercase().as_str() {
        "" | "B" => 1,
        "KB" => 1_000,
        "MB" => 1_000_000,
        "GB" => 1_000_000_000,
        "KIB" => 1 << 10,
        "MIB" => 1 << 20,
        "GIB" => 1 << 30,
        other => {
            return Err(LoraFuseError::Config(format!(
                "unknown size unit '{other}' in '{s}'"
            )))
        }
    };

    let bytes = (value * multiplier as f64).round();
    if bytes < 1.0 {
        return Err(LoraFuseError::Config(format!("size '{s}' must be positive")));
    }
    Ok(bytes as u64)
}
