//! Error types for lorafuse.

use thiserror::Error;

/// Result type alias for lorafuse operations.
pub type Result<T> = std::result::Result<T, LoraFuseError>;

/// Main error type for lorafuse operations.
#[derive(Error, Debug)]
pub enum LoraFuseError {
    /// Base model could not be resolved or read.
    #[error("Failed to load model: {0}")]
    ModelLoad(String),

    /// Adapter directory is malformed.
    #[error("Failed to load adapter: {0}")]
    AdapterLoad(String),

    /// Adapter does not fit the base model.
    #[error("Adapter incompatible with base model: {0}")]
    IncompatibleAdapter(String),

    /// Tensor not found in a checkpoint.
    #[error("Tensor not found: {0}")]
    TensorNotFound(String),

    /// Tensor shape mismatch.
    #[error("Shape mismatch for tensor '{name}': expected {expected:?}, got {actual:?}")]
    ShapeMismatch {
        /// Tensor name.
        name: String,
        /// Expected shape.
        expected: Vec<usize>,
        /// Actual shape.
        actual: Vec<usize>,
    },

    /// Tensor dtype that cannot take part in the requested operation.
    #[error("Unsupported dtype {dtype} for tensor '{name}'")]
    UnsupportedDtype {
        /// Tensor name.
        name: String,
        /// Dtype as reported by safetensors.
        dtype: String,
    },

    /// Configuration errors.
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization errors.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Safetensors format errors.
    #[error("Safetensors error: {0}")]
    Safetensors(#[from] safetensors::SafeTensorError),

    /// HuggingFace Hub errors.
    #[error("Hub error: {0}")]
    Hub(String),

    /// Tokenizer errors.
    #[error("Tokenizer error: {0}")]
    Tokenizer(String),
}

impl LoraFuseError {
    /// Attach a path to an I/O failure so the message says which file broke.
    pub fn io_at(path: impl AsRef<std::path::Path>, err: std::io::Error) -> Self {
        Self::Io(std::io::Error::new(
            err.kind(),
            format!("{}: {}", path.as_ref().display(), err),
        ))
    }
}
