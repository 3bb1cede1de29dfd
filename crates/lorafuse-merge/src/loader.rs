//! Lazy tensor loading for base model checkpoints.
//!
//! Tensors are indexed up front (name, dtype, shape, byte range) and decoded
//! on demand, so only the tensor currently being merged is held in `f32`.
//! With `low_cpu_mem_usage` the shard files are memory-mapped; otherwise they
//! are read into owned buffers.

use std::collections::HashMap;
use std::ops::Deref;
use std::path::{Path, PathBuf};

use lorafuse_core::files::{ADAPTER_WEIGHTS_FILE, WEIGHTS_INDEX_FILE};
use lorafuse_core::{LoadConfig, LoraFuseError, Result};
use lorafuse_hub::DownloadOptions;
use safetensors::SafeTensors;
use tracing::{debug, info};

use crate::WeightTensor;

/// Trait for loading tensors from a model.
pub trait TensorLoader: Send + Sync {
    /// Get the names of all tensors in the model.
    fn tensor_names(&self) -> Vec<String>;

    /// Load a tensor by name.
    fn load_tensor(&self, name: &str) -> Result<WeightTensor>;

    /// Get the shape of a tensor without loading it.
    fn tensor_shape(&self, name: &str) -> Result<Vec<usize>>;

    /// Get the dtype of a tensor.
    fn tensor_dtype(&self, name: &str) -> Result<safetensors::Dtype>;
}

enum Backing {
    Mapped(memmap2::Mmap),
    Owned(Vec<u8>),
}

impl Deref for Backing {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            Self::Mapped(m) => m,
            Self::Owned(v) => v,
        }
    }
}

/// Location of a tensor within a checkpoint file.
#[derive(Debug, Clone)]
struct TensorLocation {
    /// Index into the files array.
    file_idx: usize,
    /// Byte offset within the file.
    offset: usize,
    /// Length in bytes.
    len: usize,
    /// Data type.
    dtype: safetensors::Dtype,
    /// Shape.
    shape: Vec<usize>,
}

/// Lazy loader for safetensors checkpoints.
pub struct SafetensorsLoader {
    /// Path to the model directory or file.
    path: PathBuf,
    /// Shard contents.
    files: Vec<(PathBuf, Backing)>,
    /// Mapping from tensor name to its location.
    tensor_info: HashMap<String, TensorLocation>,
}

impl std::fmt::Debug for SafetensorsLoader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafetensorsLoader")
            .field("path", &self.path)
            .field("files", &self.files.len())
            .field("tensors", &self.tensor_info.len())
            .finish()
    }
}

/// Checkpoint files that make up the model at `path`.
///
/// An index file, when present, is authoritative: files it does not name
/// (e.g. a stray `consolidated.safetensors`) are ignored.
pub fn checkpoint_files(path: &Path) -> Result<Vec<PathBuf>> {
    if path.is_file() {
        if path.extension().is_some_and(|e| e == "safetensors") {
            return Ok(vec![path.to_path_buf()]);
        }
        return Err(LoraFuseError::ModelLoad(format!(
            "{:?} is not a safetensors file",
            path
        )));
    }

    if !path.is_dir() {
        return Err(LoraFuseError::ModelLoad(format!(
            "No model found at {:?}",
            path
        )));
    }

    let index = path.join(WEIGHTS_INDEX_FILE);
    if index.is_file() {
        let files: Vec<PathBuf> = lorafuse_hub::shards_in_index(&index)?
            .into_iter()
            .map(|name| path.join(name))
            .collect();
        if let Some(missing) = files.iter().find(|f| !f.is_file()) {
            return Err(LoraFuseError::ModelLoad(format!(
                "{} names {:?}, which does not exist",
                WEIGHTS_INDEX_FILE, missing
            )));
        }
        return Ok(files);
    }

    let mut files = Vec::new();
    for entry in std::fs::read_dir(path).map_err(|e| LoraFuseError::io_at(path, e))? {
        let file_path = entry?.path();
        let is_weights = file_path.extension().is_some_and(|e| e == "safetensors");
        let is_adapter = file_path
            .file_name()
            .is_some_and(|n| n == ADAPTER_WEIGHTS_FILE);
        if is_weights && !is_adapter {
            files.push(file_path);
        }
    }

    if files.is_empty() {
        return Err(LoraFuseError::ModelLoad(format!(
            "No safetensors files found in {:?}",
            path
        )));
    }

    // Sort for deterministic ordering
    files.sort();
    Ok(files)
}

impl SafetensorsLoader {
    /// Create a new loader for a model directory or single safetensors file.
    pub fn new(path: impl AsRef<Path>, low_cpu_mem_usage: bool) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let checkpoint = checkpoint_files(&path)?;

        info!(
            "Loading {} safetensors files from {:?}",
            checkpoint.len(),
            path
        );

        let mut files: Vec<(PathBuf, Backing)> = Vec::with_capacity(checkpoint.len());
        let mut tensor_info: HashMap<String, TensorLocation> = HashMap::new();

        for (idx, file_path) in checkpoint.into_iter().enumerate() {
            debug!("Indexing {:?}", file_path);
            let backing = if low_cpu_mem_usage {
                let file = std::fs::File::open(&file_path)
                    .map_err(|e| LoraFuseError::io_at(&file_path, e))?;
                // SAFETY: the file is opened read-only and the map lives as
                // long as this loader.
                #[allow(unsafe_code)]
                let mmap = unsafe { memmap2::Mmap::map(&file) }
                    .map_err(|e| LoraFuseError::io_at(&file_path, e))?;
                Backing::Mapped(mmap)
            } else {
                Backing::Owned(
                    std::fs::read(&file_path).map_err(|e| LoraFuseError::io_at(&file_path, e))?,
                )
            };

            let tensors = SafeTensors::deserialize(&backing)?;
            let base_ptr = backing.as_ptr() as usize;
            for (name, view) in tensors.tensors() {
                let data = view.data();
                let location = TensorLocation {
                    file_idx: idx,
                    offset: data.as_ptr() as usize - base_ptr,
                    len: data.len(),
                    dtype: view.dtype(),
                    shape: view.shape().to_vec(),
                };
                if let Some(previous) = tensor_info.insert(name.clone(), location) {
                    return Err(LoraFuseError::ModelLoad(format!(
                        "tensor '{}' appears in both {:?} and {:?}",
                        name, files[previous.file_idx].0, file_path
                    )));
                }
            }

            files.push((file_path, backing));
        }

        info!("Indexed {} tensors", tensor_info.len());

        Ok(Self {
            path,
            files,
            tensor_info,
        })
    }

    fn location(&self, name: &str) -> Result<&TensorLocation> {
        self.tensor_info
            .get(name)
            .ok_or_else(|| LoraFuseError::TensorNotFound(name.to_string()))
    }
}

impl TensorLoader for SafetensorsLoader {
    fn tensor_names(&self) -> Vec<String> {
        self.tensor_info.keys().cloned().collect()
    }

    fn load_tensor(&self, name: &str) -> Result<WeightTensor> {
        let loc = self.location(name)?;
        let (_, backing) = &self.files[loc.file_idx];
        let data = &backing[loc.offset..loc.offset + loc.len];
        WeightTensor::from_bytes(name, loc.dtype, loc.shape.clone(), data)
    }

    fn tensor_shape(&self, name: &str) -> Result<Vec<usize>> {
        Ok(self.location(name)?.shape.clone())
    }

    fn tensor_dtype(&self, name: &str) -> Result<safetensors::Dtype> {
        Ok(self.location(name)?.dtype)
    }
}

// =============================================================================
// Model Sources
// =============================================================================

/// Where base model weights come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModelSource {
    /// Local path to model directory or file.
    Local(PathBuf),
    /// HuggingFace Hub repository ID.
    Hub {
        /// Repository ID (e.g., "TinyLlama/TinyLlama-1.1B-Chat-v1.0").
        repo_id: String,
        /// Optional revision (branch, tag, or commit).
        revision: Option<String>,
    },
}

impl ModelSource {
    /// Create a model source from a HuggingFace repo ID.
    pub fn from_hub(repo_id: impl Into<String>, revision: Option<String>) -> Self {
        Self::Hub {
            repo_id: repo_id.into(),
            revision,
        }
    }

    /// Parse a model source from a string.
    ///
    /// Existing paths and anything that starts like a path are local; the
    /// rest is taken as a Hub repo ID.
    pub fn parse(s: &str, revision: Option<String>) -> Self {
        let path = Path::new(s);
        if path.exists() {
            return Self::Local(path.to_path_buf());
        }

        if s.starts_with('/') || s.starts_with('.') || s.starts_with('~') {
            return Self::Local(path.to_path_buf());
        }

        #[cfg(windows)]
        if s.contains('\\') || path.is_absolute() {
            return Self::Local(path.to_path_buf());
        }

        Self::from_hub(s, revision)
    }

    /// Resolve to a local model directory, downloading Hub snapshots.
    pub fn resolve(&self, config: &LoadConfig, include_tokenizer: bool) -> Result<PathBuf> {
        match self {
            Self::Local(path) => Ok(path.clone()),
            Self::Hub { repo_id, revision } => {
                info!("Downloading model from Hub: {}", repo_id);
                lorafuse_hub::download_model(
                    repo_id,
                    revision.as_deref(),
                    &DownloadOptions {
                        include_tokenizer,
                        include_remote_code: config.trust_remote_code,
                    },
                )
            }
        }
    }
}
