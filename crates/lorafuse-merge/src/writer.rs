//! Sharded safetensors output.
//!
//! The shard layout is planned up front from tensor shapes, so file names
//! (`model-00001-of-00003.safetensors`) are known before any data is
//! written and each shard is flushed as soon as its last tensor arrives.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use lorafuse_core::files::{SINGLE_WEIGHTS_FILE, WEIGHTS_INDEX_FILE};
use lorafuse_core::{Dtype, LoraFuseError, Result};
use safetensors::tensor::TensorView;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::WeightTensor;

/// Largest file the writer produces unless told otherwise (2 GB).
pub const DEFAULT_MAX_SHARD_SIZE: u64 = 2_000_000_000;

/// Length prefix, `__metadata__` block and alignment padding.
const HEADER_OVERHEAD: u64 = 64;

/// Upper bound on the header bytes one tensor entry takes.
fn header_cost(name: &str, ndims: usize) -> u64 {
    (name.len() + 112 + 21 * ndims) as u64
}

/// A tensor as seen by the planner.
#[derive(Debug, Clone)]
pub struct PlannedTensor {
    /// Tensor name.
    pub name: String,
    /// Number of dimensions.
    pub ndims: usize,
    /// Data bytes once written.
    pub size: u64,
}

/// One output file and the tensors it holds, in write order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShardPlan {
    /// File name inside the output directory.
    pub file_name: String,
    /// Tensor names.
    pub tensors: Vec<String>,
    /// Upper bound on the file size.
    pub estimated_size: u64,
}

/// Name of shard `idx` (zero-based) out of `total`.
pub fn shard_file_name(idx: usize, total: usize) -> String {
    if total == 1 {
        SINGLE_WEIGHTS_FILE.to_string()
    } else {
        format!("model-{:05}-of-{:05}.safetensors", idx + 1, total)
    }
}

/// Whether `name` is a weight file this writer may have produced.
pub fn is_weight_output(name: &str) -> bool {
    if name == SINGLE_WEIGHTS_FILE || name == WEIGHTS_INDEX_FILE {
        return true;
    }
    let Some(rest) = name
        .strip_prefix("model-")
        .and_then(|r| r.strip_suffix(".safetensors"))
    else {
        return false;
    };
    let Some((idx, total)) = rest.split_once("-of-") else {
        return false;
    };
    [idx, total]
        .iter()
        .all(|n| n.len() == 5 && n.bytes().all(|b| b.is_ascii_digit()))
}

/// Assign tensors to shards in order, keeping every file under `max_shard_size`.
///
/// A tensor too large for any shard gets one to itself.
pub fn plan_shards(tensors: &[PlannedTensor], max_shard_size: u64) -> Vec<ShardPlan> {
    let mut groups: Vec<(Vec<String>, u64)> = Vec::new();
    let mut current: Vec<String> = Vec::new();
    let mut current_size = HEADER_OVERHEAD;

    for tensor in tensors {
        let cost = tensor.size + header_cost(&tensor.name, tensor.ndims);
        if HEADER_OVERHEAD + cost > max_shard_size {
            warn!(
                "Tensor {} ({} bytes) exceeds the shard limit of {} bytes; writing it alone",
                tensor.name, tensor.size, max_shard_size
            );
        }
        if !current.is_empty() && current_size + cost > max_shard_size {
            groups.push((std::mem::take(&mut current), current_size));
            current_size = HEADER_OVERHEAD;
        }
        current.push(tensor.name.clone());
        current_size += cost;
    }
    if !current.is_empty() || groups.is_empty() {
        groups.push((current, current_size));
    }

    let total = groups.len();
    groups
        .into_iter()
        .enumerate()
        .map(|(idx, (tensors, estimated_size))| ShardPlan {
            file_name: shard_file_name(idx, total),
            tensors,
            estimated_size,
        })
        .collect()
}

/// `model.safetensors.index.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardIndex {
    /// Index metadata.
    pub metadata: IndexMetadata,
    /// Tensor name to shard file name.
    pub weight_map: BTreeMap<String, String>,
}

/// Metadata block of a [`ShardIndex`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexMetadata {
    /// Sum of tensor data bytes across all shards.
    pub total_size: u64,
}

/// What the writer put on disk.
#[derive(Debug, Clone)]
pub struct SavedWeights {
    /// Shard file names, in order.
    pub files: Vec<String>,
    /// Tensors written.
    pub num_tensors: usize,
    /// Sum of tensor data bytes.
    pub total_size: u64,
}

/// A tensor already narrowed to its on-disk bytes.
#[derive(Debug)]
struct EncodedTensor {
    name: String,
    dtype: safetensors::Dtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

/// Writes planned shards into an output directory.
///
/// Tensors are encoded as they arrive, so only the current shard's output
/// bytes are held between flushes.
#[derive(Debug)]
pub struct ShardedWriter {
    dir: PathBuf,
    plan: Vec<ShardPlan>,
    dtype: Dtype,
    current: usize,
    pending: Vec<EncodedTensor>,
    weight_map: BTreeMap<String, String>,
    total_size: u64,
}

impl ShardedWriter {
    /// Prepare `dir`, removing weight files left by an earlier run.
    pub fn new(dir: impl AsRef<Path>, plan: Vec<ShardPlan>, dtype: Dtype) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir).map_err(|e| LoraFuseError::io_at(&dir, e))?;

        for entry in std::fs::read_dir(&dir).map_err(|e| LoraFuseError::io_at(&dir, e))? {
            let path = entry?.path();
            let stale = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_some_and(is_weight_output);
            if stale && path.is_file() {
                debug!("Removing previous output {:?}", path);
                std::fs::remove_file(&path).map_err(|e| LoraFuseError::io_at(&path, e))?;
            }
        }

        Ok(Self {
            dir,
            plan,
            dtype,
            current: 0,
            pending: Vec::new(),
            weight_map: BTreeMap::new(),
            total_size: 0,
        })
    }

    /// Output bytes buffered for the shard being filled.
    pub fn pending_bytes(&self) -> u64 {
        self.pending.iter().map(|t| t.bytes.len() as u64).sum()
    }

    /// Number of shards that will be written.
    pub fn num_shards(&self) -> usize {
        self.plan.len()
    }

    /// Add the next tensor in plan order, flushing its shard when complete.
    pub fn write_tensor(&mut self, name: &str, tensor: WeightTensor) -> Result<()> {
        let shard = self
            .plan
            .get(self.current)
            .ok_or_else(|| LoraFuseError::Config(format!("tensor '{name}' is not in the shard plan")))?;
        let expected = shard.tensors.get(self.pending.len()).ok_or_else(|| {
            LoraFuseError::Config(format!("shard {} is already complete", shard.file_name))
        })?;
        if expected != name {
            return Err(LoraFuseError::Config(format!(
                "tensor '{name}' written out of order; expected '{expected}'"
            )));
        }

        let complete = self.pending.len() + 1 == shard.tensors.len();
        self.pending.push(EncodedTensor {
            name: name.to_string(),
            dtype: tensor.stored_dtype(self.dtype),
            shape: tensor.shape().to_vec(),
            bytes: tensor.to_bytes(self.dtype),
        });
        drop(tensor);
        if complete {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        let shard = &self.plan[self.current];
        let path = self.dir.join(&shard.file_name);
        info!(
            "Writing shard {}/{}: {:?}",
            self.current + 1,
            self.plan.len(),
            path
        );

        let mut views = Vec::with_capacity(self.pending.len());
        for tensor in &self.pending {
            let view = TensorView::new(tensor.dtype, tensor.shape.clone(), &tensor.bytes)?;
            views.push((tensor.name.as_str(), view));
            self.total_size += tensor.bytes.len() as u64;
        }

        let metadata = Some(HashMap::from([("format".to_string(), "pt".to_string())]));
        safetensors::serialize_to_file(views, &metadata, &path)?;

        for tensor in &self.pending {
            self.weight_map
                .insert(tensor.name.clone(), shard.file_name.clone());
        }
        self.pending.clear();
        self.current += 1;
        Ok(())
    }

    /// Check every planned tensor arrived and write the index when sharded.
    pub fn finalize(mut self) -> Result<SavedWeights> {
        while self
            .plan
            .get(self.current)
            .is_some_and(|s| s.tensors.is_empty())
        {
            self.flush()?;
        }
        if self.current != self.plan.len() {
            let missing = self
                .plan
                .get(self.current)
                .and_then(|s| s.tensors.get(self.pending.len()))
                .cloned()
                .unwrap_or_default();
            return Err(LoraFuseError::Config(format!(
                "shard plan incomplete; '{missing}' was never written"
            )));
        }

        let files: Vec<String> = self.plan.iter().map(|s| s.file_name.clone()).collect();
        if files.len() > 1 {
            let index = ShardIndex {
                metadata: IndexMetadata {
                    total_size: self.total_size,
                },
                weight_map: self.weight_map,
            };
            let path = self.dir.join(WEIGHTS_INDEX_FILE);
            let json = serde_json::to_string_pretty(&index)?;
            std::fs::write(&path, json).map_err(|e| LoraFuseError::io_at(&path, e))?;
            debug!("Wrote {:?}", path);
        }

        let num_tensors = self.plan.iter().map(|s| s.tensors.len()).sum();
        Ok(SavedWeights {
            files,
            num_tensors,
            total_size: self.total_size,
        })
    }
}
