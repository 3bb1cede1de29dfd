//! `merge_info.json`: how a merged model was produced.

use std::path::Path;

use lorafuse_core::files::MERGE_INFO_FILE;
use lorafuse_core::{Dtype, LoraFuseError, Result};
use serde::{Deserialize, Serialize};

/// Value of `merged_by` in every record this tool writes.
pub const MERGED_BY: &str = "lorafuse";

/// Provenance record written next to the merged weights.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeInfo {
    /// Base model reference exactly as given.
    pub base_model: String,
    /// Adapter directory exactly as given.
    pub adapter_path: String,
    /// Producing tool.
    pub merged_by: String,
    /// Storage dtype of the merged weights.
    pub dtype: String,
}

impl MergeInfo {
    /// Record for a merge of `adapter_path` into `base_model`.
    pub fn new(base_model: &str, adapter_path: &Path, dtype: Dtype) -> Self {
        Self {
            base_model: base_model.to_string(),
            adapter_path: adapter_path.to_string_lossy().into_owned(),
            merged_by: MERGED_BY.to_string(),
            dtype: dtype.as_str().to_string(),
        }
    }

    /// Write `merge_info.json` into `dir` as 2-space indented JSON.
    pub fn write(&self, dir: impl AsRef<Path>) -> Result<()> {
        let path = dir.as_ref().join(MERGE_INFO_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json).map_err(|e| LoraFuseError::io_at(&path, e))
    }

    /// Read `merge_info.json` from `dir`.
    pub fn read(dir: impl AsRef<Path>) -> Result<Self> {
        let path = dir.as_ref().join(MERGE_INFO_FILE);
        let content = std::fs::read_to_string(&path).map_err(|e| LoraFuseError::io_at(&path, e))?;
        Ok(serde_json::from_str(&content)?)
    }
}
