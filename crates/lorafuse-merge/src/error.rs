//! The error returned across the merge boundary.

use std::fmt;

use lorafuse_core::LoraFuseError;
use thiserror::Error;

/// Pipeline stage in which a merge failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStage {
    /// Resolving and indexing the base model.
    LoadBase,
    /// Reading the adapter and attaching it to the base.
    LoadAdapter,
    /// Folding low-rank updates into base tensors.
    Merge,
    /// Writing weight shards and model config.
    SaveWeights,
    /// Reading and copying the tokenizer.
    SaveTokenizer,
    /// Writing `merge_info.json`.
    WriteMetadata,
}

impl fmt::Display for MergeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::LoadBase => "loading base model",
            Self::LoadAdapter => "loading adapter",
            Self::Merge => "merging weights",
            Self::SaveWeights => "saving weights",
            Self::SaveTokenizer => "saving tokenizer",
            Self::WriteMetadata => "writing merge metadata",
        })
    }
}

impl MergeStage {
    /// Closure that tags an underlying failure with this stage.
    pub(crate) fn wrap(self) -> impl FnOnce(LoraFuseError) -> MergeError {
        move |source| MergeError {
            stage: self,
            source,
        }
    }
}

/// Any failure of [`ModelMerger::merge_adapter`](crate::ModelMerger::merge_adapter).
///
/// Every cause (unresolvable base, malformed or incompatible adapter, failed
/// write) collapses into this one type; its description carries the cause.
#[derive(Debug, Error)]
#[error("Error during merge ({stage}): {source}")]
pub struct MergeError {
    stage: MergeStage,
    source: LoraFuseError,
}

impl MergeError {
    /// Stage that failed.
    pub fn stage(&self) -> MergeStage {
        self.stage
    }
}

/// Result type for merge pipeline operations.
pub type MergeResult<T> = std::result::Result<T, MergeError>;
