//! LoRA adapter merging for lorafuse.
//!
//! This crate folds a PEFT LoRA adapter into its base model and writes a
//! standalone checkpoint:
//!
//! - **Loading**: lazy, memory-mapped safetensors indexing of the base model,
//!   local or from the HuggingFace Hub
//! - **Adapters**: `lora_A`/`lora_B` pairs, embedding LoRA, DoRA magnitudes,
//!   LoRA bias and `modules_to_save` tensors
//! - **Folding**: `W + scale * B @ A` in `f32`, stored as float16
//! - **Output**: safetensors shards of at most 2 GB with an index, the
//!   tokenizer, `config.json` and `merge_info.json`
//!
//! # Memory Efficiency
//!
//! Tensors are decoded and folded one at a time while the current shard is
//! being filled. Each is narrowed to its output bytes on arrival, so peak
//! memory is about one encoded shard plus one `f32` tensor.
//!
//! # Example
//!
//! ```ignore
//! use lorafuse_merge::{MergeOptions, ModelMerger};
//!
//! let merger = ModelMerger::new(MergeOptions::default());
//! let summary = merger.merge_adapter(
//!     "TinyLlama/TinyLlama-1.1B-Chat-v1.0",
//!     "./adapters/chat",
//!     "./merged",
//! )?;
//! println!("wrote {} shards", summary.shards.len());
//! ```

#![warn(missing_docs)]

pub mod adapter;
mod error;
mod loader;
pub mod lora;
mod merger;
mod model;
mod provenance;
mod tensor;
mod tokenizer;
pub mod writer;

pub use adapter::{missing_adapter_files, LoraAdapter, LoraKind, LoraModule};
pub use error::*;
pub use loader::*;
pub use merger::*;
pub use model::*;
pub use provenance::*;
pub use tensor::*;
pub use tokenizer::*;
pub use writer::{ShardIndex, DEFAULT_MAX_SHARD_SIZE};
