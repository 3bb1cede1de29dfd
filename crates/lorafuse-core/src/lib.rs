//! Core types, configuration and errors for lorafuse.
//!
//! This crate provides the foundational pieces shared by the rest of the
//! workspace:
//!
//! - The workspace-wide error type ([`LoraFuseError`]) and [`Result`] alias
//! - Tensor data types ([`Dtype`]) and their safetensors mapping
//! - Base model loading options ([`LoadConfig`])
//! - The PEFT adapter configuration ([`AdapterConfig`])
//! - Well-known file names ([`files`])

#![warn(missing_docs)]

mod config;
mod error;
pub mod files;
mod types;

pub use config::*;
pub use error::*;
pub use types::*;

