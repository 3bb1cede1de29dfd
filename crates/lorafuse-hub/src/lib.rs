//! HuggingFace Hub integration for lorafuse.
//!
//! Base models given as `org/name` are fetched into the local Hub cache with
//! the synchronous `hf-hub` client and then loaded like any local directory.

#![warn(missing_docs)]

mod download;

pub use download::*;
