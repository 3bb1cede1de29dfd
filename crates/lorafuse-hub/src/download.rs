//! Model snapshot downloading from HuggingFace Hub.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use hf_hub::api::sync::{Api, ApiBuilder, ApiRepo};
use hf_hub::{Repo, RepoType};
use lorafuse_core::files::{
    CONFIG_FILE, GENERATION_CONFIG_FILE, SINGLE_WEIGHTS_FILE, TOKENIZER_FILES, WEIGHTS_INDEX_FILE,
};
use lorafuse_core::{LoraFuseError, Result};
use tracing::{debug, info};

/// What to fetch besides `config.json` and the weights.
#[derive(Debug, Clone, Default)]
pub struct DownloadOptions {
    /// Fetch tokenizer files when the repo has them.
    pub include_tokenizer: bool,
    /// Fetch the repo's top-level `*.py` model code.
    pub include_remote_code: bool,
}

/// How a repository stores its safetensors weights.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WeightLayout {
    /// `model.safetensors.index.json` plus the shards it names.
    Sharded {
        /// Index file name.
        index: String,
    },
    /// One `model.safetensors`.
    Single(String),
    /// Other top-level `*.safetensors` files with no index.
    Loose(Vec<String>),
}

fn hub_err(e: impl std::fmt::Display) -> LoraFuseError {
    LoraFuseError::Hub(e.to_string())
}

/// Build the synchronous API client.
///
/// Credentials come from the Hub client's own token discovery.
fn build_api() -> Result<Api> {
    ApiBuilder::new().build().map_err(hub_err)
}

fn open_repo(api: &Api, model_id: &str, revision: Option<&str>) -> ApiRepo {
    match revision {
        Some(rev) => api.repo(Repo::with_revision(
            model_id.to_string(),
            RepoType::Model,
            rev.to_string(),
        )),
        None => api.model(model_id.to_string()),
    }
}

/// Decide which weight files to fetch from a repo file listing.
pub fn select_weight_layout(files: &[String]) -> Option<WeightLayout> {
    if files.iter().any(|f| f == WEIGHTS_INDEX_FILE) {
        return Some(WeightLayout::Sharded {
            index: WEIGHTS_INDEX_FILE.to_string(),
        });
    }
    if files.iter().any(|f| f == SINGLE_WEIGHTS_FILE) {
        return Some(WeightLayout::Single(SINGLE_WEIGHTS_FILE.to_string()));
    }

    let loose: Vec<String> = files
        .iter()
        .filter(|f| !f.contains('/') && f.ends_with(".safetensors"))
        .filter(|f| !f.starts_with("adapter_model"))
        .cloned()
        .collect();

    (!loose.is_empty()).then_some(WeightLayout::Loose(loose))
}

/// Shard file names listed in a safetensors index.
pub fn shards_in_index(index_path: &Path) -> Result<BTreeSet<String>> {
    let content =
        std::fs::read_to_string(index_path).map_err(|e| LoraFuseError::io_at(index_path, e))?;
    let index: serde_json::Value = serde_json::from_str(&content)?;

    let weight_map = index
        .get("weight_map")
        .and_then(|v| v.as_object())
        .ok_or_else(|| {
            LoraFuseError::ModelLoad(format!(
                "{} has no weight_map",
                index_path.display()
            ))
        })?;

    Ok(weight_map
        .values()
        .filter_map(|v| v.as_str().map(str::to_string))
        .collect())
}

/// Download a model snapshot and return its local directory.
///
/// # Arguments
/// * `model_id` - Model identifier (e.g., "TinyLlama/TinyLlama-1.1B-Chat-v1.0")
/// * `revision` - Optional revision/branch (e.g., "main")
/// * `options` - Extra file groups to fetch
pub fn download_model(
    model_id: &str,
    revision: Option<&str>,
    options: &DownloadOptions,
) -> Result<PathBuf> {
    let api = build_api()?;
    let repo = open_repo(&api, model_id, revision);

    let files: Vec<String> = repo
        .info()
        .map_err(hub_err)?
        .siblings
        .into_iter()
        .map(|s| s.rfilename)
        .collect();
    debug!("{} lists {} files", model_id, files.len());

    let config_path = repo.get(CONFIG_FILE).map_err(hub_err)?;

    info!("Downloading weights for {}...", model_id);
    match select_weight_layout(&files) {
        Some(WeightLayout::Sharded { index }) => {
            let index_path = repo.get(&index).map_err(hub_err)?;
            for shard in shards_in_index(&index_path)? {
                debug!("Fetching shard {}", shard);
                repo.get(&shard).map_err(hub_err)?;
            }
        }
        Some(WeightLayout::Single(file)) => {
            repo.get(&file).map_err(hub_err)?;
        }
        Some(WeightLayout::Loose(loose)) => {
            for file in loose {
                repo.get(&file).map_err(hub_err)?;
            }
        }
        None => {
            return Err(LoraFuseError::ModelLoad(format!(
                "No safetensors weights found in repo {model_id}"
            )));
        }
    }

    let mut optional: Vec<&str> = vec![GENERATION_CONFIG_FILE];
    if options.include_tokenizer {
        optional.extend(TOKENIZER_FILES.iter().copied());
    }
    if options.include_remote_code {
        optional.extend(
            files
                .iter()
                .filter(|f| !f.contains('/') && f.ends_with(".py"))
                .map(String::as_str),
        );
    }
    for file in optional {
        if files.iter().any(|f| f == file) {
            debug!("Fetching {}", file);
            repo.get(file).map_err(hub_err)?;
        }
    }

    Ok(config_path
        .parent()
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from(".")))
}
