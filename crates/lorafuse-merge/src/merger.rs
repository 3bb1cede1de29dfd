//! Merge orchestration.
//!
//! [`ModelMerger::merge_adapter`] runs the whole pipeline: load the base,
//! attach the adapter, fold it in, save the shards, copy the tokenizer and
//! write `merge_info.json`. Each stage's failure aborts the rest and comes
//! back as a [`MergeError`] tagged with the stage.

use std::path::{Path, PathBuf};

use lorafuse_core::files::{CONFIG_FILE, GENERATION_CONFIG_FILE};
use lorafuse_core::{LoadConfig, LoraFuseError, Result};
use tracing::{debug, info};

use crate::model::{BaseModel, MergedModel, PeftModel};
use crate::writer::{plan_shards, PlannedTensor, SavedWeights, ShardedWriter, DEFAULT_MAX_SHARD_SIZE};
use crate::{MergeInfo, MergeResult, MergeStage, PretrainedTokenizer};

/// Which directory the merged model's tokenizer comes from.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TokenizerSource {
    /// The adapter directory (it may add special tokens).
    #[default]
    Adapter,
    /// The base model directory.
    Base,
}

/// Merge settings.
#[derive(Debug, Clone)]
pub struct MergeOptions {
    /// How the base model is loaded and what dtype the output uses.
    pub load: LoadConfig,
    /// Largest shard file in bytes.
    pub max_shard_size: u64,
    /// Where to take the tokenizer from.
    pub tokenizer_source: TokenizerSource,
}

impl Default for MergeOptions {
    fn default() -> Self {
        Self {
            load: LoadConfig::default(),
            max_shard_size: DEFAULT_MAX_SHARD_SIZE,
            tokenizer_source: TokenizerSource::default(),
        }
    }
}

/// Progress notifications.
#[derive(Debug, Clone)]
pub enum MergeEvent {
    /// A pipeline stage started.
    Stage(MergeStage),
    /// The shard layout is known.
    Planned {
        /// Tensors to write.
        tensors: usize,
        /// Shard files.
        shards: usize,
    },
    /// A tensor was folded and handed to the writer.
    Tensor {
        /// 1-based position.
        index: usize,
        /// Total tensors.
        total: usize,
        /// Tensor name.
        name: String,
    },
}

/// Progress callback.
pub type ProgressFn = Box<dyn Fn(MergeEvent) + Send + Sync>;

/// What a successful merge produced.
#[derive(Debug, Clone)]
pub struct MergeSummary {
    /// Output directory.
    pub output: PathBuf,
    /// Weight shard file names.
    pub shards: Vec<String>,
    /// Tensors written.
    pub num_tensors: usize,
    /// Tensors changed by the adapter.
    pub num_merged: usize,
    /// Sum of tensor data bytes.
    pub total_size: u64,
    /// Tokenizer files copied.
    pub tokenizer_files: Vec<String>,
    /// The provenance record written.
    pub info: MergeInfo,
}

/// Runs LoRA merges.
#[derive(Default)]
pub struct ModelMerger {
    options: MergeOptions,
    progress: Option<ProgressFn>,
}

impl std::fmt::Debug for ModelMerger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelMerger")
            .field("options", &self.options)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl ModelMerger {
    /// Merger with the given options.
    pub fn new(options: MergeOptions) -> Self {
        Self {
            options,
            progress: None,
        }
    }

    /// Report progress through `progress`.
    pub fn with_progress(mut self, progress: ProgressFn) -> Self {
        self.progress = Some(progress);
        self
    }

    /// Merge settings.
    pub fn options(&self) -> &MergeOptions {
        &self.options
    }

    fn emit(&self, event: MergeEvent) {
        if let Some(progress) = &self.progress {
            progress(event);
        }
    }

    fn stage(&self, stage: MergeStage) {
        info!("Stage: {}", stage);
        self.emit(MergeEvent::Stage(stage));
    }

    /// Merge the adapter in `adapter` into `base` and save the result to `output`.
    ///
    /// `base` is a local model directory, a `.safetensors` file, or a Hub repo ID.
    pub fn merge_adapter(
        &self,
        base: &str,
        adapter: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> MergeResult<MergeSummary> {
        self.stage(MergeStage::LoadBase);
        let fetch_tokenizer = self.options.tokenizer_source == TokenizerSource::Base;
        let base = BaseModel::from_pretrained(base, &self.options.load, fetch_tokenizer)
            .map_err(MergeStage::LoadBase.wrap())?;
        self.merge_loaded(base, adapter, output)
    }

    /// Run the pipeline from stage 2 on with an already loaded base.
    pub fn merge_loaded(
        &self,
        base: BaseModel,
        adapter: impl AsRef<Path>,
        output: impl AsRef<Path>,
    ) -> MergeResult<MergeSummary> {
        let adapter = adapter.as_ref();
        let output = output.as_ref();

        let base_name = base.name().to_string();
        let base_dir = base.dir().map(Path::to_path_buf);
        if let Some(dir) = &base_dir {
            if same_dir(dir, output) {
                return Err(MergeStage::SaveWeights.wrap()(LoraFuseError::Config(format!(
                    "output directory {:?} is the base model directory",
                    output
                ))));
            }
        }

        self.stage(MergeStage::LoadAdapter);
        let peft = PeftModel::from_pretrained(base, adapter).map_err(MergeStage::LoadAdapter.wrap())?;
        let num_merged = peft.num_affected_tensors();

        self.stage(MergeStage::Merge);
        let merged = peft.merge_and_unload();

        self.stage(MergeStage::SaveWeights);
        let saved = self.save_weights(&merged, output)?;
        save_model_files(&merged, base_dir.as_deref(), output)
            .map_err(MergeStage::SaveWeights.wrap())?;

        self.stage(MergeStage::SaveTokenizer);
        let tokenizer_dir = match self.options.tokenizer_source {
            TokenizerSource::Adapter => Some(adapter.to_path_buf()),
            TokenizerSource::Base => base_dir.clone(),
        };
        let tokenizer_files: Vec<String> = tokenizer_dir
            .ok_or_else(|| LoraFuseError::Tokenizer("base model has no local directory".into()))
            .and_then(|dir| {
                let tokenizer = PretrainedTokenizer::from_pretrained(dir)?;
                tokenizer.save_pretrained(output)?;
                Ok(tokenizer.files().iter().map(|f| f.to_string()).collect())
            })
            .map_err(MergeStage::SaveTokenizer.wrap())?;

        self.stage(MergeStage::WriteMetadata);
        let info = MergeInfo::new(&base_name, adapter, merged.dtype());
        info.write(output).map_err(MergeStage::WriteMetadata.wrap())?;

        info!("Merge complete! Output saved to: {:?}", output);
        Ok(MergeSummary {
            output: output.to_path_buf(),
            shards: saved.files,
            num_tensors: saved.num_tensors,
            num_merged,
            total_size: saved.total_size,
            tokenizer_files,
            info,
        })
    }

    fn save_weights(&self, merged: &MergedModel, output: &Path) -> MergeResult<SavedWeights> {
        let names = merged.tensor_names();
        let planned = names
            .iter()
            .map(|name| {
                Ok(PlannedTensor {
                    name: name.clone(),
                    ndims: merged.tensor_shape(name)?.len(),
                    size: merged.stored_size(name)?,
                })
            })
            .collect::<Result<Vec<_>>>()
            .map_err(MergeStage::Merge.wrap())?;

        let plan = plan_shards(&planned, self.options.max_shard_size);
        info!(
            "Found {} tensors to write in {} shard(s)",
            names.len(),
            plan.len()
        );
        self.emit(MergeEvent::Planned {
            tensors: names.len(),
            shards: plan.len(),
        });

        let order: Vec<String> = plan.iter().flat_map(|s| s.tensors.clone()).collect();
        let mut writer =
            ShardedWriter::new(output, plan, merged.dtype()).map_err(MergeStage::SaveWeights.wrap())?;

        let total = order.len();
        for (idx, name) in order.iter().enumerate() {
            if idx % 100 == 0 || idx + 1 == total {
                info!("Processing tensor {}/{}: {}", idx + 1, total, name);
            }
            let tensor = merged.tensor(name).map_err(MergeStage::Merge.wrap())?;
            writer
                .write_tensor(name, tensor)
                .map_err(MergeStage::SaveWeights.wrap())?;
            self.emit(MergeEvent::Tensor {
                index: idx + 1,
                total,
                name: name.clone(),
            });
        }

        writer.finalize().map_err(MergeStage::SaveWeights.wrap())
    }
}

/// Write `config.json` and copy the base's generation config and model code.
fn save_model_files(merged: &MergedModel, base_dir: Option<&Path>, output: &Path) -> Result<()> {
    let config_path = output.join(CONFIG_FILE);
    let json = serde_json::to_string_pretty(&merged.config_json())?;
    std::fs::write(&config_path, json).map_err(|e| LoraFuseError::io_at(&config_path, e))?;

    let Some(base_dir) = base_dir else {
        return Ok(());
    };

    let generation = base_dir.join(GENERATION_CONFIG_FILE);
    if generation.is_file() {
        copy_into(&generation, output)?;
    }

    if merged.base().load_config().trust_remote_code {
        for entry in std::fs::read_dir(base_dir).map_err(|e| LoraFuseError::io_at(base_dir, e))? {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|e| e == "py") {
                copy_into(&path, output)?;
            }
        }
    }
    Ok(())
}

fn copy_into(src: &Path, dir: &Path) -> Result<()> {
    let Some(name) = src.file_name() else {
        return Ok(());
    };
    let dst = dir.join(name);
    debug!("Copying {:?} to {:?}", src, dst);
    std::fs::copy(src, &dst).map_err(|e| LoraFuseError::io_at(&dst, e))?;
    Ok(())
}

fn same_dir(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_options() {
        let options = MergeOptions::default();
        assert_eq!(options.max_shard_size, 2_000_000_000);
        assert_eq!(options.tokenizer_source, TokenizerSource::Adapter);
        assert_eq!(options.load.dtype, lorafuse_core::Dtype::Float16);
    }

    #[test]
    fn test_missing_base_is_load_error() {
        let out = tempfile::tempdir().unwrap();
        let err = ModelMerger::default()
            .merge_adapter("./definitely/not/a/model", out.path(), out.path())
            .unwrap_err();
        assert_eq!(err.stage(), MergeStage::LoadBase);
        assert!(err.to_string().contains("loading base model"));
    }
}
