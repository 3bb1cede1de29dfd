//! Base model, adapter attachment, and the merged view.
//!
//! The three types follow the usual PEFT flow:
//!
//! ```text
//! BaseModel::from_pretrained -> PeftModel::attach -> merge_and_unload -> MergedModel
//! ```
//!
//! Attaching validates every adapted module against the base checkpoint.
//! Folding is deferred: [`MergedModel::tensor`] loads one base tensor, applies
//! its planned fold, and hands it to the caller.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use lorafuse_core::files::CONFIG_FILE;
use lorafuse_core::{Dtype, LoadConfig, LoraFuseError, Result};
use tracing::{debug, info, warn};

use crate::adapter::LoraAdapter;
use crate::loader::{ModelSource, SafetensorsLoader, TensorLoader};
use crate::lora::{expected_weight_shape, fold_bias, fold_weight};
use crate::tensor::stored_size;
use crate::WeightTensor;

/// A base model: its configuration plus lazy access to its tensors.
pub struct BaseModel {
    name: String,
    dir: Option<PathBuf>,
    config: serde_json::Value,
    loader: Box<dyn TensorLoader>,
    load_config: LoadConfig,
}

impl std::fmt::Debug for BaseModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BaseModel")
            .field("name", &self.name)
            .field("dir", &self.dir)
            .field("tensors", &self.loader.tensor_names().len())
            .finish()
    }
}

impl BaseModel {
    /// Resolve and index a base model from a local path or Hub repo ID.
    ///
    /// `fetch_tokenizer` also downloads tokenizer files for Hub models.
    pub fn from_pretrained(name: &str, config: &LoadConfig, fetch_tokenizer: bool) -> Result<Self> {
        if name.trim().is_empty() {
            return Err(LoraFuseError::ModelLoad(
                "base model reference is empty".to_string(),
            ));
        }

        let source = ModelSource::parse(name, config.revision.clone());
        let path = source.resolve(config, fetch_tokenizer)?;
        let dir = if path.is_file() {
            path.parent().map(Path::to_path_buf).unwrap_or_default()
        } else {
            path.clone()
        };

        let config_path = dir.join(CONFIG_FILE);
        if !config_path.is_file() {
            return Err(LoraFuseError::ModelLoad(format!(
                "{} not found in {:?}",
                CONFIG_FILE, dir
            )));
        }
        let content = std::fs::read_to_string(&config_path)
            .map_err(|e| LoraFuseError::io_at(&config_path, e))?;
        let model_config: serde_json::Value = serde_json::from_str(&content)?;

        if model_config.get("auto_map").is_some() {
            if !config.trust_remote_code {
                return Err(LoraFuseError::ModelLoad(format!(
                    "{name} ships custom model code (auto_map) and trust_remote_code is disabled"
                )));
            }
            info!("{} declares custom model code; it will be carried over", name);
        }

        let loader = SafetensorsLoader::new(&path, config.low_cpu_mem_usage)?;
        info!(
            "Loaded base model {} ({})",
            name,
            model_config
                .get("model_type")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown architecture")
        );

        Ok(Self {
            name: name.to_string(),
            dir: Some(dir),
            config: model_config,
            loader: Box::new(loader),
            load_config: config.clone(),
        })
    }

    /// Wrap an arbitrary tensor source.
    pub fn from_loader(
        name: impl Into<String>,
        config: serde_json::Value,
        loader: Box<dyn TensorLoader>,
        load_config: LoadConfig,
    ) -> Self {
        Self {
            name: name.into(),
            dir: None,
            config,
            loader,
            load_config,
        }
    }

    /// Reference the model was loaded from, as given.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Local snapshot directory, if the model lives on disk.
    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Parsed `config.json`.
    pub fn config(&self) -> &serde_json::Value {
        &self.config
    }

    /// Options the model was loaded with.
    pub fn load_config(&self) -> &LoadConfig {
        &self.load_config
    }

    /// Tensor source.
    pub fn loader(&self) -> &dyn TensorLoader {
        self.loader.as_ref()
    }
}

/// What happens to one base tensor during the merge.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Fold {
    /// Add the module's low-rank delta to the weight.
    Weight(String),
    /// Add the module's `lora_B` bias to the bias.
    Bias(String),
    /// Replace with the adapter's full copy.
    Replace,
}

/// A base model with an adapter attached but not yet folded in.
#[derive(Debug)]
pub struct PeftModel {
    base: BaseModel,
    adapter: LoraAdapter,
    plan: BTreeMap<String, Fold>,
}

impl PeftModel {
    /// Load the adapter in `adapter_dir` and attach it to `base`.
    pub fn from_pretrained(base: BaseModel, adapter_dir: impl AsRef<Path>) -> Result<Self> {
        let adapter = LoraAdapter::load(adapter_dir)?;
        Self::attach(base, adapter)
    }

    /// Attach a loaded adapter, checking every module against the base.
    pub fn attach(base: BaseModel, adapter: LoraAdapter) -> Result<Self> {
        if let Some(expected) = &adapter.config.base_model_name_or_path {
            if expected != base.name() {
                debug!(
                    "Adapter was trained on {}, attaching to {}",
                    expected,
                    base.name()
                );
            }
        }

        let loader = base.loader();
        let fan_in_fan_out = adapter.config.fan_in_fan_out;
        let mut plan = BTreeMap::new();

        for module in adapter.modules.values() {
            let weight = module.weight_name();
            let shape = loader.tensor_shape(&weight).map_err(|_| {
                LoraFuseError::IncompatibleAdapter(format!(
                    "adapter targets '{}', which the base model does not have",
                    module.name
                ))
            })?;
            require_float(loader, &weight)?;

            let expected = expected_weight_shape(module, fan_in_fan_out);
            if shape != expected {
                return Err(LoraFuseError::ShapeMismatch {
                    name: weight,
                    expected: expected.to_vec(),
                    actual: shape,
                });
            }
            plan.insert(weight, Fold::Weight(module.name.clone()));

            if module.bias.is_some() {
                let bias = module.bias_name();
                let bias_shape = loader.tensor_shape(&bias).map_err(|_| {
                    LoraFuseError::IncompatibleAdapter(format!(
                        "adapter carries a bias for '{}', whose base layer has none",
                        module.name
                    ))
                })?;
                require_float(loader, &bias)?;
                let out = module.delta_shape().0;
                if bias_shape.iter().product::<usize>() != out {
                    return Err(LoraFuseError::ShapeMismatch {
                        name: bias,
                        expected: vec![out],
                        actual: bias_shape,
                    });
                }
                plan.insert(bias, Fold::Bias(module.name.clone()));
            }
        }

        for (name, tensor) in &adapter.replacements {
            if plan.contains_key(name) {
                return Err(LoraFuseError::IncompatibleAdapter(format!(
                    "'{name}' is both LoRA-adapted and saved in full"
                )));
            }
            match loader.tensor_shape(name) {
                Ok(shape) if shape != tensor.shape() => {
                    return Err(LoraFuseError::ShapeMismatch {
                        name: name.clone(),
                        expected: shape,
                        actual: tensor.shape().to_vec(),
                    });
                }
                Ok(_) => {}
                Err(_) => warn!("Adapter adds tensor '{}' that the base model lacks", name),
            }
            plan.insert(name.clone(), Fold::Replace);
        }

        info!(
            "Attached adapter: {} LoRA modules, {} replaced tensors",
            adapter.modules.len(),
            adapter.replacements.len()
        );

        Ok(Self {
            base,
            adapter,
            plan,
        })
    }

    /// The base model.
    pub fn base(&self) -> &BaseModel {
        &self.base
    }

    /// The attached adapter.
    pub fn adapter(&self) -> &LoraAdapter {
        &self.adapter
    }

    /// Number of base tensors the adapter changes.
    pub fn num_affected_tensors(&self) -> usize {
        self.plan.len()
    }

    /// Collapse the adapter into the base weights.
    pub fn merge_and_unload(self) -> MergedModel {
        let dtype = self.base.load_config().dtype;
        let mut names: BTreeSet<String> = self.base.loader().tensor_names().into_iter().collect();
        names.extend(self.adapter.replacements.keys().cloned());

        MergedModel {
            names: names.into_iter().collect(),
            dtype,
            base: self.base,
            adapter: self.adapter,
            plan: self.plan,
        }
    }
}

fn require_float(loader: &dyn TensorLoader, name: &str) -> Result<()> {
    let dtype = loader.tensor_dtype(name)?;
    if Dtype::from_safetensors(dtype).is_none() {
        return Err(LoraFuseError::UnsupportedDtype {
            name: name.to_string(),
            dtype: format!("{dtype:?}"),
        });
    }
    Ok(())
}

/// Base weights with the adapter folded in, produced tensor by tensor.
#[derive(Debug)]
pub struct MergedModel {
    base: BaseModel,
    adapter: LoraAdapter,
    plan: BTreeMap<String, Fold>,
    names: Vec<String>,
    dtype: Dtype,
}

impl MergedModel {
    /// All output tensor names, sorted.
    pub fn tensor_names(&self) -> &[String] {
        &self.names
    }

    /// Output storage dtype for floating tensors.
    pub fn dtype(&self) -> Dtype {
        self.dtype
    }

    /// The base model the weights come from.
    pub fn base(&self) -> &BaseModel {
        &self.base
    }

    /// Shape of an output tensor.
    pub fn tensor_shape(&self, name: &str) -> Result<Vec<usize>> {
        match self.adapter.replacements.get(name) {
            Some(tensor) => Ok(tensor.shape().to_vec()),
            None => self.base.loader().tensor_shape(name),
        }
    }

    /// Bytes the tensor occupies once written.
    pub fn stored_size(&self, name: &str) -> Result<u64> {
        if let Some(tensor) = self.adapter.replacements.get(name) {
            let bytes = tensor.num_elements() * tensor.stored_dtype(self.dtype).size();
            return Ok(bytes as u64);
        }
        let loader = self.base.loader();
        Ok(stored_size(
            &loader.tensor_shape(name)?,
            loader.tensor_dtype(name)?,
            self.dtype,
        ))
    }

    /// Load one output tensor, folding in its adapter update.
    pub fn tensor(&self, name: &str) -> Result<WeightTensor> {
        match self.plan.get(name) {
            Some(Fold::Replace) => self
                .adapter
                .replacements
                .get(name)
                .cloned()
                .ok_or_else(|| LoraFuseError::TensorNotFound(name.to_string())),
            Some(Fold::Weight(module)) => {
                let module = self.module(module)?;
                let mut weight = self.base.loader().load_tensor(name)?;
                fold_weight(&mut weight, module, self.adapter.config.fan_in_fan_out)?;
                Ok(weight)
            }
            Some(Fold::Bias(module)) => {
                let module = self.module(module)?;
                let mut bias = self.base.loader().load_tensor(name)?;
                fold_bias(&mut bias, module)?;
                Ok(bias)
            }
            None => self.base.loader().load_tensor(name),
        }
    }

    fn module(&self, name: &str) -> Result<&crate::adapter::LoraModule> {
        self.adapter
            .modules
            .get(name)
            .ok_or_else(|| LoraFuseError::TensorNotFound(name.to_string()))
    }

    /// `config.json` for the merged model, with `torch_dtype` updated.
    pub fn config_json(&self) -> serde_json::Value {
        let mut config = self.base.config().clone();
        if let Some(obj) = config.as_object_mut() {
            obj.insert(
                "torch_dtype".to_string(),
                serde_json::Value::String(self.dtype.as_str().to_string()),
            );
        }
        config
    }
}
