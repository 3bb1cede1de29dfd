//! Configuration types for lorafuse.

use std::collections::BTreeMap;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{Dtype, LoraFuseError, Result};

/// Base model loading configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadConfig {
    /// Data type the merged weights are stored in.
    #[serde(default)]
    pub dtype: Dtype,

    /// Memory-map checkpoint shards instead of reading them into owned buffers.
    #[serde(default = "default_true")]
    pub low_cpu_mem_usage: bool,

    /// Accept base models that ship custom model code (`auto_map` in `config.json`).
    ///
    /// The code is never executed; it is carried over to the merged model.
    #[serde(default = "default_true")]
    pub trust_remote_code: bool,

    /// Revision/branch to use for Hub models.
    #[serde(default)]
    pub revision: Option<String>,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            dtype: Dtype::Float16,
            low_cpu_mem_usage: true,
            trust_remote_code: true,
            revision: None,
        }
    }
}

fn default_true() -> bool {
    true
}

/// Target module selection as written by PEFT: a list of names or a single regex.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TargetModules {
    /// Explicit module names (`["q_proj", "v_proj"]`).
    List(Vec<String>),
    /// Regex or the `all-linear` shorthand.
    Pattern(String),
}

/// The subset of a PEFT `adapter_config.json` that affects merging.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    /// Adapter family; only `LORA` can be merged here.
    #[serde(default = "default_peft_type")]
    pub peft_type: String,

    /// LoRA rank (r).
    #[serde(default = "default_lora_r")]
    pub r: usize,

    /// LoRA alpha (scaling numerator).
    #[serde(default = "default_lora_alpha")]
    pub lora_alpha: f32,

    /// Modules the adapter was trained on.
    ///
    /// A name list must cover every LoRA module in the adapter; regex and
    /// `all-linear` forms are not checked.
    #[serde(default)]
    pub target_modules: Option<TargetModules>,

    /// Use rank-stabilized scaling (`alpha / sqrt(r)`).
    #[serde(default)]
    pub use_rslora: bool,

    /// Weight-decomposed LoRA; the adapter carries magnitude vectors.
    #[serde(default)]
    pub use_dora: bool,

    /// Base weights are stored `[in, out]` (GPT-2 `Conv1D`).
    #[serde(default)]
    pub fan_in_fan_out: bool,

    /// Per-module rank overrides.
    #[serde(default)]
    pub rank_pattern: Option<BTreeMap<String, usize>>,

    /// Per-module alpha overrides.
    #[serde(default)]
    pub alpha_pattern: Option<BTreeMap<String, f32>>,

    /// Modules trained in full and stored verbatim in the adapter.
    ///
    /// When set, every full tensor in the adapter must belong to one of them.
    #[serde(default)]
    pub modules_to_save: Option<Vec<String>>,

    /// `lora_B` carries a bias that folds into the base bias.
    ///
    /// When set, every LoRA module must have a `lora_B.bias` tensor.
    #[serde(default)]
    pub lora_bias: bool,

    /// Model the adapter was trained against. Informational only.
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,

    /// Task type (e.g. `CAUSAL_LM`). Informational only.
    #[serde(default)]
    pub task_type: Option<String>,
}

fn default_peft_type() -> String {
    "LORA".to_string()
}

fn default_lora_r() -> usize {
    8
}

fn default_lora_alpha() -> f32 {
    8.0
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            peft_type: default_peft_type(),
            r: default_lora_r(),
            lora_alpha: default_lora_alpha(),
            target_modules: None,
            use_rslora: false,
            use_dora: false,
            fan_in_fan_out: false,
            rank_pattern: None,
            alpha_pattern: None,
            modules_to_save: None,
            lora_bias: false,
            base_model_name_or_path: None,
            task_type: None,
        }
    }
}

impl AdapterConfig {
    /// Load and validate an `adapter_config.json`.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content =
            std::fs::read_to_string(path).map_err(|e| LoraFuseError::io_at(path, e))?;
        let config: Self = serde_json::from_str(&content).map_err(|e| {
            LoraFuseError::AdapterLoad(format!("{}: {}", path.display(), e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Reject adapters this tool cannot fold.
    pub fn validate(&self) -> Result<()> {
        if !self.peft_type.eq_ignore_ascii_case("LORA") {
            return Err(LoraFuseError::AdapterLoad(format!(
                "unsupported peft_type '{}', only LORA adapters can be merged",
                self.peft_type
            )));
        }
        if self.r == 0 {
            return Err(LoraFuseError::AdapterLoad("rank r must be positive".into()));
        }
        if let Some(patterns) = &self.rank_pattern {
            if let Some((key, _)) = patterns.iter().find(|(_, r)| **r == 0) {
                return Err(LoraFuseError::AdapterLoad(format!(
                    "rank_pattern entry '{key}' must be positive"
                )));
            }
        }
        Ok(())
    }

    /// Rank for a module, honoring `rank_pattern`.
    #[must_use]
    pub fn rank_for(&self, module: &str) -> usize {
        self.rank_pattern
            .as_ref()
            .and_then(|p| lookup_pattern(p, module))
            .copied()
            .unwrap_or(self.r)
    }

    /// Alpha for a module, honoring `alpha_pattern`.
    #[must_use]
    pub fn alpha_for(&self, module: &str) -> f32 {
        self.alpha_pattern
            .as_ref()
            .and_then(|p| lookup_pattern(p, module))
            .copied()
            .unwrap_or(self.lora_alpha)
    }

    /// The LoRA scaling factor applied to `B @ A` for a module.
    #[must_use]
    pub fn scaling_for(&self, module: &str) -> f32 {
        let r = self.rank_for(module) as f32;
        let alpha = self.alpha_for(module);
        if self.use_rslora {
            alpha / r.sqrt()
        } else {
            alpha / r
        }
    }
}

/// First pattern key that names `module` exactly or as its dotted suffix.
fn lookup_pattern<'a, V>(patterns: &'a BTreeMap<String, V>, module: &str) -> Option<&'a V> {
    patterns
        .iter()
        .find(|(key, _)| {
            module == key.as_str()
                || module
                    .strip_suffix(key.as_str())
                    .is_some_and(|prefix| prefix.ends_with('.'))
        })
        .map(|(_, v)| v)
}
