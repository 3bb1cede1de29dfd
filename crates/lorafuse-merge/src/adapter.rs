//! PEFT LoRA adapter loading.
//!
//! PEFT saves adapter tensors under the wrapped model's names:
//!
//! ```text
//! base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight      [r, in]
//! base_model.model.model.layers.0.self_attn.q_proj.lora_B.weight      [out, r]
//! base_model.model.model.embed_tokens.lora_embedding_A                [r, vocab]
//! base_model.model.model.embed_tokens.lora_embedding_B                [dim, r]
//! base_model.model.model.layers.0.self_attn.q_proj.lora_magnitude_vector  [out]
//! base_model.model.lm_head.weight                                     (modules_to_save)
//! ```
//!
//! Stripping `base_model.model.` gives the base model's module names.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use lorafuse_core::files::{ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE, REQUIRED_ADAPTER_FILES};
use lorafuse_core::{AdapterConfig, LoraFuseError, Result, TargetModules};
use safetensors::SafeTensors;
use tracing::{debug, info, warn};

use crate::WeightTensor;

const PEFT_PREFIX: &str = "base_model.model.";

/// Path segments of PEFT wrappers that have no meaning in the base model.
const PEFT_INTERNAL_SEGMENTS: &[&str] = &[
    "token_adapter",
    "trainable_tokens_delta",
    "trainable_tokens_original",
    "base_layer",
];

/// Required adapter files absent from `dir`, in the order they are listed.
pub fn missing_adapter_files(dir: impl AsRef<Path>) -> Vec<&'static str> {
    let dir = dir.as_ref();
    REQUIRED_ADAPTER_FILES
        .iter()
        .copied()
        .filter(|f| !dir.join(f).is_file())
        .collect()
}

/// Kind of layer a LoRA module wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoraKind {
    /// `nn.Linear` (or `Conv1D` with `fan_in_fan_out`).
    Linear,
    /// `nn.Embedding`.
    Embedding,
}

/// One adapted module: the low-rank pair plus optional DoRA/bias parts.
#[derive(Debug, Clone)]
pub struct LoraModule {
    /// Module name in the base model (`model.layers.0.self_attn.q_proj`).
    pub name: String,
    /// Wrapped layer kind.
    pub kind: LoraKind,
    /// Down projection.
    pub lora_a: WeightTensor,
    /// Up projection.
    pub lora_b: WeightTensor,
    /// DoRA magnitude, one entry per output row.
    pub magnitude: Option<WeightTensor>,
    /// Bias of `lora_B` (`lora_bias = true`).
    pub bias: Option<WeightTensor>,
    /// Rank.
    pub rank: usize,
    /// Multiplier applied to `B @ A`.
    pub scale: f32,
}

impl LoraModule {
    /// Base tensor holding this module's weight.
    pub fn weight_name(&self) -> String {
        format!("{}.weight", self.name)
    }

    /// Base tensor holding this module's bias.
    pub fn bias_name(&self) -> String {
        format!("{}.bias", self.name)
    }

    /// Logical `(out, in)` of the delta `B @ A` before any transpose.
    pub fn delta_shape(&self) -> (usize, usize) {
        (self.lora_b.shape()[0], self.lora_a.shape()[1])
    }
}

#[derive(Default)]
struct ModuleParts {
    kind: Option<LoraKind>,
    lora_a: Option<WeightTensor>,
    lora_b: Option<WeightTensor>,
    magnitude: Option<WeightTensor>,
    bias: Option<WeightTensor>,
}

/// Role of one adapter tensor.
#[derive(Debug, PartialEq, Eq)]
enum AdapterKey {
    A { module: String, kind: LoraKind },
    B { module: String, kind: LoraKind },
    BBias { module: String },
    Magnitude { module: String },
    Full { name: String },
    Internal { key: String },
}

fn classify(key: &str) -> AdapterKey {
    let stripped = key.strip_prefix(PEFT_PREFIX).unwrap_or(key);
    let parts: Vec<&str> = stripped.split('.').collect();

    let marker = parts.iter().position(|p| {
        matches!(
            *p,
            "lora_A" | "lora_B" | "lora_embedding_A" | "lora_embedding_B" | "lora_magnitude_vector"
        )
    });

    let Some(idx) = marker else {
        let internal = parts
            .iter()
            .any(|p| PEFT_INTERNAL_SEGMENTS.contains(p) || p.starts_with("lora_"));
        if internal {
            return AdapterKey::Internal {
                key: key.to_string(),
            };
        }
        // modules_to_save copies may still carry the wrapper path.
        let mut name = Vec::with_capacity(parts.len());
        let mut iter = parts.iter();
        while let Some(part) = iter.next() {
            if *part == "modules_to_save" {
                iter.next();
            } else {
                name.push(*part);
            }
        }
        return AdapterKey::Full {
            name: name.join("."),
        };
    };

    let module = parts[..idx].join(".");
    let is_bias = parts.last() == Some(&"bias") && idx + 1 < parts.len();
    match parts[idx] {
        "lora_A" => AdapterKey::A {
            module,
            kind: LoraKind::Linear,
        },
        "lora_B" if is_bias => AdapterKey::BBias { module },
        "lora_B" => AdapterKey::B {
            module,
            kind: LoraKind::Linear,
        },
        "lora_embedding_A" => AdapterKey::A {
            module,
            kind: LoraKind::Embedding,
        },
        "lora_embedding_B" => AdapterKey::B {
            module,
            kind: LoraKind::Embedding,
        },
        _ => AdapterKey::Magnitude { module },
    }
}

/// A loaded LoRA adapter, not yet attached to any base model.
#[derive(Debug, Clone)]
pub struct LoraAdapter {
    /// Directory the adapter was read from.
    pub path: PathBuf,
    /// Parsed `adapter_config.json`.
    pub config: AdapterConfig,
    /// Adapted modules by base module name.
    pub modules: BTreeMap<String, LoraModule>,
    /// Full tensors that replace base tensors of the same name.
    pub replacements: BTreeMap<String, WeightTensor>,
}

impl LoraAdapter {
    /// Load an adapter directory.
    pub fn load(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let missing = missing_adapter_files(dir);
        if !missing.is_empty() {
            return Err(LoraFuseError::AdapterLoad(format!(
                "missing {} in {:?}",
                missing.join(", "),
                dir
            )));
        }

        let config = AdapterConfig::from_file(dir.join(ADAPTER_CONFIG_FILE))?;

        let weights_path = dir.join(ADAPTER_WEIGHTS_FILE);
        let data =
            std::fs::read(&weights_path).map_err(|e| LoraFuseError::io_at(&weights_path, e))?;
        let st = SafeTensors::deserialize(&data)?;
        let mut tensors = Vec::with_capacity(st.len());
        for (name, view) in st.tensors() {
            let tensor = WeightTensor::from_view(&name, &view)?;
            tensors.push((name, tensor));
        }

        let mut adapter = Self::from_tensors(config, tensors)?;
        adapter.path = dir.to_path_buf();
        info!(
            "Loaded adapter from {:?}: {} LoRA modules, {} full tensors",
            dir,
            adapter.modules.len(),
            adapter.replacements.len()
        );
        Ok(adapter)
    }

    /// Assemble an adapter from its config and PEFT-named tensors.
    pub fn from_tensors(
        config: AdapterConfig,
        tensors: impl IntoIterator<Item = (String, WeightTensor)>,
    ) -> Result<Self> {
        config.validate()?;

        let mut parts: BTreeMap<String, ModuleParts> = BTreeMap::new();
        let mut replacements = BTreeMap::new();

        for (key, tensor) in tensors {
            match classify(&key) {
                AdapterKey::A { module, kind } => {
                    let entry = parts.entry(module).or_default();
                    entry.kind = Some(kind);
                    entry.lora_a = Some(tensor);
                }
                AdapterKey::B { module, kind } => {
                    let entry = parts.entry(module).or_default();
                    entry.kind = Some(kind);
                    entry.lora_b = Some(tensor);
                }
                AdapterKey::BBias { module } => {
                    parts.entry(module).or_default().bias = Some(tensor);
                }
                AdapterKey::Magnitude { module } => {
                    parts.entry(module).or_default().magnitude = Some(tensor);
                }
                AdapterKey::Internal { key } => {
                    return Err(LoraFuseError::AdapterLoad(format!(
                        "tensor '{key}' belongs to a PEFT wrapper that cannot be merged"
                    )));
                }
                AdapterKey::Full { name } => {
                    check_saved_module(&config, &name)?;
                    debug!("Adapter carries full tensor {}", name);
                    if replacements.insert(name.clone(), tensor).is_some() {
                        return Err(LoraFuseError::AdapterLoad(format!(
                            "tensor '{name}' stored twice"
                        )));
                    }
                }
            }
        }

        let mut modules = BTreeMap::new();
        for (name, part) in parts {
            let module = build_module(&config, &name, part)?;
            modules.insert(name, module);
        }

        if modules.is_empty() && replacements.is_empty() {
            return Err(LoraFuseError::AdapterLoad(
                "adapter contains no LoRA weights".to_string(),
            ));
        }

        Ok(Self {
            path: PathBuf::new(),
            config,
            modules,
            replacements,
        })
    }
}

/// `name` equals `key` or ends with `.{key}`.
fn matches_module(name: &str, key: &str) -> bool {
    name == key
        || name
            .strip_suffix(key)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Full tensors must come from a module listed in `modules_to_save`.
fn check_saved_module(config: &AdapterConfig, tensor: &str) -> Result<()> {
    let module = tensor.rsplit_once('.').map_or(tensor, |(m, _)| m);
    match &config.modules_to_save {
        Some(saved) if saved.iter().any(|s| matches_module(module, s)) => Ok(()),
        Some(saved) => Err(LoraFuseError::AdapterLoad(format!(
            "full tensor '{tensor}' is not from a module in modules_to_save {saved:?}"
        ))),
        None => {
            warn!("Full tensor {} but modules_to_save is not set", tensor);
            Ok(())
        }
    }
}

/// LoRA modules must be among `target_modules` when it is a name list.
fn check_target_module(config: &AdapterConfig, module: &str) -> Result<()> {
    match &config.target_modules {
        Some(TargetModules::List(targets)) if !targets.iter().any(|t| matches_module(module, t)) => {
            Err(LoraFuseError::AdapterLoad(format!(
                "module '{module}' is not in target_modules {targets:?}"
            )))
        }
        _ => Ok(()),
    }
}

fn build_module(config: &AdapterConfig, name: &str, part: ModuleParts) -> Result<LoraModule> {
    let (Some(lora_a), Some(lora_b)) = (part.lora_a, part.lora_b) else {
        return Err(LoraFuseError::AdapterLoad(format!(
            "module '{name}' needs both lora_A and lora_B"
        )));
    };
    check_target_module(config, name)?;
    let kind = part.kind.unwrap_or(LoraKind::Linear);

    if !lora_a.is_float() || !lora_b.is_float() {
        return Err(LoraFuseError::AdapterLoad(format!(
            "module '{name}' has non-floating LoRA weights"
        )));
    }
    if lora_a.shape().len() != 2 || lora_b.shape().len() != 2 {
        return Err(LoraFuseError::AdapterLoad(format!(
            "module '{name}' has LoRA weights of shape {:?} and {:?}; only 2-D layers can be merged",
            lora_a.shape(),
            lora_b.shape()
        )));
    }

    let rank = config.rank_for(name);
    if lora_a.shape()[0] != rank || lora_b.shape()[1] != rank {
        return Err(LoraFuseError::ShapeMismatch {
            name: format!("{name} (rank {rank})"),
            expected: vec![rank, lora_a.shape()[1], lora_b.shape()[0], rank],
            actual: vec![
                lora_a.shape()[0],
                lora_a.shape()[1],
                lora_b.shape()[0],
                lora_b.shape()[1],
            ],
        });
    }

    let out = lora_b.shape()[0];
    if let Some(m) = &part.magnitude {
        if kind == LoraKind::Embedding {
            return Err(LoraFuseError::AdapterLoad(format!(
                "DoRA on embedding module '{name}' is not supported"
            )));
        }
        if m.num_elements() != out {
            return Err(LoraFuseError::ShapeMismatch {
                name: format!("{name}.lora_magnitude_vector"),
                expected: vec![out],
                actual: m.shape().to_vec(),
            });
        }
    } else if config.use_dora && kind == LoraKind::Linear {
        return Err(LoraFuseError::AdapterLoad(format!(
            "use_dora is set but module '{name}' has no lora_magnitude_vector"
        )));
    }

    match &part.bias {
        None if config.lora_bias => {
            return Err(LoraFuseError::AdapterLoad(format!(
                "lora_bias is set but module '{name}' has no lora_B.bias"
            )));
        }
        Some(_) if !config.lora_bias => {
            warn!("Module {} has lora_B.bias but lora_bias is not set", name);
        }
        _ => {}
    }
    if let Some(bias) = &part.bias {
        if bias.num_elements() != out {
            return Err(LoraFuseError::ShapeMismatch {
                name: format!("{name}.lora_B.bias"),
                expected: vec![out],
                actual: bias.shape().to_vec(),
            });
        }
    }

    Ok(LoraModule {
        name: name.to_string(),
        kind,
        lora_a,
        lora_b,
        magnitude: part.magnitude,
        bias: part.bias,
        rank,
        scale: config.scaling_for(name),
    })
}
