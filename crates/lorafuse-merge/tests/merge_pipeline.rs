//! End-to-end merges over small on-disk fixtures.

use std::path::Path;

use half::f16;
use lorafuse_core::files::{MERGE_INFO_FILE, WEIGHTS_INDEX_FILE};
use lorafuse_core::{LoadConfig, LoraFuseError, Result};
use lorafuse_merge::{
    BaseModel, MergeInfo, MergeOptions, MergeStage, ModelMerger, ShardIndex, TensorLoader,
    TokenizerSource, WeightTensor,
};
use safetensors::tensor::TensorView;
use safetensors::{Dtype as StDtype, SafeTensors};
use serde_json::json;

const TOKENIZER_JSON: &str = r#"{
    "version": "1.0",
    "truncation": null,
    "padding": null,
    "added_tokens": [],
    "normalizer": null,
    "pre_tokenizer": {"type": "Whitespace"},
    "post_processor": null,
    "decoder": null,
    "model": {"type": "WordLevel", "vocab": {"<unk>": 0, "hi": 1}, "unk_token": "<unk>"}
}"#;

struct Fixture {
    dtype: StDtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

fn f32_tensor(shape: &[usize], values: &[f32]) -> Fixture {
    Fixture {
        dtype: StDtype::F32,
        shape: shape.to_vec(),
        bytes: values.iter().flat_map(|v| v.to_le_bytes()).collect(),
    }
}

fn ramp(shape: &[usize], step: f32) -> Fixture {
    let n: usize = shape.iter().product();
    let values: Vec<f32> = (0..n).map(|i| (i as f32) * step - 0.5).collect();
    f32_tensor(shape, &values)
}

fn write_safetensors(path: &Path, tensors: &[(&str, Fixture)]) {
    let views: Vec<(&str, TensorView<'_>)> = tensors
        .iter()
        .map(|(name, t)| {
            (
                *name,
                TensorView::new(t.dtype, t.shape.clone(), &t.bytes).unwrap(),
            )
        })
        .collect();
    safetensors::serialize_to_file(views, &None, path).unwrap();
}

fn f32_values(fixture: &Fixture) -> Vec<f32> {
    fixture
        .bytes
        .chunks_exact(4)
        .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect()
}

/// A tiny llama-shaped base: hidden 4, vocab 6, one layer.
fn base_tensors() -> Vec<(&'static str, Fixture)> {
    let ids: Vec<u8> = (0i64..6).flat_map(|v| v.to_le_bytes()).collect();
    vec![
        ("model.embed_tokens.weight", ramp(&[6, 4], 0.05)),
        ("model.layers.0.self_attn.q_proj.weight", ramp(&[4, 4], 0.1)),
        ("model.layers.0.self_attn.v_proj.weight", ramp(&[4, 4], 0.02)),
        ("model.norm.weight", f32_tensor(&[4], &[1.0, 0.5, 0.25, 0.125])),
        ("lm_head.weight", ramp(&[6, 4], 0.03)),
        (
            "model.position_ids",
            Fixture {
                dtype: StDtype::I64,
                shape: vec![1, 6],
                bytes: ids,
            },
        ),
    ]
}

fn write_base(dir: &Path, config: serde_json::Value) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("config.json"), config.to_string()).unwrap();
    std::fs::write(
        dir.join("generation_config.json"),
        r#"{"bos_token_id": 1, "eos_token_id": 2}"#,
    )
    .unwrap();
    write_safetensors(&dir.join("model.safetensors"), &base_tensors());
}

fn llama_config() -> serde_json::Value {
    json!({"model_type": "llama", "hidden_size": 4, "torch_dtype": "float32"})
}

fn lora_a() -> Fixture {
    f32_tensor(&[2, 4], &[0.1, 0.2, 0.3, 0.4, -0.1, 0.0, 0.1, 0.2])
}

fn lora_b() -> Fixture {
    f32_tensor(&[4, 2], &[1.0, 0.0, 0.0, 1.0, 0.5, 0.5, -1.0, 2.0])
}

fn write_adapter(dir: &Path, config: serde_json::Value, with_tokenizer: bool) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("adapter_config.json"), config.to_string()).unwrap();
    write_safetensors(
        &dir.join("adapter_model.safetensors"),
        &[
            (
                "base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight",
                lora_a(),
            ),
            (
                "base_model.model.model.layers.0.self_attn.q_proj.lora_B.weight",
                lora_b(),
            ),
        ],
    );
    if with_tokenizer {
        std::fs::write(dir.join("tokenizer.json"), TOKENIZER_JSON).unwrap();
        std::fs::write(dir.join("special_tokens_map.json"), r#"{"unk_token": "<unk>"}"#).unwrap();
    }
}

fn adapter_config() -> serde_json::Value {
    json!({
        "peft_type": "LORA",
        "r": 2,
        "lora_alpha": 4,
        "target_modules": ["q_proj"],
        "task_type": "CAUSAL_LM"
    })
}

fn read_output(dir: &Path) -> Vec<(String, StDtype, Vec<usize>, Vec<u8>)> {
    let mut out = Vec::new();
    for entry in std::fs::read_dir(dir).unwrap() {
        let path = entry.unwrap().path();
        if path.extension().is_some_and(|e| e == "safetensors") {
            let bytes = std::fs::read(&path).unwrap();
            let st = SafeTensors::deserialize(&bytes).unwrap();
            for (name, view) in st.tensors() {
                out.push((name, view.dtype(), view.shape().to_vec(), view.data().to_vec()));
            }
        }
    }
    out.sort_by(|a, b| a.0.cmp(&b.0));
    out
}

fn f16_values(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|c| f16::from_le_bytes([c[0], c[1]]).to_f32())
        .collect()
}

fn safetensors_files(dir: &Path) -> Vec<String> {
    let mut files: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.ends_with(".safetensors"))
        .collect();
    files.sort();
    files
}

#[test]
fn test_merge_writes_complete_model() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    let output = tmp.path().join("out");
    write_base(&base, llama_config());
    write_adapter(&adapter, adapter_config(), true);

    let base_ref = base.to_str().unwrap();
    let summary = ModelMerger::default()
        .merge_adapter(base_ref, &adapter, &output)
        .unwrap();

    assert_eq!(summary.shards, vec!["model.safetensors".to_string()]);
    assert_eq!(summary.num_tensors, 6);
    assert_eq!(summary.num_merged, 1);
    assert!(output.join("tokenizer.json").is_file());
    assert!(output.join("special_tokens_map.json").is_file());
    assert!(output.join("generation_config.json").is_file());
    assert!(!output.join(WEIGHTS_INDEX_FILE).exists());

    let info: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(output.join(MERGE_INFO_FILE)).unwrap())
            .unwrap();
    assert_eq!(
        info,
        json!({
            "base_model": base_ref,
            "adapter_path": adapter.to_str().unwrap(),
            "merged_by": "lorafuse",
            "dtype": "float16"
        })
    );
    assert_eq!(MergeInfo::read(&output).unwrap(), summary.info);

    let config: serde_json::Value =
        serde_json::from_str(&std::fs::read_to_string(output.join("config.json")).unwrap())
            .unwrap();
    assert_eq!(config["torch_dtype"], "float16");
    assert_eq!(config["model_type"], "llama");
}

#[test]
fn test_folded_and_untouched_tensors() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    let output = tmp.path().join("out");
    write_base(&base, llama_config());
    write_adapter(&adapter, adapter_config(), true);

    ModelMerger::default()
        .merge_adapter(base.to_str().unwrap(), &adapter, &output)
        .unwrap();
    let tensors = read_output(&output);
    let names: Vec<&str> = tensors.iter().map(|t| t.0.as_str()).collect();
    let originals: Vec<&str> = {
        let mut n: Vec<&str> = base_tensors().iter().map(|t| t.0).collect();
        n.sort();
        n
    };
    assert_eq!(names, originals);

    let get = |name: &str| tensors.iter().find(|t| t.0 == name).unwrap();

    // W + (alpha / r) * B @ A
    let w = f32_values(&ramp(&[4, 4], 0.1));
    let a = f32_values(&lora_a());
    let b = f32_values(&lora_b());
    let (_, dtype, shape, bytes) = get("model.layers.0.self_attn.q_proj.weight");
    assert_eq!(*dtype, StDtype::F16);
    assert_eq!(shape, &vec![4, 4]);
    let merged = f16_values(bytes);
    for i in 0..4 {
        for j in 0..4 {
            let delta: f32 = (0..2).map(|k| b[i * 2 + k] * a[k * 4 + j]).sum();
            let expected = w[i * 4 + j] + 2.0 * delta;
            approx::assert_abs_diff_eq!(merged[i * 4 + j], expected, epsilon = 2e-3);
        }
    }

    // Untouched floats are exactly their f16 rounding.
    let v = f32_values(&ramp(&[4, 4], 0.02));
    let (_, _, _, bytes) = get("model.layers.0.self_attn.v_proj.weight");
    let expected: Vec<u8> = v.iter().flat_map(|&x| f16::from_f32(x).to_le_bytes()).collect();
    assert_eq!(bytes, &expected);

    // Integer buffers pass through.
    let (_, dtype, shape, bytes) = get("model.position_ids");
    assert_eq!(*dtype, StDtype::I64);
    assert_eq!(shape, &vec![1, 6]);
    let ids: Vec<u8> = (0i64..6).flat_map(|v| v.to_le_bytes()).collect();
    assert_eq!(bytes, &ids);
}

#[test]
fn test_rslora_changes_scale() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    let output = tmp.path().join("out");
    write_base(&base, llama_config());
    let mut config = adapter_config();
    config["use_rslora"] = json!(true);
    write_adapter(&adapter, config, true);

    ModelMerger::default()
        .merge_adapter(base.to_str().unwrap(), &adapter, &output)
        .unwrap();
    let tensors = read_output(&output);
    let (_, _, _, bytes) = tensors
        .iter()
        .find(|t| t.0 == "model.layers.0.self_attn.q_proj.weight")
        .unwrap();
    let merged = f16_values(bytes);

    let w = f32_values(&ramp(&[4, 4], 0.1));
    let a = f32_values(&lora_a());
    let b = f32_values(&lora_b());
    let scale = 4.0 / 2.0f32.sqrt();
    let delta: f32 = (0..2).map(|k| b[k] * a[k * 4]).sum();
    approx::assert_abs_diff_eq!(merged[0], w[0] + scale * delta, epsilon = 2e-3);
}

#[test]
fn test_small_shard_limit_and_rerun() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    let output = tmp.path().join("out");
    write_base(&base, llama_config());
    write_adapter(&adapter, adapter_config(), true);

    let limit = 400;
    let merger = ModelMerger::new(MergeOptions {
        max_shard_size: limit,
        ..Default::default()
    });
    let summary = merger
        .merge_adapter(base.to_str().unwrap(), &adapter, &output)
        .unwrap();
    assert!(summary.shards.len() > 1);
    for shard in &summary.shards {
        let size = std::fs::metadata(output.join(shard)).unwrap().len();
        assert!(size <= limit, "{shard} is {size} bytes");
    }

    let index: ShardIndex = serde_json::from_str(
        &std::fs::read_to_string(output.join(WEIGHTS_INDEX_FILE)).unwrap(),
    )
    .unwrap();
    assert_eq!(index.weight_map.len(), 6);
    assert_eq!(index.metadata.total_size, summary.total_size);
    assert_eq!(read_output(&output).len(), 6);

    // Same output again, default limit: one file, nothing stale left behind.
    let again = ModelMerger::default()
        .merge_adapter(base.to_str().unwrap(), &adapter, &output)
        .unwrap();
    assert_eq!(again.shards, vec!["model.safetensors".to_string()]);
    assert_eq!(safetensors_files(&output), vec!["model.safetensors".to_string()]);
    assert!(!output.join(WEIGHTS_INDEX_FILE).exists());
    assert_eq!(read_output(&output).len(), 6);
}

#[test]
fn test_incompatible_adapter_fails_after_base_load() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    write_base(&base, llama_config());
    std::fs::create_dir_all(&adapter).unwrap();
    let mut config = adapter_config();
    config["target_modules"] = json!(["q_proj", "gate_proj"]);
    std::fs::write(adapter.join("adapter_config.json"), config.to_string()).unwrap();
    write_safetensors(
        &adapter.join("adapter_model.safetensors"),
        &[
            ("base_model.model.model.layers.0.mlp.gate_proj.lora_A.weight", lora_a()),
            ("base_model.model.model.layers.0.mlp.gate_proj.lora_B.weight", lora_b()),
        ],
    );

    let err = ModelMerger::default()
        .merge_adapter(base.to_str().unwrap(), &adapter, tmp.path().join("out"))
        .unwrap_err();
    assert_eq!(err.stage(), MergeStage::LoadAdapter);
    assert!(err.to_string().contains("gate_proj"));
}

#[test]
fn test_missing_tokenizer_is_merge_error() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    write_base(&base, llama_config());
    write_adapter(&adapter, adapter_config(), false);

    let err = ModelMerger::default()
        .merge_adapter(base.to_str().unwrap(), &adapter, tmp.path().join("out"))
        .unwrap_err();
    assert_eq!(err.stage(), MergeStage::SaveTokenizer);
}

#[test]
fn test_tokenizer_from_base() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    let output = tmp.path().join("out");
    write_base(&base, llama_config());
    std::fs::write(base.join("tokenizer.json"), TOKENIZER_JSON).unwrap();
    write_adapter(&adapter, adapter_config(), false);

    let summary = ModelMerger::new(MergeOptions {
        tokenizer_source: TokenizerSource::Base,
        ..Default::default()
    })
    .merge_adapter(base.to_str().unwrap(), &adapter, &output)
    .unwrap();
    assert_eq!(summary.tokenizer_files, vec!["tokenizer.json".to_string()]);
    assert!(output.join("tokenizer.json").is_file());
}

#[test]
fn test_remote_code_policy() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    let mut config = llama_config();
    config["auto_map"] = json!({"AutoModelForCausalLM": "modeling_custom.CustomForCausalLM"});
    write_base(&base, config);
    std::fs::write(base.join("modeling_custom.py"), "class CustomForCausalLM: pass\n").unwrap();
    write_adapter(&adapter, adapter_config(), true);

    let strict = ModelMerger::new(MergeOptions {
        load: LoadConfig {
            trust_remote_code: false,
            ..Default::default()
        },
        ..Default::default()
    });
    let err = strict
        .merge_adapter(base.to_str().unwrap(), &adapter, tmp.path().join("strict"))
        .unwrap_err();
    assert_eq!(err.stage(), MergeStage::LoadBase);
    assert!(err.to_string().contains("auto_map"));

    let output = tmp.path().join("trusted");
    ModelMerger::default()
        .merge_adapter(base.to_str().unwrap(), &adapter, &output)
        .unwrap();
    assert!(output.join("modeling_custom.py").is_file());
}

#[test]
fn test_refuses_to_overwrite_base() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    write_base(&base, llama_config());
    write_adapter(&adapter, adapter_config(), true);

    let err = ModelMerger::default()
        .merge_adapter(base.to_str().unwrap(), &adapter, &base)
        .unwrap_err();
    assert_eq!(err.stage(), MergeStage::SaveWeights);
    assert!(base.join("model.safetensors").is_file());
}

/// Tensor source whose reads fail, to inject errors after indexing.
struct FailingLoader;

impl TensorLoader for FailingLoader {
    fn tensor_names(&self) -> Vec<String> {
        vec!["model.layers.0.self_attn.q_proj.weight".to_string()]
    }

    fn load_tensor(&self, name: &str) -> Result<WeightTensor> {
        Err(LoraFuseError::ModelLoad(format!("read of '{name}' failed")))
    }

    fn tensor_shape(&self, _name: &str) -> Result<Vec<usize>> {
        Ok(vec![4, 4])
    }

    fn tensor_dtype(&self, _name: &str) -> Result<StDtype> {
        Ok(StDtype::F32)
    }
}

#[test]
fn test_failure_during_merge_is_reported() {
    let tmp = tempfile::tempdir().unwrap();
    let adapter = tmp.path().join("adapter");
    write_adapter(&adapter, adapter_config(), true);

    let base = BaseModel::from_loader(
        "stub/failing",
        llama_config(),
        Box::new(FailingLoader),
        LoadConfig::default(),
    );
    let err = ModelMerger::default()
        .merge_loaded(base, &adapter, tmp.path().join("out"))
        .unwrap_err();
    assert_eq!(err.stage(), MergeStage::Merge);
    assert!(err.to_string().contains("read of"));
}

#[test]
fn test_progress_events() {
    use std::sync::{Arc, Mutex};

    use lorafuse_merge::MergeEvent;

    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    write_base(&base, llama_config());
    write_adapter(&adapter, adapter_config(), true);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    ModelMerger::default()
        .with_progress(Box::new(move |event| {
            if let MergeEvent::Tensor { index, total, .. } = event {
                sink.lock().unwrap().push((index, total));
            }
        }))
        .merge_adapter(base.to_str().unwrap(), &adapter, tmp.path().join("out"))
        .unwrap();

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 6);
    assert_eq!(seen.last(), Some(&(6, 6)));
}

fn write_adapter_tensors(dir: &Path, config: serde_json::Value, tensors: &[(&str, Fixture)]) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("adapter_config.json"), config.to_string()).unwrap();
    write_safetensors(&dir.join("adapter_model.safetensors"), tensors);
    std::fs::write(dir.join("tokenizer.json"), TOKENIZER_JSON).unwrap();
}

fn merged_values(output: &Path, name: &str) -> Vec<f32> {
    let (_, dtype, _, bytes) = read_output(output)
        .into_iter()
        .find(|t| t.0 == name)
        .unwrap();
    assert_eq!(dtype, StDtype::F16);
    f16_values(&bytes)
}

#[test]
fn test_dora_adapter_merge() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    let output = tmp.path().join("out");
    write_base(&base, llama_config());

    let magnitude = [1.0f32, 2.0, 0.5, 3.0];
    let mut config = adapter_config();
    config["use_dora"] = json!(true);
    write_adapter_tensors(
        &adapter,
        config,
        &[
            ("base_model.model.model.layers.0.self_attn.q_proj.lora_A.weight", lora_a()),
            ("base_model.model.model.layers.0.self_attn.q_proj.lora_B.weight", lora_b()),
            (
                "base_model.model.model.layers.0.self_attn.q_proj.lora_magnitude_vector",
                f32_tensor(&[4], &magnitude),
            ),
        ],
    );

    let summary = ModelMerger::default()
        .merge_adapter(base.to_str().unwrap(), &adapter, &output)
        .unwrap();
    assert_eq!(summary.num_merged, 1);

    // m * V / ||V|| per output row, V = W + (alpha / r) * B @ A
    let w = f32_values(&ramp(&[4, 4], 0.1));
    let a = f32_values(&lora_a());
    let b = f32_values(&lora_b());
    let merged = merged_values(&output, "model.layers.0.self_attn.q_proj.weight");
    for i in 0..4 {
        let row: Vec<f32> = (0..4)
            .map(|j| w[i * 4 + j] + 2.0 * (0..2).map(|k| b[i * 2 + k] * a[k * 4 + j]).sum::<f32>())
            .collect();
        let norm = row.iter().map(|v| v * v).sum::<f32>().sqrt();
        for j in 0..4 {
            approx::assert_abs_diff_eq!(
                merged[i * 4 + j],
                magnitude[i] * row[j] / norm,
                epsilon = 3e-3
            );
        }
        let merged_norm = merged[i * 4..i * 4 + 4].iter().map(|v| v * v).sum::<f32>().sqrt();
        approx::assert_abs_diff_eq!(merged_norm, magnitude[i], epsilon = 5e-3);
    }
}

#[test]
fn test_embedding_adapter_merge() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    let output = tmp.path().join("out");
    write_base(&base, llama_config());

    // A: [r, vocab], B: [dim, r]
    let a = ramp(&[2, 6], 0.1);
    let b = f32_tensor(&[4, 2], &[1.0, 0.0, 0.0, 1.0, 0.5, -0.5, 2.0, 1.0]);
    let (a_vals, b_vals) = (f32_values(&a), f32_values(&b));
    let mut config = adapter_config();
    config["target_modules"] = json!(["q_proj", "embed_tokens"]);
    write_adapter_tensors(
        &adapter,
        config,
        &[
            ("base_model.model.model.embed_tokens.lora_embedding_A", a),
            ("base_model.model.model.embed_tokens.lora_embedding_B", b),
        ],
    );

    ModelMerger::default()
        .merge_adapter(base.to_str().unwrap(), &adapter, &output)
        .unwrap();

    // E[vocab, dim] += (alpha / r) * (B @ A)^T
    let e = f32_values(&ramp(&[6, 4], 0.05));
    let merged = merged_values(&output, "model.embed_tokens.weight");
    for v in 0..6 {
        for d in 0..4 {
            let delta: f32 = (0..2).map(|k| b_vals[d * 2 + k] * a_vals[k * 6 + v]).sum();
            approx::assert_abs_diff_eq!(merged[v * 4 + d], e[v * 4 + d] + 2.0 * delta, epsilon = 3e-3);
        }
    }

    let q = f32_values(&ramp(&[4, 4], 0.1));
    let merged_q = merged_values(&output, "model.layers.0.self_attn.q_proj.weight");
    for (m, w) in merged_q.iter().zip(&q) {
        approx::assert_abs_diff_eq!(*m, f16::from_f32(*w).to_f32());
    }
}

/// A GPT-2 style base whose attention weight is stored `[in, out]`.
fn write_conv1d_base(dir: &Path) {
    std::fs::create_dir_all(dir).unwrap();
    std::fs::write(dir.join("config.json"), json!({"model_type": "gpt2"}).to_string()).unwrap();
    write_safetensors(
        &dir.join("model.safetensors"),
        &[
            ("transformer.h.0.attn.c_attn.weight", ramp(&[4, 6], 0.04)),
            ("transformer.h.0.attn.c_attn.bias", f32_tensor(&[6], &[0.0; 6])),
        ],
    );
}

fn conv1d_adapter(dir: &Path, fan_in_fan_out: bool) -> (Vec<f32>, Vec<f32>) {
    let a = ramp(&[2, 4], 0.2);
    let b = ramp(&[6, 2], 0.15);
    let values = (f32_values(&a), f32_values(&b));
    write_adapter_tensors(
        dir,
        json!({
            "peft_type": "LORA",
            "r": 2,
            "lora_alpha": 2,
            "target_modules": ["c_attn"],
            "fan_in_fan_out": fan_in_fan_out
        }),
        &[
            ("base_model.model.transformer.h.0.attn.c_attn.lora_A.weight", a),
            ("base_model.model.transformer.h.0.attn.c_attn.lora_B.weight", b),
        ],
    );
    values
}

#[test]
fn test_fan_in_fan_out_adapter_merge() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    let output = tmp.path().join("out");
    write_conv1d_base(&base);
    let (a, b) = conv1d_adapter(&adapter, true);

    ModelMerger::default()
        .merge_adapter(base.to_str().unwrap(), &adapter, &output)
        .unwrap();

    // W[in, out] += (alpha / r) * (B @ A)^T
    let w = f32_values(&ramp(&[4, 6], 0.04));
    let merged = merged_values(&output, "transformer.h.0.attn.c_attn.weight");
    for i in 0..4 {
        for o in 0..6 {
            let delta: f32 = (0..2).map(|k| b[o * 2 + k] * a[k * 4 + i]).sum();
            approx::assert_abs_diff_eq!(merged[i * 6 + o], w[i * 6 + o] + delta, epsilon = 3e-3);
        }
    }
}

#[test]
fn test_conv1d_base_needs_fan_in_fan_out() {
    let tmp = tempfile::tempdir().unwrap();
    let base = tmp.path().join("base");
    let adapter = tmp.path().join("adapter");
    write_conv1d_base(&base);
    conv1d_adapter(&adapter, false);

    let err = ModelMerger::default()
        .merge_adapter(base.to_str().unwrap(), &adapter, tmp.path().join("out"))
        .unwrap_err();
    assert_eq!(err.stage(), MergeStage::LoadAdapter);
    let message = err.to_string();
    assert!(message.contains("Shape mismatch for tensor 'transformer.h.0.attn.c_attn.weight'"));
    assert!(message.contains("expected [6, 4], got [4, 6]"));
}
