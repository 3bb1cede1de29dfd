//! Well-known file names in model and adapter directories.

/// Model architecture configuration.
pub const CONFIG_FILE: &str = "config.json";

/// Generation defaults shipped next to the weights.
pub const GENERATION_CONFIG_FILE: &str = "generation_config.json";

/// PEFT adapter configuration.
pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";

/// PEFT adapter weights in safetensors format.
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

/// Files an adapter directory must contain before a merge is attempted.
pub const REQUIRED_ADAPTER_FILES: [&str; 2] = [ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE];

/// Weights of an unsharded checkpoint.
pub const SINGLE_WEIGHTS_FILE: &str = "model.safetensors";

/// Tensor-to-shard map of a sharded checkpoint.
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

/// Provenance record written next to merged weights.
pub const MERGE_INFO_FILE: &str = "merge_info.json";

/// Files that together make up a saved tokenizer.
pub const TOKENIZER_FILES: &[&str] = &[
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "tokenizer.model",
    "added_tokens.json",
    "vocab.json",
    "merges.txt",
    "vocab.txt",
    "chat_template.jinja",
];
