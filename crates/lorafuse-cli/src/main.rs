//! lorafuse CLI - merge a LoRA adapter into its base model.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::Context;
use clap::error::ErrorKind;
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use lorafuse_core::{parse_byte_size, LoadConfig};
use lorafuse_merge::{
    missing_adapter_files, MergeEvent, MergeOptions, MergeSummary, ModelMerger, TokenizerSource,
};

const EXAMPLE: &str =
    "Example: lorafuse TinyLlama/TinyLlama-1.1B-Chat-v1.0 ./output/lora-adapter ./output/merged";

#[derive(Parser)]
#[command(name = "lorafuse")]
#[command(author, version, about = "Merge a LoRA adapter into its base model", long_about = None)]
#[command(after_help = EXAMPLE)]
struct Cli {
    /// Base model: local directory, .safetensors file, or HuggingFace repo ID
    base_model: String,

    /// Adapter directory with adapter_config.json and adapter_model.safetensors
    adapter_path: PathBuf,

    /// Output directory for the merged model
    output_path: PathBuf,

    /// Hub revision (branch, tag, or commit) of the base model
    #[arg(long)]
    revision: Option<String>,

    /// Largest weight shard, e.g. 2GB, 500MB, 4GiB
    #[arg(long, default_value = "2GB", value_parser = parse_byte_size)]
    max_shard_size: u64,

    /// Directory the tokenizer is copied from
    #[arg(long, value_enum, default_value_t = TokenizerArg::Adapter)]
    tokenizer_source: TokenizerArg,

    /// Reject base models that ship custom model code
    #[arg(long)]
    no_remote_code: bool,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum TokenizerArg {
    /// Tokenizer saved with the adapter
    Adapter,
    /// Tokenizer of the base model
    Base,
}

impl From<TokenizerArg> for TokenizerSource {
    fn from(arg: TokenizerArg) -> Self {
        match arg {
            TokenizerArg::Adapter => TokenizerSource::Adapter,
            TokenizerArg::Base => TokenizerSource::Base,
        }
    }
}

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return match e.kind() {
                ErrorKind::DisplayHelp | ErrorKind::DisplayVersion => ExitCode::SUCCESS,
                _ => {
                    eprintln!("\n{EXAMPLE}");
                    ExitCode::FAILURE
                }
            };
        }
    };

    // Initialize logging; RUST_LOG overrides the info default
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    if let Err(e) = check_adapter_dir(&cli.adapter_path) {
        eprintln!("Error: {e}");
        return ExitCode::FAILURE;
    }

    print_header(&cli);

    match run(&cli) {
        Ok(summary) => {
            print_summary(&summary);
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("Error: {e}");
            eprintln!("\n========================================");
            eprintln!("  Merge Failed");
            eprintln!("========================================");
            ExitCode::FAILURE
        }
    }
}

/// Verify the adapter directory before anything is loaded.
fn check_adapter_dir(path: &Path) -> anyhow::Result<()> {
    if !path.exists() {
        anyhow::bail!("Adapter path does not exist: {}", path.display());
    }
    let missing = missing_adapter_files(path);
    if !missing.is_empty() {
        anyhow::bail!(
            "Missing required files in adapter directory: {}",
            missing.join(", ")
        );
    }
    Ok(())
}

fn run(cli: &Cli) -> anyhow::Result<MergeSummary> {
    let options = MergeOptions {
        load: LoadConfig {
            trust_remote_code: !cli.no_remote_code,
            revision: cli.revision.clone(),
            ..Default::default()
        },
        max_shard_size: cli.max_shard_size,
        tokenizer_source: cli.tokenizer_source.into(),
    };
    tracing::debug!("Shard limit: {} bytes", options.max_shard_size);

    let pb = ProgressBar::new(0);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("invalid progress template")?
            .progress_chars("#>-"),
    );

    let bar = pb.clone();
    let merger = ModelMerger::new(options).with_progress(Box::new(move |event| match event {
        MergeEvent::Planned { tensors, .. } => bar.set_length(tensors as u64),
        MergeEvent::Tensor { index, name, .. } => {
            bar.set_position(index as u64);
            bar.set_message(name);
        }
        MergeEvent::Stage(_) => {}
    }));

    let result = merger.merge_adapter(&cli.base_model, &cli.adapter_path, &cli.output_path);
    pb.finish_and_clear();
    Ok(result?)
}

fn print_header(cli: &Cli) {
    println!("========================================");
    println!("  lorafuse LoRA Merge");
    println!("========================================");
    println!("Base model: {}", cli.base_model);
    println!("Adapter:    {}", cli.adapter_path.display());
    println!("Output:     {}", cli.output_path.display());
    println!("========================================\n");
}

fn print_summary(summary: &MergeSummary) {
    let output = summary.output.display();
    println!("\n========================================");
    println!("  Merge Complete!");
    println!("========================================");
    println!("Output:     {}", output);
    println!("Shards:     {}", summary.shards.len());
    println!(
        "Tensors:    {} ({} updated by the adapter)",
        summary.num_tensors, summary.num_merged
    );
    println!(
        "Size:       {:.2} GB ({})",
        summary.total_size as f64 / 1e9,
        summary.info.dtype
    );
    println!("Tokenizer:  {}", summary.tokenizer_files.join(", "));
    println!("========================================");
    println!("\nNext steps:");
    println!("  1. Convert to GGUF with llama.cpp:");
    println!(
        "     python convert_hf_to_gguf.py {} --outfile {}/model.gguf --outtype f16",
        output, output
    );
    println!("  2. Import into Ollama with a Modelfile containing 'FROM ./model.gguf':");
    println!("     ollama create my-model -f Modelfile");
}
