//! Tokenizer snapshot carried over to the merged model.

use std::path::{Path, PathBuf};

use lorafuse_core::files::TOKENIZER_FILES;
use lorafuse_core::{LoraFuseError, Result};
use tracing::{debug, info};

/// The tokenizer files of one model or adapter directory.
#[derive(Debug)]
pub struct PretrainedTokenizer {
    dir: PathBuf,
    files: Vec<&'static str>,
    inner: Option<tokenizers::Tokenizer>,
}

impl PretrainedTokenizer {
    /// Collect the tokenizer in `dir`, parsing `tokenizer.json` when present.
    ///
    /// A directory counts as having a tokenizer when it holds a fast
    /// `tokenizer.json` or the vocabulary files of a slow tokenizer
    /// (`tokenizer.model`, `vocab.json` + `merges.txt`, or `vocab.txt`).
    pub fn from_pretrained(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        let files: Vec<&'static str> = TOKENIZER_FILES
            .iter()
            .copied()
            .filter(|f| dir.join(f).is_file())
            .collect();

        let has = |name: &str| files.iter().any(|f| *f == name);
        let usable = has("tokenizer.json")
            || has("tokenizer.model")
            || (has("vocab.json") && has("merges.txt"))
            || has("vocab.txt");
        if !usable {
            return Err(LoraFuseError::Tokenizer(format!(
                "no tokenizer found in {:?}",
                dir
            )));
        }

        let inner = if has("tokenizer.json") {
            let path = dir.join("tokenizer.json");
            let tokenizer = tokenizers::Tokenizer::from_file(&path)
                .map_err(|e| LoraFuseError::Tokenizer(format!("{}: {}", path.display(), e)))?;
            Some(tokenizer)
        } else {
            None
        };

        debug!("Tokenizer in {:?}: {}", dir, files.join(", "));
        Ok(Self { dir, files, inner })
    }

    /// Tokenizer file names present.
    pub fn files(&self) -> &[&'static str] {
        &self.files
    }

    /// Vocabulary size including added tokens, when `tokenizer.json` was parsed.
    pub fn vocab_size(&self) -> Option<usize> {
        self.inner.as_ref().map(|t| t.get_vocab_size(true))
    }

    /// Copy the tokenizer files into `output`, byte for byte.
    pub fn save_pretrained(&self, output: impl AsRef<Path>) -> Result<Vec<PathBuf>> {
        let output = output.as_ref();
        std::fs::create_dir_all(output).map_err(|e| LoraFuseError::io_at(output, e))?;

        let mut written = Vec::with_capacity(self.files.len());
        for file in &self.files {
            let src = self.dir.join(file);
            let dst = output.join(file);
            if same_file(&src, &dst) {
                debug!("{:?} is already in place", dst);
            } else {
                std::fs::copy(&src, &dst).map_err(|e| LoraFuseError::io_at(&dst, e))?;
            }
            written.push(dst);
        }

        info!("Saved tokenizer ({} files) to {:?}", written.len(), output);
        Ok(written)
    }
}

fn same_file(a: &Path, b: &Path) -> bool {
    match (a.canonicalize(), b.canonicalize()) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
    }
}
