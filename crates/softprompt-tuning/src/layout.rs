use crate::error::TuningResult;
use crate::tuning::PromptOutputModelType;
use std::path::{Path, PathBuf};

pub const MANIFEST_FILE: &str = "manifest.json";
pub const TRAINING_LOGS_FILE: &str = "training_logs.jsonl";

/// Filesystem layout of a saved prompt artifact.
///
/// ```text
/// <root>/manifest.json
/// <root>/encoder.pt | decoder.pt
/// <root>/training_logs.jsonl
/// <root>/<base model name>/      (optional bundle)
/// ```
#[derive(Debug, Clone)]
pub struct ArtifactLayout {
    root: PathBuf,
}

impl ArtifactLayout {
    #[must_use]
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    #[must_use]
    pub fn manifest_path(&self) -> PathBuf {
        self.root.join(MANIFEST_FILE)
    }

    /// Staging path the manifest is written to before it is renamed into place.
    #[must_use]
    pub fn manifest_staging_path(&self) -> PathBuf {
        self.root.join(format!(".{MANIFEST_FILE}.tmp"))
    }

    #[must_use]
    pub fn prompt_path(&self, role: PromptOutputModelType) -> PathBuf {
        self.root.join(role.file_name())
    }

    #[must_use]
    pub fn training_logs_path(&self) -> PathBuf {
        self.root.join(TRAINING_LOGS_FILE)
    }

    /// Directory for the bundled base model and tokenizer, relative to the root.
    #[must_use]
    pub fn bundle_dir_name(base_model_name: &str) -> String {
        let name: String = base_model_name
            .trim_matches('/')
            .chars()
            .map(|c| if matches!(c, '/' | '\\') { '_' } else { c })
            .collect();
        if name.is_empty() || name == "." || name == ".." { "base_model".to_string() } else { name }
    }

    #[must_use]
    pub fn bundle_dir(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn ensure_root(&self) -> TuningResult<()> {
        std::fs::create_dir_all(&self.root)?;
        Ok(())
    }
}
