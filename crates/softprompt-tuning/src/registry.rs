use crate::artifacts::{PromptManifest, read_manifest};
use crate::error::{TuningError, TuningResult};
use crate::layout::MANIFEST_FILE;
use std::path::{Path, PathBuf};

/// A prompt artifact found on disk.
#[derive(Debug, Clone)]
pub struct PromptArtifactEntry {
    /// Directory name, used to address the artifact (e.g. in CLI arguments).
    pub name: String,
    pub path: PathBuf,
    pub manifest: PromptManifest,
}

fn entry_for(dir: &Path) -> TuningResult<PromptArtifactEntry> {
    let name = dir
        .file_name()
        .map_or_else(|| dir.display().to_string(), |n| n.to_string_lossy().into_owned());
    Ok(PromptArtifactEntry { name, path: dir.to_path_buf(), manifest: read_manifest(dir)? })
}

/// Discover prompt artifacts by scanning `<root>/*/manifest.json`.
///
/// `root` itself counts when it holds a manifest. A missing root yields no entries.
pub fn discover_prompt_artifacts(root: &Path) -> TuningResult<Vec<PromptArtifactEntry>> {
    let mut out = Vec::new();
    if root.join(MANIFEST_FILE).exists() {
        out.push(entry_for(root)?);
    }

    let dir = match std::fs::read_dir(root) {
        Ok(d) => d,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };

    let mut dirs = Vec::new();
    for entry in dir {
        let path = entry?.path();
        if path.is_dir() && path.join(MANIFEST_FILE).exists() {
            dirs.push(path);
        }
    }
    dirs.sort();

    for path in dirs {
        match entry_for(&path) {
            Ok(entry) => out.push(entry),
            Err(err) => tracing::warn!(path = %path.display(), error = %err, "Skipping unreadable artifact"),
        }
    }
    Ok(out)
}

/// Resolve an artifact by directory name under `root`.
pub fn resolve_prompt_artifact(root: &Path, name: &str) -> TuningResult<PromptArtifactEntry> {
    let path = root.join(name);
    if !path.join(MANIFEST_FILE).exists() {
        return Err(TuningError::MissingArtifact(format!(
            "prompt artifact not found (missing manifest): {name}"
        )));
    }
    entry_for(&path)
}
