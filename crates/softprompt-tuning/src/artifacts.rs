//! On-disk prompt artifact: manifest, prompt tensors, loss log and optional bundle.

use crate::device::{Accelerator, DeviceRequest, Precision, convert_model, resolve_device};
use crate::error::{TuningError, TuningResult};
use crate::export::get_exportable_prompt_vectors;
use crate::layout::{ArtifactLayout, TRAINING_LOGS_FILE};
use crate::module::{ModuleParts, TrainedPromptModule, TrainingMetadata};
use crate::peft::{ADAPTER_CONFIG_FILE, ADAPTER_WEIGHTS_FILE, PromptTunedModel, read_adapter_config};
use crate::resource::{BaseModel, ModelConfig, PromptTokenizer};
use crate::tuning::{PromptOutputModelType, TaskType, TuningType};
use candle_core::{Device, Tensor};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub const MODULE_ID: &str = "e4f4a5a8-7b1c-4c52-9a43-3f0b8d6a2c11";
pub const MODULE_NAME: &str = "Peft Prompt Tuning";
pub const MODULE_VERSION: &str = "0.1.0";

/// Name of the tensor stored inside each prompt file.
pub const PROMPT_TENSOR_NAME: &str = "prompt";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactKind {
    Prompt,
    TrainingLogs,
    AdapterConfig,
    AdapterWeights,
}

/// A file written into the artifact, relative to its root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptArtifact {
    pub kind: ArtifactKind,
    pub path: PathBuf,
    pub sha256: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PromptManifest {
    pub module_id: String,
    pub module_name: String,
    pub version: String,
    pub created_at: DateTime<Utc>,
    pub base_model_config: ModelConfig,
    pub base_model_name: String,
    pub eos_token: String,
    pub has_base_model: bool,
    pub verbalizer: String,
    pub tuning_type: TuningType,
    pub task_type: TaskType,
    pub trained_torch_dtype: Precision,
    pub output_model_types: Vec<PromptOutputModelType>,
    /// Encoder prompt file, empty when no encoder prompt was trained.
    #[serde(rename = "ENCODER")]
    pub encoder: String,
    #[serde(rename = "DECODER")]
    pub decoder: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub full_model_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokenizer_path: Option<String>,
    pub training_logs: String,
    pub num_virtual_tokens: usize,
    #[serde(default)]
    pub artifacts: Vec<PromptArtifact>,
}

impl PromptManifest {
    /// Relative prompt file for `role`, if one was written.
    #[must_use]
    pub fn prompt_file(&self, role: PromptOutputModelType) -> Option<&str> {
        let file = match role {
            PromptOutputModelType::Encoder => &self.encoder,
            PromptOutputModelType::Decoder => &self.decoder,
        };
        (!file.is_empty()).then_some(file.as_str())
    }
}

/// One line of `training_logs.jsonl`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LossLogLine {
    pub name: String,
    #[serde(with = "loss_value")]
    pub data: f64,
}

/// JSON has no non-finite numbers: diverged losses are written as `"NaN"`,
/// `"Infinity"` or `"-Infinity"`. A `null` value reads back as NaN.
mod loss_value {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Number(f64),
        Text(String),
    }

    #[allow(clippy::trivially_copy_pass_by_ref)]
    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("NaN")
        } else if value.is_infinite() {
            serializer.serialize_str(if value.is_sign_positive() { "Infinity" } else { "-Infinity" })
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(f64::NAN),
            Some(Raw::Number(value)) => Ok(value),
            Some(Raw::Text(text)) => match text.as_str() {
                "NaN" => Ok(f64::NAN),
                "Infinity" => Ok(f64::INFINITY),
                "-Infinity" => Ok(f64::NEG_INFINITY),
                other => Err(D::Error::custom(format!("invalid loss value {other:?}"))),
            },
        }
    }
}

/// Rebuilds base models and tokenizers from a bundled directory.
pub trait ModelLoader: Send + Sync {
    fn load_base_model(
        &self,
        bundle_dir: &Path,
        base_model_name_or_path: Option<&str>,
    ) -> TuningResult<Arc<dyn BaseModel>>;

    fn load_tokenizer(&self, dir: &Path) -> TuningResult<Arc<dyn PromptTokenizer>>;
}

pub fn sha256_file(path: &Path) -> TuningResult<String> {
    let bytes = std::fs::read(path)?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

pub fn make_artifact(kind: ArtifactKind, root: &Path, relative: PathBuf) -> TuningResult<PromptArtifact> {
    let path = root.join(&relative);
    if !path.exists() {
        return Err(TuningError::Artifact(format!(
            "artifact path does not exist: {}",
            path.display()
        )));
    }

    let hash = sha256_file(&path)?;
    Ok(PromptArtifact { kind, path: relative, sha256: hash })
}

pub fn read_manifest(dir: &Path) -> TuningResult<PromptManifest> {
    let path = ArtifactLayout::new(dir.to_path_buf()).manifest_path();
    if !path.exists() {
        return Err(TuningError::MissingArtifact(format!("manifest not found: {}", path.display())));
    }
    let bytes = std::fs::read(&path)?;
    Ok(serde_json::from_slice::<PromptManifest>(&bytes)?)
}

/// Read a prompt tensor written by [`save`].
pub fn read_prompt_tensor(path: &Path, device: &Device) -> TuningResult<Tensor> {
    let mut tensors = candle_core::safetensors::load(path, device)?;
    tensors.remove(PROMPT_TENSOR_NAME).ok_or_else(|| {
        TuningError::Artifact(format!("{} holds no {PROMPT_TENSOR_NAME} tensor", path.display()))
    })
}

fn write_loss_log(path: &Path, losses: &[f64]) -> TuningResult<()> {
    let mut out = String::new();
    for loss in losses {
        out.push_str(&serde_json::to_string(&LossLogLine { name: "loss".to_string(), data: *loss })?);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

/// Read loss values back from a loss log. Lines not named `loss` are skipped.
pub fn read_loss_log(path: &Path) -> TuningResult<Vec<f64>> {
    let contents = std::fs::read_to_string(path)?;
    let mut losses = Vec::new();
    for (idx, line) in contents.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let entry: LossLogLine = serde_json::from_str(line).map_err(|e| {
            TuningError::Artifact(format!("failed to parse loss log line {}: {}", idx + 1, e))
        })?;
        if entry.name == "loss" {
            losses.push(entry.data);
        }
    }
    Ok(losses)
}

/// Write `module` as a prompt artifact into `dir`.
///
/// The manifest is written last, so a directory with a manifest is complete.
pub fn save(module: &TrainedPromptModule, dir: &Path, save_base_model: bool) -> TuningResult<PromptManifest> {
    let prompts =
        get_exportable_prompt_vectors(module.model(), module.tuning_type(), module.output_model_types())?;
    if prompts.is_empty() {
        return Err(TuningError::MissingArtifact(
            "Failed to export encoder and/or decoder prompts".to_string(),
        ));
    }

    let layout = ArtifactLayout::new(dir.to_path_buf());
    layout.ensure_root()?;
    let root = layout.root();
    let mut artifacts = Vec::new();

    let mut prompt_files = [String::new(), String::new()];
    for (role, prompt) in prompts.iter() {
        let Some(prompt) = prompt else { continue };
        let path = layout.prompt_path(role);
        prompt.contiguous()?.save_safetensors(PROMPT_TENSOR_NAME, &path)?;
        tracing::debug!(role = role.as_str(), path = %path.display(), "Saved prompt");

        let slot = match role {
            PromptOutputModelType::Encoder => 0,
            PromptOutputModelType::Decoder => 1,
        };
        prompt_files[slot] = role.file_name().to_string();
        artifacts.push(make_artifact(ArtifactKind::Prompt, root, PathBuf::from(role.file_name()))?);
    }
    let [encoder, decoder] = prompt_files;

    let (full_model_path, tokenizer_path) = if save_base_model {
        let relative = ArtifactLayout::bundle_dir_name(module.base_model_name());
        let bundle = layout.bundle_dir(&relative);
        std::fs::create_dir_all(&bundle)?;
        module.tokenizer().save_pretrained(&bundle)?;
        module.model().save_pretrained(&bundle)?;

        let relative_path = PathBuf::from(&relative);
        artifacts.push(make_artifact(
            ArtifactKind::AdapterConfig,
            root,
            relative_path.join(ADAPTER_CONFIG_FILE),
        )?);
        artifacts.push(make_artifact(
            ArtifactKind::AdapterWeights,
            root,
            relative_path.join(ADAPTER_WEIGHTS_FILE),
        )?);
        (Some(relative.clone()), Some(relative))
    } else {
        (None, None)
    };

    write_loss_log(&layout.training_logs_path(), &module.training_metadata().loss)?;
    artifacts.push(make_artifact(ArtifactKind::TrainingLogs, root, PathBuf::from(TRAINING_LOGS_FILE))?);

    let manifest = PromptManifest {
        module_id: MODULE_ID.to_string(),
        module_name: MODULE_NAME.to_string(),
        version: MODULE_VERSION.to_string(),
        created_at: Utc::now(),
        base_model_config: module.base_model_config().clone(),
        base_model_name: module.base_model_name().to_string(),
        eos_token: module.tokenizer().eos_token(),
        has_base_model: save_base_model,
        verbalizer: module.verbalizer().to_string(),
        tuning_type: module.tuning_type(),
        task_type: module.task_type(),
        trained_torch_dtype: Precision::from_dtype(module.model().dtype())?,
        output_model_types: module.output_model_types().to_vec(),
        encoder,
        decoder,
        full_model_path,
        tokenizer_path,
        training_logs: TRAINING_LOGS_FILE.to_string(),
        num_virtual_tokens: module.model().config().num_virtual_tokens(),
        artifacts,
    };

    let staging = layout.manifest_staging_path();
    std::fs::write(&staging, serde_json::to_string_pretty(&manifest)?)?;
    std::fs::rename(&staging, layout.manifest_path())?;

    tracing::info!(path = %root.display(), has_base_model = save_base_model, "Saved prompt artifact");
    Ok(manifest)
}

/// Load a prompt artifact saved with a bundled base model.
///
/// Precision is `precision_override` when given, otherwise the trained precision
/// recorded in the manifest. Only causal language model bundles can be reloaded.
pub fn load(
    dir: &Path,
    precision_override: Option<&str>,
    device_request: &DeviceRequest,
    loader: &dyn ModelLoader,
    accelerator: &dyn Accelerator,
) -> TuningResult<TrainedPromptModule> {
    let manifest = read_manifest(dir)?;
    let precision = match precision_override {
        Some(name) => name.parse::<Precision>()?,
        None => manifest.trained_torch_dtype,
    };

    let (true, Some(full_model_path)) = (manifest.has_base_model, manifest.full_model_path.as_deref()) else {
        return Err(TuningError::MissingArtifact("base_model not provided.".to_string()));
    };
    let bundle = dir.join(full_model_path);
    let adapter_config = read_adapter_config(&bundle)?;
    if adapter_config.task_type() != TaskType::CausalLm {
        return Err(TuningError::NotImplemented(
            "Only export of causal LM models is supported".to_string(),
        ));
    }

    let device = resolve_device(device_request, accelerator);
    let base = loader.load_base_model(&bundle, adapter_config.common().base_model_name_or_path.as_deref())?;
    let mut model = PromptTunedModel::from_pretrained(base, &bundle, &Device::Cpu)?;
    let conversion = convert_model(device.as_deref(), &mut model, precision, accelerator)?;

    let tokenizer_dir = dir.join(manifest.tokenizer_path.as_deref().unwrap_or(full_model_path));
    let tokenizer = loader.load_tokenizer(&tokenizer_dir)?;

    let logs_path = dir.join(&manifest.training_logs);
    let loss = if logs_path.exists() { read_loss_log(&logs_path)? } else { Vec::new() };

    tracing::info!(
        path = %dir.display(),
        precision = %conversion.precision,
        "Loaded prompt artifact"
    );
    Ok(TrainedPromptModule::new(ModuleParts {
        tokenizer,
        model,
        base_model_config: manifest.base_model_config,
        base_model_name: manifest.base_model_name,
        verbalizer: manifest.verbalizer,
        task_type: manifest.task_type,
        tuning_type: manifest.tuning_type,
        output_model_types: manifest.output_model_types,
        training_metadata: TrainingMetadata { loss },
        warnings: conversion.warning.into_iter().collect(),
    }))
}

/// Re-hash every recorded artifact file and check prompt tensor shapes.
pub fn verify_artifact(dir: &Path) -> TuningResult<PromptManifest> {
    let manifest = read_manifest(dir)?;

    for artifact in &manifest.artifacts {
        let path = dir.join(&artifact.path);
        if !path.exists() {
            return Err(TuningError::MissingArtifact(format!("{} is missing", artifact.path.display())));
        }
        let actual = sha256_file(&path)?;
        if actual != artifact.sha256 {
            return Err(TuningError::Artifact(format!(
                "sha256 mismatch for {}: expected {}, found {actual}",
                artifact.path.display(),
                artifact.sha256
            )));
        }
    }

    for role in &manifest.output_model_types {
        let Some(file) = manifest.prompt_file(*role) else {
            return Err(TuningError::MissingArtifact(format!("no prompt recorded for {}", role.as_str())));
        };
        let prompt = read_prompt_tensor(&dir.join(file), &Device::Cpu)?;
        let rows = prompt.dim(0)?;
        if prompt.rank() != 2 || rows != manifest.num_virtual_tokens {
            return Err(TuningError::ShapeMismatch(format!(
                "{file} has shape {:?}, expected {} rows",
                prompt.dims(),
                manifest.num_virtual_tokens
            )));
        }
    }

    Ok(manifest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_loss_log_roundtrip_skips_other_names() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(TRAINING_LOGS_FILE);
        write_loss_log(&path, &[0.5, 0.25]).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().next().unwrap(), r#"{"name":"loss","data":0.5}"#);

        std::fs::write(&path, format!("{contents}{{\"name\":\"lr\",\"data\":0.3}}\n")).unwrap();
        assert_eq!(read_loss_log(&path).unwrap(), vec![0.5, 0.25]);
    }

    #[test]
    fn test_loss_log_keeps_non_finite_values() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(TRAINING_LOGS_FILE);
        write_loss_log(&path, &[0.5, f64::NAN, f64::INFINITY, f64::NEG_INFINITY]).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().nth(1).unwrap(), r#"{"name":"loss","data":"NaN"}"#);

        let losses = read_loss_log(&path).unwrap();
        assert_eq!(losses.len(), 4);
        assert_eq!(losses[0], 0.5);
        assert!(losses[1].is_nan());
        assert_eq!(losses[2], f64::INFINITY);
        assert_eq!(losses[3], f64::NEG_INFINITY);
    }

    #[test]
    fn test_loss_log_reads_null_and_integer_values() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join(TRAINING_LOGS_FILE);
        std::fs::write(&path, "{\"name\":\"loss\",\"data\":null}\n{\"name\":\"loss\",\"data\":2}\n").unwrap();

        let losses = read_loss_log(&path).unwrap();
        assert!(losses[0].is_nan());
        assert_eq!(losses[1], 2.0);

        std::fs::write(&path, "{\"name\":\"loss\",\"data\":\"big\"}\n").unwrap();
        assert!(matches!(read_loss_log(&path), Err(TuningError::Artifact(_))));
    }

    #[test]
    fn test_make_artifact_requires_file() {
        let temp = TempDir::new().unwrap();
        assert!(make_artifact(ArtifactKind::Prompt, temp.path(), PathBuf::from("encoder.pt")).is_err());

        std::fs::write(temp.path().join("encoder.pt"), b"abc").unwrap();
        let artifact = make_artifact(ArtifactKind::Prompt, temp.path(), PathBuf::from("encoder.pt")).unwrap();
        assert_eq!(
            artifact.sha256,
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
        assert_eq!(artifact.path, PathBuf::from("encoder.pt"));
    }

    #[test]
    fn test_read_manifest_missing() {
        let temp = TempDir::new().unwrap();
        assert!(matches!(read_manifest(temp.path()), Err(TuningError::MissingArtifact(_))));
    }

    #[test]
    fn test_prompt_tensor_file_roundtrip() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("encoder.pt");
        let tensor = Tensor::arange(0f32, 6f32, &Device::Cpu).unwrap().reshape((3, 2)).unwrap();
        tensor.save_safetensors(PROMPT_TENSOR_NAME, &path).unwrap();

        let back = read_prompt_tensor(&path, &Device::Cpu).unwrap();
        assert_eq!(back.to_vec2::<f32>().unwrap(), tensor.to_vec2::<f32>().unwrap());
    }
}
