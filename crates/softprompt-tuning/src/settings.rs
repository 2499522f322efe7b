//! Process configuration for prompt tuning.
//!
//! Settings come from an optional TOML file layered under `SOFTPROMPT__*`
//! environment variables (e.g. `SOFTPROMPT__DISTRIBUTED__MASTER_PORT=29600`).

use crate::error::TuningResult;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Environment variable prefix for overrides.
pub const ENV_PREFIX: &str = "SOFTPROMPT";

/// Coordinator settings handed to the elastic launcher.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedSettings {
    #[serde(default = "default_master_addr")]
    pub master_addr: String,
    #[serde(default = "default_master_port")]
    pub master_port: u16,
    #[serde(default = "default_monitor_interval")]
    pub monitor_interval_secs: u64,
}

fn default_master_addr() -> String {
    "localhost".to_string()
}

fn default_master_port() -> u16 {
    29550
}

fn default_monitor_interval() -> u64 {
    5
}

impl Default for DistributedSettings {
    fn default() -> Self {
        Self {
            master_addr: default_master_addr(),
            master_port: default_master_port(),
            monitor_interval_secs: default_monitor_interval(),
        }
    }
}

/// Base-model-family quirks for causal language models.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CausalLmSettings {
    /// Value forced into the base model's `d_model` config field before the prompt
    /// encoder is sized. `None` leaves the base config untouched.
    #[serde(default = "default_causal_d_model")]
    pub d_model: Option<usize>,
}

#[allow(clippy::unnecessary_wraps)]
fn default_causal_d_model() -> Option<usize> {
    Some(1024)
}

impl Default for CausalLmSettings {
    fn default() -> Self {
        Self { d_model: default_causal_d_model() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrainingSettings {
    /// Pass-through trainer arguments accepted by `train`.
    #[serde(default = "default_allowed_args")]
    pub allowed_args: Vec<String>,
}

fn default_allowed_args() -> Vec<String> {
    crate::training_args::ALLOWED_TRAINING_ARGS.iter().map(ToString::to_string).collect()
}

impl Default for TrainingSettings {
    fn default() -> Self {
        Self { allowed_args: default_allowed_args() }
    }
}

/// Root settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Precision used when a caller does not name one.
    #[serde(default = "default_torch_dtype")]
    pub torch_dtype: String,
    #[serde(default)]
    pub distributed: DistributedSettings,
    #[serde(default)]
    pub causal_lm: CausalLmSettings,
    #[serde(default)]
    pub training: TrainingSettings,
}

fn default_torch_dtype() -> String {
    "float32".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            torch_dtype: default_torch_dtype(),
            distributed: DistributedSettings::default(),
            causal_lm: CausalLmSettings::default(),
            training: TrainingSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings from an optional file plus environment overrides.
    ///
    /// A missing file is not an error; values not set anywhere keep their defaults.
    pub fn load(path: Option<&Path>) -> TuningResult<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(false));
        }
        let settings = builder
            .add_source(config::Environment::with_prefix(ENV_PREFIX).separator("__"))
            .build()?
            .try_deserialize::<Self>()?;
        Ok(settings)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_settings_default() {
        let settings = Settings::default();
        assert_eq!(settings.torch_dtype, "float32");
        assert_eq!(settings.distributed.master_addr, "localhost");
        assert_eq!(settings.distributed.master_port, 29550);
        assert_eq!(settings.causal_lm.d_model, Some(1024));
        assert!(settings.training.allowed_args.contains(&"save_total_limit".to_string()));
    }

    #[test]
    fn test_settings_deserialize_minimal() {
        let settings: Settings = serde_json::from_str("{}").unwrap();
        assert_eq!(settings, Settings::default());
    }

    #[test]
    fn test_settings_deserialize_disables_d_model_quirk() {
        let json = r#"{"causal_lm": {"d_model": null}, "distributed": {"master_port": 30000}}"#;
        let settings: Settings = serde_json::from_str(json).unwrap();
        assert_eq!(settings.causal_lm.d_model, None);
        assert_eq!(settings.distributed.master_port, 30000);
        assert_eq!(settings.distributed.master_addr, "localhost");
    }

    #[test]
    fn test_settings_load_from_toml_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("softprompt.toml");
        std::fs::write(
            &path,
            "torch_dtype = \"bfloat16\"\n\n[distributed]\nmaster_addr = \"10.0.0.1\"\n",
        )
        .unwrap();

        let settings = Settings::load(Some(&path)).unwrap();
        assert_eq!(settings.torch_dtype, "bfloat16");
        assert_eq!(settings.distributed.master_addr, "10.0.0.1");
        assert_eq!(settings.distributed.master_port, 29550);
    }

    #[test]
    fn test_settings_load_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let settings = Settings::load(Some(&temp.path().join("absent.toml"))).unwrap();
        assert_eq!(settings.causal_lm.d_model, Some(1024));
    }
}
