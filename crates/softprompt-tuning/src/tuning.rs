//! Tuning variants and backend tuning configuration.
//!
//! A user-facing [`TuningConfig`] is mapped onto a backend config
//! ([`BackendTuningConfig`]) for the selected [`TuningType`]. The backend config is
//! what the prompt encoder is built from and what gets persisted as
//! `adapter_config.json`.

use crate::error::{TuningError, TuningResult, TuningWarning};
use crate::resource::PretrainedModelResource;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::str::FromStr;

/// Parameter-efficient tuning variants.
///
/// Only [`TuningType::PromptTuning`] and [`TuningType::MultitaskPromptTuning`] are
/// implemented; the others parse so they can be rejected with a clear error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TuningType {
    PromptTuning,
    MultitaskPromptTuning,
    PrefixTuning,
    PTuning,
    Lora,
    MultitaskPrefixTuning,
}

impl TuningType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::PromptTuning => "PROMPT_TUNING",
            Self::MultitaskPromptTuning => "MULTITASK_PROMPT_TUNING",
            Self::PrefixTuning => "PREFIX_TUNING",
            Self::PTuning => "P_TUNING",
            Self::Lora => "LORA",
            Self::MultitaskPrefixTuning => "MULTITASK_PREFIX_TUNING",
        }
    }

    #[must_use]
    pub fn is_implemented(self) -> bool {
        matches!(self, Self::PromptTuning | Self::MultitaskPromptTuning)
    }

    /// Fail with a configuration error for declared-but-unimplemented variants.
    pub fn ensure_implemented(self) -> TuningResult<Self> {
        if self.is_implemented() {
            Ok(self)
        } else {
            Err(TuningError::Configuration(format!(
                "tuning type {} is not supported; supported types: {}, {}",
                self.as_str(),
                Self::PromptTuning.as_str(),
                Self::MultitaskPromptTuning.as_str()
            )))
        }
    }
}

impl FromStr for TuningType {
    type Err = TuningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "PROMPT_TUNING" => Ok(Self::PromptTuning),
            "MULTITASK_PROMPT_TUNING" => Ok(Self::MultitaskPromptTuning),
            "PREFIX_TUNING" => Ok(Self::PrefixTuning),
            "P_TUNING" => Ok(Self::PTuning),
            "LORA" => Ok(Self::Lora),
            "MULTITASK_PREFIX_TUNING" => Ok(Self::MultitaskPrefixTuning),
            _ => Err(TuningError::Configuration(format!("unknown tuning type: {s}"))),
        }
    }
}

impl std::fmt::Display for TuningType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Parse a tuning type name and reject variants that cannot be trained.
pub fn resolve_tuning_type(name: &str) -> TuningResult<TuningType> {
    name.parse::<TuningType>()?.ensure_implemented()
}

/// Transformer role a trained prompt is exported for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromptOutputModelType {
    Encoder,
    Decoder,
}

impl PromptOutputModelType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Encoder => "ENCODER",
            Self::Decoder => "DECODER",
        }
    }

    /// Fixed artifact file name for this role's prompt tensor.
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Encoder => "encoder.pt",
            Self::Decoder => "decoder.pt",
        }
    }
}

impl FromStr for PromptOutputModelType {
    type Err = TuningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "ENCODER" => Ok(Self::Encoder),
            "DECODER" => Ok(Self::Decoder),
            _ => Err(TuningError::Configuration(format!("unknown output model type: {s}"))),
        }
    }
}

/// Backend task type identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TaskType {
    #[serde(rename = "CAUSAL_LM")]
    CausalLm,
    #[serde(rename = "SEQ_2_SEQ_LM")]
    Seq2SeqLm,
    #[serde(rename = "SEQ_CLS")]
    SequenceClassification,
    #[serde(rename = "TOKEN_CLS")]
    TokenClassification,
    #[serde(rename = "QUESTION_ANS")]
    QuestionAnswering,
    #[serde(rename = "FEATURE_EXTRACTION")]
    FeatureExtraction,
}

impl TaskType {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::CausalLm => "CAUSAL_LM",
            Self::Seq2SeqLm => "SEQ_2_SEQ_LM",
            Self::SequenceClassification => "SEQ_CLS",
            Self::TokenClassification => "TOKEN_CLS",
            Self::QuestionAnswering => "QUESTION_ANS",
            Self::FeatureExtraction => "FEATURE_EXTRACTION",
        }
    }
}

impl FromStr for TaskType {
    type Err = TuningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "" => Err(TuningError::Configuration("task_type must be a non-empty string".to_string())),
            "CAUSAL_LM" => Ok(Self::CausalLm),
            "SEQ_2_SEQ_LM" => Ok(Self::Seq2SeqLm),
            "SEQ_CLS" => Ok(Self::SequenceClassification),
            "TOKEN_CLS" => Ok(Self::TokenClassification),
            "QUESTION_ANS" => Ok(Self::QuestionAnswering),
            "FEATURE_EXTRACTION" => Ok(Self::FeatureExtraction),
            other => Err(TuningError::Configuration(format!("unknown task type: {other}"))),
        }
    }
}

impl std::fmt::Display for TaskType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// User-facing tuning configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TuningConfig {
    pub num_virtual_tokens: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tuning_init_method: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tuning_init_text: Option<String>,
    /// Safetensors state dict seeding multi-task initialization.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_tuning_init_source_model: Option<String>,
    /// Roles to train; the base model family's defaults apply when absent.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_model_types: Option<Vec<PromptOutputModelType>>,
}

impl TuningConfig {
    #[must_use]
    pub fn with_virtual_tokens(num_virtual_tokens: usize) -> Self {
        Self { num_virtual_tokens: Some(num_virtual_tokens), ..Self::default() }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PromptTuningInit {
    #[default]
    Random,
    Text,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MultitaskPromptTuningInit {
    #[default]
    Random,
    Text,
    AverageSourceTasks,
    ExactSourceTask,
    OnlySourceShared,
}

impl MultitaskPromptTuningInit {
    /// Whether this init reads a source state dict.
    #[must_use]
    pub fn uses_source_state(self) -> bool {
        matches!(self, Self::AverageSourceTasks | Self::ExactSourceTask | Self::OnlySourceShared)
    }
}

/// Fields every prompt-learning backend config carries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptLearningFields {
    pub task_type: TaskType,
    #[serde(default)]
    pub inference_mode: bool,
    #[serde(default)]
    pub base_model_name_or_path: Option<String>,
    pub num_virtual_tokens: usize,
    #[serde(default)]
    pub token_dim: Option<usize>,
    #[serde(default)]
    pub num_transformer_submodules: Option<usize>,
    #[serde(default)]
    pub num_attention_heads: Option<usize>,
    #[serde(default)]
    pub num_layers: Option<usize>,
}

const PROMPT_LEARNING_FIELDS: &[&str] = &[
    "task_type",
    "inference_mode",
    "base_model_name_or_path",
    "num_virtual_tokens",
    "token_dim",
    "num_transformer_submodules",
    "num_attention_heads",
    "num_layers",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PromptTuningConfig {
    #[serde(flatten)]
    pub common: PromptLearningFields,
    #[serde(default)]
    pub prompt_tuning_init: PromptTuningInit,
    #[serde(default)]
    pub prompt_tuning_init_text: Option<String>,
    #[serde(default)]
    pub tokenizer_name_or_path: Option<String>,
}

impl PromptTuningConfig {
    pub const FIELDS: &'static [&'static str] =
        &["prompt_tuning_init", "prompt_tuning_init_text", "tokenizer_name_or_path"];
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MultitaskPromptTuningConfig {
    #[serde(flatten)]
    pub common: PromptLearningFields,
    #[serde(default)]
    pub prompt_tuning_init: MultitaskPromptTuningInit,
    #[serde(default)]
    pub prompt_tuning_init_text: Option<String>,
    #[serde(default)]
    pub tokenizer_name_or_path: Option<String>,
    #[serde(default)]
    pub prompt_tuning_init_state_dict_path: Option<String>,
    #[serde(default)]
    pub prompt_tuning_init_task: usize,
    #[serde(default = "default_one")]
    pub num_ranks: usize,
    #[serde(default = "default_one")]
    pub num_tasks: usize,
}

const fn default_one() -> usize {
    1
}

impl MultitaskPromptTuningConfig {
    pub const FIELDS: &'static [&'static str] = &[
        "prompt_tuning_init",
        "prompt_tuning_init_text",
        "tokenizer_name_or_path",
        "prompt_tuning_init_state_dict_path",
        "prompt_tuning_init_task",
        "num_ranks",
        "num_tasks",
    ];
}

/// Backend configuration for the implemented tuning variants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "peft_type")]
pub enum BackendTuningConfig {
    #[serde(rename = "PROMPT_TUNING")]
    PromptTuning(PromptTuningConfig),
    #[serde(rename = "MULTITASK_PROMPT_TUNING")]
    MultitaskPromptTuning(MultitaskPromptTuningConfig),
}

impl BackendTuningConfig {
    #[must_use]
    pub fn common(&self) -> &PromptLearningFields {
        match self {
            Self::PromptTuning(c) => &c.common,
            Self::MultitaskPromptTuning(c) => &c.common,
        }
    }

    pub fn common_mut(&mut self) -> &mut PromptLearningFields {
        match self {
            Self::PromptTuning(c) => &mut c.common,
            Self::MultitaskPromptTuning(c) => &mut c.common,
        }
    }

    #[must_use]
    pub fn tuning_type(&self) -> TuningType {
        match self {
            Self::PromptTuning(_) => TuningType::PromptTuning,
            Self::MultitaskPromptTuning(_) => TuningType::MultitaskPromptTuning,
        }
    }

    #[must_use]
    pub fn task_type(&self) -> TaskType {
        self.common().task_type
    }

    #[must_use]
    pub fn num_virtual_tokens(&self) -> usize {
        self.common().num_virtual_tokens
    }

    #[must_use]
    pub fn num_transformer_submodules(&self) -> usize {
        self.common().num_transformer_submodules.unwrap_or(1)
    }

    /// Rows of the full prompt table (`submodules × virtual tokens`).
    #[must_use]
    pub fn total_virtual_tokens(&self) -> usize {
        self.num_virtual_tokens() * self.num_transformer_submodules()
    }

    #[must_use]
    pub fn prompt_tuning_init_text(&self) -> Option<&str> {
        match self {
            Self::PromptTuning(c) => c.prompt_tuning_init_text.as_deref(),
            Self::MultitaskPromptTuning(c) => c.prompt_tuning_init_text.as_deref(),
        }
    }

    fn declared_fields(tuning_type: TuningType) -> TuningResult<Vec<&'static str>> {
        let specific = match tuning_type {
            TuningType::PromptTuning => PromptTuningConfig::FIELDS,
            TuningType::MultitaskPromptTuning => MultitaskPromptTuningConfig::FIELDS,
            other => {
                other.ensure_implemented()?;
                &[]
            }
        };
        Ok(PROMPT_LEARNING_FIELDS.iter().chain(specific).copied().collect())
    }

    fn validate(&self) -> TuningResult<()> {
        if self.num_virtual_tokens() == 0 {
            return Err(TuningError::Configuration(
                "num_virtual_tokens must be a positive integer".to_string(),
            ));
        }

        let text_init = match self {
            Self::PromptTuning(c) => c.prompt_tuning_init == PromptTuningInit::Text,
            Self::MultitaskPromptTuning(c) => {
                if c.prompt_tuning_init.uses_source_state()
                    && c.prompt_tuning_init_state_dict_path.is_none()
                {
                    return Err(TuningError::Configuration(format!(
                        "prompt_tuning_init {:?} requires prompt_tuning_init_source_model",
                        c.prompt_tuning_init
                    )));
                }
                c.prompt_tuning_init == MultitaskPromptTuningInit::Text
            }
        };
        if text_init && self.prompt_tuning_init_text().is_none_or(|t| t.trim().is_empty()) {
            return Err(TuningError::Configuration(
                "TEXT initialization requires prompt_tuning_init_text".to_string(),
            ));
        }
        Ok(())
    }
}

/// Output of [`build_backend_config`].
#[derive(Debug, Clone)]
pub struct BuiltTuningConfig {
    pub config: BackendTuningConfig,
    /// Input fields the selected backend config does not declare.
    pub dropped_fields: Vec<String>,
}

/// Map a user tuning config onto the backend config for `tuning_type`.
pub fn build_backend_config(
    resource: &dyn PretrainedModelResource,
    tuning_type: TuningType,
    task_type: &str,
    tokenizer_name_or_path: &str,
    tuning_config: &TuningConfig,
    output_model_types: &[PromptOutputModelType],
) -> TuningResult<BuiltTuningConfig> {
    let task_type: TaskType = task_type.parse()?;
    match tuning_config.num_virtual_tokens {
        Some(n) if n > 0 => {}
        _ => {
            return Err(TuningError::Configuration(
                "num_virtual_tokens not provided in tuning_config".to_string(),
            ));
        }
    }

    let mut params = match serde_json::to_value(tuning_config)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    params.retain(|_, v| !v.is_null());

    if let Some(source) = params.remove("prompt_tuning_init_source_model") {
        params.insert("prompt_tuning_init_state_dict_path".to_string(), source);
    }
    params.insert("tokenizer_name_or_path".to_string(), Value::from(tokenizer_name_or_path));
    params.insert(
        "num_transformer_submodules".to_string(),
        Value::from(resource.get_num_transformer_submodules(output_model_types)?),
    );
    params.remove("output_model_types");
    if let Some(Value::String(method)) = params.remove("prompt_tuning_init_method") {
        params.insert(
            "prompt_tuning_init".to_string(),
            Value::from(method.trim().to_ascii_uppercase()),
        );
    }

    let declared = BackendTuningConfig::declared_fields(tuning_type)?;
    let mut dropped_fields: Vec<String> =
        params.keys().filter(|k| !declared.contains(&k.as_str())).cloned().collect();
    dropped_fields.sort();
    params.retain(|k, _| declared.contains(&k.as_str()));
    if !dropped_fields.is_empty() {
        TuningWarning::DroppedConfigFields { fields: dropped_fields.clone() }.emit();
    }

    params.insert("task_type".to_string(), serde_json::to_value(task_type)?);
    params.insert("peft_type".to_string(), Value::from(tuning_type.as_str()));

    let config: BackendTuningConfig = serde_json::from_value(Value::Object(params))
        .map_err(|e| TuningError::Configuration(format!("invalid {tuning_type} config: {e}")))?;
    config.validate()?;

    tracing::info!(config = ?config, "Parameters used");
    Ok(BuiltTuningConfig { config, dropped_fields })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_tuning_type() {
        assert_eq!(resolve_tuning_type("PROMPT_TUNING").unwrap(), TuningType::PromptTuning);
        assert_eq!(
            resolve_tuning_type("multitask_prompt_tuning").unwrap(),
            TuningType::MultitaskPromptTuning
        );
        assert!(matches!(resolve_tuning_type("LORA"), Err(TuningError::Configuration(_))));
        assert!(matches!(resolve_tuning_type("bogus"), Err(TuningError::Configuration(_))));
    }

    #[test]
    fn test_tuning_type_serde_names() {
        let json = serde_json::to_string(&TuningType::PTuning).unwrap();
        assert_eq!(json, "\"P_TUNING\"");
        let json = serde_json::to_string(&TaskType::Seq2SeqLm).unwrap();
        assert_eq!(json, "\"SEQ_2_SEQ_LM\"");
        let roles: Vec<PromptOutputModelType> =
            serde_json::from_str(r#"["ENCODER","DECODER"]"#).unwrap();
        assert_eq!(roles, vec![PromptOutputModelType::Encoder, PromptOutputModelType::Decoder]);
    }

    #[test]
    fn test_task_type_parse() {
        assert_eq!("CAUSAL_LM".parse::<TaskType>().unwrap(), TaskType::CausalLm);
        assert!(matches!("".parse::<TaskType>(), Err(TuningError::Configuration(_))));
        assert!("causal".parse::<TaskType>().is_err());
    }

    #[test]
    fn test_backend_config_roundtrip_tagged() {
        let json = serde_json::json!({
            "peft_type": "MULTITASK_PROMPT_TUNING",
            "task_type": "SEQ_2_SEQ_LM",
            "num_virtual_tokens": 8,
            "num_transformer_submodules": 2,
            "prompt_tuning_init": "AVERAGE_SOURCE_TASKS",
            "prompt_tuning_init_state_dict_path": "/tmp/source.safetensors",
        });
        let config: BackendTuningConfig = serde_json::from_value(json).unwrap();
        assert_eq!(config.tuning_type(), TuningType::MultitaskPromptTuning);
        assert_eq!(config.total_virtual_tokens(), 16);

        let BackendTuningConfig::MultitaskPromptTuning(mpt) = &config else {
            panic!("expected multitask config");
        };
        assert_eq!(mpt.num_tasks, 1);
        assert_eq!(mpt.num_ranks, 1);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_text_init_requires_text() {
        let json = serde_json::json!({
            "peft_type": "PROMPT_TUNING",
            "task_type": "CAUSAL_LM",
            "num_virtual_tokens": 4,
            "prompt_tuning_init": "TEXT",
        });
        let config: BackendTuningConfig = serde_json::from_value(json).unwrap();
        assert!(matches!(config.validate(), Err(TuningError::Configuration(_))));
    }

    #[test]
    fn test_declared_fields_rejects_unimplemented() {
        assert!(BackendTuningConfig::declared_fields(TuningType::PrefixTuning).is_err());
        let fields = BackendTuningConfig::declared_fields(TuningType::MultitaskPromptTuning).unwrap();
        assert!(fields.contains(&"num_tasks"));
        assert!(!BackendTuningConfig::declared_fields(TuningType::PromptTuning)
            .unwrap()
            .contains(&"num_tasks"));
    }
}
