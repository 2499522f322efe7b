//! Base model resources and the collaborator traits they are built from.
//!
//! The frozen model, its tokenizer and the training harness are external. This
//! module defines the narrow traits they are consumed through and the two base
//! model families prompt tuning supports.

use crate::dataset::TrainingDataset;
use crate::error::{TuningError, TuningResult};
use crate::peft::PromptTunedModel;
use crate::training_args::TrainingArguments;
use crate::tuning::{PromptOutputModelType, TaskType};
use async_trait::async_trait;
use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;

/// Key-value configuration of a base model.
pub type ModelConfig = Map<String, Value>;

/// Frozen pretrained model.
///
/// Handles are shared between the resource and the prompt-tuned wrapper, so every
/// method takes `&self`; implementations use interior mutability for config and
/// device changes.
pub trait BaseModel: Send + Sync {
    fn config(&self) -> ModelConfig;

    fn set_config_value(&self, key: &str, value: Value);

    fn enable_gradient_checkpointing(&self);

    /// Layer class names that must not be split across shards.
    fn no_split_modules(&self) -> Vec<String>;

    /// Look up word embeddings for `token_ids` (`[n]` -> `[n, token_dim]`).
    fn embed_tokens(&self, token_ids: &Tensor) -> TuningResult<Tensor>;

    fn to_device(&self, device: &Device, dtype: DType) -> TuningResult<()>;

    fn save_pretrained(&self, dir: &Path) -> TuningResult<()>;
}

pub trait PromptTokenizer: Send + Sync {
    fn eos_token(&self) -> String;

    fn encode(&self, text: &str) -> TuningResult<Vec<u32>>;

    fn save_pretrained(&self, dir: &Path) -> TuningResult<()>;
}

/// One entry of a trainer's log history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub step: u64,
    pub epoch: f64,
    #[serde(default)]
    pub loss: Option<f64>,
    #[serde(default)]
    pub learning_rate: Option<f64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainOutput {
    pub global_step: u64,
    pub training_loss: f64,
    pub log_history: Vec<LogEntry>,
}

impl TrainOutput {
    /// Per-step loss values, in log order.
    #[must_use]
    pub fn losses(&self) -> Vec<f64> {
        self.log_history.iter().filter_map(|entry| entry.loss).collect()
    }
}

/// A trainer bound to a dataset and a prompt-tuned model.
#[async_trait]
pub trait Trainer: Send {
    async fn train(&mut self) -> TuningResult<TrainOutput>;

    /// Write the trained adapter into `dir`.
    fn save_model(&self, dir: &Path) -> TuningResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DataCollatorKind {
    LanguageModeling { mlm: bool },
    Seq2Seq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TrainingArgumentsKind {
    Standard,
    Seq2Seq,
}

/// Everything a harness needs to build a trainer.
pub struct TrainerRequest<'a> {
    pub train_dataset: Arc<TrainingDataset>,
    pub eval_dataset: Option<Arc<TrainingDataset>>,
    pub model: &'a mut PromptTunedModel,
    pub tokenizer: Arc<dyn PromptTokenizer>,
    pub collator: DataCollatorKind,
    pub arguments_kind: TrainingArgumentsKind,
    pub args: TrainingArguments,
}

/// Builds trainers for a base model.
pub trait TrainingHarness: Send + Sync {
    fn build_trainer<'a>(&self, request: TrainerRequest<'a>) -> TuningResult<Box<dyn Trainer + 'a>>;
}

/// Supported base model families.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelFamily {
    CausalLm,
    Seq2SeqLm,
}

impl ModelFamily {
    #[must_use]
    pub fn task_type(self) -> TaskType {
        match self {
            Self::CausalLm => TaskType::CausalLm,
            Self::Seq2SeqLm => TaskType::Seq2SeqLm,
        }
    }

    #[must_use]
    pub fn max_transformer_submodules(self) -> usize {
        match self {
            Self::CausalLm => 1,
            Self::Seq2SeqLm => 2,
        }
    }

    #[must_use]
    pub fn default_output_model_types(self) -> Vec<PromptOutputModelType> {
        vec![PromptOutputModelType::Encoder]
    }

    #[must_use]
    pub fn collator(self) -> DataCollatorKind {
        match self {
            Self::CausalLm => DataCollatorKind::LanguageModeling { mlm: false },
            Self::Seq2SeqLm => DataCollatorKind::Seq2Seq,
        }
    }

    #[must_use]
    pub fn arguments_kind(self) -> TrainingArgumentsKind {
        match self {
            Self::CausalLm => TrainingArgumentsKind::Standard,
            Self::Seq2SeqLm => TrainingArgumentsKind::Seq2Seq,
        }
    }

    /// Count the transformer submodules `output_model_types` selects.
    pub fn num_transformer_submodules(
        self,
        output_model_types: &[PromptOutputModelType],
    ) -> TuningResult<usize> {
        let distinct: BTreeSet<_> = output_model_types.iter().collect();
        let count = distinct.len();
        if count == 0 || count > self.max_transformer_submodules() {
            return Err(TuningError::Configuration(format!(
                "{self:?} supports between 1 and {} output model types, got {count}",
                self.max_transformer_submodules()
            )));
        }
        Ok(count)
    }
}

/// Capabilities prompt tuning consumes from a base model wrapper.
pub trait PretrainedModelResource: Send + Sync {
    fn family(&self) -> ModelFamily;

    fn model_name(&self) -> &str;

    fn model(&self) -> Arc<dyn BaseModel>;

    fn tokenizer(&self) -> Arc<dyn PromptTokenizer>;

    fn get_config(&self) -> ModelConfig {
        self.model().config()
    }

    fn get_num_transformer_submodules(
        &self,
        output_model_types: &[PromptOutputModelType],
    ) -> TuningResult<usize> {
        self.family().num_transformer_submodules(output_model_types)
    }

    fn get_trainer<'a>(&self, request: TrainerRequest<'a>) -> TuningResult<Box<dyn Trainer + 'a>>;
}

/// Handles shared by both families.
#[derive(Clone)]
pub struct ModelHandle {
    pub name: String,
    pub model: Arc<dyn BaseModel>,
    pub tokenizer: Arc<dyn PromptTokenizer>,
    pub harness: Arc<dyn TrainingHarness>,
}

impl ModelHandle {
    pub fn new(
        name: impl Into<String>,
        model: Arc<dyn BaseModel>,
        tokenizer: Arc<dyn PromptTokenizer>,
        harness: Arc<dyn TrainingHarness>,
    ) -> Self {
        Self { name: name.into(), model, tokenizer, harness }
    }

    fn trainer_for<'a>(
        &self,
        family: ModelFamily,
        mut request: TrainerRequest<'a>,
    ) -> TuningResult<Box<dyn Trainer + 'a>> {
        request.collator = family.collator();
        request.arguments_kind = family.arguments_kind();
        self.harness.build_trainer(request)
    }
}

impl std::fmt::Debug for ModelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelHandle").field("name", &self.name).finish_non_exhaustive()
    }
}

/// Decoder-only language model.
#[derive(Debug, Clone)]
pub struct CausalLm(pub ModelHandle);

/// Encoder-decoder language model.
#[derive(Debug, Clone)]
pub struct Seq2SeqLm(pub ModelHandle);

macro_rules! impl_resource {
    ($ty:ty, $family:expr) => {
        impl PretrainedModelResource for $ty {
            fn family(&self) -> ModelFamily {
                $family
            }

            fn model_name(&self) -> &str {
                &self.0.name
            }

            fn model(&self) -> Arc<dyn BaseModel> {
                Arc::clone(&self.0.model)
            }

            fn tokenizer(&self) -> Arc<dyn PromptTokenizer> {
                Arc::clone(&self.0.tokenizer)
            }

            fn get_trainer<'a>(
                &self,
                request: TrainerRequest<'a>,
            ) -> TuningResult<Box<dyn Trainer + 'a>> {
                self.0.trainer_for($family, request)
            }
        }
    };
}

impl_resource!(CausalLm, ModelFamily::CausalLm);
impl_resource!(Seq2SeqLm, ModelFamily::Seq2SeqLm);

/// A base model resource of either family.
#[derive(Debug, Clone)]
pub enum BaseModelResource {
    CausalLm(CausalLm),
    Seq2SeqLm(Seq2SeqLm),
}

impl BaseModelResource {
    fn inner(&self) -> &dyn PretrainedModelResource {
        match self {
            Self::CausalLm(r) => r,
            Self::Seq2SeqLm(r) => r,
        }
    }
}

impl PretrainedModelResource for BaseModelResource {
    fn family(&self) -> ModelFamily {
        self.inner().family()
    }

    fn model_name(&self) -> &str {
        self.inner().model_name()
    }

    fn model(&self) -> Arc<dyn BaseModel> {
        self.inner().model()
    }

    fn tokenizer(&self) -> Arc<dyn PromptTokenizer> {
        self.inner().tokenizer()
    }

    fn get_config(&self) -> ModelConfig {
        self.inner().get_config()
    }

    fn get_num_transformer_submodules(
        &self,
        output_model_types: &[PromptOutputModelType],
    ) -> TuningResult<usize> {
        self.inner().get_num_transformer_submodules(output_model_types)
    }

    fn get_trainer<'a>(&self, request: TrainerRequest<'a>) -> TuningResult<Box<dyn Trainer + 'a>> {
        self.inner().get_trainer(request)
    }
}

impl From<CausalLm> for BaseModelResource {
    fn from(value: CausalLm) -> Self {
        Self::CausalLm(value)
    }
}

impl From<Seq2SeqLm> for BaseModelResource {
    fn from(value: Seq2SeqLm) -> Self {
        Self::Seq2SeqLm(value)
    }
}
