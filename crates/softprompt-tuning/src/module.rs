use crate::device::Accelerator;
use crate::error::TuningWarning;
use crate::peft::PromptTunedModel;
use crate::resource::{ModelConfig, PromptTokenizer};
use crate::tuning::{PromptOutputModelType, TaskType, TuningType};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Config field holding the location a base model was loaded from.
pub const NAME_OR_PATH_KEY: &str = "_name_or_path";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TrainingMetadata {
    /// One value per optimizer step, main rank only.
    pub loss: Vec<f64>,
}

/// Inputs for [`TrainedPromptModule::new`].
pub struct ModuleParts {
    pub tokenizer: Arc<dyn PromptTokenizer>,
    pub model: PromptTunedModel,
    pub base_model_config: ModelConfig,
    pub base_model_name: String,
    pub verbalizer: String,
    pub task_type: TaskType,
    pub tuning_type: TuningType,
    pub output_model_types: Vec<PromptOutputModelType>,
    pub training_metadata: TrainingMetadata,
    pub warnings: Vec<TuningWarning>,
}

/// A trained (or loaded) prompt-tuned model and everything needed to save it.
pub struct TrainedPromptModule {
    tokenizer: Arc<dyn PromptTokenizer>,
    model: PromptTunedModel,
    base_model_config: ModelConfig,
    base_model_name: String,
    verbalizer: String,
    task_type: TaskType,
    tuning_type: TuningType,
    output_model_types: Vec<PromptOutputModelType>,
    training_metadata: TrainingMetadata,
    warnings: Vec<TuningWarning>,
}

impl TrainedPromptModule {
    /// Build a module. The base config snapshot never keeps `_name_or_path`, since
    /// the same model can be saved to a different location.
    #[must_use]
    pub fn new(parts: ModuleParts) -> Self {
        let mut base_model_config = parts.base_model_config;
        base_model_config.remove(NAME_OR_PATH_KEY);
        debug_assert!(!base_model_config.contains_key(NAME_OR_PATH_KEY));

        Self {
            tokenizer: parts.tokenizer,
            model: parts.model,
            base_model_config,
            base_model_name: parts.base_model_name,
            verbalizer: parts.verbalizer,
            task_type: parts.task_type,
            tuning_type: parts.tuning_type,
            output_model_types: parts.output_model_types,
            training_metadata: parts.training_metadata,
            warnings: parts.warnings,
        }
    }

    #[must_use]
    pub fn tokenizer(&self) -> &Arc<dyn PromptTokenizer> {
        &self.tokenizer
    }

    #[must_use]
    pub fn model(&self) -> &PromptTunedModel {
        &self.model
    }

    pub fn model_mut(&mut self) -> &mut PromptTunedModel {
        &mut self.model
    }

    #[must_use]
    pub fn base_model_config(&self) -> &ModelConfig {
        &self.base_model_config
    }

    #[must_use]
    pub fn base_model_name(&self) -> &str {
        &self.base_model_name
    }

    #[must_use]
    pub fn verbalizer(&self) -> &str {
        &self.verbalizer
    }

    #[must_use]
    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    #[must_use]
    pub fn tuning_type(&self) -> TuningType {
        self.tuning_type
    }

    #[must_use]
    pub fn output_model_types(&self) -> &[PromptOutputModelType] {
        &self.output_model_types
    }

    #[must_use]
    pub fn training_metadata(&self) -> &TrainingMetadata {
        &self.training_metadata
    }

    /// Non-fatal conditions raised while this module was trained or loaded.
    #[must_use]
    pub fn warnings(&self) -> &[TuningWarning] {
        &self.warnings
    }

    /// Release the model and tokenizer, then ask the accelerator to drop cached memory.
    pub fn close(self, accelerator: &dyn Accelerator) {
        let Self { model, tokenizer, .. } = self;
        drop(model);
        drop(tokenizer);
        if let Err(err) = accelerator.empty_cache() {
            tracing::debug!(error = %err, "Accelerator cache was not cleared");
        }
    }
}

impl std::fmt::Debug for TrainedPromptModule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrainedPromptModule")
            .field("base_model_name", &self.base_model_name)
            .field("task_type", &self.task_type)
            .field("tuning_type", &self.tuning_type)
            .field("output_model_types", &self.output_model_types)
            .field("model", &self.model)
            .finish_non_exhaustive()
    }
}
