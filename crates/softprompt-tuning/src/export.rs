//! Extraction of trained prompt vectors.

use crate::error::{TuningError, TuningResult};
use crate::peft::PromptTunedModel;
use crate::tuning::{BackendTuningConfig, PromptOutputModelType, TuningType};
use candle_core::{DType, Tensor};
use std::collections::BTreeMap;

/// Exported prompt per role; roles that were not trained map to `None`.
#[derive(Debug, Clone)]
pub struct ExportedPrompts(BTreeMap<PromptOutputModelType, Option<Tensor>>);

impl ExportedPrompts {
    fn empty() -> Self {
        Self(BTreeMap::from([
            (PromptOutputModelType::Encoder, None),
            (PromptOutputModelType::Decoder, None),
        ]))
    }

    #[must_use]
    pub fn get(&self, role: PromptOutputModelType) -> Option<&Tensor> {
        self.0.get(&role).and_then(Option::as_ref)
    }

    #[must_use]
    pub fn encoder(&self) -> Option<&Tensor> {
        self.get(PromptOutputModelType::Encoder)
    }

    #[must_use]
    pub fn decoder(&self) -> Option<&Tensor> {
        self.get(PromptOutputModelType::Decoder)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.values().all(Option::is_none)
    }

    pub fn iter(&self) -> impl Iterator<Item = (PromptOutputModelType, Option<&Tensor>)> {
        self.0.iter().map(|(role, tensor)| (*role, tensor.as_ref()))
    }
}

/// Extract the prompt tensor(s) to ship with an artifact.
///
/// Every declared role receives the first `num_virtual_tokens` rows of the prompt
/// table; for encoder-decoder models trained with two submodules the second half
/// duplicates the first.
pub fn get_exportable_prompt_vectors(
    model: &PromptTunedModel,
    tuning_type: TuningType,
    output_model_types: &[PromptOutputModelType],
) -> TuningResult<ExportedPrompts> {
    let config = model.config();
    let num_transformer_submodules = config.num_transformer_submodules();
    let num_virtual_tokens = config.num_virtual_tokens();
    if !(1..=2).contains(&num_transformer_submodules) {
        return Err(TuningError::ShapeMismatch(format!(
            "Only 1 or 2 transformer submodules allowed. {num_transformer_submodules} detected."
        )));
    }
    if config.tuning_type() != tuning_type {
        return Err(TuningError::Configuration(format!(
            "model was built for {} but {tuning_type} was requested",
            config.tuning_type()
        )));
    }

    let prompt_vector = match config {
        BackendTuningConfig::PromptTuning(_) => {
            tracing::info!("Extracting prompt vector for prompt tuning");
            model.get_prompt_embedding_to_save()?
        }
        BackendTuningConfig::MultitaskPromptTuning(_) => {
            tracing::info!("Calculating single target task prompt vector");
            let prompt_tokens = model.prompt_tokens()?.unsqueeze(0)?;
            let task_ids = Tensor::zeros(prompt_tokens.dim(0)?, DType::U32, model.device())?;
            model.encoder().forward(&prompt_tokens, Some(&task_ids))?.squeeze(0)?.detach()
        }
    };
    let prompt_vector = prompt_vector.to_device(model.device())?;

    let rows = prompt_vector.dim(0)?;
    let expected = num_transformer_submodules * num_virtual_tokens;
    if rows != expected {
        return Err(TuningError::ShapeMismatch(format!(
            "Row mismatch: Expected num_transformer_submodules * num_virtual_tokens ({expected}) but got {rows}"
        )));
    }

    let mut prompts = ExportedPrompts::empty();
    for role in output_model_types {
        prompts.0.insert(*role, Some(prompt_vector.narrow(0, 0, num_virtual_tokens)?));
    }
    Ok(prompts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exported_prompts_empty() {
        let prompts = ExportedPrompts::empty();
        assert!(prompts.is_empty());
        assert!(prompts.encoder().is_none());
        assert_eq!(prompts.iter().count(), 2);
    }
}
