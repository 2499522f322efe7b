//! Top-level prompt tuning flow.

use crate::dataset::{
    DatasetPreprocessor, GenerationTrainRecord, PreprocessRequest, TokenizingPreprocessor, TrainRecord,
    TrainingDataset, convert_to_generation_record,
};
use crate::device::{Accelerator, DeviceRequest, Precision, resolve_device};
use crate::error::{TuningResult, TuningWarning};
use crate::launch::{ElasticLaunchConfig, ElasticLauncher, InProcessLauncher, TrainingJob, launch_training, main_rank_losses};
use crate::module::{ModuleParts, TrainedPromptModule, TrainingMetadata};
use crate::peft::{PromptTunedModel, get_peft_model};
use crate::resource::{ModelFamily, PretrainedModelResource, TrainerRequest};
use crate::settings::Settings;
use crate::training_args::{
    TrainerSchedule, TrainingArguments, collect_trainer_arguments, filter_training_arguments,
    infer_max_steps, sharding_overrides,
};
use crate::tuning::{TuningConfig, TuningType, build_backend_config};
use std::sync::Arc;

/// Seed used when shuffling the preprocessed train stream.
pub const DATASET_SEED: u64 = 73;

/// Verbalizer that feeds the raw input through unchanged.
pub const DEFAULT_VERBALIZER: &str = "{{input}}";

/// Hyperparameters and overrides for [`PromptTuningRuntime::train`].
#[derive(Debug, Clone)]
pub struct TrainOptions {
    pub num_epochs: u32,
    pub learning_rate: f64,
    pub verbalizer: String,
    pub batch_size: usize,
    pub max_source_length: usize,
    pub max_target_length: usize,
    pub accumulate_steps: usize,
    /// Precision name; the configured default applies when `None`.
    pub torch_dtype: Option<String>,
    pub silence_progress_bars: bool,
    pub seed: u64,
    pub device: DeviceRequest,
    pub tuning_type: TuningType,
    /// Pass-through trainer arguments, filtered against the allow-list.
    pub training_arguments: TrainingArguments,
}

impl Default for TrainOptions {
    fn default() -> Self {
        Self {
            num_epochs: 20,
            learning_rate: 0.3,
            verbalizer: DEFAULT_VERBALIZER.to_string(),
            batch_size: 8,
            max_source_length: 256,
            max_target_length: 128,
            accumulate_steps: 32,
            torch_dtype: None,
            silence_progress_bars: true,
            seed: DATASET_SEED,
            device: DeviceRequest::Detect,
            tuning_type: TuningType::PromptTuning,
            training_arguments: TrainingArguments::new(),
        }
    }
}

/// Runs prompt tuning against injected collaborators.
#[derive(Clone)]
pub struct PromptTuningRuntime {
    settings: Settings,
    accelerator: Arc<dyn Accelerator>,
    launcher: Arc<dyn ElasticLauncher>,
    preprocessor: Arc<dyn DatasetPreprocessor>,
}

impl PromptTuningRuntime {
    #[must_use]
    pub fn new(settings: Settings, accelerator: Arc<dyn Accelerator>) -> Self {
        Self {
            settings,
            accelerator,
            launcher: Arc::new(InProcessLauncher),
            preprocessor: Arc::new(TokenizingPreprocessor),
        }
    }

    #[must_use]
    pub fn with_launcher(mut self, launcher: Arc<dyn ElasticLauncher>) -> Self {
        self.launcher = launcher;
        self
    }

    #[must_use]
    pub fn with_preprocessor(mut self, preprocessor: Arc<dyn DatasetPreprocessor>) -> Self {
        self.preprocessor = preprocessor;
        self
    }

    #[must_use]
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    #[must_use]
    pub fn accelerator(&self) -> &Arc<dyn Accelerator> {
        &self.accelerator
    }

    /// Train soft prompts for `resource` on `train_records`.
    ///
    /// Configuration and shape problems fail before any compute. Trainer failures
    /// propagate unchanged. The intermediate checkpoint directory is removed on
    /// every exit path.
    pub async fn train(
        &self,
        resource: &dyn PretrainedModelResource,
        train_records: Vec<TrainRecord>,
        tuning_config: &TuningConfig,
        val_records: Option<Vec<TrainRecord>>,
        options: TrainOptions,
    ) -> TuningResult<TrainedPromptModule> {
        let precision = Precision::resolve(options.torch_dtype.as_deref(), &self.settings)?;
        let tuning_type = options.tuning_type.ensure_implemented()?;
        let mut warnings = Vec::new();

        let base_model = resource.model();
        let tokenizer = resource.tokenizer();
        base_model.enable_gradient_checkpointing();

        let base_model_name = resource.model_name().to_string();
        let base_model_config = resource.get_config();

        let family = resource.family();
        let task_type = family.task_type();
        let output_model_types =
            tuning_config.output_model_types.clone().unwrap_or_else(|| family.default_output_model_types());
        let built = build_backend_config(
            resource,
            tuning_type,
            task_type.as_str(),
            &base_model_name,
            tuning_config,
            &output_model_types,
        )?;
        if !built.dropped_fields.is_empty() {
            warnings.push(TuningWarning::DroppedConfigFields { fields: built.dropped_fields.clone() });
        }
        tracing::debug!(config = ?built.config, "Backend tuning config");

        let train_records: Vec<_> = train_records.into_iter().map(convert_to_generation_record).collect();
        let val_records: Option<Vec<_>> =
            val_records.map(|records| records.into_iter().map(convert_to_generation_record).collect());

        if family == ModelFamily::CausalLm
            && let Some(d_model) = self.settings.causal_lm.d_model
        {
            base_model.set_config_value("d_model", d_model.into());
        }

        let mut peft_model = get_peft_model(Arc::clone(&base_model), tokenizer.as_ref(), built.config)?;
        let device = resolve_device(&options.device, self.accelerator.as_ref());

        let preprocess = |records: &[GenerationTrainRecord], shuffle: bool| {
            self.preprocessor.preprocess(PreprocessRequest {
                family,
                records,
                tokenizer: tokenizer.as_ref(),
                max_source_length: options.max_source_length,
                max_target_length: options.max_target_length,
                shuffle,
                random_seed: DATASET_SEED,
                task_ids: 0,
            })
        };
        let train_dataset: Arc<TrainingDataset> = Arc::new(preprocess(&train_records, true)?);
        let eval_dataset = match &val_records {
            Some(records) => Some(Arc::new(preprocess(records, false)?)),
            None => None,
        };

        let (filtered_arguments, extra) =
            filter_training_arguments(options.training_arguments.clone(), &self.settings.training.allowed_args);
        warnings.extend(extra);

        let module_parts = |model: PromptTunedModel, loss: Vec<f64>, warnings: Vec<TuningWarning>| ModuleParts {
            tokenizer: Arc::clone(&tokenizer),
            model,
            base_model_config: base_model_config.clone(),
            base_model_name: base_model_name.clone(),
            verbalizer: options.verbalizer.clone(),
            task_type,
            tuning_type,
            output_model_types: output_model_types.clone(),
            training_metadata: TrainingMetadata { loss },
            warnings,
        };

        if options.num_epochs < 1 {
            let warning = TuningWarning::TrainingSkipped { num_epochs: options.num_epochs };
            warning.emit();
            warnings.push(warning);
            return Ok(TrainedPromptModule::new(module_parts(peft_model, Vec::new(), warnings)));
        }

        let device_count = self.accelerator.device_count();
        let loss = {
            let checkpoint_dir = tempfile::Builder::new().prefix("softprompt-checkpoint-").tempdir()?;

            let schedule = TrainerSchedule {
                precision,
                output_dir: checkpoint_dir.path(),
                batch_size: options.batch_size,
                num_epochs: options.num_epochs,
                random_seed: options.seed,
                learning_rate: options.learning_rate,
                accumulate_steps: options.accumulate_steps,
                max_steps: infer_max_steps(options.num_epochs, options.batch_size, train_dataset.len())?,
                silence_progress_bars: options.silence_progress_bars,
                no_cuda: device.as_deref().is_none_or(|d| d == "cpu"),
            };
            let mut args = collect_trainer_arguments(&schedule);
            args.extend(filtered_arguments);
            args.extend(sharding_overrides(device_count, &base_model.no_split_modules()));

            let trainer = resource.get_trainer(TrainerRequest {
                train_dataset: Arc::clone(&train_dataset),
                eval_dataset,
                model: &mut peft_model,
                tokenizer: Arc::clone(&tokenizer),
                collator: family.collator(),
                arguments_kind: family.arguments_kind(),
                args,
            })?;
            let job = TrainingJob {
                trainer,
                tokenizer: Arc::clone(&tokenizer),
                checkpoint_dir: checkpoint_dir.path().to_path_buf(),
            };

            if self.accelerator.is_available() {
                let launch_config = ElasticLaunchConfig::single_node(&self.settings.distributed, device_count);
                tracing::info!(
                    nproc_per_node = device_count,
                    endpoint = %launch_config.rdzv_endpoint,
                    "Launching distributed training"
                );
                main_rank_losses(self.launcher.launch(&launch_config, job).await?)?
            } else {
                launch_training(job).await?
            }
        };

        tracing::info!(steps = loss.len(), base_model = %base_model_name, "Prompt tuning complete");
        Ok(TrainedPromptModule::new(module_parts(peft_model, loss, warnings)))
    }
}
