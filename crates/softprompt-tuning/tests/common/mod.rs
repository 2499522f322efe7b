//! Shared mocks for the integration tests.
//!
//! The base model is a fixed embedding table, the tokenizer maps characters to
//! their scalar values, and the trainer runs a few SGD steps that pull the prompt
//! parameters towards zero.

#![allow(dead_code)]

use async_trait::async_trait;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::Optimizer;
use serde_json::{Value, json};
use softprompt_tuning::error::{TuningError, TuningResult};
use softprompt_tuning::launch::{ElasticLaunchConfig, ElasticLauncher, TrainingJob, launch_training};
use softprompt_tuning::resource::{
    BaseModel, CausalLm, DataCollatorKind, LogEntry, ModelConfig, ModelHandle, PromptTokenizer, Seq2SeqLm,
    TrainOutput, Trainer, TrainerRequest, TrainingHarness,
};
use softprompt_tuning::module::ModuleParts;
use softprompt_tuning::peft::get_peft_model;
use softprompt_tuning::resource::PretrainedModelResource;
use softprompt_tuning::training_args::TrainingArguments;
use softprompt_tuning::tuning::{PromptOutputModelType, TaskType, TuningConfig, TuningType, build_backend_config};
use softprompt_tuning::{GenerationTrainRecord, ModelLoader, TrainRecord, TrainedPromptModule, TrainingMetadata};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, Ordering};

pub const HIDDEN_SIZE: usize = 8;
pub const VOCAB_SIZE: u32 = 32;
pub const MODEL_NAME: &str = "acme/tiny-lm";
pub const BASE_MODEL_FILE: &str = "base_model.json";
pub const TOKENIZER_FILE: &str = "tokenizer.json";

/// Frozen model backed by a deterministic `[VOCAB_SIZE, HIDDEN_SIZE]` embedding table.
pub struct MockBaseModel {
    config: Mutex<ModelConfig>,
    table: Tensor,
    pub gradient_checkpointing: AtomicBool,
    pub placement: Mutex<Option<(Device, DType)>>,
}

impl MockBaseModel {
    pub fn new() -> Self {
        let mut config = ModelConfig::new();
        config.insert("_name_or_path".to_string(), json!(MODEL_NAME));
        config.insert("model_type".to_string(), json!("tiny"));
        config.insert("hidden_size".to_string(), json!(HIDDEN_SIZE));
        config.insert("num_hidden_layers".to_string(), json!(2));
        config.insert("num_attention_heads".to_string(), json!(2));

        let table = Tensor::arange(0f32, (VOCAB_SIZE as usize * HIDDEN_SIZE) as f32, &Device::Cpu)
            .and_then(|t| t.affine(0.01, 0.0))
            .and_then(|t| t.reshape((VOCAB_SIZE as usize, HIDDEN_SIZE)))
            .unwrap();

        Self {
            config: Mutex::new(config),
            table,
            gradient_checkpointing: AtomicBool::new(false),
            placement: Mutex::new(None),
        }
    }
}

impl BaseModel for MockBaseModel {
    fn config(&self) -> ModelConfig {
        self.config.lock().unwrap().clone()
    }

    fn set_config_value(&self, key: &str, value: Value) {
        self.config.lock().unwrap().insert(key.to_string(), value);
    }

    fn enable_gradient_checkpointing(&self) {
        self.gradient_checkpointing.store(true, Ordering::SeqCst);
    }

    fn no_split_modules(&self) -> Vec<String> {
        vec!["TinyDecoderLayer".to_string()]
    }

    fn embed_tokens(&self, token_ids: &Tensor) -> TuningResult<Tensor> {
        let ids: Vec<u32> = token_ids.to_vec1::<u32>()?.into_iter().map(|id| id % VOCAB_SIZE).collect();
        let ids = Tensor::new(ids.as_slice(), &Device::Cpu)?;
        Ok(self.table.index_select(&ids, 0)?)
    }

    fn to_device(&self, device: &Device, dtype: DType) -> TuningResult<()> {
        *self.placement.lock().unwrap() = Some((device.clone(), dtype));
        Ok(())
    }

    fn save_pretrained(&self, dir: &Path) -> TuningResult<()> {
        std::fs::write(dir.join(BASE_MODEL_FILE), serde_json::to_vec(&self.config())?)?;
        Ok(())
    }
}

/// One token per character; `$` is the end-of-sequence marker.
pub struct CharTokenizer;

impl PromptTokenizer for CharTokenizer {
    fn eos_token(&self) -> String {
        "$".to_string()
    }

    fn encode(&self, text: &str) -> TuningResult<Vec<u32>> {
        Ok(text.chars().map(u32::from).collect())
    }

    fn save_pretrained(&self, dir: &Path) -> TuningResult<()> {
        std::fs::write(dir.join(TOKENIZER_FILE), r#"{"type":"char"}"#)?;
        Ok(())
    }
}

/// What the harness saw when it built a trainer.
#[derive(Debug, Clone)]
pub struct HarnessCall {
    pub args: TrainingArguments,
    pub collator: DataCollatorKind,
    pub train_len: usize,
    pub eval_len: Option<usize>,
}

/// Builds [`MockTrainer`]s and records every request.
#[derive(Default)]
pub struct MockHarness {
    pub fail_training: bool,
    pub max_steps: u64,
    pub calls: Mutex<Vec<HarnessCall>>,
    pub saved_to: Arc<Mutex<Option<PathBuf>>>,
}

impl MockHarness {
    pub fn new() -> Self {
        Self { max_steps: 3, ..Self::default() }
    }

    pub fn failing() -> Self {
        Self { fail_training: true, ..Self::new() }
    }

    pub fn last_call(&self) -> HarnessCall {
        self.calls.lock().unwrap().last().cloned().expect("trainer was never built")
    }

    pub fn checkpoint_dir(&self) -> Option<PathBuf> {
        self.saved_to.lock().unwrap().clone()
    }
}

impl TrainingHarness for MockHarness {
    fn build_trainer<'a>(&self, request: TrainerRequest<'a>) -> TuningResult<Box<dyn Trainer + 'a>> {
        self.calls.lock().unwrap().push(HarnessCall {
            args: request.args.clone(),
            collator: request.collator,
            train_len: request.train_dataset.len(),
            eval_len: request.eval_dataset.as_ref().map(|d| d.len()),
        });

        let steps = request.args.get_u64("max_steps").unwrap_or(1).min(self.max_steps);
        let learning_rate = request.args.get_f64("learning_rate").unwrap_or(0.1);
        Ok(Box::new(MockTrainer {
            vars: request.model.trainable_vars(),
            steps,
            learning_rate,
            fail: self.fail_training,
            saved_to: Arc::clone(&self.saved_to),
        }))
    }
}

pub struct MockTrainer {
    vars: Vec<Var>,
    steps: u64,
    learning_rate: f64,
    fail: bool,
    saved_to: Arc<Mutex<Option<PathBuf>>>,
}

impl MockTrainer {
    fn loss(&self) -> TuningResult<Tensor> {
        let mut total = Tensor::zeros((), DType::F32, &Device::Cpu)?;
        for var in &self.vars {
            total = (total + var.as_tensor().sqr()?.mean_all()?)?;
        }
        Ok(total)
    }
}

#[async_trait]
impl Trainer for MockTrainer {
    async fn train(&mut self) -> TuningResult<TrainOutput> {
        if self.fail {
            return Err(TuningError::Trainer("CUDA out of memory".to_string()));
        }

        let mut sgd = candle_nn::SGD::new(self.vars.clone(), self.learning_rate)?;
        let mut log_history = Vec::new();
        for step in 1..=self.steps {
            let loss = self.loss()?;
            let value = f64::from(loss.to_scalar::<f32>()?);
            sgd.backward_step(&loss)?;
            log_history.push(LogEntry {
                step,
                epoch: step as f64 / self.steps as f64,
                loss: Some(value),
                learning_rate: Some(self.learning_rate),
            });
        }
        let losses: Vec<f64> = log_history.iter().filter_map(|e| e.loss).collect();
        let training_loss = losses.iter().sum::<f64>() / losses.len().max(1) as f64;
        Ok(TrainOutput { global_step: self.steps, training_loss, log_history })
    }

    fn save_model(&self, dir: &Path) -> TuningResult<()> {
        std::fs::write(dir.join("trainer_state.json"), r#"{"saved":true}"#)?;
        *self.saved_to.lock().unwrap() = Some(dir.to_path_buf());
        Ok(())
    }
}

/// Runs rank 0 in-process and fabricates results for the other ranks.
#[derive(Default)]
pub struct RecordingLauncher {
    pub configs: Mutex<Vec<ElasticLaunchConfig>>,
}

#[async_trait]
impl ElasticLauncher for RecordingLauncher {
    async fn launch<'a>(
        &self,
        config: &ElasticLaunchConfig,
        job: TrainingJob<'a>,
    ) -> TuningResult<HashMap<usize, Vec<f64>>> {
        self.configs.lock().unwrap().push(config.clone());
        let mut by_rank = HashMap::from([(0, launch_training(job).await?)]);
        for rank in 1..config.nproc_per_node {
            by_rank.insert(rank, vec![99.0]);
        }
        Ok(by_rank)
    }
}

/// Reloads bundles written by [`MockBaseModel`] and [`CharTokenizer`].
#[derive(Default)]
pub struct MockLoader {
    pub requested_names: Mutex<Vec<Option<String>>>,
}

impl ModelLoader for MockLoader {
    fn load_base_model(
        &self,
        bundle_dir: &Path,
        base_model_name_or_path: Option<&str>,
    ) -> TuningResult<Arc<dyn BaseModel>> {
        if !bundle_dir.join(BASE_MODEL_FILE).exists() {
            return Err(TuningError::MissingArtifact(format!("no base model in {}", bundle_dir.display())));
        }
        self.requested_names.lock().unwrap().push(base_model_name_or_path.map(ToString::to_string));
        Ok(Arc::new(MockBaseModel::new()))
    }

    fn load_tokenizer(&self, dir: &Path) -> TuningResult<Arc<dyn PromptTokenizer>> {
        if !dir.join(TOKENIZER_FILE).exists() {
            return Err(TuningError::MissingArtifact(format!("no tokenizer in {}", dir.display())));
        }
        Ok(Arc::new(CharTokenizer))
    }
}

pub fn handle(model: Arc<MockBaseModel>, harness: Arc<MockHarness>) -> ModelHandle {
    ModelHandle::new(MODEL_NAME, model, Arc::new(CharTokenizer), harness)
}

pub fn causal_lm(harness: Arc<MockHarness>) -> (CausalLm, Arc<MockBaseModel>) {
    let model = Arc::new(MockBaseModel::new());
    (CausalLm(handle(Arc::clone(&model), harness)), model)
}

pub fn seq2seq_lm(harness: Arc<MockHarness>) -> (Seq2SeqLm, Arc<MockBaseModel>) {
    let model = Arc::new(MockBaseModel::new());
    (Seq2SeqLm(handle(Arc::clone(&model), harness)), model)
}

/// Untrained causal prompt-tuning module with the given loss history and roles.
pub fn causal_module(loss: Vec<f64>, output_model_types: Vec<PromptOutputModelType>) -> TrainedPromptModule {
    let (resource, base) = causal_lm(Arc::new(MockHarness::new()));
    let built = build_backend_config(
        &resource,
        TuningType::PromptTuning,
        TaskType::CausalLm.as_str(),
        MODEL_NAME,
        &TuningConfig::with_virtual_tokens(4),
        &[PromptOutputModelType::Encoder],
    )
    .unwrap();
    let model = get_peft_model(base as Arc<dyn BaseModel>, &CharTokenizer, built.config).unwrap();

    TrainedPromptModule::new(ModuleParts {
        tokenizer: Arc::new(CharTokenizer),
        model,
        base_model_config: resource.get_config(),
        base_model_name: MODEL_NAME.to_string(),
        verbalizer: "{{input}}".to_string(),
        task_type: TaskType::CausalLm,
        tuning_type: TuningType::PromptTuning,
        output_model_types,
        training_metadata: TrainingMetadata { loss },
        warnings: Vec::new(),
    })
}

pub fn train_records() -> Vec<TrainRecord> {
    vec![
        TrainRecord::from(GenerationTrainRecord {
            input: "@foo what a cute dog!".to_string(),
            output: "no complaint".to_string(),
        }),
        TrainRecord::from(GenerationTrainRecord {
            input: "@bar this is the worst idea ever.".to_string(),
            output: "complaint".to_string(),
        }),
        TrainRecord::from(GenerationTrainRecord {
            input: "@baz the package never arrived".to_string(),
            output: "complaint".to_string(),
        }),
    ]
}

pub fn tensor_values(tensor: &Tensor) -> Vec<Vec<f32>> {
    tensor.to_dtype(DType::F32).unwrap().to_vec2::<f32>().unwrap()
}
