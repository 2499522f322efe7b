//! Soft prompt tuning
//!
//! Parameter-efficient tuning primitives for frozen generative language models:
//! - Building backend tuning configs for prompt tuning and multi-task prompt tuning
//! - Driving single-process or elastic training through injected collaborators
//! - Exporting trained prompt vectors and validating their shape
//! - Writing and reloading prompt artifacts (`manifest.json`, `encoder.pt`, ...)

pub mod artifacts;
pub mod dataset;
pub mod device;
pub mod error;
pub mod export;
pub mod launch;
pub mod layout;
pub mod module;
pub mod orchestrator;
pub mod peft;
pub mod registry;
pub mod resource;
pub mod settings;
pub mod training_args;
pub mod tuning;

pub use artifacts::{
    ArtifactKind, ModelLoader, PromptArtifact, PromptManifest, load, read_manifest, save, verify_artifact,
};
pub use dataset::{
    ClassificationTrainRecord, DatasetPreprocessor, GenerationTrainRecord, PreprocessRequest,
    TokenizingPreprocessor, TrainRecord, TrainingDataset, convert_to_generation_record, read_jsonl_records,
};
pub use device::{
    Accelerator, CandleAccelerator, DeviceRequest, Precision, StaticAccelerator, convert_model, resolve_device,
};
pub use error::{TuningError, TuningResult, TuningWarning};
pub use export::{ExportedPrompts, get_exportable_prompt_vectors};
pub use launch::{ElasticLaunchConfig, ElasticLauncher, InProcessLauncher, TrainingJob, launch_training};
pub use layout::ArtifactLayout;
pub use module::{TrainedPromptModule, TrainingMetadata};
pub use orchestrator::{PromptTuningRuntime, TrainOptions};
pub use peft::{PromptEncoder, PromptTunedModel, get_peft_model};
pub use registry::{PromptArtifactEntry, discover_prompt_artifacts, resolve_prompt_artifact};
pub use resource::{
    BaseModel, BaseModelResource, CausalLm, ModelConfig, ModelFamily, ModelHandle, PretrainedModelResource,
    PromptTokenizer, Seq2SeqLm, Trainer, TrainerRequest, TrainingHarness,
};
pub use settings::Settings;
pub use training_args::{ALLOWED_TRAINING_ARGS, TrainingArguments};
pub use tuning::{
    BackendTuningConfig, PromptOutputModelType, TaskType, TuningConfig, TuningType, build_backend_config,
    resolve_tuning_type,
};
