use thiserror::Error;

pub type TuningResult<T> = std::result::Result<T, TuningError>;

#[derive(Debug, Error)]
pub enum TuningError {
    #[error("invalid tuning configuration: {0}")]
    Configuration(String),

    #[error("prompt shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("missing artifact: {0}")]
    MissingArtifact(String),

    #[error("not implemented: {0}")]
    NotImplemented(String),

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("artifact error: {0}")]
    Artifact(String),

    #[error("trainer error: {0}")]
    Trainer(String),

    #[error(transparent)]
    Tensor(#[from] candle_core::Error),

    #[error(transparent)]
    Settings(#[from] config::ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Non-fatal conditions surfaced while tuning, converting or loading.
///
/// Each warning is logged when raised and kept on the value it affected so callers
/// can inspect what fallback was applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TuningWarning {
    /// Requested precision is not supported on the target device.
    UnsupportedPrecision { requested: String, fallback: String },
    /// Pass-through training arguments outside the allow-list were dropped.
    ExtraArguments { keys: Vec<String> },
    /// Tuning config fields the selected backend config does not declare.
    DroppedConfigFields { fields: Vec<String> },
    /// Training was skipped because the epoch count was below one.
    TrainingSkipped { num_epochs: u32 },
}

impl TuningWarning {
    /// Log the warning through `tracing`.
    pub fn emit(&self) {
        match self {
            Self::UnsupportedPrecision { requested, fallback } => {
                tracing::warn!(
                    requested = %requested,
                    fallback = %fallback,
                    "Requested data type {requested} is unsupported; falling back to {fallback}"
                );
            }
            Self::ExtraArguments { keys } => {
                tracing::warn!(
                    keys = ?keys,
                    "{keys:?} parameter(s) not allowed currently and will be ignored"
                );
            }
            Self::DroppedConfigFields { fields } => {
                tracing::info!(
                    fields = ?fields,
                    "config params not supported by provided tuning type"
                );
            }
            Self::TrainingSkipped { num_epochs } => {
                tracing::warn!(
                    num_epochs = num_epochs,
                    "Number of epochs configured is {num_epochs} which is less than minimum 1. No training will be performed"
                );
            }
        }
    }
}
