//! Prompt encoders and the prompt-tuned model wrapper.
//!
//! The base model stays frozen. The only trainable state is the prompt table held
//! by a [`PromptEncoder`]:
//!
//! - plain prompt tuning keeps one `[total_virtual_tokens, token_dim]` embedding;
//! - multi-task prompt tuning keeps a shared embedding plus a low-rank per-task
//!   factorisation (`prefix_task_cols @ prefix_task_rows`) that is multiplied
//!   element-wise into it.
//!
//! Adapters are persisted as `adapter_config.json` (the backend tuning config)
//! next to `adapter_model.safetensors`.

use crate::error::{TuningError, TuningResult};
use crate::resource::{BaseModel, PromptTokenizer};
use crate::tuning::{
    BackendTuningConfig, MultitaskPromptTuningConfig, MultitaskPromptTuningInit, PromptTuningConfig,
    PromptTuningInit,
};
use candle_core::{DType, Device, Tensor, Var};
use serde_json::Value;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

pub const ADAPTER_CONFIG_FILE: &str = "adapter_config.json";
pub const ADAPTER_WEIGHTS_FILE: &str = "adapter_model.safetensors";

pub const PROMPT_EMBEDDINGS_KEY: &str = "prompt_embeddings";
pub const PREFIX_TASK_COLS_KEY: &str = "prefix_task_cols";
pub const PREFIX_TASK_ROWS_KEY: &str = "prefix_task_rows";

const TASK_FACTOR_STD: f32 = 0.02;

/// Base config keys consulted, in order, for the prompt width.
const TOKEN_DIM_KEYS: &[&str] = &["hidden_size", "n_embd", "d_model"];
const NUM_LAYERS_KEYS: &[&str] = &["num_hidden_layers", "num_layers", "n_layer"];
const NUM_HEADS_KEYS: &[&str] = &["num_attention_heads", "n_head"];

#[derive(Debug, Clone)]
pub enum PromptEncoder {
    PromptEmbedding {
        embedding: Var,
    },
    MultitaskPromptEmbedding {
        embedding: Var,
        prefix_task_cols: Var,
        prefix_task_rows: Var,
    },
}

impl PromptEncoder {
    /// Shared prompt table, `[total_virtual_tokens, token_dim]`.
    #[must_use]
    pub fn embedding(&self) -> &Var {
        match self {
            Self::PromptEmbedding { embedding } | Self::MultitaskPromptEmbedding { embedding, .. } => {
                embedding
            }
        }
    }

    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        match self {
            Self::PromptEmbedding { embedding } => vec![embedding.clone()],
            Self::MultitaskPromptEmbedding { embedding, prefix_task_cols, prefix_task_rows } => {
                vec![embedding.clone(), prefix_task_cols.clone(), prefix_task_rows.clone()]
            }
        }
    }

    /// Encode prompt token indices `[batch, n]` into `[batch, n, token_dim]`.
    ///
    /// `task_ids` (`[batch]`) selects the task factor for multi-task encoders and is
    /// ignored otherwise.
    pub fn forward(&self, indices: &Tensor, task_ids: Option<&Tensor>) -> TuningResult<Tensor> {
        let (batch, n) = indices.dims2()?;
        let table = self.embedding().as_tensor();
        let token_dim = table.dim(1)?;
        let prompts = table.index_select(&indices.flatten_all()?, 0)?.reshape((batch, n, token_dim))?;

        match self {
            Self::PromptEmbedding { .. } => Ok(prompts),
            Self::MultitaskPromptEmbedding { prefix_task_cols, prefix_task_rows, .. } => {
                let task_ids = task_ids.ok_or_else(|| {
                    TuningError::Configuration("task_ids are required for multi-task prompts".to_string())
                })?;
                let cols = prefix_task_cols.as_tensor().index_select(task_ids, 0)?;
                let rows = prefix_task_rows.as_tensor().index_select(task_ids, 0)?;
                let task_prompts = cols.narrow(1, 0, n)?.contiguous()?.matmul(&rows)?;
                Ok(prompts.mul(&task_prompts)?)
            }
        }
    }

    fn state(&self) -> HashMap<String, Tensor> {
        let mut state = HashMap::new();
        state.insert(PROMPT_EMBEDDINGS_KEY.to_string(), self.embedding().as_tensor().detach());
        if let Self::MultitaskPromptEmbedding { prefix_task_cols, prefix_task_rows, .. } = self {
            state.insert(PREFIX_TASK_COLS_KEY.to_string(), prefix_task_cols.as_tensor().detach());
            state.insert(PREFIX_TASK_ROWS_KEY.to_string(), prefix_task_rows.as_tensor().detach());
        }
        state
    }

    fn from_state(config: &BackendTuningConfig, state: &HashMap<String, Tensor>) -> TuningResult<Self> {
        let var = |key: &str| -> TuningResult<Var> {
            let tensor = state
                .get(key)
                .ok_or_else(|| TuningError::MissingArtifact(format!("adapter weights lack {key}")))?;
            Ok(Var::from_tensor(tensor)?)
        };

        let encoder = match config {
            BackendTuningConfig::PromptTuning(_) => Self::PromptEmbedding { embedding: var(PROMPT_EMBEDDINGS_KEY)? },
            BackendTuningConfig::MultitaskPromptTuning(_) => Self::MultitaskPromptEmbedding {
                embedding: var(PROMPT_EMBEDDINGS_KEY)?,
                prefix_task_cols: var(PREFIX_TASK_COLS_KEY)?,
                prefix_task_rows: var(PREFIX_TASK_ROWS_KEY)?,
            },
        };

        let rows = encoder.embedding().dim(0)?;
        if rows != config.total_virtual_tokens() {
            return Err(TuningError::ShapeMismatch(format!(
                "adapter prompt table has {rows} rows, config expects {}",
                config.total_virtual_tokens()
            )));
        }
        Ok(encoder)
    }

    fn to(&self, device: &Device, dtype: DType) -> TuningResult<Self> {
        let move_var = |var: &Var| -> TuningResult<Var> {
            Ok(Var::from_tensor(&var.as_tensor().to_device(device)?.to_dtype(dtype)?)?)
        };
        Ok(match self {
            Self::PromptEmbedding { embedding } => Self::PromptEmbedding { embedding: move_var(embedding)? },
            Self::MultitaskPromptEmbedding { embedding, prefix_task_cols, prefix_task_rows } => {
                Self::MultitaskPromptEmbedding {
                    embedding: move_var(embedding)?,
                    prefix_task_cols: move_var(prefix_task_cols)?,
                    prefix_task_rows: move_var(prefix_task_rows)?,
                }
            }
        })
    }
}

/// A frozen base model wrapped with a trainable prompt encoder.
pub struct PromptTunedModel {
    base: Arc<dyn BaseModel>,
    config: BackendTuningConfig,
    encoder: PromptEncoder,
    device: Device,
    dtype: DType,
}

impl std::fmt::Debug for PromptTunedModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PromptTunedModel")
            .field("config", &self.config)
            .field("encoder", &self.encoder)
            .field("device", &self.device)
            .field("dtype", &self.dtype)
            .finish_non_exhaustive()
    }
}

impl PromptTunedModel {
    /// Assemble a model from an already initialised encoder. Shapes are not checked.
    #[must_use]
    pub fn from_parts(base: Arc<dyn BaseModel>, config: BackendTuningConfig, encoder: PromptEncoder) -> Self {
        let table = encoder.embedding().as_tensor();
        let (device, dtype) = (table.device().clone(), table.dtype());
        Self { base, config, encoder, device, dtype }
    }

    #[must_use]
    pub fn base_model(&self) -> &Arc<dyn BaseModel> {
        &self.base
    }

    #[must_use]
    pub fn config(&self) -> &BackendTuningConfig {
        &self.config
    }

    #[must_use]
    pub fn encoder(&self) -> &PromptEncoder {
        &self.encoder
    }

    #[must_use]
    pub fn device(&self) -> &Device {
        &self.device
    }

    #[must_use]
    pub fn dtype(&self) -> DType {
        self.dtype
    }

    #[must_use]
    pub fn trainable_vars(&self) -> Vec<Var> {
        self.encoder.trainable_vars()
    }

    /// Prompt token indices `0..total_virtual_tokens` on the model device.
    pub fn prompt_tokens(&self) -> TuningResult<Tensor> {
        let total = self.config.total_virtual_tokens() as u32;
        Ok(Tensor::arange(0u32, total, &self.device)?)
    }

    /// Detached copy of the shared prompt table.
    pub fn get_prompt_embedding_to_save(&self) -> TuningResult<Tensor> {
        Ok(self.encoder.embedding().as_tensor().detach().copy()?)
    }

    /// Move the prompt encoder and the base model to `device` in `dtype`.
    pub fn to(&mut self, device: &Device, dtype: DType) -> TuningResult<()> {
        self.base.to_device(device, dtype)?;
        self.encoder = self.encoder.to(device, dtype)?;
        self.device = device.clone();
        self.dtype = dtype;
        Ok(())
    }

    /// Write the adapter config and weights, then the base model, into `dir`.
    pub fn save_pretrained(&self, dir: &Path) -> TuningResult<()> {
        std::fs::create_dir_all(dir)?;
        let mut config = self.config.clone();
        config.common_mut().inference_mode = true;
        std::fs::write(dir.join(ADAPTER_CONFIG_FILE), serde_json::to_vec_pretty(&config)?)?;
        candle_core::safetensors::save(&self.encoder.state(), dir.join(ADAPTER_WEIGHTS_FILE))?;
        self.base.save_pretrained(dir)?;
        Ok(())
    }

    /// Reattach a saved adapter from `dir` to `base`.
    pub fn from_pretrained(base: Arc<dyn BaseModel>, dir: &Path, device: &Device) -> TuningResult<Self> {
        let config = read_adapter_config(dir)?;
        let weights = dir.join(ADAPTER_WEIGHTS_FILE);
        if !weights.exists() {
            return Err(TuningError::MissingArtifact(format!(
                "adapter weights not found: {}",
                weights.display()
            )));
        }
        let state = candle_core::safetensors::load(&weights, device)?;
        let encoder = PromptEncoder::from_state(&config, &state)?;
        let dtype = encoder.embedding().dtype();
        Ok(Self { base, config, encoder, device: device.clone(), dtype })
    }
}

/// Read `adapter_config.json` from a saved adapter directory.
pub fn read_adapter_config(dir: &Path) -> TuningResult<BackendTuningConfig> {
    let path = dir.join(ADAPTER_CONFIG_FILE);
    if !path.exists() {
        return Err(TuningError::MissingArtifact(format!("adapter config not found: {}", path.display())));
    }
    let bytes = std::fs::read(&path)?;
    Ok(serde_json::from_slice(&bytes)?)
}

fn lookup_usize(config: &serde_json::Map<String, Value>, keys: &[&str]) -> Option<usize> {
    keys.iter().find_map(|k| config.get(*k).and_then(Value::as_u64)).map(|v| v as usize)
}

/// Wrap `base` with a freshly initialised prompt encoder for `config`.
///
/// Missing `token_dim`, `num_layers` and `num_attention_heads` are filled in from the
/// base model config.
pub fn get_peft_model(
    base: Arc<dyn BaseModel>,
    tokenizer: &dyn PromptTokenizer,
    mut config: BackendTuningConfig,
) -> TuningResult<PromptTunedModel> {
    let base_config = base.config();
    let common = config.common_mut();
    if common.token_dim.is_none() {
        common.token_dim = lookup_usize(&base_config, TOKEN_DIM_KEYS);
    }
    if common.num_layers.is_none() {
        common.num_layers = lookup_usize(&base_config, NUM_LAYERS_KEYS);
    }
    if common.num_attention_heads.is_none() {
        common.num_attention_heads = lookup_usize(&base_config, NUM_HEADS_KEYS);
    }
    if common.base_model_name_or_path.is_none() {
        common.base_model_name_or_path =
            base_config.get("_name_or_path").and_then(Value::as_str).map(ToString::to_string);
    }
    let token_dim = common.token_dim.ok_or_else(|| {
        TuningError::Configuration(
            "token_dim not set and base model config has no hidden_size, n_embd or d_model".to_string(),
        )
    })?;

    let device = Device::Cpu;
    let encoder = match &config {
        BackendTuningConfig::PromptTuning(pt) => {
            init_prompt_embedding(pt, &config, token_dim, base.as_ref(), tokenizer, &device)?
        }
        BackendTuningConfig::MultitaskPromptTuning(mpt) => {
            init_multitask_embedding(mpt, &config, token_dim, base.as_ref(), tokenizer, &device)?
        }
    };

    tracing::debug!(
        tuning_type = %config.tuning_type(),
        total_virtual_tokens = config.total_virtual_tokens(),
        token_dim,
        "Initialised prompt encoder"
    );
    Ok(PromptTunedModel { base, config, encoder, device, dtype: DType::F32 })
}

fn init_prompt_embedding(
    pt: &PromptTuningConfig,
    config: &BackendTuningConfig,
    token_dim: usize,
    base: &dyn BaseModel,
    tokenizer: &dyn PromptTokenizer,
    device: &Device,
) -> TuningResult<PromptEncoder> {
    let total = config.total_virtual_tokens();
    let embedding = match pt.prompt_tuning_init {
        PromptTuningInit::Random => Var::randn(0f32, 1f32, (total, token_dim), device)?,
        PromptTuningInit::Text => text_embedding(config, total, base, tokenizer, device)?,
    };
    Ok(PromptEncoder::PromptEmbedding { embedding })
}

fn init_multitask_embedding(
    mpt: &MultitaskPromptTuningConfig,
    config: &BackendTuningConfig,
    token_dim: usize,
    base: &dyn BaseModel,
    tokenizer: &dyn PromptTokenizer,
    device: &Device,
) -> TuningResult<PromptEncoder> {
    let total = config.total_virtual_tokens();
    let (tasks, ranks) = (mpt.num_tasks, mpt.num_ranks);

    let mut embedding = match mpt.prompt_tuning_init {
        MultitaskPromptTuningInit::Text => text_embedding(config, total, base, tokenizer, device)?,
        _ => Var::randn(0f32, 1f32, (total, token_dim), device)?,
    };
    let mut prefix_task_cols = Var::randn(0f32, TASK_FACTOR_STD, (tasks, total, ranks), device)?;
    let mut prefix_task_rows = Var::randn(0f32, TASK_FACTOR_STD, (tasks, ranks, token_dim), device)?;

    if mpt.prompt_tuning_init.uses_source_state() {
        let path = mpt.prompt_tuning_init_state_dict_path.as_deref().ok_or_else(|| {
            TuningError::Configuration("source state dict path is required".to_string())
        })?;
        let source = candle_core::safetensors::load(path, device)?;
        let get = |key: &str| {
            source
                .get(key)
                .ok_or_else(|| TuningError::MissingArtifact(format!("{key} not found in {path}")))
        };

        let shared = get(PROMPT_EMBEDDINGS_KEY)?.to_dtype(DType::F32)?;
        if shared.dims() != [total, token_dim] {
            return Err(TuningError::ShapeMismatch(format!(
                "source prompt embeddings are {:?}, expected [{total}, {token_dim}]",
                shared.dims()
            )));
        }
        embedding = Var::from_tensor(&shared)?;

        let factors = match mpt.prompt_tuning_init {
            MultitaskPromptTuningInit::AverageSourceTasks => Some((
                get(PREFIX_TASK_COLS_KEY)?.mean_keepdim(0)?,
                get(PREFIX_TASK_ROWS_KEY)?.mean_keepdim(0)?,
            )),
            MultitaskPromptTuningInit::ExactSourceTask => {
                let task = mpt.prompt_tuning_init_task;
                Some((
                    get(PREFIX_TASK_COLS_KEY)?.narrow(0, task, 1)?,
                    get(PREFIX_TASK_ROWS_KEY)?.narrow(0, task, 1)?,
                ))
            }
            _ => None,
        };
        if let Some((cols, rows)) = factors {
            prefix_task_cols = Var::from_tensor(&cols.to_dtype(DType::F32)?.repeat((tasks, 1, 1))?)?;
            prefix_task_rows = Var::from_tensor(&rows.to_dtype(DType::F32)?.repeat((tasks, 1, 1))?)?;
        }
        if prefix_task_cols.dims() != [tasks, total, ranks] || prefix_task_rows.dims() != [tasks, ranks, token_dim] {
            return Err(TuningError::ShapeMismatch(format!(
                "source task factors {:?} x {:?} do not match {tasks} tasks of rank {ranks}",
                prefix_task_cols.dims(),
                prefix_task_rows.dims()
            )));
        }
    }

    Ok(PromptEncoder::MultitaskPromptEmbedding { embedding, prefix_task_cols, prefix_task_rows })
}

/// Initialise the prompt table from the base model's embeddings of the init text,
/// repeating or truncating the token ids to `total` rows.
fn text_embedding(
    config: &BackendTuningConfig,
    total: usize,
    base: &dyn BaseModel,
    tokenizer: &dyn PromptTokenizer,
    device: &Device,
) -> TuningResult<Var> {
    let text = config
        .prompt_tuning_init_text()
        .ok_or_else(|| TuningError::Configuration("prompt_tuning_init_text is required".to_string()))?;
    let ids = tokenizer.encode(text)?;
    if ids.is_empty() {
        return Err(TuningError::Configuration(
            "prompt_tuning_init_text produced no tokens".to_string(),
        ));
    }
    let ids: Vec<u32> = ids.iter().copied().cycle().take(total).collect();
    let ids = Tensor::new(ids.as_slice(), device)?;
    let embedded = base.embed_tokens(&ids)?.to_device(device)?.to_dtype(DType::F32)?;
    if embedded.dim(0)? != total {
        return Err(TuningError::ShapeMismatch(format!(
            "text init produced {} rows, expected {total}",
            embedded.dim(0)?
        )));
    }
    Ok(Var::from_tensor(&embedded.detach())?)
}
