//! Single-process and elastic training execution.

use crate::error::{TuningError, TuningResult};
use crate::resource::{PromptTokenizer, Trainer};
use crate::settings::DistributedSettings;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Rank whose results are kept after a distributed run.
pub const MAIN_RANK: usize = 0;

/// Launch configuration for a multi-process run on one node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElasticLaunchConfig {
    pub min_nodes: usize,
    pub max_nodes: usize,
    pub nproc_per_node: usize,
    pub run_id: String,
    pub rdzv_backend: String,
    pub rdzv_endpoint: String,
    pub max_restarts: u32,
    pub monitor_interval: Duration,
}

impl ElasticLaunchConfig {
    /// One node, one process per accelerator, static rendezvous at the coordinator.
    #[must_use]
    pub fn single_node(settings: &DistributedSettings, nproc_per_node: usize) -> Self {
        Self {
            min_nodes: 1,
            max_nodes: 1,
            nproc_per_node,
            run_id: Uuid::new_v4().to_string(),
            rdzv_backend: "static".to_string(),
            rdzv_endpoint: format!("{}:{}", settings.master_addr, settings.master_port),
            max_restarts: 0,
            monitor_interval: Duration::from_secs(settings.monitor_interval_secs),
        }
    }
}

/// Work executed by every rank.
pub struct TrainingJob<'a> {
    pub trainer: Box<dyn Trainer + 'a>,
    pub tokenizer: Arc<dyn PromptTokenizer>,
    pub checkpoint_dir: PathBuf,
}

/// Run `job` in the current process: train, then save the model and tokenizer into
/// the checkpoint directory. Returns the per-step loss history.
pub async fn launch_training(job: TrainingJob<'_>) -> TuningResult<Vec<f64>> {
    let TrainingJob { mut trainer, tokenizer, checkpoint_dir } = job;

    let output = trainer.train().await?;
    trainer.save_model(&checkpoint_dir)?;
    tokenizer.save_pretrained(&checkpoint_dir)?;

    let losses = output.losses();
    tracing::info!(
        global_step = output.global_step,
        training_loss = output.training_loss,
        logged_steps = losses.len(),
        "Training finished"
    );
    Ok(losses)
}

/// Runs a training job across worker processes and reports each rank's loss history.
#[async_trait]
pub trait ElasticLauncher: Send + Sync {
    async fn launch<'a>(
        &self,
        config: &ElasticLaunchConfig,
        job: TrainingJob<'a>,
    ) -> TuningResult<HashMap<usize, Vec<f64>>>;
}

/// Launcher that runs the job in this process as the only rank.
#[derive(Debug, Clone, Copy, Default)]
pub struct InProcessLauncher;

#[async_trait]
impl ElasticLauncher for InProcessLauncher {
    async fn launch<'a>(
        &self,
        config: &ElasticLaunchConfig,
        job: TrainingJob<'a>,
    ) -> TuningResult<HashMap<usize, Vec<f64>>> {
        tracing::debug!(
            run_id = %config.run_id,
            endpoint = %config.rdzv_endpoint,
            "Running elastic job in-process"
        );
        let losses = launch_training(job).await?;
        Ok(HashMap::from([(MAIN_RANK, losses)]))
    }
}

/// Keep the main rank's losses from a distributed run.
pub fn main_rank_losses(mut by_rank: HashMap<usize, Vec<f64>>) -> TuningResult<Vec<f64>> {
    by_rank
        .remove(&MAIN_RANK)
        .ok_or_else(|| TuningError::Trainer(format!("no result reported by rank {MAIN_RANK}")))
}
