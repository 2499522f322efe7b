//! Trainer argument assembly.

use crate::device::Precision;
use crate::error::{TuningError, TuningResult, TuningWarning};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::path::Path;

/// Pass-through trainer arguments `train` accepts by default.
pub const ALLOWED_TRAINING_ARGS: &[&str] = &[
    "save_total_limit",
    "save_strategy",
    "weight_decay",
    "warmup_steps",
    "lr_scheduler_type",
    "logging_steps",
];

pub const FSDP_STRATEGY: &str = "full_shard offload auto_wrap";

/// Key-value trainer arguments. Later inserts override earlier ones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TrainingArguments(pub Map<String, Value>);

impl TrainingArguments {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<Value>) {
        self.0.insert(key.to_string(), value.into());
    }

    /// Apply every entry of `other` on top of `self`.
    pub fn extend(&mut self, other: Self) {
        self.0.extend(other.0);
    }

    #[must_use]
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.0.get(key).and_then(Value::as_u64)
    }

    #[must_use]
    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.0.get(key).and_then(Value::as_f64)
    }

    #[must_use]
    pub fn get_bool(&self, key: &str) -> Option<bool> {
        self.0.get(key).and_then(Value::as_bool)
    }

    #[must_use]
    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<Map<String, Value>> for TrainingArguments {
    fn from(value: Map<String, Value>) -> Self {
        Self(value)
    }
}

/// Keep only allow-listed keys; everything else is named in one warning.
pub fn filter_training_arguments(
    args: TrainingArguments,
    allowed: &[String],
) -> (TrainingArguments, Option<TuningWarning>) {
    let (kept, rejected): (Map<String, Value>, Map<String, Value>) =
        args.0.into_iter().partition(|(k, _)| allowed.iter().any(|a| a == k));

    let warning = (!rejected.is_empty()).then(|| {
        let mut keys: Vec<String> = rejected.into_iter().map(|(k, _)| k).collect();
        keys.sort();
        let warning = TuningWarning::ExtraArguments { keys };
        warning.emit();
        warning
    });
    (TrainingArguments(kept), warning)
}

/// `ceil(dataset_len / batch_size) * num_epochs`.
pub fn infer_max_steps(num_epochs: u32, batch_size: usize, dataset_len: usize) -> TuningResult<u64> {
    if batch_size == 0 {
        return Err(TuningError::Configuration("batch_size must be >= 1".to_string()));
    }
    Ok(dataset_len.div_ceil(batch_size) as u64 * u64::from(num_epochs))
}

/// Schedule and environment for one training run.
#[derive(Debug, Clone)]
pub struct TrainerSchedule<'a> {
    pub precision: Precision,
    pub output_dir: &'a Path,
    pub batch_size: usize,
    pub num_epochs: u32,
    pub random_seed: u64,
    pub learning_rate: f64,
    pub accumulate_steps: usize,
    pub max_steps: u64,
    pub silence_progress_bars: bool,
    /// True when no accelerator is used.
    pub no_cuda: bool,
}

/// Base trainer arguments for `schedule`, before pass-through and sharding overrides.
#[must_use]
pub fn collect_trainer_arguments(schedule: &TrainerSchedule<'_>) -> TrainingArguments {
    let mut args = TrainingArguments::new();
    args.insert("output_dir", schedule.output_dir.to_string_lossy().into_owned());
    args.insert("do_train", true);
    args.insert("per_device_train_batch_size", schedule.batch_size);
    args.insert("per_device_eval_batch_size", schedule.batch_size);
    args.insert("num_train_epochs", schedule.num_epochs);
    args.insert("seed", schedule.random_seed);
    args.insert("learning_rate", schedule.learning_rate);
    args.insert("weight_decay", 0.01);
    args.insert("save_total_limit", 3);
    args.insert("gradient_accumulation_steps", schedule.accumulate_steps);
    args.insert("gradient_checkpointing", true);
    args.insert("logging_strategy", "steps");
    args.insert("logging_steps", 1);
    args.insert("max_steps", schedule.max_steps);
    args.insert("disable_tqdm", schedule.silence_progress_bars);
    args.insert("no_cuda", schedule.no_cuda);
    args.insert("fp16", schedule.precision == Precision::Float16);
    args.insert("bf16", schedule.precision == Precision::BFloat16);
    args
}

/// Fully-sharded data parallel settings, only when more than one accelerator is visible.
#[must_use]
pub fn sharding_overrides(device_count: usize, no_split_modules: &[String]) -> TrainingArguments {
    let mut args = TrainingArguments::new();
    if device_count > 1 {
        args.insert("fsdp", FSDP_STRATEGY);
        args.insert(
            "fsdp_config",
            serde_json::json!({ "fsdp_transformer_layer_cls_to_wrap": no_split_modules }),
        );
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allowed() -> Vec<String> {
        ALLOWED_TRAINING_ARGS.iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_filter_training_arguments_names_rejected_keys() {
        let mut args = TrainingArguments::new();
        args.insert("weight_decay", 0.1);
        args.insert("foo", 1);
        args.insert("bar", "x");

        let (kept, warning) = filter_training_arguments(args, &allowed());
        assert_eq!(kept.get_f64("weight_decay"), Some(0.1));
        assert!(!kept.contains_key("foo"));
        assert_eq!(
            warning,
            Some(TuningWarning::ExtraArguments { keys: vec!["bar".to_string(), "foo".to_string()] })
        );
    }

    #[test]
    fn test_filter_training_arguments_without_extras() {
        let (kept, warning) = filter_training_arguments(TrainingArguments::new(), &allowed());
        assert!(kept.is_empty());
        assert!(warning.is_none());
    }

    #[test]
    fn test_infer_max_steps_rounds_up() {
        assert_eq!(infer_max_steps(3, 4, 10).unwrap(), 9);
        assert_eq!(infer_max_steps(2, 5, 10).unwrap(), 4);
        assert_eq!(infer_max_steps(0, 5, 10).unwrap(), 0);
        assert!(infer_max_steps(1, 0, 10).is_err());
    }

    #[test]
    fn test_collect_trainer_arguments_precision_flags() {
        let dir = Path::new("/tmp/checkpoints");
        let schedule = TrainerSchedule {
            precision: Precision::BFloat16,
            output_dir: dir,
            batch_size: 8,
            num_epochs: 2,
            random_seed: 73,
            learning_rate: 0.3,
            accumulate_steps: 32,
            max_steps: 4,
            silence_progress_bars: true,
            no_cuda: false,
        };
        let args = collect_trainer_arguments(&schedule);
        assert_eq!(args.get_bool("bf16"), Some(true));
        assert_eq!(args.get_bool("fp16"), Some(false));
        assert_eq!(args.get_u64("max_steps"), Some(4));
        assert_eq!(args.get_u64("gradient_accumulation_steps"), Some(32));
        assert_eq!(args.get("output_dir"), Some(&Value::from("/tmp/checkpoints")));
    }

    #[test]
    fn test_overrides_apply_in_order() {
        let mut args = TrainingArguments::new();
        args.insert("save_total_limit", 3);
        let mut overrides = TrainingArguments::new();
        overrides.insert("save_total_limit", 1);
        args.extend(overrides);
        assert_eq!(args.get_u64("save_total_limit"), Some(1));
    }

    #[test]
    fn test_sharding_overrides_only_for_multiple_devices() {
        let layers = vec!["T5Block".to_string()];
        assert!(sharding_overrides(1, &layers).is_empty());

        let args = sharding_overrides(2, &layers);
        assert_eq!(args.get("fsdp"), Some(&Value::from(FSDP_STRATEGY)));
        assert_eq!(
            args.get("fsdp_config"),
            Some(&serde_json::json!({"fsdp_transformer_layer_cls_to_wrap": ["T5Block"]}))
        );
    }
}
