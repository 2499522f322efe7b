use crate::error::{TuningError, TuningResult};
use crate::resource::{ModelFamily, PromptTokenizer};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::path::Path;

/// Label id ignored by the loss.
pub const IGNORE_INDEX: i64 = -100;

/// Stable identifier for a dataset (content hash).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DatasetId(pub String);

/// Input/output pair used for prompt tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenerationTrainRecord {
    pub input: String,
    pub output: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassificationTrainRecord {
    pub text: String,
    pub labels: Vec<String>,
}

/// Any record accepted by `train`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TrainRecord {
    Generation(GenerationTrainRecord),
    Classification(ClassificationTrainRecord),
}

impl From<GenerationTrainRecord> for TrainRecord {
    fn from(value: GenerationTrainRecord) -> Self {
        Self::Generation(value)
    }
}

impl From<ClassificationTrainRecord> for TrainRecord {
    fn from(value: ClassificationTrainRecord) -> Self {
        Self::Classification(value)
    }
}

/// Normalise a record into a generation record; classification labels are joined
/// with `,` to form the target text.
#[must_use]
pub fn convert_to_generation_record(record: TrainRecord) -> GenerationTrainRecord {
    match record {
        TrainRecord::Generation(record) => record,
        TrainRecord::Classification(record) => {
            GenerationTrainRecord { input: record.text, output: record.labels.join(",") }
        }
    }
}

pub fn compute_dataset_id(records: &[GenerationTrainRecord]) -> TuningResult<DatasetId> {
    let mut hasher = Sha256::new();

    for record in records {
        let bytes = serde_json::to_vec(record)?;
        hasher.update(bytes);
        hasher.update(b"\n");
    }

    Ok(DatasetId(hex::encode(hasher.finalize())))
}

pub fn validate_records(records: &[GenerationTrainRecord]) -> TuningResult<()> {
    if records.is_empty() {
        return Err(TuningError::Dataset("train stream must not be empty".to_string()));
    }
    for (idx, record) in records.iter().enumerate() {
        if record.input.trim().is_empty() {
            return Err(TuningError::Dataset(format!("record[{idx}] input is empty")));
        }
    }
    Ok(())
}

/// Read a JSONL stream of generation or classification records.
pub fn read_jsonl_records(path: &Path) -> TuningResult<Vec<TrainRecord>> {
    let contents = std::fs::read_to_string(path)?;
    let mut records = Vec::new();

    for (idx, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let record: TrainRecord = serde_json::from_str(line).map_err(|e| {
            TuningError::Dataset(format!("failed to parse jsonl line {}: {}", idx + 1, e))
        })?;
        records.push(record);
    }

    Ok(records)
}

pub fn write_jsonl_records(path: &Path, records: &[GenerationTrainRecord]) -> TuningResult<()> {
    let mut out = String::new();
    for record in records {
        out.push_str(&serde_json::to_string(record)?);
        out.push('\n');
    }
    std::fs::write(path, out)?;
    Ok(())
}

/// One tokenized training example.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenizedExample {
    pub input_ids: Vec<u32>,
    pub attention_mask: Vec<u8>,
    pub labels: Vec<i64>,
    pub task_ids: u32,
}

/// Preprocessed dataset handed to the trainer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrainingDataset {
    pub id: DatasetId,
    pub examples: Vec<TokenizedExample>,
}

impl TrainingDataset {
    #[must_use]
    pub fn len(&self) -> usize {
        self.examples.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.examples.is_empty()
    }
}

pub struct PreprocessRequest<'a> {
    pub family: ModelFamily,
    pub records: &'a [GenerationTrainRecord],
    pub tokenizer: &'a dyn PromptTokenizer,
    pub max_source_length: usize,
    pub max_target_length: usize,
    pub shuffle: bool,
    pub random_seed: u64,
    pub task_ids: u32,
}

/// Turns generation records into a tokenized dataset.
pub trait DatasetPreprocessor: Send + Sync {
    fn preprocess(&self, request: PreprocessRequest<'_>) -> TuningResult<TrainingDataset>;
}

/// Tokenizes source and target text with the base model tokenizer.
///
/// Causal models see `source ++ target ++ eos` with the source positions masked out
/// of the labels; encoder-decoder models get the source as input and the target as
/// labels.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokenizingPreprocessor;

impl DatasetPreprocessor for TokenizingPreprocessor {
    fn preprocess(&self, request: PreprocessRequest<'_>) -> TuningResult<TrainingDataset> {
        let id = compute_dataset_id(request.records)?;
        let eos = request.tokenizer.encode(&request.tokenizer.eos_token())?;

        let mut order: Vec<usize> = (0..request.records.len()).collect();
        if request.shuffle {
            order.sort_by_key(|idx| shuffle_key(request.random_seed, *idx));
        }

        let mut examples = Vec::with_capacity(order.len());
        for idx in order {
            let record = &request.records[idx];
            let mut source = request.tokenizer.encode(&record.input)?;
            source.truncate(request.max_source_length);
            let mut target = request.tokenizer.encode(&record.output)?;
            target.truncate(request.max_target_length);

            let (input_ids, labels): (Vec<u32>, Vec<i64>) = match request.family {
                ModelFamily::CausalLm => {
                    let labels = std::iter::repeat_n(IGNORE_INDEX, source.len())
                        .chain(target.iter().chain(&eos).map(|t| i64::from(*t)))
                        .collect();
                    let input_ids = source.into_iter().chain(target).chain(eos.iter().copied()).collect();
                    (input_ids, labels)
                }
                ModelFamily::Seq2SeqLm => {
                    let labels = target.iter().map(|t| i64::from(*t)).collect();
                    (source, labels)
                }
            };
            let attention_mask = vec![1; input_ids.len()];
            examples.push(TokenizedExample { input_ids, attention_mask, labels, task_ids: request.task_ids });
        }

        tracing::debug!(dataset_id = %id.0, examples = examples.len(), "Preprocessed train stream");
        Ok(TrainingDataset { id, examples })
    }
}

fn shuffle_key(seed: u64, idx: usize) -> Vec<u8> {
    let mut hasher = Sha256::new();
    hasher.update(seed.to_le_bytes());
    hasher.update((idx as u64).to_le_bytes());
    hasher.finalize().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    struct CharTokenizer;

    impl PromptTokenizer for CharTokenizer {
        fn eos_token(&self) -> String {
            "$".to_string()
        }

        fn encode(&self, text: &str) -> TuningResult<Vec<u32>> {
            Ok(text.chars().map(u32::from).collect())
        }

        fn save_pretrained(&self, _dir: &Path) -> TuningResult<()> {
            Ok(())
        }
    }

    fn records() -> Vec<GenerationTrainRecord> {
        vec![
            GenerationTrainRecord { input: "abc".to_string(), output: "x".to_string() },
            GenerationTrainRecord { input: "de".to_string(), output: "yz".to_string() },
        ]
    }

    #[test]
    fn test_classification_record_joins_labels() {
        let record = TrainRecord::from(ClassificationTrainRecord {
            text: "great movie".to_string(),
            labels: vec!["positive".to_string(), "fun".to_string()],
        });
        let converted = convert_to_generation_record(record);
        assert_eq!(converted.input, "great movie");
        assert_eq!(converted.output, "positive,fun");
    }

    #[test]
    fn test_validate_records_rejects_empty() {
        assert!(validate_records(&[]).is_err());
        let blank = vec![GenerationTrainRecord { input: " ".to_string(), output: "x".to_string() }];
        assert!(validate_records(&blank).is_err());
        assert!(validate_records(&records()).is_ok());
    }

    #[test]
    fn test_compute_dataset_id_stable_for_same_content() {
        let id1 = compute_dataset_id(&records()).unwrap();
        let id2 = compute_dataset_id(&records()).unwrap();
        assert_eq!(id1, id2);
        assert_eq!(id1.0.len(), 64);
    }

    #[test]
    fn test_read_jsonl_records_mixed_and_line_errors() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("train.jsonl");
        std::fs::write(
            &path,
            "{\"input\":\"a\",\"output\":\"b\"}\n\n{\"text\":\"t\",\"labels\":[\"l1\",\"l2\"]}\n",
        )
        .unwrap();
        let records = read_jsonl_records(&path).unwrap();
        assert_eq!(records.len(), 2);
        assert!(matches!(records[1], TrainRecord::Classification(_)));

        std::fs::write(&path, "{\"input\":\"a\",\"output\":\"b\"}\nnot json\n").unwrap();
        let err = read_jsonl_records(&path).unwrap_err();
        assert!(err.to_string().contains("line 2"));
    }

    #[test]
    fn test_write_then_read_jsonl() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("out.jsonl");
        write_jsonl_records(&path, &records()).unwrap();
        let back: Vec<_> =
            read_jsonl_records(&path).unwrap().into_iter().map(convert_to_generation_record).collect();
        assert_eq!(back, records());
    }

    #[test]
    fn test_tokenizing_preprocessor_causal_masks_source() {
        let records = records();
        let dataset = TokenizingPreprocessor
            .preprocess(PreprocessRequest {
                family: ModelFamily::CausalLm,
                records: &records,
                tokenizer: &CharTokenizer,
                max_source_length: 2,
                max_target_length: 8,
                shuffle: false,
                random_seed: 73,
                task_ids: 0,
            })
            .unwrap();

        assert_eq!(dataset.len(), 2);
        let first = &dataset.examples[0];
        assert_eq!(first.input_ids, vec![97, 98, 120, 36]);
        assert_eq!(first.labels, vec![IGNORE_INDEX, IGNORE_INDEX, 120, 36]);
        assert_eq!(first.attention_mask, vec![1, 1, 1, 1]);
    }

    #[test]
    fn test_tokenizing_preprocessor_seq2seq_shuffle_is_deterministic() {
        let records: Vec<_> = (0..8)
            .map(|i| GenerationTrainRecord { input: format!("in{i}"), output: format!("out{i}") })
            .collect();
        let request = || PreprocessRequest {
            family: ModelFamily::Seq2SeqLm,
            records: &records,
            tokenizer: &CharTokenizer,
            max_source_length: 16,
            max_target_length: 16,
            shuffle: true,
            random_seed: 73,
            task_ids: 0,
        };

        let a = TokenizingPreprocessor.preprocess(request()).unwrap();
        let b = TokenizingPreprocessor.preprocess(request()).unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 8);
        assert!(a.examples.iter().all(|e| e.labels.len() == 4));
    }
}
