use anyhow::{Context, Result};
use colored::Colorize;
use softprompt_tuning::dataset::{compute_dataset_id, convert_to_generation_record, validate_records};
use softprompt_tuning::read_jsonl_records;
use std::path::Path;

/// Parse and validate a train stream, then print its size and content id.
pub fn validate(path: &Path) -> Result<()> {
    let records = read_jsonl_records(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let records: Vec<_> = records.into_iter().map(convert_to_generation_record).collect();
    validate_records(&records)?;
    let id = compute_dataset_id(&records)?;

    println!("{} {} records", "✓".green(), records.len());
    println!("  dataset id: {}", id.0.dimmed());
    Ok(())
}
