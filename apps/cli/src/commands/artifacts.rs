//! `list`, `inspect` and `verify`.

use anyhow::{Context, Result};
use colored::Colorize;
use serde_json::json;
use softprompt_tuning::artifacts::read_loss_log;
use softprompt_tuning::{discover_prompt_artifacts, read_manifest, verify_artifact};
use std::path::Path;

pub fn list(root: &Path, json_output: bool) -> Result<()> {
    let entries = discover_prompt_artifacts(root)
        .with_context(|| format!("Failed to scan {} for prompt artifacts", root.display()))?;

    if json_output {
        let out: Vec<_> = entries
            .iter()
            .map(|e| {
                json!({
                    "name": e.name,
                    "path": e.path,
                    "base_model": e.manifest.base_model_name,
                    "tuning_type": e.manifest.tuning_type,
                    "task_type": e.manifest.task_type,
                    "num_virtual_tokens": e.manifest.num_virtual_tokens,
                    "created_at": e.manifest.created_at,
                })
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&out)?);
        return Ok(());
    }

    println!();
    println!("{}", format!("Prompt Artifacts ({})", entries.len()).bold().cyan());
    println!();

    if entries.is_empty() {
        println!("  {}", "No prompt artifacts found.".dimmed());
        return Ok(());
    }

    println!("{:<24} {:<26} {:<8} {}", "Name", "Tuning Type", "Tokens", "Base Model");
    println!("{}", "─".repeat(90));
    for e in entries {
        println!(
            "{:<24} {:<26} {:<8} {}",
            e.name.cyan(),
            e.manifest.tuning_type.as_str(),
            e.manifest.num_virtual_tokens,
            e.manifest.base_model_name.dimmed()
        );
    }
    println!();
    Ok(())
}

pub fn inspect(dir: &Path, json_output: bool) -> Result<()> {
    let manifest = read_manifest(dir).with_context(|| format!("Failed to read {}", dir.display()))?;

    if json_output {
        println!("{}", serde_json::to_string_pretty(&manifest)?);
        return Ok(());
    }

    let bundled = if manifest.has_base_model {
        manifest.full_model_path.clone().unwrap_or_default()
    } else {
        "not bundled".to_string()
    };

    println!();
    println!("{}", "Prompt Artifact".bold().cyan());
    println!();
    println!("  {:<16} {}", "Path:", dir.display());
    println!("  {:<16} {} {}", "Module:", manifest.module_name, manifest.version.dimmed());
    println!("  {:<16} {}", "Created:", manifest.created_at.to_rfc3339());
    println!("  {:<16} {} ({})", "Base model:", manifest.base_model_name, bundled);
    println!("  {:<16} {}", "Tuning type:", manifest.tuning_type);
    println!("  {:<16} {}", "Task type:", manifest.task_type);
    println!("  {:<16} {}", "Precision:", manifest.trained_torch_dtype);
    println!("  {:<16} {}", "Virtual tokens:", manifest.num_virtual_tokens);
    println!("  {:<16} {}", "Verbalizer:", manifest.verbalizer);
    for role in &manifest.output_model_types {
        let file = manifest.prompt_file(*role).unwrap_or("missing");
        println!("  {:<16} {}", format!("{}:", role.as_str()), file);
    }

    let logs = dir.join(&manifest.training_logs);
    if logs.exists() {
        let losses = read_loss_log(&logs)?;
        match losses.last() {
            Some(last) => println!("  {:<16} {} steps, final loss {last:.4}", "Training:", losses.len()),
            None => println!("  {:<16} {}", "Training:", "no steps recorded".dimmed()),
        }
    }
    println!();
    Ok(())
}

pub fn verify(dir: &Path) -> Result<()> {
    let manifest = verify_artifact(dir).with_context(|| format!("Verification failed for {}", dir.display()))?;
    println!(
        "{} {} verified ({} files)",
        "✓".green(),
        dir.display(),
        manifest.artifacts.len()
    );
    Ok(())
}
