//! softprompt CLI - inspect, verify and list soft prompt artifacts
//!
//! Artifacts are written by `softprompt_tuning::save`; this binary reads them back
//! without loading a base model.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Soft prompt artifact tooling
#[derive(Parser, Debug)]
#[command(
    name = "softprompt",
    author,
    version,
    about = "Inspect and verify soft prompt tuning artifacts"
)]
struct Args {
    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "warn", global = true)]
    log_level: String,

    /// Settings file (TOML). SOFTPROMPT__* environment variables take precedence.
    #[arg(short, long, global = true)]
    settings: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List prompt artifacts under a directory
    List {
        /// Directory holding one artifact per subdirectory
        root: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show the manifest of a prompt artifact
    Inspect {
        /// Artifact directory
        dir: PathBuf,

        /// Output the raw manifest as JSON
        #[arg(long)]
        json: bool,
    },

    /// Re-hash artifact files and check prompt tensor shapes
    Verify {
        /// Artifact directory
        dir: PathBuf,
    },

    /// Print the effective settings
    Config {
        /// Output as JSON instead of TOML
        #[arg(long)]
        json: bool,
    },

    /// Validate a JSONL train stream
    ///
    /// Accepts generation records (`input`, `output`) and classification
    /// records (`text`, `labels`).
    Records {
        /// JSONL file
        path: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "error" => Level::ERROR,
        _ => Level::WARN,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .without_time()
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match args.command {
        Command::List { root, json } => commands::artifacts::list(&root, json),
        Command::Inspect { dir, json } => commands::artifacts::inspect(&dir, json),
        Command::Verify { dir } => commands::artifacts::verify(&dir),
        Command::Config { json } => commands::settings::show(args.settings.as_deref(), json),
        Command::Records { path } => commands::records::validate(&path),
    }
}
