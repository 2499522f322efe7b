use anyhow::{Context, Result};
use softprompt_tuning::Settings;
use std::path::Path;

pub fn show(path: Option<&Path>, json_output: bool) -> Result<()> {
    let settings = Settings::load(path).context("Failed to load settings")?;
    if json_output {
        println!("{}", serde_json::to_string_pretty(&settings)?);
    } else {
        print!("{}", toml::to_string_pretty(&settings)?);
    }
    Ok(())
}
