// ABOUTME: CLI config command - print the effective configuration or write it to a file

use anyhow::{Context, Result};

use hostpool::config::AppConfig;

use super::{ConfigArgs, OutputFormat};

/// Execute the config command
pub fn execute(args: &ConfigArgs, format: OutputFormat, config: &AppConfig) -> Result<()> {
    if let Some(path) = &args.write {
        config.save_to(path)?;
        println!("Wrote configuration to {}", path.display());
        return Ok(());
    }

    match format {
        OutputFormat::Json => {
            let json = serde_json::to_string_pretty(config).context("Failed to serialize configuration")?;
            println!("{json}");
        }
        OutputFormat::Text => print!("{}", config.to_toml()?),
    }

    Ok(())
}
