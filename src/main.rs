// ABOUTME: Main entry point for the hostpool CLI
//
// Binary: hostpool
// Usage: hostpool [--config PATH] [--format text|json] <COMMAND>
// - fetch: fetch URLs through per-host connection pools
// - config: show or write the effective configuration

#![allow(missing_docs)]

use anyhow::{Context, Result};
use clap::Parser;

use hostpool::config::AppConfig;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    let args = cli::Cli::parse();

    let config = match &args.config {
        Some(path) => AppConfig::load_from(path)?,
        None => AppConfig::load()?,
    };

    setup_logging(&config)?;
    setup_panic_handler();
    tracing::debug!(pool = ?config.pool, hosts = config.hosts.len(), "Configuration loaded");

    match args.command {
        cli::Commands::Fetch(fetch_args) => cli::fetch::execute(fetch_args, args.format, &config).await,
        cli::Commands::Config(config_args) => cli::config::execute(&config_args, args.format, &config),
    }
}

fn setup_logging(config: &AppConfig) -> Result<()> {
    use std::fs::OpenOptions;
    use tracing_subscriber::prelude::*;

    // Create log directory if it doesn't exist
    let log_dir = config.log_directory()?;
    std::fs::create_dir_all(&log_dir)
        .with_context(|| format!("Failed to create log directory {}", log_dir.display()))?;

    // Create JSONL log file with timestamp
    let log_file = log_dir.join(format!(
        "hostpool-{}.jsonl",
        chrono::Local::now().format("%Y%m%d-%H%M%S")
    ));

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_file)
        .with_context(|| format!("Failed to create log file {}", log_file.display()))?;

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .json()             // Output in JSON Lines format
                .with_target(true)  // Include target module in JSON
                .with_writer(file)
                .with_ansi(false),
        )
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| config.logging.filter.as_str().into()),
        )
        .init();

    Ok(())
}

fn setup_panic_handler() {
    use tracing::error;

    std::panic::set_hook(Box::new(|panic_info| {
        error!("Application panicked: {}", panic_info);
        eprintln!("Application panicked: {}", panic_info);
        eprintln!("Please check the logs for more details.");
    }));
}
