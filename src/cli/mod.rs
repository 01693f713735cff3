// ABOUTME: CLI argument parsing and command routing for hostpool
//
// Provides command-line interface for:
// - Fetching URLs through the pooled router (fetch)
// - Inspecting or writing the effective configuration (config)

pub mod config;
pub mod fetch;

use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;

/// Pooled HTTP/1.1 client with per-host connection pools
#[derive(Parser)]
#[command(name = "hostpool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Use this config file instead of the default search path
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,
}

/// Output format for commands
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Fetch one or more URLs through the connection pools
    Fetch(FetchArgs),

    /// Show the effective configuration
    Config(ConfigArgs),
}

/// Arguments for the fetch command
#[derive(clap::Args)]
pub struct FetchArgs {
    /// Absolute URLs to fetch
    #[arg(required = true)]
    pub urls: Vec<String>,

    /// Fetch every URL this many times
    #[arg(long, short, default_value = "1")]
    pub repeat: usize,

    /// Request method
    #[arg(long, short = 'X', default_value = "GET")]
    pub method: String,

    /// Extra request header, e.g. -H "Accept: application/json"
    #[arg(long = "header", short = 'H')]
    pub headers: Vec<String>,
}

/// Arguments for the config command
#[derive(clap::Args)]
pub struct ConfigArgs {
    /// Write the effective configuration to this file instead of printing it
    #[arg(long)]
    pub write: Option<PathBuf>,
}
