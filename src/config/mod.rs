// ABOUTME: Configuration management for hostpool
// Handles pool defaults, per-host overrides and logging, layered from TOML files and env

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::pool::ConnectionPoolSettings;

/// Prefix of environment variables that override file configuration
pub const ENV_PREFIX: &str = "HOSTPOOL_";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Application version
    #[serde(default = "default_version")]
    pub version: String,

    /// Settings for every host without an override
    #[serde(default)]
    pub pool: ConnectionPoolSettings,

    /// Per-host settings, keyed by host name
    ///
    /// Each host section starts from `[pool]` and overrides only what it names.
    #[serde(default)]
    pub hosts: HashMap<String, ConnectionPoolSettings>,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Directory for JSONL log files (default: ~/.hostpool/logs)
    #[serde(default)]
    pub directory: Option<PathBuf>,

    /// `EnvFilter` directive used when RUST_LOG is unset
    #[serde(default = "default_log_filter")]
    pub filter: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            filter: default_log_filter(),
        }
    }
}

fn default_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_log_filter() -> String {
    "hostpool=info".to_string()
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            version: default_version(),
            pool: ConnectionPoolSettings::default(),
            hosts: HashMap::new(),
            logging: LoggingConfig::default(),
        }
    }
}

impl AppConfig {
    /// Load configuration from default locations, then apply environment overrides
    pub fn load() -> Result<Self> {
        Self::load_layers(&Self::get_config_paths())
    }

    /// Load configuration from one explicit file, then apply environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            anyhow::bail!("Config file {} does not exist", path.display());
        }
        Self::load_layers(&[path.to_path_buf()])
    }

    fn load_layers(paths: &[PathBuf]) -> Result<Self> {
        let mut merged = toml::Table::new();

        // Later files win
        for path in paths {
            if path.exists() {
                let content = fs::read_to_string(path)
                    .with_context(|| format!("Failed to read config from {}", path.display()))?;

                let layer: toml::Table = toml::from_str(&content)
                    .with_context(|| format!("Failed to parse config from {}", path.display()))?;

                merge(&mut merged, layer);
            }
        }

        let mut config = Self::from_table(merged)?;
        config.apply_env(&load_from_env())?;
        config.validate()?;
        Ok(config)
    }

    /// Build a config from raw TOML, letting host sections inherit from `[pool]`
    pub fn from_table(mut table: toml::Table) -> Result<Self> {
        let pool = match table.get("pool") {
            Some(toml::Value::Table(pool)) => pool.clone(),
            _ => toml::Table::new(),
        };

        if let Some(toml::Value::Table(hosts)) = table.get_mut("hosts") {
            for (host, overrides) in hosts.iter_mut() {
                let toml::Value::Table(overrides) = overrides else {
                    anyhow::bail!("hosts.{host} must be a table");
                };
                let mut inherited = pool.clone();
                merge(&mut inherited, std::mem::take(overrides));
                *overrides = inherited;
            }
        }

        let mut config: Self = toml::Value::Table(table)
            .try_into()
            .context("Failed to interpret configuration")?;
        config.hosts = config
            .hosts
            .into_iter()
            .map(|(host, settings)| (host.to_ascii_lowercase(), settings))
            .collect();
        Ok(config)
    }

    /// Apply `HOSTPOOL_*` overrides to the default pool settings and logging
    pub fn apply_env(&mut self, vars: &HashMap<String, String>) -> Result<()> {
        for (name, value) in vars {
            let Some(key) = name.strip_prefix(ENV_PREFIX) else {
                continue;
            };
            let parse_error = || format!("Invalid value `{value}` for {name}");

            match key {
                "MAX_CONNECTIONS" => self.pool.max_connections = value.parse().with_context(parse_error)?,
                "MAX_RETRIES" => self.pool.max_retries = value.parse().with_context(parse_error)?,
                "MAX_OPEN_REQUESTS" => {
                    self.pool.max_open_requests = value.parse().with_context(parse_error)?;
                }
                "PIPELINING_LIMIT" => {
                    self.pool.pipelining_limit = value.parse().with_context(parse_error)?;
                }
                "IDLE_TIMEOUT_MS" => {
                    self.pool.idle_timeout = Duration::from_millis(value.parse().with_context(parse_error)?);
                }
                "CONNECT_TIMEOUT_MS" => {
                    self.pool.connect_timeout =
                        Duration::from_millis(value.parse().with_context(parse_error)?);
                }
                "LOG_FILTER" => self.logging.filter.clone_from(value),
                "LOG_DIR" => self.logging.directory = Some(PathBuf::from(value)),
                _ => tracing::debug!(variable = %name, "Ignoring unknown environment override"),
            }
        }
        Ok(())
    }

    /// Reject settings a pool could not run with
    pub fn validate(&self) -> Result<()> {
        self.pool.validate().context("Invalid [pool] settings")?;
        for (host, settings) in &self.hosts {
            settings
                .validate()
                .with_context(|| format!("Invalid settings for host {host}"))?;
        }
        Ok(())
    }

    /// Settings that apply to `host`
    pub fn settings_for(&self, host: &str) -> &ConnectionPoolSettings {
        self.hosts
            .get(&host.to_ascii_lowercase())
            .unwrap_or(&self.pool)
    }

    /// Write configuration as TOML
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let content = self.to_toml()?;
        fs::write(path, content)
            .with_context(|| format!("Failed to write config to {}", path.display()))?;

        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("Failed to serialize configuration")
    }

    /// Get configuration file paths, lowest precedence first
    fn get_config_paths() -> Vec<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/hostpool/config.toml")];

        if let Ok(config_dir) = Self::get_user_config_dir() {
            paths.push(config_dir.join("config.toml"));
        }

        if let Ok(cwd) = std::env::current_dir() {
            paths.push(cwd.join(".hostpool").join("config.toml"));
        }

        paths
    }

    /// Get user configuration directory (~/.hostpool)
    pub fn get_user_config_dir() -> Result<PathBuf> {
        let home_dir = dirs::home_dir().context("Failed to get home directory")?;
        Ok(home_dir.join(".hostpool"))
    }

    /// Directory log files are written to
    pub fn log_directory(&self) -> Result<PathBuf> {
        match &self.logging.directory {
            Some(directory) => Ok(directory.clone()),
            None => Ok(Self::get_user_config_dir()?.join("logs")),
        }
    }
}

/// Deep-merge `overlay` into `base`; tables merge key by key, anything else is replaced
fn merge(base: &mut toml::Table, overlay: toml::Table) {
    for (key, value) in overlay {
        if let toml::Value::Table(incoming) = value {
            if let Some(toml::Value::Table(existing)) = base.get_mut(&key) {
                merge(existing, incoming);
                continue;
            }
            base.insert(key, toml::Value::Table(incoming));
        } else {
            base.insert(key, value);
        }
    }
}

/// Load configuration from environment
pub fn load_from_env() -> HashMap<String, String> {
    std::env::vars()
        .filter(|(k, _)| k.starts_with(ENV_PREFIX))
        .collect()
}
