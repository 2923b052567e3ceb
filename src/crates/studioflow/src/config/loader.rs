//! Configuration loader
//!
//! Loads configuration from:
//! 1. Default values
//! 2. A TOML file, when one is given and exists
//! 3. `STUDIOFLOW_*` environment variables
//!
//! Later sources override earlier ones. The result is validated before it is
//! returned.

use crate::config::schema::StudioflowConfig;
use crate::error::{Result, StudioflowError};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tokio::fs;
use tracing::{debug, info};

/// Environment variables recognised as overrides
pub const ENV_DATABASE_URL: &str = "STUDIOFLOW_DATABASE_URL";
pub const ENV_WORKER_CONCURRENCY: &str = "STUDIOFLOW_WORKER_CONCURRENCY";
pub const ENV_LEASE_SECONDS: &str = "STUDIOFLOW_LEASE_SECONDS";
pub const ENV_MAX_ATTEMPTS: &str = "STUDIOFLOW_MAX_ATTEMPTS";
pub const ENV_SIMULATED: &str = "STUDIOFLOW_SIMULATED_BACKENDS";
pub const ENV_LOG_LEVEL: &str = "STUDIOFLOW_LOG_LEVEL";

/// Configuration loader
#[derive(Debug, Default)]
pub struct ConfigLoader {
    path: Option<PathBuf>,
}

impl ConfigLoader {
    /// Create a loader that only applies defaults and environment overrides
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a TOML file on top of the defaults
    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.path = Some(path.into());
        self
    }

    /// Load, override from the process environment, and validate
    pub async fn load(&self) -> Result<StudioflowConfig> {
        self.load_with_env(|key| std::env::var(key).ok()).await
    }

    /// Same as [`load`](Self::load) with an explicit environment lookup
    pub async fn load_with_env<F>(&self, env: F) -> Result<StudioflowConfig>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = StudioflowConfig::default();

        if let Some(path) = &self.path {
            if path.exists() {
                config.merge(Self::load_from_path(path).await?);
                debug!(path = %path.display(), "Loaded config file");
            } else {
                debug!(path = %path.display(), "Config file not found, using defaults");
            }
        }

        apply_env_overrides(&mut config, env)?;
        config.validate()?;

        info!(
            database = %config.database.url,
            simulated = config.backends.simulated,
            "Configuration resolved"
        );
        Ok(config)
    }

    async fn load_from_path(path: &Path) -> Result<StudioflowConfig> {
        let content = fs::read_to_string(path).await.map_err(|e| {
            StudioflowError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;

        toml::from_str(&content).map_err(|e| {
            StudioflowError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })
    }
}

fn apply_env_overrides<F>(config: &mut StudioflowConfig, env: F) -> Result<()>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = env(ENV_DATABASE_URL) {
        config.database.url = url;
    }
    if let Some(value) = env(ENV_WORKER_CONCURRENCY) {
        config.worker.concurrency = parse_var(ENV_WORKER_CONCURRENCY, &value)?;
    }
    if let Some(value) = env(ENV_LEASE_SECONDS) {
        config.worker.lease_seconds = parse_var(ENV_LEASE_SECONDS, &value)?;
    }
    if let Some(value) = env(ENV_MAX_ATTEMPTS) {
        config.retry.max_attempts = parse_var(ENV_MAX_ATTEMPTS, &value)?;
    }
    if let Some(value) = env(ENV_SIMULATED) {
        config.backends.simulated = parse_bool(ENV_SIMULATED, &value)?;
    }
    if let Some(level) = env(ENV_LOG_LEVEL) {
        config.logging.level = level;
    }
    Ok(())
}

fn parse_var<T: FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| StudioflowError::Config(format!("{key}: invalid value '{value}'")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(StudioflowError::Config(format!(
            "{key}: expected a boolean, got '{value}'"
        ))),
    }
}
