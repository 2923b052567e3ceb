//! Configuration schema for studioflow

use crate::error::{Result, StudioflowError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main studioflow configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct StudioflowConfig {
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Worker configuration
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Retry/backoff configuration
    #[serde(default)]
    pub retry: RetryConfig,

    /// Video generation circuit breaker
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerConfig,

    /// Interrupt visibility polling
    #[serde(default)]
    pub resume: ResumeConfig,

    /// Pipeline job settings
    #[serde(default)]
    pub pipeline: PipelineConfig,

    /// External collaborators
    #[serde(default)]
    pub backends: BackendsConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// SQLite connection URL (`sqlite:studioflow.db`, `sqlite::memory:`)
    pub url: String,

    /// Maximum pooled connections
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite:studioflow.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Worker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Jobs executed concurrently by one worker process
    pub concurrency: usize,

    /// Lease length granted per claim, in seconds
    pub lease_seconds: u64,

    /// Idle sleep between empty polls, in milliseconds
    pub poll_interval_ms: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            lease_seconds: 60,
            poll_interval_ms: 500,
        }
    }
}

impl WorkerConfig {
    pub fn lease(&self) -> Duration {
        Duration::from_secs(self.lease_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Retry/backoff configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay before the first retry, in milliseconds
    pub base_delay_ms: u64,

    /// Growth factor per attempt
    pub exponential_base: f64,

    /// Upper bound on the un-jittered delay, in milliseconds
    pub max_delay_ms: u64,

    /// Attempts granted to newly enqueued jobs
    pub max_attempts: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            exponential_base: 2.0,
            max_delay_ms: 300_000,
            max_attempts: 5,
        }
    }
}

/// Circuit breaker configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: u32,

    /// Time spent open before probing, in milliseconds
    pub recovery_timeout_ms: u64,

    /// Concurrent probes admitted while half-open
    pub half_open_max_calls: u32,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout_ms: 30_000,
            half_open_max_calls: 1,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// Interrupt visibility polling
///
/// A webhook can arrive before the engine has committed the interrupt it resumes.
/// The dispatcher polls for it, giving simulated backends (which answer almost
/// instantly) a longer window.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResumeConfig {
    pub poll_interval_ms: u64,
    pub visibility_timeout_ms: u64,
    pub simulated_visibility_timeout_ms: u64,
}

impl Default for ResumeConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 100,
            visibility_timeout_ms: 2_000,
            simulated_visibility_timeout_ms: 10_000,
        }
    }
}

impl ResumeConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Poll window for the given backend mode
    pub fn visibility_timeout(&self, simulated: bool) -> Duration {
        if simulated {
            Duration::from_millis(self.simulated_visibility_timeout_ms)
        } else {
            Duration::from_millis(self.visibility_timeout_ms)
        }
    }
}

/// Pipeline job settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Workflow name recorded on new runs
    pub workflow_name: String,

    /// Poll the render service every N seconds while awaiting a render
    /// (0 disables polling and relies on the render webhook alone)
    pub render_poll_seconds: u64,

    /// Polls before a render still pending is given up on
    pub render_poll_max_attempts: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workflow_name: "video_pipeline".to_string(),
            render_poll_seconds: 0,
            render_poll_max_attempts: 120,
        }
    }
}

impl PipelineConfig {
    /// Render poll interval, `None` when polling is disabled
    pub fn render_poll_interval(&self) -> Option<Duration> {
        (self.render_poll_seconds > 0).then(|| Duration::from_secs(self.render_poll_seconds))
    }
}

/// External collaborators
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct BackendsConfig {
    /// Use the in-process simulated studio instead of live services
    pub simulated: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl StudioflowConfig {
    /// Merge another configuration into this one
    pub fn merge(&mut self, other: StudioflowConfig) {
        // serde fills in defaults for missing fields
        self.database = other.database;
        self.worker = other.worker;
        self.retry = other.retry;
        self.circuit_breaker = other.circuit_breaker;
        self.resume = other.resume;
        self.pipeline = other.pipeline;
        self.backends = other.backends;
        self.logging = other.logging;
    }

    /// Reject values the runtime cannot operate with
    pub fn validate(&self) -> Result<()> {
        let mut issues = Vec::new();

        if self.database.max_connections == 0 {
            issues.push("database.max_connections must be at least 1");
        }
        if self.worker.concurrency == 0 {
            issues.push("worker.concurrency must be at least 1");
        }
        if self.worker.lease_seconds == 0 {
            issues.push("worker.lease_seconds must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            issues.push("retry.max_attempts must be at least 1");
        }
        if self.retry.exponential_base < 1.0 {
            issues.push("retry.exponential_base must be >= 1.0");
        }
        if self.circuit_breaker.failure_threshold == 0 {
            issues.push("circuit_breaker.failure_threshold must be at least 1");
        }
        if self.circuit_breaker.half_open_max_calls == 0 {
            issues.push("circuit_breaker.half_open_max_calls must be at least 1");
        }
        if self.resume.poll_interval_ms == 0 {
            issues.push("resume.poll_interval_ms must be at least 1");
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(StudioflowError::Config(issues.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = StudioflowConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.worker.lease(), Duration::from_secs(60));
        assert!(!config.backends.simulated);
    }

    #[test]
    fn test_partial_toml_fills_defaults() {
        let config: StudioflowConfig = toml::from_str(
            r#"
            [worker]
            concurrency = 8

            [retry]
            base_delay_ms = 250
            "#,
        )
        .unwrap();

        assert_eq!(config.worker.concurrency, 8);
        assert_eq!(config.worker.lease_seconds, 60);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.database.url, "sqlite:studioflow.db");
    }

    #[test]
    fn test_validate_collects_issues() {
        let mut config = StudioflowConfig::default();
        config.worker.concurrency = 0;
        config.retry.exponential_base = 0.5;

        let err = config.validate().unwrap_err().to_string();
        assert!(err.contains("worker.concurrency"));
        assert!(err.contains("retry.exponential_base"));
    }

    #[test]
    fn test_visibility_timeout_longer_when_simulated() {
        let resume = ResumeConfig::default();
        assert!(resume.visibility_timeout(true) > resume.visibility_timeout(false));
    }
}
