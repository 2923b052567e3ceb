//! Configuration management
//!
//! TOML configuration with defaults for every field and `STUDIOFLOW_*`
//! environment overrides.

pub mod loader;
pub mod schema;

pub use loader::ConfigLoader;
pub use schema::{
    BackendsConfig, CircuitBreakerConfig, DatabaseConfig, LoggingConfig, PipelineConfig,
    ResumeConfig, RetryConfig, StudioflowConfig, WorkerConfig,
};
