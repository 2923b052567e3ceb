//! # Studioflow - Durable Jobs and Resumable Production Pipelines
//!
//! Studioflow drives multi-step video production runs whose steps finish
//! asynchronously (provider webhooks) or wait on a human decision, and keeps them
//! correct across crashes, restarts and many concurrent worker processes.
//!
//! ## Features
//!
//! - **Durable job queue** - lease-based claiming in SQLite with crash recovery,
//!   heartbeats, exponential backoff and idempotency keys
//! - **Dead letters** - terminal webhook failures are kept once per cause and can be
//!   replayed through the normal resume path
//! - **Resumable workflow** - each step commits one versioned checkpoint; runs
//!   suspend on interrupts and resume exactly where they stopped
//! - **Resume dispatcher** - routes events and HITL gate decisions, tolerating
//!   webhooks that arrive before the interrupt is visible
//! - **Circuit breaker** - guards every video generator call
//! - **Safety verdict cache** - keeps moderation decisions stable on replay
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use studioflow::backends::{Backends, SimulatedStudio};
//! use studioflow::{AppContext, ConfigLoader};
//! use std::sync::Arc;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let config = ConfigLoader::new().with_path("studioflow.toml").load().await?;
//! let studio = Arc::new(SimulatedStudio::new());
//! let app = AppContext::open(config, Backends::simulated(studio)).await?;
//!
//! let run = app.start_pipeline("a timelapse of a city waking up").await?;
//! let worker = app.worker("worker-1");
//! while worker.run_once().await?.is_some() {}
//!
//! println!("{} is {}", run.run_id, app.engine.get_run(&run.run_id).await?.status);
//! # Ok(())
//! # }
//! ```
//!
//! ## Delivery guarantees
//!
//! Jobs run at least once. Every side effect a step performs carries an
//! idempotency key derived from the run and step, and every state change is a
//! compare-and-swap, so a repeated execution converges on the same result.

pub mod app;
pub mod backends;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod dead_letter;
pub mod handlers;
pub mod health;
pub mod logging;
pub mod models;
pub mod queue;
pub mod repositories;
pub mod safety;
pub mod shutdown;
pub mod workflow;

mod error;

pub use app::AppContext;
pub use circuit_breaker::{CircuitBreaker, CircuitState};
pub use config::{ConfigLoader, StudioflowConfig};
pub use db::Database;
pub use dead_letter::{DeadLetterService, DeadLetterSource};
pub use health::{HealthReport, HealthStatus};
pub use queue::{HandlerOutcome, JobDisposition, JobHandler, RetryPolicy, Worker};
pub use shutdown::ShutdownCoordinator;
pub use workflow::{ResumeDispatcher, ResumeOutcome, RunProjection, WorkflowEngine};

pub use error::{ErrorClass, Result, StudioflowError};
