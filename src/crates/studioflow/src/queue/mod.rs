//! Durable job queue execution
//!
//! - [`retry`] - backoff policy
//! - [`handler`] - the handler contract and its tagged outcome
//! - [`worker`] - lease-based claim loop with heartbeats

pub mod handler;
pub mod retry;
pub mod worker;

pub use handler::{HandlerOutcome, JobHandler};
pub use retry::RetryPolicy;
pub use worker::{heartbeat_interval, JobDisposition, Worker, WorkerSettings};
