//! Repository layer for database access
//!
//! Repositories wrap the shared [`Database`](crate::db::Database) and expose typed
//! operations over one table each. Timestamps are UTC Unix epoch milliseconds.

pub mod checkpoint_repository;
pub mod dead_letter_repository;
pub mod job_repository;
pub mod run_repository;
pub mod safety_audit_repository;

pub use checkpoint_repository::SqliteCheckpointSaver;
pub use dead_letter_repository::DeadLetterRepository;
pub use job_repository::{FailureOutcome, JobRepository, NewJob};
pub use run_repository::RunRepository;
pub use safety_audit_repository::{SafetyAuditRecord, SafetyAuditRepository};

use chrono::Utc;
use std::time::Duration;

pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

pub(crate) fn duration_millis(duration: Duration) -> i64 {
    i64::try_from(duration.as_millis()).unwrap_or(i64::MAX)
}
