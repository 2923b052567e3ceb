//! Error types for studioflow
//!
//! One error enum for the whole crate. [`StudioflowError::class`] maps every variant
//! onto the retry taxonomy the worker acts on.

use studioflow_checkpoint::CheckpointError;
use thiserror::Error;

/// Result type alias for studioflow operations
pub type Result<T> = std::result::Result<T, StudioflowError>;

/// Classification of errors for retry decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// May succeed if retried after a delay (backend outage, lease contention,
    /// interrupt not yet visible)
    Transient,

    /// Will fail the same way every time (malformed payload, state mismatch)
    Permanent,
}

/// Main error type for studioflow operations
#[derive(Debug, Error)]
pub enum StudioflowError {
    /// A non-terminal job already holds the idempotency key
    #[error("Duplicate job for idempotency key '{0}'")]
    DuplicateJob(String),

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Dead letter not found: {0}")]
    DeadLetterNotFound(String),

    /// No pending interrupt of the event kind exists on the run
    #[error("No pending '{event_kind}' interrupt on run {run_id}")]
    NoPendingInterrupt { run_id: String, event_kind: String },

    /// The named interrupt is no longer pending (consumed by another resume)
    #[error("Interrupt {interrupt_id} is not pending on run {run_id}")]
    InterruptNotFound { run_id: String, interrupt_id: String },

    /// More than one pending interrupt matches; never resolved by guessing
    #[error("{count} pending '{event_kind}' interrupts on run {run_id}")]
    AmbiguousInterrupt {
        run_id: String,
        event_kind: String,
        count: usize,
    },

    /// The interrupt did not become visible within the poll window
    #[error("Interrupt '{event_kind}' on run {run_id} not visible yet, retry later")]
    ResumeRetryable { run_id: String, event_kind: String },

    /// HITL resume against a run that is not awaiting that gate
    #[error("Run {run_id} is '{actual}', expected '{expected}'")]
    StateMismatch {
        run_id: String,
        expected: String,
        actual: String,
    },

    /// Another writer committed the run's checkpoint first
    #[error("Run {0} was modified concurrently")]
    ConcurrentModification(String),

    #[error("Circuit '{0}' is open")]
    CircuitOpen(String),

    /// Failure reported by an external collaborator
    #[error("{service} error: {message}")]
    Backend { service: String, message: String },

    /// Malformed input or a domain rule violation
    #[error("Validation error: {0}")]
    Validation(String),

    /// A job handler failed outside its own error handling (e.g. panicked)
    #[error("Handler error: {0}")]
    Handler(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("Checkpoint error: {0}")]
    Checkpoint(CheckpointError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<CheckpointError> for StudioflowError {
    fn from(err: CheckpointError) -> Self {
        match err {
            CheckpointError::Conflict { run_id, .. } => Self::ConcurrentModification(run_id),
            other => Self::Checkpoint(other),
        }
    }
}

impl StudioflowError {
    /// Shorthand for a backend failure
    pub fn backend(service: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Backend {
            service: service.into(),
            message: message.into(),
        }
    }

    /// Classify the error for retry decisions
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::ResumeRetryable { .. }
            | Self::ConcurrentModification(_)
            | Self::CircuitOpen(_)
            | Self::Backend { .. }
            | Self::Handler(_)
            | Self::Database(_)
            | Self::Io(_) => ErrorClass::Transient,
            Self::Checkpoint(CheckpointError::Storage(_)) => ErrorClass::Transient,
            Self::DuplicateJob(_)
            | Self::JobNotFound(_)
            | Self::RunNotFound(_)
            | Self::DeadLetterNotFound(_)
            | Self::NoPendingInterrupt { .. }
            | Self::InterruptNotFound { .. }
            | Self::AmbiguousInterrupt { .. }
            | Self::StateMismatch { .. }
            | Self::Validation(_)
            | Self::Config(_)
            | Self::Migration(_)
            | Self::Checkpoint(_)
            | Self::Serialization(_) => ErrorClass::Permanent,
        }
    }

    /// Whether retrying may help
    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::Transient
    }
}

/// Whether a database error is a uniqueness constraint violation
pub(crate) fn is_unique_violation(err: &sqlx::Error) -> bool {
    matches!(err, sqlx::Error::Database(db) if db.is_unique_violation())
}
