//! Job handler contract
//!
//! Handlers return a [`HandlerOutcome`] rather than signalling control flow through
//! errors: "not ready yet" is [`HandlerOutcome::Reschedule`], a distinct variant
//! from a failure.

use crate::dead_letter::DeadLetterSource;
use crate::error::{Result, StudioflowError};
use crate::models::Job;
use async_trait::async_trait;
use std::time::Duration;

/// Result of one handler execution
#[derive(Debug)]
pub enum HandlerOutcome {
    /// Work done; the job becomes terminal-succeeded
    Success,

    /// Not ready; retry after `delay`
    ///
    /// Consumes an attempt, but is logged at info level and never treated as an
    /// error until attempts run out.
    Reschedule { delay: Duration, reason: String },

    /// Attempt failed; the error's class decides between retry and terminal failure
    Failure(StudioflowError),
}

impl HandlerOutcome {
    pub fn reschedule(delay: Duration, reason: impl Into<String>) -> Self {
        Self::Reschedule {
            delay,
            reason: reason.into(),
        }
    }
}

impl From<Result<()>> for HandlerOutcome {
    fn from(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(e) => Self::Failure(e),
        }
    }
}

/// Executes jobs of one `job_type`
///
/// Jobs are delivered at least once: a handler that stalls past its lease can run
/// concurrently with a second worker that reclaimed the job, so handlers must be
/// idempotent.
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// Registry key this handler serves
    fn job_type(&self) -> &'static str;

    /// Where terminal failures of this job type are dead-lettered
    ///
    /// `None` means terminal failures go to [`on_terminal_failure`](Self::on_terminal_failure)
    /// instead.
    fn dead_letter_source(&self) -> Option<DeadLetterSource> {
        None
    }

    /// Execute one attempt
    async fn handle(&self, job: &Job) -> HandlerOutcome;

    /// Called once when a job without a dead-letter source fails terminally
    async fn on_terminal_failure(&self, _job: &Job, _error: &str) -> Result<()> {
        Ok(())
    }
}
