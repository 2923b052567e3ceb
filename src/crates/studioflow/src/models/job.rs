//! Job model for database persistence

use crate::error::{Result, StudioflowError};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;
use std::fmt;
use std::str::FromStr;

/// Lifecycle of a job row
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Waiting for `next_attempt_at`
    Pending,
    /// Claimed by a worker until `lease_expires_at`
    Leased,
    Succeeded,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Leased => "leased",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StudioflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "leased" => Ok(Self::Leased),
            "succeeded" => Ok(Self::Succeeded),
            "failed" => Ok(Self::Failed),
            other => Err(StudioflowError::Validation(format!(
                "unknown job status '{other}'"
            ))),
        }
    }
}

/// A durable unit of queued work
///
/// # Timestamps
/// All timestamps are UTC Unix epoch milliseconds.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Job {
    /// Unique job identifier (UUID string)
    pub id: String,

    /// Handler registry key (e.g. `pipeline.advance`, `webhook.render`)
    pub job_type: String,

    /// Run the job acts on
    pub run_id: String,

    /// Handler input as a JSON string
    pub payload: String,

    /// pending, leased, succeeded or failed
    pub status: String,

    /// Failed attempts so far
    pub attempts: i64,

    pub max_attempts: i64,

    /// Worker currently holding the lease
    pub lease_owner: Option<String>,

    pub lease_expires_at: Option<i64>,

    /// Caller-supplied deduplication key
    pub idempotency_key: Option<String>,

    /// Earliest time the job may be claimed
    pub next_attempt_at: i64,

    pub last_error: Option<String>,

    pub created_at: i64,

    pub updated_at: i64,

    pub completed_at: Option<i64>,
}

impl Job {
    /// Parsed status
    pub fn status(&self) -> Result<JobStatus> {
        self.status.parse()
    }

    /// Parsed payload
    pub fn payload_json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.payload)?)
    }

    pub fn is_terminal(&self) -> bool {
        self.status().map(|s| s.is_terminal()).unwrap_or(false)
    }

    /// Whether a further failure would exhaust the job
    pub fn is_last_attempt(&self) -> bool {
        self.attempts + 1 >= self.max_attempts
    }
}
