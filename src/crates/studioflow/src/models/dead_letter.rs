//! Dead letter model

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// A permanently failed unit of work kept for replay or manual resolution
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DeadLetterEntry {
    pub id: String,

    /// Origin of the failed work (e.g. `video_generation`, `render`)
    pub source: String,

    pub run_id: String,

    /// Job that exhausted its attempts, when there was one
    pub job_id: Option<String>,

    /// Original job payload as a JSON string
    pub payload: String,

    /// Last error seen
    pub error: String,

    pub attempts: i64,

    /// How the entry was closed: `replayed` or `manual`
    pub resolution: Option<String>,

    /// Unix epoch milliseconds
    pub created_at: i64,

    /// Unix epoch milliseconds, unset while the entry is open
    pub resolved_at: Option<i64>,
}

impl DeadLetterEntry {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Parsed payload
    pub fn payload_json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.payload)?)
    }
}
