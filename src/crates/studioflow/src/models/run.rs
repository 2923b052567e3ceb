//! Run projection model

use crate::error::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::FromRow;

/// Read projection of a workflow run
///
/// Written only together with the run's checkpoint, so it never shows a state the
/// checkpoint does not hold.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Run {
    /// Run identifier (UUID string)
    pub id: String,

    pub workflow_name: String,

    /// running, awaiting_<kind>, completed, failed or rejected
    pub status: String,

    pub current_step: String,

    /// Run outputs as a JSON string
    pub artifacts: String,

    /// Failure or rejection reason
    pub error: Option<String>,

    /// Unix epoch milliseconds
    pub created_at: i64,

    /// Unix epoch milliseconds
    pub updated_at: i64,
}

impl Run {
    /// Parsed artifacts
    pub fn artifacts_json(&self) -> Result<Value> {
        Ok(serde_json::from_str(&self.artifacts)?)
    }
}
