//! Run projection reads
//!
//! Rows are written by the checkpoint saver inside its commit transaction; this
//! repository only reads them.

use crate::db::Database;
use crate::error::{Result, StudioflowError};
use crate::models::Run;

/// Repository for run projection queries
#[derive(Clone, Debug)]
pub struct RunRepository {
    db: Database,
}

impl RunRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get a run by ID
    pub async fn get(&self, run_id: &str) -> Result<Run> {
        self.find(run_id)
            .await?
            .ok_or_else(|| StudioflowError::RunNotFound(run_id.to_string()))
    }

    /// Get a run by ID, if it exists
    pub async fn find(&self, run_id: &str) -> Result<Option<Run>> {
        let run = sqlx::query_as::<_, Run>("SELECT * FROM runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(run)
    }

    /// Runs in a status, newest first
    pub async fn list_by_status(&self, status: &str) -> Result<Vec<Run>> {
        let runs = sqlx::query_as::<_, Run>(
            "SELECT * FROM runs WHERE status = ? ORDER BY updated_at DESC",
        )
        .bind(status)
        .fetch_all(self.db.pool())
        .await?;
        Ok(runs)
    }
}
