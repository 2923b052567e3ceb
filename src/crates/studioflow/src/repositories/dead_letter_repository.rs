//! Dead letter repository

use super::now_millis;
use crate::db::Database;
use crate::dead_letter::DeadLetterSource;
use crate::error::{Result, StudioflowError};
use crate::models::{DeadLetterEntry, Job};
use uuid::Uuid;

/// Repository for dead letter entries
#[derive(Clone, Debug)]
pub struct DeadLetterRepository {
    db: Database,
}

impl DeadLetterRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Record the terminal failure of `job`
    ///
    /// Returns `None` when an unresolved entry for the same source and run already
    /// exists; that entry is left as it is.
    pub async fn record(
        &self,
        source: DeadLetterSource,
        job: &Job,
        error: &str,
    ) -> Result<Option<DeadLetterEntry>> {
        let entry = sqlx::query_as::<_, DeadLetterEntry>(
            "INSERT INTO dead_letters (id, source, run_id, job_id, payload, error, attempts, created_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT DO NOTHING
             RETURNING *",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(source.as_str())
        .bind(&job.run_id)
        .bind(&job.id)
        .bind(&job.payload)
        .bind(error)
        .bind(job.attempts)
        .bind(now_millis())
        .fetch_optional(self.db.pool())
        .await?;

        Ok(entry)
    }

    /// Get an entry by ID
    pub async fn get(&self, id: &str) -> Result<DeadLetterEntry> {
        sqlx::query_as::<_, DeadLetterEntry>("SELECT * FROM dead_letters WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| StudioflowError::DeadLetterNotFound(id.to_string()))
    }

    /// List entries, newest first
    pub async fn list(
        &self,
        source: Option<DeadLetterSource>,
        unresolved_only: bool,
    ) -> Result<Vec<DeadLetterEntry>> {
        let entries = sqlx::query_as::<_, DeadLetterEntry>(
            "SELECT * FROM dead_letters
             WHERE (? IS NULL OR source = ?)
               AND (? = 0 OR resolved_at IS NULL)
             ORDER BY created_at DESC, id",
        )
        .bind(source.map(|s| s.as_str()))
        .bind(source.map(|s| s.as_str()))
        .bind(unresolved_only)
        .fetch_all(self.db.pool())
        .await?;
        Ok(entries)
    }

    /// Close an entry; a no-op on an entry that is already resolved
    ///
    /// Returns whether this call resolved it.
    pub async fn resolve(&self, id: &str, resolution: &str) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE dead_letters SET resolution = ?, resolved_at = ?
             WHERE id = ? AND resolved_at IS NULL",
        )
        .bind(resolution)
        .bind(now_millis())
        .bind(id)
        .execute(self.db.pool())
        .await?;
        Ok(result.rows_affected() == 1)
    }
}
