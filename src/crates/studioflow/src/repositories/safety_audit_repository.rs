//! Safety verdict audit trail

use super::now_millis;
use crate::db::Database;
use crate::error::Result;
use crate::safety::{SafetyAuditSink, SafetyCacheEntry};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// One recorded moderation verdict
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct SafetyAuditRecord {
    pub id: i64,
    pub run_id: String,
    pub content_hash: String,
    pub verdict: String,
    pub category: Option<String>,
    /// Unix epoch milliseconds
    pub recorded_at: i64,
}

/// Repository for the `safety_audit` table
#[derive(Clone, Debug)]
pub struct SafetyAuditRepository {
    db: Database,
}

impl SafetyAuditRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Verdicts recorded for a run, oldest first
    pub async fn list_for_run(&self, run_id: &str) -> Result<Vec<SafetyAuditRecord>> {
        let records = sqlx::query_as::<_, SafetyAuditRecord>(
            "SELECT * FROM safety_audit WHERE run_id = ? ORDER BY id",
        )
        .bind(run_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(records)
    }
}

#[async_trait]
impl SafetyAuditSink for SafetyAuditRepository {
    async fn record(&self, run_id: &str, entry: &SafetyCacheEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO safety_audit (run_id, content_hash, verdict, category, recorded_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(run_id)
        .bind(&entry.content_hash)
        .bind(entry.verdict.as_str())
        .bind(&entry.category)
        .bind(now_millis())
        .execute(self.db.pool())
        .await?;
        Ok(())
    }
}
