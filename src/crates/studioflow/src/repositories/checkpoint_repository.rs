//! SQLite checkpoint storage
//!
//! [`SqliteCheckpointSaver`] stores one row per run in `checkpoints` and, in the same
//! transaction, upserts the run's projection row in `runs`. A reader of `runs`
//! therefore never sees a status the checkpoint does not hold.
//!
//! Writes are compare-and-swap on `version`. The first statement of each
//! transaction is the guarded write, so the transaction takes SQLite's write lock
//! immediately instead of upgrading from a read lock.

use super::now_millis;
use crate::db::Database;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::FromRow;
use studioflow_checkpoint::{
    Checkpoint, CheckpointError, CheckpointMetadata, CheckpointSaver, Interrupt,
    Result as CheckpointResult,
};
use tracing::debug;

#[derive(Debug, FromRow)]
struct CheckpointRow {
    run_id: String,
    state: String,
    pending_interrupts: String,
    metadata: String,
    version: i64,
    updated_at: i64,
}

impl CheckpointRow {
    fn into_checkpoint(self) -> CheckpointResult<Checkpoint> {
        let pending_interrupts: Vec<Interrupt> = serde_json::from_str(&self.pending_interrupts)?;
        let metadata: CheckpointMetadata = serde_json::from_str(&self.metadata)?;
        let updated_at = DateTime::<Utc>::from_timestamp_millis(self.updated_at).ok_or_else(|| {
            CheckpointError::Invalid(format!("bad updated_at for run {}", self.run_id))
        })?;

        Ok(Checkpoint {
            state: serde_json::from_str(&self.state)?,
            run_id: self.run_id,
            pending_interrupts,
            metadata,
            version: self.version,
            updated_at,
        })
    }
}

fn storage(err: sqlx::Error) -> CheckpointError {
    CheckpointError::Storage(err.to_string())
}

/// Checkpoint saver backed by the studioflow database
#[derive(Clone, Debug)]
pub struct SqliteCheckpointSaver {
    db: Database,
}

impl SqliteCheckpointSaver {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    async fn stored_version(&self, run_id: &str) -> CheckpointResult<i64> {
        let version: Option<(i64,)> =
            sqlx::query_as("SELECT version FROM checkpoints WHERE run_id = ?")
                .bind(run_id)
                .fetch_optional(self.db.pool())
                .await
                .map_err(storage)?;
        Ok(version.map(|(v,)| v).unwrap_or(0))
    }
}

#[async_trait]
impl CheckpointSaver for SqliteCheckpointSaver {
    async fn get(&self, run_id: &str) -> CheckpointResult<Option<Checkpoint>> {
        let row = sqlx::query_as::<_, CheckpointRow>("SELECT * FROM checkpoints WHERE run_id = ?")
            .bind(run_id)
            .fetch_optional(self.db.pool())
            .await
            .map_err(storage)?;

        row.map(CheckpointRow::into_checkpoint).transpose()
    }

    async fn put(&self, mut checkpoint: Checkpoint) -> CheckpointResult<Checkpoint> {
        let now = now_millis();
        let expected = checkpoint.version;
        let next_version = expected + 1;
        let state = serde_json::to_string(&checkpoint.state)?;
        let interrupts = serde_json::to_string(&checkpoint.pending_interrupts)?;
        let metadata = serde_json::to_string(&checkpoint.metadata)?;
        let artifacts = serde_json::to_string(&checkpoint.metadata.artifacts)?;

        let mut tx = self.db.pool().begin().await.map_err(storage)?;

        let written = if expected == 0 {
            sqlx::query(
                "INSERT INTO checkpoints (run_id, state, pending_interrupts, metadata, version, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?)
                 ON CONFLICT(run_id) DO NOTHING",
            )
            .bind(&checkpoint.run_id)
            .bind(&state)
            .bind(&interrupts)
            .bind(&metadata)
            .bind(next_version)
            .bind(now)
            .execute(&mut *tx)
            .await
            .map_err(storage)?
        } else {
            sqlx::query(
                "UPDATE checkpoints
                 SET state = ?, pending_interrupts = ?, metadata = ?, version = ?, updated_at = ?
                 WHERE run_id = ? AND version = ?",
            )
            .bind(&state)
            .bind(&interrupts)
            .bind(&metadata)
            .bind(next_version)
            .bind(now)
            .bind(&checkpoint.run_id)
            .bind(expected)
            .execute(&mut *tx)
            .await
            .map_err(storage)?
        };

        if written.rows_affected() != 1 {
            tx.rollback().await.map_err(storage)?;
            let actual = self.stored_version(&checkpoint.run_id).await?;
            return Err(CheckpointError::Conflict {
                run_id: checkpoint.run_id,
                expected,
                actual,
            });
        }

        sqlx::query(
            "INSERT INTO runs (id, workflow_name, status, current_step, artifacts, error, created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                 status = excluded.status,
                 current_step = excluded.current_step,
                 artifacts = excluded.artifacts,
                 error = excluded.error,
                 updated_at = excluded.updated_at",
        )
        .bind(&checkpoint.run_id)
        .bind(&checkpoint.metadata.workflow_name)
        .bind(&checkpoint.metadata.status)
        .bind(&checkpoint.metadata.current_step)
        .bind(&artifacts)
        .bind(&checkpoint.metadata.error)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(storage)?;

        tx.commit().await.map_err(storage)?;

        debug!(
            run_id = %checkpoint.run_id,
            version = next_version,
            status = %checkpoint.metadata.status,
            step = %checkpoint.metadata.current_step,
            "Checkpoint committed"
        );

        checkpoint.version = next_version;
        checkpoint.updated_at =
            DateTime::<Utc>::from_timestamp_millis(now).unwrap_or_else(Utc::now);
        Ok(checkpoint)
    }

    async fn delete(&self, run_id: &str) -> CheckpointResult<bool> {
        let result = sqlx::query("DELETE FROM checkpoints WHERE run_id = ?")
            .bind(run_id)
            .execute(self.db.pool())
            .await
            .map_err(storage)?;
        Ok(result.rows_affected() > 0)
    }

    async fn healthy(&self) -> bool {
        sqlx::query("SELECT COUNT(*) FROM checkpoints")
            .fetch_one(self.db.pool())
            .await
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::repositories::RunRepository;
    use serde_json::json;

    async fn saver() -> (SqliteCheckpointSaver, RunRepository) {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        (SqliteCheckpointSaver::new(db.clone()), RunRepository::new(db))
    }

    fn checkpoint() -> Checkpoint {
        Checkpoint::new(
            "run-1",
            json!({"brief": "launch"}),
            CheckpointMetadata::new("video_pipeline", "running", "ideation"),
        )
    }

    #[tokio::test]
    async fn test_put_writes_checkpoint_and_projection() {
        let (saver, runs) = saver().await;
        let mut cp = checkpoint();
        cp.push_interrupt(Interrupt::new("videos", "wait_for_videos")).unwrap();

        let stored = saver.put(cp).await.unwrap();
        assert_eq!(stored.version, 1);

        let loaded = saver.get("run-1").await.unwrap().unwrap();
        assert_eq!(loaded.version, 1);
        assert_eq!(loaded.state, json!({"brief": "launch"}));
        assert_eq!(loaded.pending_interrupts.len(), 1);

        let run = runs.get("run-1").await.unwrap();
        assert_eq!(run.status, "running");
        assert_eq!(run.current_step, "ideation");
        assert_eq!(run.workflow_name, "video_pipeline");
    }

    #[tokio::test]
    async fn test_stale_write_leaves_projection_untouched() {
        let (saver, runs) = saver().await;
        let v1 = saver.put(checkpoint()).await.unwrap();

        let mut winner = v1.clone();
        winner.metadata.current_step = "production".to_string();
        saver.put(winner).await.unwrap();

        let mut loser = v1;
        loser.metadata.status = "failed".to_string();
        match saver.put(loser).await.unwrap_err() {
            CheckpointError::Conflict { expected, actual, .. } => {
                assert_eq!(expected, 1);
                assert_eq!(actual, 2);
            }
            other => panic!("unexpected error: {other}"),
        }

        let run = runs.get("run-1").await.unwrap();
        assert_eq!(run.status, "running");
        assert_eq!(run.current_step, "production");
    }

    #[tokio::test]
    async fn test_second_insert_conflicts() {
        let (saver, _) = saver().await;
        saver.put(checkpoint()).await.unwrap();
        assert!(matches!(
            saver.put(checkpoint()).await,
            Err(CheckpointError::Conflict { .. })
        ));
    }

    #[tokio::test]
    async fn test_delete_keeps_projection() {
        let (saver, runs) = saver().await;
        saver.put(checkpoint()).await.unwrap();
        assert!(saver.healthy().await);

        assert!(saver.delete("run-1").await.unwrap());
        assert!(saver.get("run-1").await.unwrap().is_none());
        assert!(runs.find("run-1").await.unwrap().is_some());
    }
}
