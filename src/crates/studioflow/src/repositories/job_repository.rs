//! Job repository: the persistent job store
//!
//! Every state change is a single conditional `UPDATE`, so the SQLite write lock is
//! the only coordination between workers:
//!
//! - claims select and lease a row in one statement
//! - lease extensions and outcome marks only apply while the caller still owns the
//!   lease, so a worker that stalled past its lease cannot overwrite the new owner
//! - the partial unique index on `idempotency_key` rejects a second active job

use super::{duration_millis, now_millis};
use crate::db::Database;
use crate::error::{is_unique_violation, Result, StudioflowError};
use crate::models::{Job, JobStatus};
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use uuid::Uuid;

/// A job about to be enqueued
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub run_id: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub max_attempts: u32,
    /// Delay before the first claim
    pub delay: Duration,
}

impl NewJob {
    pub fn new(job_type: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            run_id: run_id.into(),
            payload: Value::Object(Default::default()),
            idempotency_key: None,
            max_attempts: 5,
            delay: Duration::ZERO,
        }
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Result of recording a failed attempt
#[derive(Debug, Clone)]
pub enum FailureOutcome {
    /// Back to pending until `next_attempt_at`
    Retrying { attempts: i64, next_attempt_at: i64 },
    /// Attempts used up; the job is terminal-failed
    Exhausted(Job),
    /// The caller no longer owns the lease; nothing was written
    LeaseLost,
}

/// Repository for job queue operations
#[derive(Clone, Debug)]
pub struct JobRepository {
    db: Database,
}

impl JobRepository {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Enqueue a job
    ///
    /// Fails with [`StudioflowError::DuplicateJob`] while another pending or leased
    /// job holds the same idempotency key; callers treat that as success.
    pub async fn enqueue(
        &self,
        job_type: &str,
        run_id: &str,
        payload: &Value,
        idempotency_key: Option<&str>,
        max_attempts: u32,
    ) -> Result<String> {
        let mut job = NewJob::new(job_type, run_id)
            .with_payload(payload.clone())
            .with_max_attempts(max_attempts);
        job.idempotency_key = idempotency_key.map(str::to_string);
        self.insert(&job).await
    }

    /// Insert a job built with [`NewJob`]
    pub async fn insert(&self, job: &NewJob) -> Result<String> {
        let id = Uuid::new_v4().to_string();
        let now = now_millis();
        let payload = serde_json::to_string(&job.payload)?;

        let inserted = sqlx::query(
            "INSERT INTO jobs (id, job_type, run_id, payload, status, attempts, max_attempts,
                               idempotency_key, next_attempt_at, created_at, updated_at)
             VALUES (?, ?, ?, ?, 'pending', 0, ?, ?, ?, ?, ?)",
        )
        .bind(&id)
        .bind(&job.job_type)
        .bind(&job.run_id)
        .bind(&payload)
        .bind(i64::from(job.max_attempts.max(1)))
        .bind(&job.idempotency_key)
        .bind(now.saturating_add(duration_millis(job.delay)))
        .bind(now)
        .bind(now)
        .execute(self.db.pool())
        .await;

        match inserted {
            Ok(_) => {
                debug!(
                    job_id = %id,
                    job_type = %job.job_type,
                    run_id = %job.run_id,
                    "Job enqueued"
                );
                Ok(id)
            }
            Err(e) if is_unique_violation(&e) => Err(StudioflowError::DuplicateJob(
                job.idempotency_key.clone().unwrap_or_default(),
            )),
            Err(e) => Err(e.into()),
        }
    }

    /// Atomically claim one due job for `worker_id`
    ///
    /// Eligible rows are pending jobs whose `next_attempt_at` has passed and leased
    /// jobs whose lease expired (the owner is presumed dead). Reclaiming an expired
    /// lease does not count as an attempt.
    pub async fn claim_next(&self, worker_id: &str, lease: Duration) -> Result<Option<Job>> {
        let now = now_millis();
        let job = sqlx::query_as::<_, Job>(
            "UPDATE jobs
             SET status = 'leased', lease_owner = ?, lease_expires_at = ?, updated_at = ?
             WHERE id = (
                 SELECT id FROM jobs
                 WHERE (status = 'pending' AND next_attempt_at <= ?)
                    OR (status = 'leased' AND lease_expires_at <= ?)
                 ORDER BY next_attempt_at, created_at
                 LIMIT 1
             )
             AND ((status = 'pending' AND next_attempt_at <= ?)
                  OR (status = 'leased' AND lease_expires_at <= ?))
             RETURNING *",
        )
        .bind(worker_id)
        .bind(now.saturating_add(duration_millis(lease)))
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(now)
        .bind(now)
        .fetch_optional(self.db.pool())
        .await?;

        if let Some(job) = &job {
            debug!(job_id = %job.id, worker_id, attempts = job.attempts, "Job claimed");
        }
        Ok(job)
    }

    /// Extend the lease if `worker_id` still owns it
    ///
    /// Returns `false` (and writes nothing) when the lease was reassigned.
    pub async fn touch_lease(
        &self,
        job_id: &str,
        worker_id: &str,
        lease: Duration,
    ) -> Result<bool> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE jobs SET lease_expires_at = ?, updated_at = ?
             WHERE id = ? AND status = 'leased' AND lease_owner = ?",
        )
        .bind(now.saturating_add(duration_millis(lease)))
        .bind(now)
        .bind(job_id)
        .bind(worker_id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Mark a leased job succeeded
    pub async fn mark_succeeded(&self, job_id: &str, worker_id: &str) -> Result<bool> {
        let now = now_millis();
        let result = sqlx::query(
            "UPDATE jobs
             SET status = 'succeeded', lease_owner = NULL, lease_expires_at = NULL,
                 last_error = NULL, completed_at = ?, updated_at = ?
             WHERE id = ? AND status = 'leased' AND lease_owner = ?",
        )
        .bind(now)
        .bind(now)
        .bind(job_id)
        .bind(worker_id)
        .execute(self.db.pool())
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Record a failed attempt
    ///
    /// While `attempts + 1 < max_attempts` the job returns to pending at
    /// `now + retry_delay`; otherwise it becomes terminal-failed.
    pub async fn mark_failed(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
        retry_delay: Duration,
    ) -> Result<FailureOutcome> {
        let now = now_millis();
        let job = sqlx::query_as::<_, Job>(
            "UPDATE jobs
             SET attempts = attempts + 1,
                 status = CASE WHEN attempts + 1 < max_attempts THEN 'pending' ELSE 'failed' END,
                 next_attempt_at = CASE WHEN attempts + 1 < max_attempts THEN ? ELSE next_attempt_at END,
                 completed_at = CASE WHEN attempts + 1 < max_attempts THEN NULL ELSE ? END,
                 lease_owner = NULL, lease_expires_at = NULL,
                 last_error = ?, updated_at = ?
             WHERE id = ? AND status = 'leased' AND lease_owner = ?
             RETURNING *",
        )
        .bind(now.saturating_add(duration_millis(retry_delay)))
        .bind(now)
        .bind(error)
        .bind(now)
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(match job {
            None => FailureOutcome::LeaseLost,
            Some(job) if job.status == JobStatus::Failed.as_str() => FailureOutcome::Exhausted(job),
            Some(job) => FailureOutcome::Retrying {
                attempts: job.attempts,
                next_attempt_at: job.next_attempt_at,
            },
        })
    }

    /// Fail a leased job without consuming its remaining attempts
    ///
    /// Used for permanent errors. Returns `None` when the lease was lost.
    pub async fn fail_permanently(
        &self,
        job_id: &str,
        worker_id: &str,
        error: &str,
    ) -> Result<Option<Job>> {
        let now = now_millis();
        let job = sqlx::query_as::<_, Job>(
            "UPDATE jobs
             SET status = 'failed', attempts = attempts + 1,
                 lease_owner = NULL, lease_expires_at = NULL,
                 last_error = ?, completed_at = ?, updated_at = ?
             WHERE id = ? AND status = 'leased' AND lease_owner = ?
             RETURNING *",
        )
        .bind(error)
        .bind(now)
        .bind(now)
        .bind(job_id)
        .bind(worker_id)
        .fetch_optional(self.db.pool())
        .await?;

        Ok(job)
    }

    /// Get a job by ID
    pub async fn get(&self, job_id: &str) -> Result<Job> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = ?")
            .bind(job_id)
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| StudioflowError::JobNotFound(job_id.to_string()))
    }

    /// All jobs of a run, oldest first
    pub async fn list_by_run(&self, run_id: &str) -> Result<Vec<Job>> {
        let jobs = sqlx::query_as::<_, Job>(
            "SELECT * FROM jobs WHERE run_id = ? ORDER BY created_at, id",
        )
        .bind(run_id)
        .fetch_all(self.db.pool())
        .await?;
        Ok(jobs)
    }

    /// Number of jobs in a status
    pub async fn count_by_status(&self, status: JobStatus) -> Result<i64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM jobs WHERE status = ?")
            .bind(status.as_str())
            .fetch_one(self.db.pool())
            .await?;
        Ok(count)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn repo() -> JobRepository {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        JobRepository::new(db)
    }

    #[tokio::test]
    async fn test_duplicate_idempotency_key_while_active() {
        let repo = repo().await;
        let first = repo
            .enqueue("webhook.render", "run-1", &json!({}), Some("render:run-1"), 3)
            .await
            .unwrap();

        let err = repo
            .enqueue("webhook.render", "run-1", &json!({}), Some("render:run-1"), 3)
            .await
            .unwrap_err();
        assert!(matches!(err, StudioflowError::DuplicateJob(ref k) if k == "render:run-1"));

        // Once terminal, the key is free again
        let job = repo.claim_next("w1", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(job.id, first);
        assert!(repo.mark_succeeded(&job.id, "w1").await.unwrap());
        repo.enqueue("webhook.render", "run-1", &json!({}), Some("render:run-1"), 3)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_jobs_without_key_never_collide() {
        let repo = repo().await;
        repo.enqueue("pipeline.advance", "run-1", &json!({}), None, 3).await.unwrap();
        repo.enqueue("pipeline.advance", "run-1", &json!({}), None, 3).await.unwrap();
        assert_eq!(repo.count_by_status(JobStatus::Pending).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_claim_sets_lease_and_skips_leased() {
        let repo = repo().await;
        repo.enqueue("pipeline.advance", "run-1", &json!({"a": 1}), None, 3).await.unwrap();

        let job = repo.claim_next("w1", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(job.status().unwrap(), JobStatus::Leased);
        assert_eq!(job.lease_owner.as_deref(), Some("w1"));
        assert!(job.lease_expires_at.unwrap() > job.updated_at);
        assert_eq!(job.payload_json().unwrap(), json!({"a": 1}));

        assert!(repo.claim_next("w2", Duration::from_secs(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delayed_job_not_claimable_yet() {
        let repo = repo().await;
        repo.insert(&NewJob::new("render.poll", "run-1").with_delay(Duration::from_secs(60)))
            .await
            .unwrap();
        assert!(repo.claim_next("w1", Duration::from_secs(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_expired_lease_is_reclaimed() {
        let repo = repo().await;
        let id = repo.enqueue("pipeline.advance", "run-1", &json!({}), None, 3).await.unwrap();

        repo.claim_next("w1", Duration::ZERO).await.unwrap().unwrap();
        let reclaimed = repo.claim_next("w2", Duration::from_secs(30)).await.unwrap().unwrap();
        assert_eq!(reclaimed.id, id);
        assert_eq!(reclaimed.lease_owner.as_deref(), Some("w2"));
        assert_eq!(reclaimed.attempts, 0);

        // The previous owner can no longer extend or complete it
        assert!(!repo.touch_lease(&id, "w1", Duration::from_secs(30)).await.unwrap());
        assert!(!repo.mark_succeeded(&id, "w1").await.unwrap());
        assert!(matches!(
            repo.mark_failed(&id, "w1", "late", Duration::ZERO).await.unwrap(),
            FailureOutcome::LeaseLost
        ));
        assert!(repo.touch_lease(&id, "w2", Duration::from_secs(30)).await.unwrap());
    }

    #[tokio::test]
    async fn test_mark_failed_until_exhausted() {
        let repo = repo().await;
        let id = repo.enqueue("webhook.videos", "run-1", &json!({}), None, 2).await.unwrap();

        repo.claim_next("w1", Duration::from_secs(30)).await.unwrap().unwrap();
        match repo.mark_failed(&id, "w1", "boom", Duration::ZERO).await.unwrap() {
            FailureOutcome::Retrying { attempts, .. } => assert_eq!(attempts, 1),
            other => panic!("unexpected outcome: {other:?}"),
        }

        repo.claim_next("w1", Duration::from_secs(30)).await.unwrap().unwrap();
        match repo.mark_failed(&id, "w1", "boom again", Duration::ZERO).await.unwrap() {
            FailureOutcome::Exhausted(job) => {
                assert_eq!(job.attempts, 2);
                assert_eq!(job.status().unwrap(), JobStatus::Failed);
                assert_eq!(job.last_error.as_deref(), Some("boom again"));
                assert!(job.completed_at.is_some());
            }
            other => panic!("unexpected outcome: {other:?}"),
        }
        assert!(repo.claim_next("w1", Duration::from_secs(30)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_retry_delay_defers_next_claim() {
        let repo = repo().await;
        let id = repo.enqueue("pipeline.advance", "run-1", &json!({}), None, 3).await.unwrap();

        repo.claim_next("w1", Duration::from_secs(30)).await.unwrap().unwrap();
        repo.mark_failed(&id, "w1", "not yet", Duration::from_secs(60)).await.unwrap();
        assert!(repo.claim_next("w1", Duration::from_secs(30)).await.unwrap().is_none());

        let job = repo.get(&id).await.unwrap();
        assert_eq!(job.status().unwrap(), JobStatus::Pending);
        assert!(job.lease_owner.is_none());
    }

    #[tokio::test]
    async fn test_fail_permanently_skips_remaining_attempts() {
        let repo = repo().await;
        let id = repo.enqueue("webhook.render", "run-1", &json!({}), None, 5).await.unwrap();
        repo.claim_next("w1", Duration::from_secs(30)).await.unwrap().unwrap();

        let job = repo.fail_permanently(&id, "w1", "missing video_url").await.unwrap().unwrap();
        assert_eq!(job.status().unwrap(), JobStatus::Failed);
        assert_eq!(job.attempts, 1);
        assert!(repo.fail_permanently(&id, "w1", "again").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_missing_job() {
        let repo = repo().await;
        assert!(matches!(
            repo.get("nope").await,
            Err(StudioflowError::JobNotFound(_))
        ));
    }
}
