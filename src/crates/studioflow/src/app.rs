//! Application context
//!
//! Builds every long-lived component from a [`StudioflowConfig`] and a set of
//! [`Backends`], and owns them until [`AppContext::close`]. Nothing is cached in
//! globals: tests open their own context with fakes.

use crate::backends::{Backends, CircuitBreakingVideoGenerator};
use crate::circuit_breaker::CircuitBreaker;
use crate::config::StudioflowConfig;
use crate::db::Database;
use crate::dead_letter::{DeadLetterService, DeadLetterSource};
use crate::error::{Result, StudioflowError};
use crate::handlers::{
    webhook_job_type, PipelineHandler, RenderPollHandler, RenderPolling, WebhookHandler,
};
use crate::health::{HealthChecker, HealthReport};
use crate::queue::{RetryPolicy, Worker, WorkerSettings};
use crate::repositories::{
    DeadLetterRepository, JobRepository, NewJob, RunRepository, SafetyAuditRepository,
    SqliteCheckpointSaver,
};
use crate::safety::SafetyGuard;
use crate::workflow::step::status;
use crate::workflow::{ResumeDispatcher, RunProjection, WorkflowEngine};
use serde_json::Value;
use std::sync::Arc;
use studioflow_checkpoint::CheckpointSaver;
use tracing::{info, warn};

/// Every component of a running studioflow process
pub struct AppContext {
    pub config: StudioflowConfig,
    pub db: Database,
    pub jobs: JobRepository,
    pub runs: RunRepository,
    pub dead_letter_repository: DeadLetterRepository,
    pub safety_audit: SafetyAuditRepository,
    pub checkpoints: Arc<dyn CheckpointSaver>,
    pub video_breaker: Arc<CircuitBreaker>,
    pub backends: Backends,
    pub engine: WorkflowEngine,
    pub dispatcher: ResumeDispatcher,
    pub dead_letters: DeadLetterService,
}

impl std::fmt::Debug for AppContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppContext")
            .field("database", &self.config.database.url)
            .finish_non_exhaustive()
    }
}

impl AppContext {
    /// Connect, migrate and wire everything up
    ///
    /// `backends.video` is wrapped in the circuit breaker here; callers pass the raw
    /// generator.
    pub async fn open(config: StudioflowConfig, backends: Backends) -> Result<Self> {
        config.validate()?;
        let db =
            Database::initialize(&config.database.url, config.database.max_connections).await?;
        Self::with_database(config, backends, db)
    }

    /// Wire everything up on an already migrated database
    pub fn with_database(
        config: StudioflowConfig,
        mut backends: Backends,
        db: Database,
    ) -> Result<Self> {
        let video_breaker =
            Arc::new(CircuitBreaker::new("video", config.circuit_breaker.clone()));
        backends.video = Arc::new(CircuitBreakingVideoGenerator::new(
            backends.video.clone(),
            video_breaker.clone(),
        ));

        let jobs = JobRepository::new(db.clone());
        let runs = RunRepository::new(db.clone());
        let dead_letter_repository = DeadLetterRepository::new(db.clone());
        let safety_audit = SafetyAuditRepository::new(db.clone());
        let checkpoints: Arc<dyn CheckpointSaver> =
            Arc::new(SqliteCheckpointSaver::new(db.clone()));

        let safety = SafetyGuard::new(backends.shield.clone())
            .with_audit(Arc::new(safety_audit.clone()));
        let engine =
            WorkflowEngine::new(checkpoints.clone(), runs.clone(), backends.clone(), safety);
        let dispatcher = ResumeDispatcher::new(engine.clone(), jobs.clone())
            .with_polling(
                config.resume.poll_interval(),
                config.resume.visibility_timeout(config.backends.simulated),
            )
            .with_max_attempts(config.retry.max_attempts);
        let dead_letters =
            DeadLetterService::new(dead_letter_repository.clone(), dispatcher.clone());

        info!(
            database = %config.database.url,
            simulated = config.backends.simulated,
            "Studioflow context opened"
        );

        Ok(Self {
            config,
            db,
            jobs,
            runs,
            dead_letter_repository,
            safety_audit,
            checkpoints,
            video_breaker,
            backends,
            engine,
            dispatcher,
            dead_letters,
        })
    }

    /// A worker with every pipeline handler registered
    pub fn worker(&self, worker_id: impl Into<String>) -> Worker {
        let settings = WorkerSettings::from_config(worker_id, &self.config.worker);
        let retry = RetryPolicy::from(&self.config.retry);

        let polling = self.config.pipeline.render_poll_interval().map(|interval| RenderPolling {
            interval,
            max_attempts: self.config.pipeline.render_poll_max_attempts,
        });
        let poll_interval = polling
            .map(|p| p.interval)
            .unwrap_or(std::time::Duration::from_secs(5));

        Worker::new(settings, self.jobs.clone(), self.dead_letter_repository.clone(), retry)
            .with_handler(Arc::new(
                PipelineHandler::new(self.engine.clone(), self.jobs.clone())
                    .with_render_polling(polling),
            ))
            .with_handler(Arc::new(WebhookHandler::new(
                DeadLetterSource::VideoGeneration,
                self.dispatcher.clone(),
            )))
            .with_handler(Arc::new(WebhookHandler::new(
                DeadLetterSource::Render,
                self.dispatcher.clone(),
            )))
            .with_handler(Arc::new(RenderPollHandler::new(
                self.backends.render.clone(),
                self.dispatcher.clone(),
                poll_interval,
            )))
    }

    /// Create a run and enqueue its first advance
    ///
    /// The run is committed before its job is queued. If queueing fails the run is
    /// left `running` for [`AppContext::recover_stalled_runs`] to pick up.
    pub async fn start_pipeline(&self, brief: &str) -> Result<RunProjection> {
        let run = self
            .engine
            .start_run(&self.config.pipeline.workflow_name, brief)
            .await?;
        if let Err(e) = self.dispatcher.schedule_advance(&run).await {
            warn!(run_id = %run.run_id, error = %e, "First advance not queued");
            return Err(e);
        }
        Ok(run)
    }

    /// Re-queue the advance job of every `running` run that has none
    ///
    /// Covers a process that died between committing a checkpoint and queueing the
    /// job that continues it. Runs that already have a pending or leased advance
    /// for their current step are left alone. Returns how many jobs were queued.
    pub async fn recover_stalled_runs(&self) -> Result<usize> {
        let mut queued = 0;
        for row in self.runs.list_by_status(status::RUNNING).await? {
            let run = match self.engine.get_run(&row.id).await {
                Ok(run) => run,
                // Pruned since the listing
                Err(StudioflowError::RunNotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if self.dispatcher.schedule_advance(&run).await? {
                queued += 1;
            }
        }
        if queued > 0 {
            info!(queued, "Re-queued advances for stalled runs");
        }
        Ok(queued)
    }

    /// Queue a webhook delivery for the worker
    ///
    /// The same delivery (same source, run and payload) is queued at most once
    /// while a previous copy is still pending.
    pub async fn receive_webhook(
        &self,
        source: DeadLetterSource,
        run_id: &str,
        payload: Value,
    ) -> Result<Option<String>> {
        let key = format!(
            "{run_id}:{}:{}",
            source.as_str(),
            crate::safety::content_hash(&payload.to_string())
        );
        let job = NewJob::new(webhook_job_type(source), run_id)
            .with_payload(payload)
            .with_idempotency_key(key)
            .with_max_attempts(self.config.retry.max_attempts);
        match self.jobs.insert(&job).await {
            Ok(job_id) => Ok(Some(job_id)),
            Err(StudioflowError::DuplicateJob(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub async fn health(&self) -> HealthReport {
        HealthReport::new(vec![
            HealthChecker::check_database(&self.db).await,
            HealthChecker::check_checkpoint_store(&self.engine).await,
            HealthChecker::check_circuit(&self.video_breaker),
            HealthChecker::check_dead_letters(&self.dead_letter_repository).await,
        ])
    }

    pub async fn close(&self) {
        self.db.close().await;
        info!("Studioflow context closed");
    }
}
