//! Job queue worker
//!
//! A worker claims due jobs under a lease and runs their handlers, at most
//! `concurrency` at a time. Each claimed job gets two tasks:
//!
//! - the handler task, whose panics are caught at the task boundary
//! - a heartbeat task extending the lease every `clamp(lease / 3, 1s, 30s)`
//!
//! The heartbeat is told to stop and then joined as soon as the handler returns,
//! whatever the outcome. The handler's [`HandlerOutcome`] is then recorded:
//!
//! | Outcome | Action |
//! |---------|--------|
//! | `Success` | mark succeeded |
//! | `Reschedule` | mark failed with the handler's delay (info log) |
//! | transient `Failure` | mark failed with the policy backoff (warn log) |
//! | permanent `Failure` | fail permanently (error log) |
//!
//! A job that ends terminal-failed is dead-lettered when its handler names a
//! dead-letter source; otherwise the handler's `on_terminal_failure` runs.

use crate::config::WorkerConfig;
use crate::error::{ErrorClass, Result};
use crate::models::Job;
use crate::queue::handler::{HandlerOutcome, JobHandler};
use crate::queue::retry::RetryPolicy;
use crate::repositories::{DeadLetterRepository, FailureOutcome, JobRepository};
use crate::shutdown::ShutdownCoordinator;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Semaphore};
use tracing::{debug, error, info, warn};

const MIN_HEARTBEAT: Duration = Duration::from_secs(1);
const MAX_HEARTBEAT: Duration = Duration::from_secs(30);

/// Interval between lease extensions for a lease of `lease`
pub fn heartbeat_interval(lease: Duration) -> Duration {
    (lease / 3).clamp(MIN_HEARTBEAT, MAX_HEARTBEAT)
}

/// Per-process worker settings
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Lease owner name, unique per process
    pub worker_id: String,
    pub concurrency: usize,
    pub lease: Duration,
    /// Idle sleep between empty polls
    pub poll_interval: Duration,
}

impl WorkerSettings {
    pub fn from_config(worker_id: impl Into<String>, config: &WorkerConfig) -> Self {
        Self {
            worker_id: worker_id.into(),
            concurrency: config.concurrency,
            lease: config.lease(),
            poll_interval: config.poll_interval(),
        }
    }
}

/// How a processed job ended up
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobDisposition {
    Succeeded,
    /// Back to pending for another attempt
    Retrying,
    /// Terminal-failed without a dead-letter entry
    Failed,
    /// Terminal-failed and recorded as a dead letter
    DeadLettered,
    /// Lease was reassigned while the handler ran; the outcome was discarded
    LeaseLost,
}

/// Claims and executes jobs
pub struct Worker {
    settings: WorkerSettings,
    jobs: JobRepository,
    dead_letters: DeadLetterRepository,
    retry: RetryPolicy,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    slots: Arc<Semaphore>,
    permits: u32,
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("settings", &self.settings)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Worker {
    pub fn new(
        settings: WorkerSettings,
        jobs: JobRepository,
        dead_letters: DeadLetterRepository,
        retry: RetryPolicy,
    ) -> Self {
        let permits = u32::try_from(settings.concurrency.max(1)).unwrap_or(u32::MAX);
        Self {
            settings,
            jobs,
            dead_letters,
            retry,
            handlers: HashMap::new(),
            slots: Arc::new(Semaphore::new(permits as usize)),
            permits,
        }
    }

    /// Register a handler for its job type, replacing any previous one
    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(handler.job_type(), handler);
        self
    }

    pub fn id(&self) -> &str {
        &self.settings.worker_id
    }

    /// Claim loop; returns after shutdown once in-flight jobs have finished
    pub async fn run(self: Arc<Self>, shutdown: ShutdownCoordinator) {
        info!(
            worker_id = %self.settings.worker_id,
            concurrency = self.permits,
            handlers = ?self.handlers.keys().collect::<Vec<_>>(),
            "Worker started"
        );

        loop {
            let permit = tokio::select! {
                permit = self.slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.wait_for_shutdown() => break,
            };

            match self.jobs.claim_next(&self.settings.worker_id, self.settings.lease).await {
                Ok(Some(job)) => {
                    let worker = Arc::clone(&self);
                    tokio::spawn(async move {
                        worker.process(job).await;
                        drop(permit);
                    });
                    continue;
                }
                Ok(None) => drop(permit),
                Err(e) => {
                    drop(permit);
                    error!(worker_id = %self.settings.worker_id, error = %e, "Claim failed");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(self.settings.poll_interval) => {}
                _ = shutdown.wait_for_shutdown() => break,
            }
        }

        info!(worker_id = %self.settings.worker_id, "Worker draining in-flight jobs");
        if let Ok(all) = self.slots.acquire_many(self.permits).await {
            drop(all);
        }
        info!(worker_id = %self.settings.worker_id, "Worker stopped");
    }

    /// Claim and process at most one job inline
    ///
    /// Returns the job as claimed together with how it ended up.
    pub async fn run_once(&self) -> Result<Option<(Job, JobDisposition)>> {
        let Some(job) = self
            .jobs
            .claim_next(&self.settings.worker_id, self.settings.lease)
            .await?
        else {
            return Ok(None);
        };
        let disposition = self.process(job.clone()).await;
        Ok(Some((job, disposition)))
    }

    /// Execute a claimed job and record its outcome
    pub async fn process(&self, job: Job) -> JobDisposition {
        let Some(handler) = self.handlers.get(job.job_type.as_str()).cloned() else {
            let message = format!("no handler registered for job type '{}'", job.job_type);
            error!(job_id = %job.id, job_type = %job.job_type, "{}", message);
            return match self
                .jobs
                .fail_permanently(&job.id, &self.settings.worker_id, &message)
                .await
            {
                Ok(Some(_)) => JobDisposition::Failed,
                Ok(None) => JobDisposition::LeaseLost,
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to record job failure");
                    JobDisposition::LeaseLost
                }
            };
        };

        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts + 1,
            "Running job"
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let heartbeat = tokio::spawn(heartbeat(
            self.jobs.clone(),
            job.id.clone(),
            self.settings.worker_id.clone(),
            self.settings.lease,
            stop_rx,
        ));

        let task_handler = Arc::clone(&handler);
        let task_job = job.clone();
        let outcome = match tokio::spawn(async move { task_handler.handle(&task_job).await }).await
        {
            Ok(outcome) => outcome,
            Err(join_error) => HandlerOutcome::Failure(crate::StudioflowError::Handler(format!(
                "handler task aborted: {join_error}"
            ))),
        };

        let _ = stop_tx.send(());
        if let Err(e) = heartbeat.await {
            warn!(job_id = %job.id, error = %e, "Heartbeat task ended abnormally");
        }

        match self.record_outcome(&job, handler.as_ref(), outcome).await {
            Ok(disposition) => disposition,
            Err(e) => {
                // The lease will expire and another worker will retry the job
                error!(job_id = %job.id, error = %e, "Failed to record job outcome");
                JobDisposition::LeaseLost
            }
        }
    }

    async fn record_outcome(
        &self,
        job: &Job,
        handler: &dyn JobHandler,
        outcome: HandlerOutcome,
    ) -> Result<JobDisposition> {
        let worker_id = self.settings.worker_id.as_str();

        let failed = match outcome {
            HandlerOutcome::Success => {
                if self.jobs.mark_succeeded(&job.id, worker_id).await? {
                    debug!(job_id = %job.id, job_type = %job.job_type, "Job succeeded");
                    return Ok(JobDisposition::Succeeded);
                }
                warn!(job_id = %job.id, "Lease lost before success was recorded");
                return Ok(JobDisposition::LeaseLost);
            }
            HandlerOutcome::Reschedule { delay, reason } => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    delay_ms = delay.as_millis() as u64,
                    reason = %reason,
                    "Job rescheduled"
                );
                let message = format!("rescheduled: {reason}");
                let failed = self.jobs.mark_failed(&job.id, worker_id, &message, delay).await?;
                (failed, message)
            }
            HandlerOutcome::Failure(err) => {
                let message = err.to_string();
                match err.class() {
                    ErrorClass::Transient => {
                        let delay = self
                            .retry
                            .delay(u32::try_from(job.attempts).unwrap_or(u32::MAX));
                        warn!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            attempt = job.attempts + 1,
                            max_attempts = job.max_attempts,
                            retry_in_ms = delay.as_millis() as u64,
                            error = %message,
                            "Job attempt failed"
                        );
                        let failed =
                            self.jobs.mark_failed(&job.id, worker_id, &message, delay).await?;
                        (failed, message)
                    }
                    ErrorClass::Permanent => {
                        error!(
                            job_id = %job.id,
                            job_type = %job.job_type,
                            error = %message,
                            "Job failed permanently"
                        );
                        let failed = match self
                            .jobs
                            .fail_permanently(&job.id, worker_id, &message)
                            .await?
                        {
                            Some(failed_job) => FailureOutcome::Exhausted(failed_job),
                            None => FailureOutcome::LeaseLost,
                        };
                        (failed, message)
                    }
                }
            }
        };

        Ok(match failed {
            (FailureOutcome::Retrying { .. }, _) => JobDisposition::Retrying,
            (FailureOutcome::LeaseLost, _) => {
                warn!(job_id = %job.id, "Lease lost before failure was recorded");
                JobDisposition::LeaseLost
            }
            (FailureOutcome::Exhausted(failed_job), message) => {
                self.on_terminal_failure(handler, &failed_job, &message).await
            }
        })
    }

    async fn on_terminal_failure(
        &self,
        handler: &dyn JobHandler,
        job: &Job,
        error: &str,
    ) -> JobDisposition {
        let Some(source) = handler.dead_letter_source() else {
            error!(
                job_id = %job.id,
                job_type = %job.job_type,
                run_id = %job.run_id,
                attempts = job.attempts,
                error,
                "Job exhausted"
            );
            if let Err(e) = handler.on_terminal_failure(job, error).await {
                error!(job_id = %job.id, error = %e, "Terminal failure hook failed");
            }
            return JobDisposition::Failed;
        };

        match self.dead_letters.record(source, job, error).await {
            Ok(Some(entry)) => {
                error!(
                    job_id = %job.id,
                    run_id = %job.run_id,
                    dead_letter_id = %entry.id,
                    source = source.as_str(),
                    error,
                    "Job dead-lettered"
                );
                JobDisposition::DeadLettered
            }
            Ok(None) => {
                warn!(
                    job_id = %job.id,
                    run_id = %job.run_id,
                    source = source.as_str(),
                    "Unresolved dead letter already exists for this run"
                );
                JobDisposition::DeadLettered
            }
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to record dead letter");
                JobDisposition::Failed
            }
        }
    }
}

async fn heartbeat(
    jobs: JobRepository,
    job_id: String,
    worker_id: String,
    lease: Duration,
    mut stop: oneshot::Receiver<()>,
) {
    let interval = heartbeat_interval(lease);
    loop {
        tokio::select! {
            _ = &mut stop => break,
            _ = tokio::time::sleep(interval) => {
                match jobs.touch_lease(&job_id, &worker_id, lease).await {
                    Ok(true) => debug!(job_id = %job_id, "Lease extended"),
                    Ok(false) => {
                        warn!(
                            job_id = %job_id,
                            worker_id = %worker_id,
                            "Lease lost, stopping heartbeat"
                        );
                        break;
                    }
                    Err(e) => warn!(job_id = %job_id, error = %e, "Lease extension failed"),
                }
            }
        }
    }
}
