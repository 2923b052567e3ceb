//! Resume dispatcher
//!
//! Routes inbound events and HITL decisions to the pending interrupt they target.
//! An event can arrive before the step that waits for it has committed its
//! interrupt (the webhook raced the worker). In that case the dispatcher polls the
//! checkpoint until the interrupt shows up or the visibility window closes, and then
//! gives up with the transient [`StudioflowError::ResumeRetryable`] so the webhook
//! job is retried later.
//!
//! A resume commits the checkpoint and then queues the `pipeline.advance` job that
//! carries the run on. The two writes are separate, so a delivery that finds the run
//! already past its step re-queues that job (the idempotency key makes this a no-op
//! when it already exists). Redelivering an event, or retrying a gate decision,
//! therefore recovers a run whose continuation was lost.
//!
//! Dropping a pending call at any await point is safe: the only durable writes are
//! the checkpoint commit and the idempotent enqueue.

use crate::error::{Result, StudioflowError};
use crate::handlers::ADVANCE_JOB;
use crate::repositories::{JobRepository, NewJob};
use crate::workflow::engine::{RunProjection, WorkflowEngine};
use crate::workflow::step::{status, Step, RENDER_EVENT, VIDEOS_EVENT};
use serde_json::{json, Value};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// What a resume call did
#[derive(Debug, Clone, PartialEq)]
pub enum ResumeOutcome {
    /// The interrupt was consumed and the step committed
    Resumed(RunProjection),
    /// The run is terminal or already past the step the event belongs to
    NoOp(RunProjection),
}

impl ResumeOutcome {
    pub fn run(&self) -> &RunProjection {
        match self {
            Self::Resumed(run) | Self::NoOp(run) => run,
        }
    }

    pub fn is_noop(&self) -> bool {
        matches!(self, Self::NoOp(_))
    }
}

#[derive(Debug, Clone)]
pub struct ResumeDispatcher {
    engine: WorkflowEngine,
    jobs: JobRepository,
    poll_interval: Duration,
    visibility_timeout: Duration,
    max_attempts: u32,
}

impl ResumeDispatcher {
    pub fn new(engine: WorkflowEngine, jobs: JobRepository) -> Self {
        Self {
            engine,
            jobs,
            poll_interval: Duration::from_millis(100),
            visibility_timeout: Duration::from_secs(2),
            max_attempts: 5,
        }
    }

    pub fn with_polling(mut self, poll_interval: Duration, visibility_timeout: Duration) -> Self {
        self.poll_interval = poll_interval;
        self.visibility_timeout = visibility_timeout;
        self
    }

    /// Attempts given to continuation jobs
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn engine(&self) -> &WorkflowEngine {
        &self.engine
    }

    /// Clips for the run are ready
    pub async fn resume_after_videos(
        &self,
        run_id: &str,
        video_urls: &[String],
    ) -> Result<ResumeOutcome> {
        self.resume_after_event(run_id, VIDEOS_EVENT, json!({ "video_urls": video_urls }))
            .await
    }

    /// The final render for the run is ready
    pub async fn resume_after_render(
        &self,
        run_id: &str,
        video_url: &str,
    ) -> Result<ResumeOutcome> {
        self.resume_after_event(run_id, RENDER_EVENT, json!({ "video_url": video_url }))
            .await
    }

    /// Resume the interrupt of `event_kind` pending on the run
    pub async fn resume_after_event(
        &self,
        run_id: &str,
        event_kind: &str,
        payload: Value,
    ) -> Result<ResumeOutcome> {
        let owning = Step::owning(event_kind);
        let deadline = Instant::now() + self.visibility_timeout;

        loop {
            let Some(checkpoint) = self.engine.checkpoint(run_id).await? else {
                // Pruned runs are terminal; anything else is unknown
                let run = self.engine.get_run(run_id).await?;
                if run.is_terminal() {
                    return Ok(ResumeOutcome::NoOp(run));
                }
                return Err(StudioflowError::RunNotFound(run_id.to_string()));
            };
            let run = RunProjection::from_checkpoint(&checkpoint);

            if run.is_terminal() {
                debug!(run_id, event_kind, status = %run.status, "Event for terminal run ignored");
                return Ok(ResumeOutcome::NoOp(run));
            }
            if let Some(owning) = owning {
                if run.step()? > owning {
                    debug!(
                        run_id,
                        event_kind,
                        step = %run.current_step,
                        "Run already past event step"
                    );
                    self.schedule_advance(&run).await?;
                    return Ok(ResumeOutcome::NoOp(run));
                }
            }

            let matching = checkpoint.pending_matching(event_kind);
            match matching.len() {
                1 => {
                    let interrupt_id = matching[0].id.clone();
                    match self.engine.resume(run_id, &interrupt_id, payload.clone()).await {
                        Ok(run) => {
                            self.schedule_advance(&run).await?;
                            return Ok(ResumeOutcome::Resumed(run));
                        }
                        // Someone else committed or consumed the interrupt first;
                        // re-read and decide again
                        Err(StudioflowError::ConcurrentModification(_))
                        | Err(StudioflowError::InterruptNotFound { .. }) => continue,
                        Err(e) => return Err(e),
                    }
                }
                0 if owning.is_none() => {
                    return Err(StudioflowError::NoPendingInterrupt {
                        run_id: run_id.to_string(),
                        event_kind: event_kind.to_string(),
                    })
                }
                0 => {
                    if Instant::now() >= deadline {
                        info!(
                            run_id,
                            event_kind,
                            step = %run.current_step,
                            "Interrupt not visible yet"
                        );
                        return Err(StudioflowError::ResumeRetryable {
                            run_id: run_id.to_string(),
                            event_kind: event_kind.to_string(),
                        });
                    }
                    tokio::time::sleep(self.poll_interval).await;
                }
                count => {
                    return Err(StudioflowError::AmbiguousInterrupt {
                        run_id: run_id.to_string(),
                        event_kind: event_kind.to_string(),
                        count,
                    })
                }
            }
        }
    }

    /// Record a human decision on `gate`
    ///
    /// The run must be exactly `awaiting_<gate>`; anything else is a
    /// [`StudioflowError::StateMismatch`] for the caller to surface. A run found
    /// already past the gate gets its continuation re-queued first, so retrying a
    /// decision whose follow-up job was lost still moves the run on.
    pub async fn resume_hitl_gate(
        &self,
        run_id: &str,
        gate: &str,
        approved: bool,
        comment: Option<String>,
        data: Option<Value>,
    ) -> Result<RunProjection> {
        let expected = status::awaiting(gate);
        let payload = json!({ "approved": approved, "comment": comment, "data": data });

        loop {
            let run = self.engine.get_run(run_id).await?;
            if run.status != expected {
                let past_gate = match (Step::owning(gate), run.step()) {
                    (Some(owning), Ok(step)) => step > owning,
                    _ => false,
                };
                if past_gate {
                    self.schedule_advance(&run).await?;
                }
                return Err(StudioflowError::StateMismatch {
                    run_id: run_id.to_string(),
                    expected,
                    actual: run.status,
                });
            }

            let matching: Vec<_> = run
                .pending_interrupts
                .iter()
                .filter(|i| i.gate.as_deref() == Some(gate))
                .collect();
            let interrupt_id = match matching.as_slice() {
                [interrupt] => interrupt.id.clone(),
                [] => {
                    return Err(StudioflowError::NoPendingInterrupt {
                        run_id: run_id.to_string(),
                        event_kind: gate.to_string(),
                    })
                }
                many => {
                    return Err(StudioflowError::AmbiguousInterrupt {
                        run_id: run_id.to_string(),
                        event_kind: gate.to_string(),
                        count: many.len(),
                    })
                }
            };

            match self.engine.resume(run_id, &interrupt_id, payload.clone()).await {
                Ok(run) => {
                    info!(run_id, gate, approved, status = %run.status, "Gate decision applied");
                    self.schedule_advance(&run).await?;
                    return Ok(run);
                }
                Err(StudioflowError::ConcurrentModification(_))
                | Err(StudioflowError::InterruptNotFound { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Enqueue the job that carries a running run forward
    ///
    /// Returns whether a job was enqueued; suspended and terminal runs need none,
    /// and an active job for the same step is reused.
    pub async fn schedule_advance(&self, run: &RunProjection) -> Result<bool> {
        if run.is_terminal() || !run.pending_interrupts.is_empty() {
            return Ok(false);
        }

        let key = format!("{}:advance:{}", run.run_id, run.current_step);
        let job = NewJob::new(ADVANCE_JOB, &run.run_id)
            .with_idempotency_key(&key)
            .with_max_attempts(self.max_attempts);
        match self.jobs.insert(&job).await {
            Ok(job_id) => {
                debug!(
                    run_id = %run.run_id,
                    job_id = %job_id,
                    step = %run.current_step,
                    "Advance scheduled"
                );
                Ok(true)
            }
            Err(StudioflowError::DuplicateJob(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }
}
