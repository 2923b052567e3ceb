//! Job handlers wiring the queue to the workflow
//!
//! | Job type | Handler | Terminal failure |
//! |----------|---------|------------------|
//! | `pipeline.advance` | [`PipelineHandler`] | run marked failed |
//! | `webhook.videos` | [`WebhookHandler`] | dead letter (`video_generation`) |
//! | `webhook.render` | [`WebhookHandler`] | dead letter (`render`) |
//! | `render.poll` | [`RenderPollHandler`] | run marked failed |

use crate::backends::{RenderService, RenderStatus};
use crate::dead_letter::DeadLetterSource;
use crate::error::{Result, StudioflowError};
use crate::models::Job;
use crate::queue::{HandlerOutcome, JobHandler};
use crate::repositories::{JobRepository, NewJob};
use crate::workflow::step::{status, Step, RENDER_EVENT};
use crate::workflow::{ResumeDispatcher, WorkflowEngine};
use async_trait::async_trait;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

pub const ADVANCE_JOB: &str = "pipeline.advance";
pub const VIDEOS_WEBHOOK_JOB: &str = "webhook.videos";
pub const RENDER_WEBHOOK_JOB: &str = "webhook.render";
pub const RENDER_POLL_JOB: &str = "render.poll";

/// Job type carrying webhook deliveries of `source`
pub fn webhook_job_type(source: DeadLetterSource) -> &'static str {
    match source {
        DeadLetterSource::VideoGeneration => VIDEOS_WEBHOOK_JOB,
        DeadLetterSource::Render => RENDER_WEBHOOK_JOB,
    }
}

/// Render polling schedule
#[derive(Debug, Clone, Copy)]
pub struct RenderPolling {
    pub interval: Duration,
    pub max_attempts: u32,
}

/// Advances a run until it suspends or ends
#[derive(Debug, Clone)]
pub struct PipelineHandler {
    engine: WorkflowEngine,
    jobs: JobRepository,
    render_polling: Option<RenderPolling>,
}

impl PipelineHandler {
    pub fn new(engine: WorkflowEngine, jobs: JobRepository) -> Self {
        Self {
            engine,
            jobs,
            render_polling: None,
        }
    }

    /// Also poll the render service while the run awaits its render
    pub fn with_render_polling(mut self, polling: Option<RenderPolling>) -> Self {
        self.render_polling = polling;
        self
    }

    async fn schedule_render_poll(&self, run_id: &str, render_id: &str) -> Result<()> {
        let Some(polling) = self.render_polling else {
            return Ok(());
        };
        let job = NewJob::new(RENDER_POLL_JOB, run_id)
            .with_payload(json!({ "render_id": render_id }))
            .with_idempotency_key(format!("{run_id}:{RENDER_POLL_JOB}"))
            .with_max_attempts(polling.max_attempts)
            .with_delay(polling.interval);
        match self.jobs.insert(&job).await {
            Ok(job_id) => {
                debug!(run_id, job_id = %job_id, render_id, "Render poll scheduled");
                Ok(())
            }
            Err(StudioflowError::DuplicateJob(_)) => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl JobHandler for PipelineHandler {
    fn job_type(&self) -> &'static str {
        ADVANCE_JOB
    }

    async fn handle(&self, job: &Job) -> HandlerOutcome {
        let run = match self.engine.advance(&job.run_id).await {
            Ok(run) => run,
            Err(e) => return HandlerOutcome::Failure(e),
        };

        if run.status == status::awaiting(RENDER_EVENT) {
            if let Some(render_id) = run.artifacts.get("render_id").and_then(Value::as_str) {
                if let Err(e) = self.schedule_render_poll(&run.run_id, render_id).await {
                    return HandlerOutcome::Failure(e);
                }
            }
        }
        HandlerOutcome::Success
    }

    async fn on_terminal_failure(&self, job: &Job, error: &str) -> Result<()> {
        self.engine.fail_run(&job.run_id, error).await?;
        Ok(())
    }
}

/// Delivers a webhook payload to the run it targets
#[derive(Debug, Clone)]
pub struct WebhookHandler {
    source: DeadLetterSource,
    dispatcher: ResumeDispatcher,
}

impl WebhookHandler {
    pub fn new(source: DeadLetterSource, dispatcher: ResumeDispatcher) -> Self {
        Self { source, dispatcher }
    }
}

#[async_trait]
impl JobHandler for WebhookHandler {
    fn job_type(&self) -> &'static str {
        webhook_job_type(self.source)
    }

    fn dead_letter_source(&self) -> Option<DeadLetterSource> {
        Some(self.source)
    }

    async fn handle(&self, job: &Job) -> HandlerOutcome {
        let payload = match job.payload_json() {
            Ok(payload) => payload,
            Err(e) => return HandlerOutcome::Failure(e),
        };
        match self.source.dispatch(&self.dispatcher, &job.run_id, &payload).await {
            Ok(outcome) => {
                debug!(
                    job_id = %job.id,
                    run_id = %job.run_id,
                    noop = outcome.is_noop(),
                    "Webhook delivered"
                );
                HandlerOutcome::Success
            }
            Err(e) => HandlerOutcome::Failure(e),
        }
    }
}

/// Polls the render service and resumes the run once the render is done
pub struct RenderPollHandler {
    render: Arc<dyn RenderService>,
    dispatcher: ResumeDispatcher,
    interval: Duration,
}

impl RenderPollHandler {
    pub fn new(
        render: Arc<dyn RenderService>,
        dispatcher: ResumeDispatcher,
        interval: Duration,
    ) -> Self {
        Self {
            render,
            dispatcher,
            interval,
        }
    }

    async fn poll(&self, job: &Job) -> Result<HandlerOutcome> {
        let run = self.dispatcher.engine().get_run(&job.run_id).await?;
        if run.is_terminal() {
            return Ok(HandlerOutcome::Success);
        }
        if run.step()? > Step::WaitForRender {
            // Resumed elsewhere; make sure the follow-up advance exists
            self.dispatcher.schedule_advance(&run).await?;
            return Ok(HandlerOutcome::Success);
        }

        let payload = job.payload_json()?;
        let render_id = payload
            .get("render_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                StudioflowError::Validation("render poll needs 'render_id'".to_string())
            })?;

        match self.render.render_status(render_id).await? {
            RenderStatus::Pending => Ok(HandlerOutcome::reschedule(
                self.interval,
                format!("render {render_id} still pending"),
            )),
            RenderStatus::Done { video_url } => {
                self.dispatcher.resume_after_render(&job.run_id, &video_url).await?;
                info!(run_id = %job.run_id, render_id, "Render picked up by polling");
                Ok(HandlerOutcome::Success)
            }
            RenderStatus::Failed { reason } => Err(StudioflowError::Validation(format!(
                "render {render_id} failed: {reason}"
            ))),
        }
    }
}

#[async_trait]
impl JobHandler for RenderPollHandler {
    fn job_type(&self) -> &'static str {
        RENDER_POLL_JOB
    }

    async fn handle(&self, job: &Job) -> HandlerOutcome {
        self.poll(job).await.unwrap_or_else(HandlerOutcome::Failure)
    }

    async fn on_terminal_failure(&self, job: &Job, error: &str) -> Result<()> {
        self.dispatcher.engine().fail_run(&job.run_id, error).await?;
        Ok(())
    }
}
