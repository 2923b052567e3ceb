//! Workflow engine
//!
//! Drives a pipeline run step by step. Each step execution ends in exactly one
//! checkpoint commit, which is the only durable mutation a step makes besides its
//! idempotent calls to external collaborators. A commit is a compare-and-swap on the
//! checkpoint version; a lost race surfaces as
//! [`StudioflowError::ConcurrentModification`] and nothing is written.
//!
//! Suspension works by returning [`StepTransition::Suspend`] from a step: the commit
//! records a pending [`Interrupt`] and the run status becomes `awaiting_<kind>`.
//! [`WorkflowEngine::resume`] later re-enters exactly that step with the event
//! payload as the result of the suspended call.

use crate::backends::{Backends, ClipRequest};
use crate::error::{Result, StudioflowError};
use crate::models::Run;
use crate::repositories::RunRepository;
use crate::safety::{SafetyGuard, Verdict, SYSTEM_ERROR};
use crate::workflow::state::{AuditEntry, PipelineState};
use crate::workflow::step::{
    status, Step, HITL_EVENT, PUBLISH_APPROVAL_GATE, RENDER_EVENT, VIDEOS_EVENT,
};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use studioflow_checkpoint::{Checkpoint, CheckpointMetadata, CheckpointSaver, Interrupt};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Outcome of executing one step
#[derive(Debug, Clone, PartialEq)]
pub enum StepTransition {
    /// Move to another step
    Next(Step),
    /// Halt until an event of `waiting_for` (or a decision on `gate`) arrives
    Suspend {
        waiting_for: String,
        gate: Option<String>,
    },
    Complete,
    Reject { reason: String },
    Fail { reason: String },
}

/// Read view of a run
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunProjection {
    pub run_id: String,
    pub workflow_name: String,
    pub status: String,
    pub current_step: String,
    pub artifacts: Value,
    pub error: Option<String>,
    /// Empty for runs read from the projection table only
    #[serde(default)]
    pub pending_interrupts: Vec<Interrupt>,
}

impl RunProjection {
    pub fn from_checkpoint(checkpoint: &Checkpoint) -> Self {
        Self {
            run_id: checkpoint.run_id.clone(),
            workflow_name: checkpoint.metadata.workflow_name.clone(),
            status: checkpoint.metadata.status.clone(),
            current_step: checkpoint.metadata.current_step.clone(),
            artifacts: checkpoint.metadata.artifacts.clone(),
            error: checkpoint.metadata.error.clone(),
            pending_interrupts: checkpoint.pending_interrupts.clone(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        status::is_terminal(&self.status)
    }

    pub fn step(&self) -> Result<Step> {
        self.current_step.parse()
    }
}

impl From<Run> for RunProjection {
    fn from(run: Run) -> Self {
        let artifacts = run.artifacts_json().unwrap_or(Value::Null);
        Self {
            run_id: run.id,
            workflow_name: run.workflow_name,
            status: run.status,
            current_step: run.current_step,
            artifacts,
            error: run.error,
            pending_interrupts: Vec::new(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct VideosPayload {
    video_urls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RenderPayload {
    video_url: String,
}

#[derive(Debug, Deserialize)]
struct ApprovalPayload {
    approved: bool,
    #[serde(default)]
    comment: Option<String>,
    #[serde(default)]
    data: Option<Value>,
}

fn parse_payload<T: serde::de::DeserializeOwned>(step: Step, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| StudioflowError::Validation(format!("invalid resume payload for {step}: {e}")))
}

/// Idempotency key for a side effect of `step`
fn step_key(run_id: &str, step: Step, n: Option<usize>) -> String {
    match n {
        Some(n) => format!("{run_id}:{step}:{n}"),
        None => format!("{run_id}:{step}"),
    }
}

/// Executes and persists pipeline runs
#[derive(Clone)]
pub struct WorkflowEngine {
    checkpoints: Arc<dyn CheckpointSaver>,
    runs: RunRepository,
    backends: Backends,
    safety: SafetyGuard,
}

impl std::fmt::Debug for WorkflowEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkflowEngine").finish_non_exhaustive()
    }
}

impl WorkflowEngine {
    /// `backends.video` is expected to be breaker-wrapped already
    pub fn new(
        checkpoints: Arc<dyn CheckpointSaver>,
        runs: RunRepository,
        backends: Backends,
        safety: SafetyGuard,
    ) -> Self {
        Self {
            checkpoints,
            runs,
            backends,
            safety,
        }
    }

    /// Create a run positioned at `ideation`
    pub async fn start_run(&self, workflow_name: &str, brief: &str) -> Result<RunProjection> {
        let run_id = Uuid::new_v4().to_string();
        let state = PipelineState::new(brief);
        let mut metadata =
            CheckpointMetadata::new(workflow_name, status::RUNNING, Step::Ideation.as_str());
        metadata.artifacts = state.artifacts();

        let checkpoint = Checkpoint::new(&run_id, serde_json::to_value(&state)?, metadata);
        let stored = self.checkpoints.put(checkpoint).await?;

        info!(run_id = %run_id, workflow = workflow_name, "Run started");
        Ok(RunProjection::from_checkpoint(&stored))
    }

    /// Current checkpoint of a run, if it has one
    pub async fn checkpoint(&self, run_id: &str) -> Result<Option<Checkpoint>> {
        Ok(self.checkpoints.get(run_id).await?)
    }

    /// Projection of a run, falling back to the runs table for pruned runs
    pub async fn get_run(&self, run_id: &str) -> Result<RunProjection> {
        match self.checkpoints.get(run_id).await? {
            Some(checkpoint) => Ok(RunProjection::from_checkpoint(&checkpoint)),
            None => Ok(self.runs.get(run_id).await?.into()),
        }
    }

    /// Execute steps until the run suspends or ends
    ///
    /// A no-op on runs that are already suspended or terminal.
    pub async fn advance(&self, run_id: &str) -> Result<RunProjection> {
        loop {
            let (checkpoint, state) = self.load(run_id).await?;
            if status::is_terminal(&checkpoint.metadata.status) || checkpoint.is_suspended() {
                return Ok(RunProjection::from_checkpoint(&checkpoint));
            }
            self.execute_and_commit(checkpoint, state, None).await?;
        }
    }

    /// Execute at most one step
    pub async fn advance_one(&self, run_id: &str) -> Result<RunProjection> {
        let (checkpoint, state) = self.load(run_id).await?;
        if status::is_terminal(&checkpoint.metadata.status) || checkpoint.is_suspended() {
            return Ok(RunProjection::from_checkpoint(&checkpoint));
        }
        let committed = self.execute_and_commit(checkpoint, state, None).await?;
        Ok(RunProjection::from_checkpoint(&committed))
    }

    /// Resume the step suspended on `interrupt_id` with `payload`
    ///
    /// Only the resumed step runs; the caller schedules whatever follows. Resuming a
    /// terminal run is a no-op.
    pub async fn resume(
        &self,
        run_id: &str,
        interrupt_id: &str,
        payload: Value,
    ) -> Result<RunProjection> {
        let (mut checkpoint, state) = self.load(run_id).await?;
        if status::is_terminal(&checkpoint.metadata.status) {
            debug!(run_id, "Resume of a terminal run ignored");
            return Ok(RunProjection::from_checkpoint(&checkpoint));
        }

        let interrupt = checkpoint.take_interrupt(interrupt_id).ok_or_else(|| {
            StudioflowError::InterruptNotFound {
                run_id: run_id.to_string(),
                interrupt_id: interrupt_id.to_string(),
            }
        })?;
        if interrupt.step != checkpoint.metadata.current_step {
            return Err(StudioflowError::Validation(format!(
                "interrupt {} was raised by '{}' but run {run_id} is at '{}'",
                interrupt.id, interrupt.step, checkpoint.metadata.current_step
            )));
        }

        info!(
            run_id,
            interrupt_id,
            kind = interrupt.kind(),
            step = %interrupt.step,
            "Resuming run"
        );
        let committed = self.execute_and_commit(checkpoint, state, Some(payload)).await?;
        Ok(RunProjection::from_checkpoint(&committed))
    }

    /// Mark a non-terminal run failed; a no-op on terminal runs
    pub async fn fail_run(&self, run_id: &str, error: &str) -> Result<RunProjection> {
        loop {
            let (mut checkpoint, _) = self.load(run_id).await?;
            if status::is_terminal(&checkpoint.metadata.status) {
                return Ok(RunProjection::from_checkpoint(&checkpoint));
            }

            checkpoint.pending_interrupts.clear();
            checkpoint.metadata.current_step = Step::Failed.as_str().to_string();
            checkpoint.metadata.status = status::FAILED.to_string();
            checkpoint.metadata.error = Some(error.to_string());

            match self.checkpoints.put(checkpoint).await.map_err(StudioflowError::from) {
                Ok(stored) => {
                    warn!(run_id, error, "Run failed");
                    return Ok(RunProjection::from_checkpoint(&stored));
                }
                Err(StudioflowError::ConcurrentModification(_)) => continue,
                Err(e) => return Err(e),
            }
        }
    }

    /// Delete the checkpoint of a terminal run; the projection row stays
    pub async fn prune(&self, run_id: &str) -> Result<bool> {
        let Some(checkpoint) = self.checkpoints.get(run_id).await? else {
            return Ok(false);
        };
        if !status::is_terminal(&checkpoint.metadata.status) {
            return Err(StudioflowError::Validation(format!(
                "run {run_id} is '{}', only terminal runs can be pruned",
                checkpoint.metadata.status
            )));
        }
        Ok(self.checkpoints.delete(run_id).await?)
    }

    pub async fn checkpoint_store_healthy(&self) -> bool {
        self.checkpoints.healthy().await
    }

    async fn load(&self, run_id: &str) -> Result<(Checkpoint, PipelineState)> {
        let checkpoint = self
            .checkpoints
            .get(run_id)
            .await?
            .ok_or_else(|| StudioflowError::RunNotFound(run_id.to_string()))?;
        let state: PipelineState = serde_json::from_value(checkpoint.state.clone())?;
        Ok((checkpoint, state))
    }

    async fn execute_and_commit(
        &self,
        mut checkpoint: Checkpoint,
        mut state: PipelineState,
        resume: Option<Value>,
    ) -> Result<Checkpoint> {
        let run_id = checkpoint.run_id.clone();
        let step: Step = checkpoint.metadata.current_step.parse()?;
        let transition = self.execute(&run_id, step, &mut state, resume).await?;

        let metadata = &mut checkpoint.metadata;
        match &transition {
            StepTransition::Next(next) => {
                metadata.current_step = next.as_str().to_string();
                metadata.status = status::RUNNING.to_string();
            }
            StepTransition::Suspend { waiting_for, gate } => {
                let mut interrupt = Interrupt::new(waiting_for.as_str(), step.as_str());
                if let Some(gate) = gate {
                    interrupt = interrupt.with_gate(gate.as_str());
                }
                metadata.status = status::awaiting(interrupt.kind());
                checkpoint.push_interrupt(interrupt)?;
            }
            StepTransition::Complete => {
                metadata.current_step = Step::Completed.as_str().to_string();
                metadata.status = status::COMPLETED.to_string();
            }
            StepTransition::Reject { reason } => {
                metadata.current_step = Step::Rejected.as_str().to_string();
                metadata.status = status::REJECTED.to_string();
                metadata.error = Some(reason.clone());
            }
            StepTransition::Fail { reason } => {
                metadata.current_step = Step::Failed.as_str().to_string();
                metadata.status = status::FAILED.to_string();
                metadata.error = Some(reason.clone());
            }
        }
        checkpoint.metadata.artifacts = state.artifacts();
        checkpoint.state = serde_json::to_value(&state)?;

        let stored = self.checkpoints.put(checkpoint).await?;
        info!(
            run_id = %run_id,
            from = %step,
            to = %stored.metadata.current_step,
            status = %stored.metadata.status,
            version = stored.version,
            "Step committed"
        );
        Ok(stored)
    }

    async fn execute(
        &self,
        run_id: &str,
        step: Step,
        state: &mut PipelineState,
        resume: Option<Value>,
    ) -> Result<StepTransition> {
        match step {
            Step::Ideation => self.ideation(run_id, state).await,
            Step::Production => self.production(run_id, state).await,
            Step::WaitForVideos => match resume {
                None => Ok(suspend(VIDEOS_EVENT, None)),
                Some(payload) => {
                    let payload: VideosPayload = parse_payload(step, payload)?;
                    if payload.video_urls.is_empty() {
                        return Err(StudioflowError::Validation(
                            "videos event carries no video_urls".to_string(),
                        ));
                    }
                    state.video_urls = payload.video_urls;
                    Ok(StepTransition::Next(Step::Editing))
                }
            },
            Step::Editing => {
                let render_id = self
                    .backends
                    .render
                    .submit_render(&step_key(run_id, step, None), run_id, &state.video_urls)
                    .await?;
                state.render_id = Some(render_id);
                Ok(StepTransition::Next(Step::WaitForRender))
            }
            Step::WaitForRender => match resume {
                None => Ok(suspend(RENDER_EVENT, None)),
                Some(payload) => {
                    let payload: RenderPayload = parse_payload(step, payload)?;
                    state.final_video_url = Some(payload.video_url);
                    Ok(StepTransition::Next(Step::PublishApproval))
                }
            },
            Step::PublishApproval => self.publish_approval(run_id, state, resume).await,
            Step::Publishing => {
                let video_url = state.final_video_url.clone().ok_or_else(|| {
                    StudioflowError::Validation(format!("run {run_id} has no final video"))
                })?;
                let caption = state
                    .script
                    .as_ref()
                    .map(|s| s.caption.clone())
                    .unwrap_or_default();
                let receipt = self
                    .backends
                    .publisher
                    .publish(&step_key(run_id, step, None), &video_url, &caption)
                    .await?;
                state.publish_receipt = Some(receipt);
                Ok(StepTransition::Complete)
            }
            Step::Completed | Step::Failed | Step::Rejected => Err(StudioflowError::Validation(
                format!("run {run_id} is already {step}"),
            )),
        }
    }

    async fn ideation(&self, run_id: &str, state: &mut PipelineState) -> Result<StepTransition> {
        let script = self
            .backends
            .script_writer
            .draft(&step_key(run_id, Step::Ideation, None), &state.brief)
            .await?;

        let mut text = format!("{}\n{}", script.title, script.body);
        for scene in &script.scenes {
            text.push('\n');
            text.push_str(&scene.prompt);
        }
        state.script = Some(script);

        if let Some(transition) = self.moderate(run_id, state, &text, "script").await? {
            return Ok(transition);
        }
        Ok(StepTransition::Next(Step::Production))
    }

    async fn production(&self, run_id: &str, state: &mut PipelineState) -> Result<StepTransition> {
        let scenes = state
            .script
            .as_ref()
            .map(|s| s.scenes.clone())
            .ok_or_else(|| StudioflowError::Validation(format!("run {run_id} has no script")))?;

        let mut clip_ids = Vec::with_capacity(scenes.len());
        for scene in &scenes {
            let request = ClipRequest {
                idempotency_key: step_key(run_id, Step::Production, Some(scene.index)),
                run_id: run_id.to_string(),
                prompt: scene.prompt.clone(),
                duration_seconds: scene.duration_seconds,
            };
            clip_ids.push(self.backends.video.submit_clip(&request).await?);
        }
        debug!(run_id, clips = clip_ids.len(), "Clips submitted");
        state.clip_ids = clip_ids;
        Ok(StepTransition::Next(Step::WaitForVideos))
    }

    async fn publish_approval(
        &self,
        run_id: &str,
        state: &mut PipelineState,
        resume: Option<Value>,
    ) -> Result<StepTransition> {
        // Re-runs on resume; the verdict cache keeps the decision stable
        let caption = state
            .script
            .as_ref()
            .map(|s| s.caption.clone())
            .unwrap_or_default();
        if let Some(transition) = self.moderate(run_id, state, &caption, "caption").await? {
            return Ok(transition);
        }

        let Some(payload) = resume else {
            return Ok(suspend(HITL_EVENT, Some(PUBLISH_APPROVAL_GATE)));
        };
        let decision: ApprovalPayload = parse_payload(Step::PublishApproval, payload)?;
        state.approved = Some(decision.approved);
        state.audit_log.push(AuditEntry {
            gate: PUBLISH_APPROVAL_GATE.to_string(),
            approved: decision.approved,
            comment: decision.comment.clone(),
            data: decision.data,
            decided_at: Utc::now(),
        });

        if decision.approved {
            Ok(StepTransition::Next(Step::Publishing))
        } else {
            let reason = match decision.comment {
                Some(comment) => format!("rejected at {PUBLISH_APPROVAL_GATE}: {comment}"),
                None => format!("rejected at {PUBLISH_APPROVAL_GATE}"),
            };
            Ok(StepTransition::Reject { reason })
        }
    }

    /// Moderate `content`; `Some` stops the step
    ///
    /// A shield outage is returned as a transient error so the step is retried and
    /// the content re-checked.
    async fn moderate(
        &self,
        run_id: &str,
        state: &mut PipelineState,
        content: &str,
        what: &str,
    ) -> Result<Option<StepTransition>> {
        let entry = self.safety.check(run_id, &mut state.safety_cache, content).await;
        match (entry.verdict, entry.category.as_deref()) {
            (Verdict::Safe, _) => Ok(None),
            (Verdict::Unsafe, Some(SYSTEM_ERROR)) => Err(StudioflowError::backend(
                "safety_shield",
                format!("{what} could not be moderated"),
            )),
            (Verdict::Unsafe, category) => {
                let category = category.unwrap_or("unspecified");
                warn!(run_id, what, category, "Content blocked");
                Ok(Some(StepTransition::Fail {
                    reason: format!("{what} blocked by safety shield ({category})"),
                }))
            }
        }
    }
}

fn suspend(waiting_for: &str, gate: Option<&str>) -> StepTransition {
    StepTransition::Suspend {
        waiting_for: waiting_for.to_string(),
        gate: gate.map(str::to_string),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::SimulatedStudio;
    use crate::db::Database;
    use serde_json::json;
    use studioflow_checkpoint::InMemoryCheckpointSaver;

    async fn engine() -> (WorkflowEngine, Arc<SimulatedStudio>) {
        let db = Database::in_memory().await.unwrap();
        db.run_migrations().await.unwrap();
        let studio = Arc::new(SimulatedStudio::new());
        let backends = Backends::simulated(studio.clone());
        let engine = WorkflowEngine::new(
            Arc::new(InMemoryCheckpointSaver::new()),
            RunRepository::new(db),
            backends.clone(),
            SafetyGuard::new(backends.shield.clone()),
        );
        (engine, studio)
    }

    #[tokio::test]
    async fn test_advance_suspends_on_videos() {
        let (engine, studio) = engine().await;
        let run = engine.start_run("video_pipeline", "northern lights").await.unwrap();
        assert_eq!(run.current_step, "ideation");

        let run = engine.advance(&run.run_id).await.unwrap();
        assert_eq!(run.current_step, "wait_for_videos");
        assert_eq!(run.status, "awaiting_videos");
        assert_eq!(run.pending_interrupts.len(), 1);
        assert_eq!(studio.clip_submissions(), 3);

        // Suspended runs do not move
        let again = engine.advance(&run.run_id).await.unwrap();
        assert_eq!(again.current_step, "wait_for_videos");
        assert_eq!(studio.clip_submissions(), 3);
    }

    #[tokio::test]
    async fn test_resume_runs_only_the_suspended_step() {
        let (engine, _) = engine().await;
        let run = engine.start_run("video_pipeline", "river delta").await.unwrap();
        let run = engine.advance(&run.run_id).await.unwrap();
        let interrupt_id = run.pending_interrupts[0].id.clone();

        let resumed = engine
            .resume(&run.run_id, &interrupt_id, json!({"video_urls": ["a.mp4", "b.mp4"]}))
            .await
            .unwrap();
        assert_eq!(resumed.current_step, "editing");
        assert_eq!(resumed.status, "running");
        assert!(resumed.pending_interrupts.is_empty());
        assert_eq!(resumed.artifacts["video_urls"], json!(["a.mp4", "b.mp4"]));

        let err = engine
            .resume(&run.run_id, &interrupt_id, json!({"video_urls": ["a.mp4"]}))
            .await
            .unwrap_err();
        match &err {
            StudioflowError::InterruptNotFound { interrupt_id: missing, .. } => {
                assert_eq!(missing, &interrupt_id);
            }
            other => panic!("unexpected error: {other}"),
        }
        assert!(err.to_string().contains(&interrupt_id));
        assert!(!err.is_transient());
    }

    #[tokio::test]
    async fn test_bad_payload_leaves_interrupt_pending() {
        let (engine, _) = engine().await;
        let run = engine.start_run("video_pipeline", "glaciers").await.unwrap();
        let run = engine.advance(&run.run_id).await.unwrap();
        let interrupt_id = run.pending_interrupts[0].id.clone();

        let err = engine
            .resume(&run.run_id, &interrupt_id, json!({"video_urls": []}))
            .await
            .unwrap_err();
        assert!(matches!(err, StudioflowError::Validation(_)));

        let run = engine.get_run(&run.run_id).await.unwrap();
        assert_eq!(run.status, "awaiting_videos");
        assert_eq!(run.pending_interrupts.len(), 1);
    }

    #[tokio::test]
    async fn test_flagged_script_fails_run() {
        let (engine, studio) = engine().await;
        studio.flag_term("contraband", "policy");
        let run = engine.start_run("video_pipeline", "contraband review").await.unwrap();

        let run = engine.advance(&run.run_id).await.unwrap();
        assert_eq!(run.status, "failed");
        assert_eq!(run.current_step, "failed");
        assert!(run.error.unwrap().contains("policy"));
        assert_eq!(studio.clip_submissions(), 0);
    }

    #[tokio::test]
    async fn test_shield_outage_is_transient() {
        let (engine, studio) = engine().await;
        studio.set_shield_outage(true);
        let run = engine.start_run("video_pipeline", "orchards").await.unwrap();

        let err = engine.advance(&run.run_id).await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(engine.get_run(&run.run_id).await.unwrap().current_step, "ideation");

        studio.set_shield_outage(false);
        let run = engine.advance(&run.run_id).await.unwrap();
        assert_eq!(run.status, "awaiting_videos");
    }

    #[tokio::test]
    async fn test_fail_run_and_prune() {
        let (engine, _) = engine().await;
        let run = engine.start_run("video_pipeline", "deserts").await.unwrap();

        let err = engine.prune(&run.run_id).await.unwrap_err();
        assert!(matches!(err, StudioflowError::Validation(_)));

        let failed = engine.fail_run(&run.run_id, "render exhausted").await.unwrap();
        assert_eq!(failed.status, "failed");
        let again = engine.fail_run(&run.run_id, "other").await.unwrap();
        assert_eq!(again.error.as_deref(), Some("render exhausted"));

        assert!(engine.prune(&run.run_id).await.unwrap());
        assert!(engine.checkpoint(&run.run_id).await.unwrap().is_none());
    }
}
