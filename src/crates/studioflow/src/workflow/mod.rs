//! Resumable pipeline workflow
//!
//! - [`step`] - pipeline steps, event kinds and run statuses
//! - [`state`] - run variables stored in the checkpoint
//! - [`engine`] - step execution and checkpoint commits
//! - [`dispatcher`] - routes events and HITL decisions to pending interrupts

pub mod dispatcher;
pub mod engine;
pub mod state;
pub mod step;

pub use dispatcher::{ResumeDispatcher, ResumeOutcome};
pub use engine::{RunProjection, StepTransition, WorkflowEngine};
pub use state::{AuditEntry, PipelineState};
pub use step::Step;
