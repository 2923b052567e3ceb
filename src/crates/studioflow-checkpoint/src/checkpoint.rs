//! Checkpoint and interrupt data structures
//!
//! A [`Checkpoint`] is the single, overwritten snapshot of one run: its serialized
//! variables, the interrupts it is currently suspended on, and the projection fields
//! (`status`, `current_step`, `error`, `artifacts`) that readers see.
//!
//! # Interrupts
//!
//! An [`Interrupt`] is a durable suspension point. It is identified by `id` and
//! matched against inbound events by its *kind*: the HITL gate name when `gate` is
//! set, otherwise `waiting_for`. A checkpoint never carries two pending interrupts
//! of the same kind; [`Checkpoint::push_interrupt`] enforces this.
//!
//! # Versions
//!
//! `version` starts at `0` for a checkpoint that has never been stored. Every
//! successful [`CheckpointSaver::put`](crate::CheckpointSaver::put) increments it, and
//! a `put` carrying a stale version is rejected with
//! [`CheckpointError::Conflict`](crate::CheckpointError::Conflict).

use crate::error::{CheckpointError, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A durable suspension point awaiting an external event or a human decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Interrupt {
    /// Unique interrupt identifier
    pub id: String,

    /// Event kind the run is waiting for (e.g. `videos`, `render`, `hitl`)
    pub waiting_for: String,

    /// HITL gate name, when the interrupt awaits a human decision
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<String>,

    /// Step that raised the interrupt
    pub step: String,

    /// When the interrupt was raised
    pub created_at: DateTime<Utc>,
}

impl Interrupt {
    /// Create an interrupt raised by `step`, waiting for `waiting_for`
    pub fn new(waiting_for: impl Into<String>, step: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            waiting_for: waiting_for.into(),
            gate: None,
            step: step.into(),
            created_at: Utc::now(),
        }
    }

    /// Attach a HITL gate name
    pub fn with_gate(mut self, gate: impl Into<String>) -> Self {
        self.gate = Some(gate.into());
        self
    }

    /// Kind used for uniqueness: the gate if present, else `waiting_for`
    pub fn kind(&self) -> &str {
        self.gate.as_deref().unwrap_or(&self.waiting_for)
    }

    /// Whether an inbound event of `event_kind` targets this interrupt
    pub fn matches(&self, event_kind: &str) -> bool {
        self.waiting_for == event_kind || self.gate.as_deref() == Some(event_kind)
    }
}

/// Projection fields stored alongside the checkpoint state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMetadata {
    /// Name of the workflow definition
    pub workflow_name: String,

    /// Run status (e.g. `running`, `awaiting_render`, `completed`)
    pub status: String,

    /// Step the run is positioned at
    pub current_step: String,

    /// Human-readable failure or rejection reason
    #[serde(default)]
    pub error: Option<String>,

    /// Externally visible run outputs
    #[serde(default)]
    pub artifacts: Value,
}

impl CheckpointMetadata {
    /// Create metadata for a run positioned at `current_step`
    pub fn new(
        workflow_name: impl Into<String>,
        status: impl Into<String>,
        current_step: impl Into<String>,
    ) -> Self {
        Self {
            workflow_name: workflow_name.into(),
            status: status.into(),
            current_step: current_step.into(),
            error: None,
            artifacts: Value::Object(Default::default()),
        }
    }
}

/// Snapshot of a run sufficient to resume it
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Run this checkpoint belongs to
    pub run_id: String,

    /// Serialized run variables
    pub state: Value,

    /// Interrupts the run is currently suspended on
    #[serde(default)]
    pub pending_interrupts: Vec<Interrupt>,

    /// Projection fields
    pub metadata: CheckpointMetadata,

    /// Stored version this snapshot was read at (`0` = never stored)
    #[serde(default)]
    pub version: i64,

    /// Last time the checkpoint was stored
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    /// Create a not-yet-stored checkpoint
    pub fn new(run_id: impl Into<String>, state: Value, metadata: CheckpointMetadata) -> Self {
        Self {
            run_id: run_id.into(),
            state,
            pending_interrupts: Vec::new(),
            metadata,
            version: 0,
            updated_at: Utc::now(),
        }
    }

    /// Add a pending interrupt, refusing a second interrupt of the same kind
    pub fn push_interrupt(&mut self, interrupt: Interrupt) -> Result<()> {
        if self
            .pending_interrupts
            .iter()
            .any(|pending| pending.kind() == interrupt.kind())
        {
            return Err(CheckpointError::Invalid(format!(
                "run {} already has a pending '{}' interrupt",
                self.run_id,
                interrupt.kind()
            )));
        }
        self.pending_interrupts.push(interrupt);
        Ok(())
    }

    /// Remove and return the pending interrupt with `id`
    pub fn take_interrupt(&mut self, id: &str) -> Option<Interrupt> {
        let index = self.pending_interrupts.iter().position(|i| i.id == id)?;
        Some(self.pending_interrupts.remove(index))
    }

    /// Pending interrupts an event of `event_kind` would resume
    pub fn pending_matching(&self, event_kind: &str) -> Vec<&Interrupt> {
        self.pending_interrupts
            .iter()
            .filter(|i| i.matches(event_kind))
            .collect()
    }

    /// Whether the run is suspended
    pub fn is_suspended(&self) -> bool {
        !self.pending_interrupts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn checkpoint() -> Checkpoint {
        Checkpoint::new(
            "run-1",
            json!({"brief": "launch"}),
            CheckpointMetadata::new("pipeline", "running", "ideation"),
        )
    }

    #[test]
    fn test_interrupt_kind_prefers_gate() {
        let plain = Interrupt::new("videos", "wait_for_videos");
        assert_eq!(plain.kind(), "videos");

        let gated = Interrupt::new("hitl", "publish_approval").with_gate("publish_approval");
        assert_eq!(gated.kind(), "publish_approval");
        assert!(gated.matches("hitl"));
        assert!(gated.matches("publish_approval"));
        assert!(!gated.matches("render"));
    }

    #[test]
    fn test_push_interrupt_rejects_same_kind() {
        let mut cp = checkpoint();
        cp.push_interrupt(Interrupt::new("render", "wait_for_render")).unwrap();
        let err = cp
            .push_interrupt(Interrupt::new("render", "wait_for_render"))
            .unwrap_err();
        assert!(matches!(err, CheckpointError::Invalid(_)));
        assert_eq!(cp.pending_interrupts.len(), 1);

        // A different kind is fine
        cp.push_interrupt(Interrupt::new("videos", "wait_for_videos")).unwrap();
        assert_eq!(cp.pending_interrupts.len(), 2);
    }

    #[test]
    fn test_take_interrupt() {
        let mut cp = checkpoint();
        let interrupt = Interrupt::new("videos", "wait_for_videos");
        let id = interrupt.id.clone();
        cp.push_interrupt(interrupt).unwrap();
        assert!(cp.is_suspended());

        assert!(cp.take_interrupt("missing").is_none());
        let taken = cp.take_interrupt(&id).unwrap();
        assert_eq!(taken.waiting_for, "videos");
        assert!(!cp.is_suspended());
    }

    #[test]
    fn test_serde_roundtrip_keeps_interrupts() {
        let mut cp = checkpoint();
        cp.push_interrupt(Interrupt::new("hitl", "publish_approval").with_gate("publish_approval"))
            .unwrap();
        let encoded = serde_json::to_string(&cp).unwrap();
        let decoded: Checkpoint = serde_json::from_str(&encoded).unwrap();
        assert_eq!(decoded, cp);
        assert_eq!(decoded.pending_matching("publish_approval").len(), 1);
    }
}
