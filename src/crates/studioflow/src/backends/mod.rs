//! External collaborators used by pipeline steps
//!
//! Each collaborator is an explicit trait listing only the operations the pipeline
//! uses. Every mutating call carries an idempotency key derived from the run and
//! step (`<run_id>:<step>[:<n>]`), so a step re-executed after a crash or a lost
//! lease does not duplicate the side effect.
//!
//! - [`guarded`] wraps the video generator in the circuit breaker
//! - [`simulated`] is a deterministic in-process implementation of everything

pub mod guarded;
pub mod simulated;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use guarded::CircuitBreakingVideoGenerator;
pub use simulated::SimulatedStudio;

/// One scene of a drafted script
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Scene {
    pub index: usize,
    /// Prompt sent to the video generator
    pub prompt: String,
    pub duration_seconds: u32,
}

/// Script produced by ideation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Script {
    pub title: String,
    pub body: String,
    /// Caption used when publishing
    pub caption: String,
    pub scenes: Vec<Scene>,
}

/// Clip submission
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClipRequest {
    pub idempotency_key: String,
    pub run_id: String,
    pub prompt: String,
    pub duration_seconds: u32,
}

/// Progress of a submitted render
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RenderStatus {
    Pending,
    Done { video_url: String },
    Failed { reason: String },
}

/// Confirmation from the publishing platform
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PublishReceipt {
    pub post_id: String,
    pub url: String,
}

/// Raw moderation result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModerationResult {
    pub safe: bool,
    /// Violation category when unsafe (e.g. `policy`, `violence`)
    pub category: Option<String>,
}

#[async_trait]
pub trait ScriptWriter: Send + Sync {
    async fn draft(&self, idempotency_key: &str, brief: &str) -> Result<Script>;
}

/// Asynchronous clip generation; results arrive by webhook
#[async_trait]
pub trait VideoGenerator: Send + Sync {
    /// Submit a clip, returning the provider's clip ID
    async fn submit_clip(&self, request: &ClipRequest) -> Result<String>;
}

/// Asynchronous final render; results arrive by webhook or polling
#[async_trait]
pub trait RenderService: Send + Sync {
    /// Submit a render of the given clips, returning the render ID
    async fn submit_render(
        &self,
        idempotency_key: &str,
        run_id: &str,
        video_urls: &[String],
    ) -> Result<String>;

    async fn render_status(&self, render_id: &str) -> Result<RenderStatus>;
}

#[async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        idempotency_key: &str,
        video_url: &str,
        caption: &str,
    ) -> Result<PublishReceipt>;
}

/// Content moderation
#[async_trait]
pub trait SafetyShield: Send + Sync {
    async fn moderate(&self, content: &str) -> Result<ModerationResult>;
}

/// The full set of collaborators, injected at startup
#[derive(Clone)]
pub struct Backends {
    pub script_writer: Arc<dyn ScriptWriter>,
    pub video: Arc<dyn VideoGenerator>,
    pub render: Arc<dyn RenderService>,
    pub publisher: Arc<dyn Publisher>,
    pub shield: Arc<dyn SafetyShield>,
}

impl Backends {
    /// Every collaborator served by one simulated studio
    pub fn simulated(studio: Arc<SimulatedStudio>) -> Self {
        Self {
            script_writer: studio.clone(),
            video: studio.clone(),
            render: studio.clone(),
            publisher: studio.clone(),
            shield: studio,
        }
    }
}

impl std::fmt::Debug for Backends {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backends").finish_non_exhaustive()
    }
}
