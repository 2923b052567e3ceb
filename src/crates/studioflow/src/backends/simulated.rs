//! Deterministic in-process studio
//!
//! Implements every collaborator trait without network access. Submissions are
//! keyed by idempotency key, so repeating a call returns the original result and
//! the counters show how many distinct side effects happened. Failure injection
//! knobs let tests exercise retries, the circuit breaker and the safety cache.

use super::{
    ClipRequest, ModerationResult, PublishReceipt, Publisher, RenderService, RenderStatus,
    SafetyShield, Scene, Script, ScriptWriter, VideoGenerator,
};
use crate::error::{Result, StudioflowError};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;

const SCENES_PER_SCRIPT: usize = 3;
const CDN: &str = "https://cdn.studioflow.test";

#[derive(Debug, Default)]
struct StudioState {
    scripts: HashMap<String, Script>,
    clips: HashMap<String, String>,
    renders: HashMap<String, String>,
    publications: HashMap<String, PublishReceipt>,
    video_calls: u64,
    moderation_calls: u64,
    fail_video_calls: u32,
    fail_script_calls: u32,
    shield_outage: bool,
    renders_pending: bool,
    flagged_terms: Vec<(String, String)>,
}

/// Simulated implementation of every external collaborator
#[derive(Debug, Default)]
pub struct SimulatedStudio {
    state: Mutex<StudioState>,
}

impl SimulatedStudio {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` video generator calls with a backend error
    pub fn fail_next_video_calls(&self, n: u32) {
        self.state.lock().fail_video_calls = n;
    }

    /// Fail the next `n` script drafts with a backend error
    pub fn fail_next_script_calls(&self, n: u32) {
        self.state.lock().fail_script_calls = n;
    }

    /// Make the moderation shield error out until cleared
    pub fn set_shield_outage(&self, outage: bool) {
        self.state.lock().shield_outage = outage;
    }

    /// Keep renders pending until cleared
    pub fn set_renders_pending(&self, pending: bool) {
        self.state.lock().renders_pending = pending;
    }

    /// Flag content containing `term` (case-insensitive) as unsafe
    pub fn flag_term(&self, term: impl Into<String>, category: impl Into<String>) {
        self.state
            .lock()
            .flagged_terms
            .push((term.into().to_lowercase(), category.into()));
    }

    /// Total video generator calls, including failed ones
    pub fn video_calls(&self) -> u64 {
        self.state.lock().video_calls
    }

    /// Distinct clips submitted
    pub fn clip_submissions(&self) -> usize {
        self.state.lock().clips.len()
    }

    /// Distinct renders submitted
    pub fn render_submissions(&self) -> usize {
        self.state.lock().renders.len()
    }

    /// Distinct publications
    pub fn publications(&self) -> usize {
        self.state.lock().publications.len()
    }

    pub fn moderation_calls(&self) -> u64 {
        self.state.lock().moderation_calls
    }

    /// URL a render with `render_id` resolves to
    pub fn render_url(render_id: &str) -> String {
        format!("{CDN}/renders/{render_id}.mp4")
    }

    /// URL a clip with `clip_id` resolves to
    pub fn clip_url(clip_id: &str) -> String {
        format!("{CDN}/clips/{clip_id}.mp4")
    }
}

/// Short stable identifier derived from an idempotency key
fn derive_id(prefix: &str, key: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(key.as_bytes());
    let hex: String = digest.iter().take(6).map(|b| format!("{b:02x}")).collect();
    format!("{prefix}-{hex}")
}

#[async_trait]
impl ScriptWriter for SimulatedStudio {
    async fn draft(&self, idempotency_key: &str, brief: &str) -> Result<Script> {
        let mut state = self.state.lock();
        if state.fail_script_calls > 0 {
            state.fail_script_calls -= 1;
            return Err(StudioflowError::backend("script_writer", "simulated outage"));
        }
        if let Some(script) = state.scripts.get(idempotency_key) {
            return Ok(script.clone());
        }

        let scenes = (0..SCENES_PER_SCRIPT)
            .map(|index| Scene {
                index,
                prompt: format!("{brief} (scene {})", index + 1),
                duration_seconds: 5,
            })
            .collect();
        let script = Script {
            title: brief.chars().take(60).collect(),
            body: format!("A short video about {brief}."),
            caption: format!("{brief} #studioflow"),
            scenes,
        };
        state.scripts.insert(idempotency_key.to_string(), script.clone());
        Ok(script)
    }
}

#[async_trait]
impl VideoGenerator for SimulatedStudio {
    async fn submit_clip(&self, request: &ClipRequest) -> Result<String> {
        let mut state = self.state.lock();
        state.video_calls += 1;
        if state.fail_video_calls > 0 {
            state.fail_video_calls -= 1;
            return Err(StudioflowError::backend("video_generator", "503 service unavailable"));
        }
        let clip_id = state
            .clips
            .entry(request.idempotency_key.clone())
            .or_insert_with(|| derive_id("clip", &request.idempotency_key))
            .clone();
        Ok(clip_id)
    }
}

#[async_trait]
impl RenderService for SimulatedStudio {
    async fn submit_render(
        &self,
        idempotency_key: &str,
        _run_id: &str,
        video_urls: &[String],
    ) -> Result<String> {
        if video_urls.is_empty() {
            return Err(StudioflowError::Validation(
                "render needs at least one clip".to_string(),
            ));
        }
        let mut state = self.state.lock();
        let render_id = state
            .renders
            .entry(idempotency_key.to_string())
            .or_insert_with(|| derive_id("render", idempotency_key))
            .clone();
        Ok(render_id)
    }

    async fn render_status(&self, render_id: &str) -> Result<RenderStatus> {
        let state = self.state.lock();
        if !state.renders.values().any(|id| id == render_id) {
            return Ok(RenderStatus::Failed {
                reason: format!("unknown render {render_id}"),
            });
        }
        if state.renders_pending {
            Ok(RenderStatus::Pending)
        } else {
            Ok(RenderStatus::Done {
                video_url: Self::render_url(render_id),
            })
        }
    }
}

#[async_trait]
impl Publisher for SimulatedStudio {
    async fn publish(
        &self,
        idempotency_key: &str,
        video_url: &str,
        _caption: &str,
    ) -> Result<PublishReceipt> {
        let mut state = self.state.lock();
        let receipt = state
            .publications
            .entry(idempotency_key.to_string())
            .or_insert_with(|| {
                let post_id = derive_id("post", idempotency_key);
                PublishReceipt {
                    url: format!("https://social.studioflow.test/p/{post_id}?src={video_url}"),
                    post_id,
                }
            })
            .clone();
        Ok(receipt)
    }
}

#[async_trait]
impl SafetyShield for SimulatedStudio {
    async fn moderate(&self, content: &str) -> Result<ModerationResult> {
        let mut state = self.state.lock();
        state.moderation_calls += 1;
        if state.shield_outage {
            return Err(StudioflowError::backend("safety_shield", "shield unavailable"));
        }

        let lowered = content.to_lowercase();
        let hit = state
            .flagged_terms
            .iter()
            .find(|(term, _)| lowered.contains(term.as_str()));

        Ok(match hit {
            Some((_, category)) => ModerationResult {
                safe: false,
                category: Some(category.clone()),
            },
            None => ModerationResult {
                safe: true,
                category: None,
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_submissions_are_idempotent() {
        let studio = SimulatedStudio::new();
        let request = ClipRequest {
            idempotency_key: "run-1:production:0".to_string(),
            run_id: "run-1".to_string(),
            prompt: "harbor".to_string(),
            duration_seconds: 5,
        };

        let first = studio.submit_clip(&request).await.unwrap();
        let second = studio.submit_clip(&request).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(studio.clip_submissions(), 1);
        assert_eq!(studio.video_calls(), 2);

        assert!(SimulatedStudio::clip_url(&first).ends_with(&format!("{first}.mp4")));
    }

    #[tokio::test]
    async fn test_flagged_terms_and_outage() {
        let studio = SimulatedStudio::new();
        studio.flag_term("Forbidden", "policy");

        let verdict = studio.moderate("a forbidden idea").await.unwrap();
        assert!(!verdict.safe);
        assert_eq!(verdict.category.as_deref(), Some("policy"));
        assert!(studio.moderate("a harmless idea").await.unwrap().safe);

        studio.set_shield_outage(true);
        assert!(studio.moderate("anything").await.is_err());
        assert_eq!(studio.moderation_calls(), 3);
    }

    #[tokio::test]
    async fn test_render_pending_until_cleared() {
        let studio = SimulatedStudio::new();
        studio.set_renders_pending(true);
        let id = studio
            .submit_render("run-1:editing", "run-1", &["u".to_string()])
            .await
            .unwrap();
        assert_eq!(studio.render_status(&id).await.unwrap(), RenderStatus::Pending);

        studio.set_renders_pending(false);
        assert_eq!(
            studio.render_status(&id).await.unwrap(),
            RenderStatus::Done {
                video_url: SimulatedStudio::render_url(&id)
            }
        );
    }
}
