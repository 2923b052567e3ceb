//! Run variables carried in the checkpoint

use crate::backends::{PublishReceipt, Script};
use crate::safety::SafetyCache;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

/// Recorded HITL decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub gate: String,
    pub approved: bool,
    #[serde(default)]
    pub comment: Option<String>,
    #[serde(default)]
    pub data: Option<Value>,
    pub decided_at: DateTime<Utc>,
}

/// Variables of one pipeline run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineState {
    pub brief: String,
    pub script: Option<Script>,
    /// Provider clip IDs, one per scene, in scene order
    pub clip_ids: Vec<String>,
    pub video_urls: Vec<String>,
    pub render_id: Option<String>,
    pub final_video_url: Option<String>,
    pub publish_receipt: Option<PublishReceipt>,
    pub approved: Option<bool>,
    pub safety_cache: SafetyCache,
    pub audit_log: Vec<AuditEntry>,
}

impl PipelineState {
    pub fn new(brief: impl Into<String>) -> Self {
        Self {
            brief: brief.into(),
            ..Default::default()
        }
    }

    /// Externally visible outputs, mirrored into the run projection
    pub fn artifacts(&self) -> Value {
        json!({
            "title": self.script.as_ref().map(|s| s.title.clone()),
            "clip_ids": self.clip_ids,
            "video_urls": self.video_urls,
            "render_id": self.render_id,
            "final_video_url": self.final_video_url,
            "post_url": self.publish_receipt.as_ref().map(|r| r.url.clone()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_tolerates_missing_fields() {
        let state: PipelineState = serde_json::from_value(json!({"brief": "tides"})).unwrap();
        assert_eq!(state, PipelineState::new("tides"));
        assert_eq!(state.artifacts()["video_urls"], json!([]));
    }
}
