//! Pipeline steps and run statuses

use crate::error::{Result, StudioflowError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Event kind a clip webhook resumes
pub const VIDEOS_EVENT: &str = "videos";
/// Event kind a render webhook or poll resumes
pub const RENDER_EVENT: &str = "render";
/// Event kind of every human-in-the-loop interrupt
pub const HITL_EVENT: &str = "hitl";
/// Gate name of the pre-publication review
pub const PUBLISH_APPROVAL_GATE: &str = "publish_approval";

/// Position of a run in the pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Step {
    Ideation,
    Production,
    WaitForVideos,
    Editing,
    WaitForRender,
    PublishApproval,
    Publishing,
    Completed,
    Failed,
    Rejected,
}

impl Step {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ideation => "ideation",
            Self::Production => "production",
            Self::WaitForVideos => "wait_for_videos",
            Self::Editing => "editing",
            Self::WaitForRender => "wait_for_render",
            Self::PublishApproval => "publish_approval",
            Self::Publishing => "publishing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Rejected => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Rejected)
    }

    /// The step that suspends on, and is resumed by, events of `event_kind`
    pub fn owning(event_kind: &str) -> Option<Self> {
        match event_kind {
            VIDEOS_EVENT => Some(Self::WaitForVideos),
            RENDER_EVENT => Some(Self::WaitForRender),
            HITL_EVENT | PUBLISH_APPROVAL_GATE => Some(Self::PublishApproval),
            _ => None,
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Step {
    type Err = StudioflowError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s {
            "ideation" => Self::Ideation,
            "production" => Self::Production,
            "wait_for_videos" => Self::WaitForVideos,
            "editing" => Self::Editing,
            "wait_for_render" => Self::WaitForRender,
            "publish_approval" => Self::PublishApproval,
            "publishing" => Self::Publishing,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            "rejected" => Self::Rejected,
            other => {
                return Err(StudioflowError::Validation(format!(
                    "unknown step '{other}'"
                )))
            }
        })
    }
}

/// Run status strings
pub mod status {
    pub const RUNNING: &str = "running";
    pub const COMPLETED: &str = "completed";
    pub const FAILED: &str = "failed";
    pub const REJECTED: &str = "rejected";

    /// Status of a run suspended on an interrupt of `kind`
    pub fn awaiting(kind: &str) -> String {
        format!("awaiting_{kind}")
    }

    pub fn is_terminal(status: &str) -> bool {
        matches!(status, COMPLETED | FAILED | REJECTED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_are_ordered_along_the_pipeline() {
        assert!(Step::Ideation < Step::Production);
        assert!(Step::WaitForRender < Step::PublishApproval);
        assert!(Step::Publishing < Step::Completed);
        assert_eq!("wait_for_render".parse::<Step>().unwrap(), Step::WaitForRender);
        assert!("drafting".parse::<Step>().is_err());
    }

    #[test]
    fn test_owning_step() {
        assert_eq!(Step::owning("videos"), Some(Step::WaitForVideos));
        assert_eq!(Step::owning("render"), Some(Step::WaitForRender));
        assert_eq!(Step::owning("publish_approval"), Some(Step::PublishApproval));
        assert_eq!(Step::owning("thumbnail"), None);
    }

    #[test]
    fn test_status_strings() {
        assert_eq!(status::awaiting("publish_approval"), "awaiting_publish_approval");
        assert!(status::is_terminal("rejected"));
        assert!(!status::is_terminal("awaiting_render"));
    }
}
