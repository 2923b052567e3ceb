//! Dead letter handling
//!
//! Webhook jobs that fail terminally are recorded as dead letters, at most one
//! unresolved entry per source and run. An operator can replay an entry, which
//! feeds its stored payload through the same resume entrypoint the webhook handler
//! uses, or resolve it manually.

use crate::error::{Result, StudioflowError};
use crate::models::DeadLetterEntry;
use crate::repositories::DeadLetterRepository;
use crate::workflow::{ResumeDispatcher, ResumeOutcome};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tracing::info;

/// Resolution recorded by [`DeadLetterService::replay`]
pub const RESOLUTION_REPLAYED: &str = "replayed";
/// Resolution recorded by [`DeadLetterService::resolve`]
pub const RESOLUTION_MANUAL: &str = "manual";

/// Origin of a dead-lettered unit of work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterSource {
    /// Clip completion webhook
    VideoGeneration,
    /// Render completion webhook
    Render,
}

impl DeadLetterSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::VideoGeneration => "video_generation",
            Self::Render => "render",
        }
    }

    /// Feed a webhook payload of this source into the dispatcher
    ///
    /// Fails with a validation error when the payload lacks the fields the source
    /// needs: a non-empty `video_urls` list for clips, a `video_url` string for
    /// renders.
    pub async fn dispatch(
        &self,
        dispatcher: &ResumeDispatcher,
        run_id: &str,
        payload: &Value,
    ) -> Result<ResumeOutcome> {
        match self {
            Self::VideoGeneration => {
                let urls = video_urls(payload)?;
                dispatcher.resume_after_videos(run_id, &urls).await
            }
            Self::Render => {
                let url = payload
                    .get("video_url")
                    .and_then(Value::as_str)
                    .filter(|url| !url.is_empty())
                    .ok_or_else(|| {
                        StudioflowError::Validation("render payload needs 'video_url'".to_string())
                    })?;
                dispatcher.resume_after_render(run_id, url).await
            }
        }
    }
}

fn video_urls(payload: &Value) -> Result<Vec<String>> {
    let missing = || {
        StudioflowError::Validation("video payload needs non-empty 'video_urls'".to_string())
    };
    let list = payload
        .get("video_urls")
        .and_then(Value::as_array)
        .ok_or_else(missing)?;
    let urls = list
        .iter()
        .map(|url| url.as_str().map(str::to_string))
        .collect::<Option<Vec<_>>>()
        .ok_or_else(missing)?;
    if urls.is_empty() {
        return Err(missing());
    }
    Ok(urls)
}

impl fmt::Display for DeadLetterSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeadLetterSource {
    type Err = StudioflowError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "video_generation" => Ok(Self::VideoGeneration),
            "render" => Ok(Self::Render),
            other => Err(StudioflowError::Validation(format!(
                "unknown dead letter source '{other}'"
            ))),
        }
    }
}

/// Operator surface over dead letters
#[derive(Debug, Clone)]
pub struct DeadLetterService {
    repository: DeadLetterRepository,
    dispatcher: ResumeDispatcher,
}

impl DeadLetterService {
    pub fn new(repository: DeadLetterRepository, dispatcher: ResumeDispatcher) -> Self {
        Self {
            repository,
            dispatcher,
        }
    }

    pub async fn list(
        &self,
        source: Option<DeadLetterSource>,
        unresolved_only: bool,
    ) -> Result<Vec<DeadLetterEntry>> {
        self.repository.list(source, unresolved_only).await
    }

    pub async fn get(&self, id: &str) -> Result<DeadLetterEntry> {
        self.repository.get(id).await
    }

    /// Re-run the resume the failed webhook attempted, then mark the entry replayed
    ///
    /// Repeating a replay is harmless: the resume is a no-op once the run has moved
    /// past the step, and an entry is only resolved once.
    pub async fn replay(&self, id: &str) -> Result<ResumeOutcome> {
        let entry = self.repository.get(id).await?;
        let source: DeadLetterSource = entry.source.parse()?;
        let payload = entry.payload_json()?;

        let outcome = source.dispatch(&self.dispatcher, &entry.run_id, &payload).await?;
        if self.repository.resolve(id, RESOLUTION_REPLAYED).await? {
            info!(
                dead_letter_id = id,
                run_id = %entry.run_id,
                source = source.as_str(),
                noop = outcome.is_noop(),
                "Dead letter replayed"
            );
        }
        Ok(outcome)
    }

    /// Close an entry without replaying it
    pub async fn resolve(&self, id: &str) -> Result<DeadLetterEntry> {
        if self.repository.resolve(id, RESOLUTION_MANUAL).await? {
            info!(dead_letter_id = id, "Dead letter resolved manually");
        }
        self.repository.get(id).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_source_round_trip() {
        for source in [DeadLetterSource::VideoGeneration, DeadLetterSource::Render] {
            assert_eq!(source.as_str().parse::<DeadLetterSource>().unwrap(), source);
        }
        assert!("thumbnail".parse::<DeadLetterSource>().is_err());
    }

    #[test]
    fn test_video_urls_extraction() {
        assert_eq!(
            video_urls(&json!({"video_urls": ["a.mp4", "b.mp4"]})).unwrap(),
            vec!["a.mp4".to_string(), "b.mp4".to_string()]
        );
        for bad in [
            json!({}),
            json!({"video_urls": []}),
            json!({"video_urls": "a.mp4"}),
            json!({"video_urls": [1, 2]}),
        ] {
            assert!(matches!(video_urls(&bad), Err(StudioflowError::Validation(_))));
        }
    }
}
