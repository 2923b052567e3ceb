//! Dead-letter recording, replay and manual resolution

mod common;

use serde_json::json;
use studioflow::dead_letter::{RESOLUTION_MANUAL, RESOLUTION_REPLAYED};
use studioflow::{DeadLetterSource, JobDisposition, StudioflowError};

/// A videos webhook that arrives while the run is still at ideation, with no
/// retries left, lands in the dead letters
async fn early_videos_webhook(t: &common::TestApp) -> (String, String) {
    let run = t
        .app
        .engine
        .start_run("video_pipeline", "night market")
        .await
        .unwrap();
    t.app
        .receive_webhook(
            DeadLetterSource::VideoGeneration,
            &run.run_id,
            json!({ "video_urls": ["https://cdn/a.mp4", "https://cdn/b.mp4"] }),
        )
        .await
        .unwrap();

    let processed = common::drain(&t.app.worker("w1")).await;
    assert_eq!(
        processed,
        vec![("webhook.videos".to_string(), JobDisposition::DeadLettered)]
    );

    let entries = t
        .app
        .dead_letters
        .list(Some(DeadLetterSource::VideoGeneration), true)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    (run.run_id, entries[0].id.clone())
}

#[tokio::test]
async fn test_replay_resumes_run_and_resolves_entry() {
    let t = common::setup_with(|config| config.retry.max_attempts = 1).await;
    let (run_id, entry_id) = early_videos_webhook(&t).await;

    let entry = t.app.dead_letters.get(&entry_id).await.unwrap();
    assert_eq!(entry.run_id, run_id);
    assert_eq!(entry.attempts, 1);
    assert!(entry.resolution.is_none());

    // The run catches up to the point where it waits for the clips
    let waiting = t.app.engine.advance(&run_id).await.unwrap();
    assert_eq!(waiting.status, "awaiting_videos");

    let outcome = t.app.dead_letters.replay(&entry_id).await.unwrap();
    assert!(!outcome.is_noop());
    assert_eq!(outcome.run().current_step, "editing");

    let entry = t.app.dead_letters.get(&entry_id).await.unwrap();
    assert_eq!(entry.resolution.as_deref(), Some(RESOLUTION_REPLAYED));
    assert!(entry.resolved_at.is_some());
    assert!(t
        .app
        .dead_letters
        .list(None, true)
        .await
        .unwrap()
        .is_empty());

    // Replaying again finds the run past the wait step
    let again = t.app.dead_letters.replay(&entry_id).await.unwrap();
    assert!(again.is_noop());

    let checkpoint = t.app.engine.checkpoint(&run_id).await.unwrap().unwrap();
    let state: studioflow::workflow::PipelineState =
        serde_json::from_value(checkpoint.state).unwrap();
    assert_eq!(state.video_urls.len(), 2);
}

#[tokio::test]
async fn test_replay_before_run_is_ready_keeps_entry_open() {
    let t = common::setup_with(|config| config.retry.max_attempts = 1).await;
    let (_, entry_id) = early_videos_webhook(&t).await;

    let err = t.app.dead_letters.replay(&entry_id).await.unwrap_err();
    assert!(matches!(err, StudioflowError::ResumeRetryable { .. }));

    let entry = t.app.dead_letters.get(&entry_id).await.unwrap();
    assert!(entry.resolution.is_none());
}

#[tokio::test]
async fn test_manual_resolution() {
    let t = common::setup_with(|config| config.retry.max_attempts = 1).await;
    let (_, entry_id) = early_videos_webhook(&t).await;

    let entry = t.app.dead_letters.resolve(&entry_id).await.unwrap();
    assert_eq!(entry.resolution.as_deref(), Some(RESOLUTION_MANUAL));

    // Resolving twice keeps the first resolution
    let entry = t.app.dead_letters.resolve(&entry_id).await.unwrap();
    assert_eq!(entry.resolution.as_deref(), Some(RESOLUTION_MANUAL));

    let health = t.app.health().await;
    assert_eq!(
        health.check("dead_letters").unwrap().status,
        studioflow::HealthStatus::Healthy
    );
}

#[tokio::test]
async fn test_malformed_payload_is_dead_lettered_and_cannot_replay() {
    let t = common::setup().await;
    let run = t
        .app
        .engine
        .start_run("video_pipeline", "lighthouse")
        .await
        .unwrap();
    t.app
        .receive_webhook(DeadLetterSource::Render, &run.run_id, json!({ "status": "done" }))
        .await
        .unwrap();

    // Validation failures are not retried
    let processed = common::drain(&t.app.worker("w1")).await;
    assert_eq!(
        processed,
        vec![("webhook.render".to_string(), JobDisposition::DeadLettered)]
    );

    let entries = t
        .app
        .dead_letters
        .list(Some(DeadLetterSource::Render), true)
        .await
        .unwrap();
    assert_eq!(entries.len(), 1);
    assert!(entries[0].error.contains("video_url"));

    let err = t.app.dead_letters.replay(&entries[0].id).await.unwrap_err();
    assert!(matches!(err, StudioflowError::Validation(_)));
    assert!(t
        .app
        .dead_letters
        .get(&entries[0].id)
        .await
        .unwrap()
        .resolution
        .is_none());

    let health = t.app.health().await;
    assert_eq!(
        health.check("dead_letters").unwrap().status,
        studioflow::HealthStatus::Degraded
    );
}

#[tokio::test]
async fn test_unknown_entry() {
    let t = common::setup().await;

    let err = t.app.dead_letters.replay("missing").await.unwrap_err();
    assert!(matches!(err, StudioflowError::DeadLetterNotFound(_)));

    let err = t.app.dead_letters.resolve("missing").await.unwrap_err();
    assert!(matches!(err, StudioflowError::DeadLetterNotFound(_)));
}
