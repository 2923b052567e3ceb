//! Common test utilities and setup

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use studioflow::backends::{Backends, SimulatedStudio};
use studioflow::queue::{JobDisposition, Worker};
use studioflow::{AppContext, StudioflowConfig};
use tempfile::TempDir;

static TEST_DB_COUNTER: AtomicUsize = AtomicUsize::new(0);

/// A migrated app on its own temporary database, backed by a simulated studio
pub struct TestApp {
    pub app: AppContext,
    pub studio: Arc<SimulatedStudio>,
    _dir: TempDir,
}

/// Configuration with short delays suitable for tests
pub fn test_config(dir: &TempDir) -> StudioflowConfig {
    let counter = TEST_DB_COUNTER.fetch_add(1, Ordering::SeqCst);
    let db_path = dir.path().join(format!("test_{counter}.db"));

    let mut config = StudioflowConfig::default();
    config.database.url = format!("sqlite:{}", db_path.display());
    config.retry.base_delay_ms = 10;
    config.retry.max_delay_ms = 50;
    config.resume.poll_interval_ms = 20;
    config.resume.visibility_timeout_ms = 100;
    config.backends.simulated = false;
    config.worker.poll_interval_ms = 10;
    config
}

pub async fn setup() -> TestApp {
    setup_with(|_| {}).await
}

pub async fn setup_with(customize: impl FnOnce(&mut StudioflowConfig)) -> TestApp {
    let dir = TempDir::new().expect("Failed to create temp dir");
    let mut config = test_config(&dir);
    customize(&mut config);

    let studio = Arc::new(SimulatedStudio::new());
    let app = AppContext::open(config, Backends::simulated(studio.clone()))
        .await
        .expect("Failed to open app");

    TestApp {
        app,
        studio,
        _dir: dir,
    }
}

/// Run every job that is due right now, returning how each ended
pub async fn drain(worker: &Worker) -> Vec<(String, JobDisposition)> {
    let mut processed = Vec::new();
    while let Some((job, disposition)) = worker.run_once().await.expect("claim failed") {
        processed.push((job.job_type, disposition));
    }
    processed
}

/// Clip URLs the simulated studio would report for a run's submitted clips
pub fn clip_urls(run: &studioflow::RunProjection) -> Vec<String> {
    run.artifacts["clip_ids"]
        .as_array()
        .map(|ids| {
            ids.iter()
                .filter_map(|id| id.as_str())
                .map(SimulatedStudio::clip_url)
                .collect()
        })
        .unwrap_or_default()
}

/// Keep running jobs, waiting out retry delays, until none are pending or leased
pub async fn run_until_settled(
    app: &AppContext,
    worker: &Worker,
    timeout: std::time::Duration,
) -> Vec<(String, JobDisposition)> {
    use studioflow::models::JobStatus;

    let deadline = tokio::time::Instant::now() + timeout;
    let mut processed = Vec::new();
    loop {
        if let Some((job, disposition)) = worker.run_once().await.expect("claim failed") {
            processed.push((job.job_type, disposition));
            continue;
        }

        let pending = app.jobs.count_by_status(JobStatus::Pending).await.expect("count failed");
        let leased = app.jobs.count_by_status(JobStatus::Leased).await.expect("count failed");
        if pending + leased == 0 {
            return processed;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "jobs did not settle in time: {processed:?}"
        );
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
}
