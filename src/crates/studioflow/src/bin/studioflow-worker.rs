//! Studioflow worker - claims and runs pipeline jobs until interrupted

use anyhow::Context;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use studioflow::backends::{Backends, SimulatedStudio};
use studioflow::logging::init_tracing;
use studioflow::{AppContext, ConfigLoader, ShutdownCoordinator};
use tracing::info;

#[derive(Parser)]
#[command(name = "studioflow-worker")]
#[command(about = "Run a studioflow queue worker", long_about = None)]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Cli {
    /// TOML configuration file
    #[arg(short, long, default_value = "studioflow.toml")]
    config: PathBuf,

    /// Lease owner name; defaults to a random ID
    #[arg(short, long)]
    worker_id: Option<String>,

    /// Override `database.url`
    #[arg(long)]
    database_url: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::new()
        .with_path(&cli.config)
        .load()
        .await
        .context("failed to load configuration")?;
    if let Some(url) = cli.database_url {
        config.database.url = url;
    }
    init_tracing(&config.logging)?;

    // Live provider clients are supplied by embedders of the library
    if !config.backends.simulated {
        info!("No live backends are linked into this binary, using the simulated studio");
        config.backends.simulated = true;
    }
    let backends = Backends::simulated(Arc::new(SimulatedStudio::new()));
    let app = AppContext::open(config, backends)
        .await
        .context("failed to open studioflow")?;

    let worker_id = cli
        .worker_id
        .unwrap_or_else(|| format!("worker-{}", uuid::Uuid::new_v4()));
    let worker = Arc::new(app.worker(worker_id));

    let shutdown = ShutdownCoordinator::new();
    let signals = shutdown.install_signal_handlers();

    let report = app.health().await;
    info!(status = %report.status, "Startup health check");

    app.recover_stalled_runs()
        .await
        .context("failed to re-queue stalled runs")?;

    worker.run(shutdown).await;

    signals.abort();
    app.close().await;
    Ok(())
}
