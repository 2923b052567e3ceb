//! Worker stop signal
//!
//! A [`ShutdownCoordinator`] is a latch shared by every clone: once stopped it stays
//! stopped. The worker's claim loop selects on [`ShutdownCoordinator::wait_for_shutdown`]
//! and lets jobs already running finish before it returns.

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct ShutdownCoordinator {
    stop: Arc<watch::Sender<bool>>,
    // Keeps the channel open so `send_if_modified` always lands
    observer: watch::Receiver<bool>,
}

impl std::fmt::Debug for ShutdownCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownCoordinator")
            .field("stopping", &self.is_shutdown_requested())
            .finish()
    }
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        let (stop, observer) = watch::channel(false);
        Self {
            stop: Arc::new(stop),
            observer,
        }
    }

    /// Flip the latch; only the first call logs and wakes waiters
    pub fn request_shutdown(&self) {
        let first = self.stop.send_if_modified(|stopping| {
            let was = *stopping;
            *stopping = true;
            !was
        });
        if first {
            info!("Worker stop requested");
        }
    }

    pub fn is_shutdown_requested(&self) -> bool {
        *self.observer.borrow()
    }

    /// Resolves once a stop has been requested, including one requested earlier
    pub async fn wait_for_shutdown(&self) {
        let mut observer = self.observer.clone();
        loop {
            if *observer.borrow_and_update() {
                return;
            }
            if observer.changed().await.is_err() {
                return;
            }
        }
    }

    /// Stop on Ctrl-C, or on SIGTERM where the platform has it
    ///
    /// The returned task can be aborted once the worker has exited on its own.
    pub fn install_signal_handlers(&self) -> tokio::task::JoinHandle<()> {
        let coordinator = self.clone();
        tokio::spawn(async move {
            match stop_signal().await {
                Ok(name) => {
                    warn!(signal = name, "Stopping worker after in-flight jobs");
                    coordinator.request_shutdown();
                }
                Err(e) => error!(
                    error = %e,
                    "Signal handlers unavailable; stop the worker by other means"
                ),
            }
        })
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(unix)]
async fn stop_signal() -> std::io::Result<&'static str> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.map(|()| "SIGINT"),
        _ = terminate.recv() => Ok("SIGTERM"),
    }
}

#[cfg(not(unix))]
async fn stop_signal() -> std::io::Result<&'static str> {
    tokio::signal::ctrl_c().await.map(|()| "Ctrl-C")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_latch_stays_set() {
        let shutdown = ShutdownCoordinator::new();
        assert!(!shutdown.is_shutdown_requested());

        shutdown.request_shutdown();
        shutdown.request_shutdown();
        assert!(shutdown.is_shutdown_requested());
        assert!(shutdown.clone().is_shutdown_requested());
    }

    #[tokio::test]
    async fn test_waiters_on_clones_wake() {
        let shutdown = ShutdownCoordinator::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let shutdown = shutdown.clone();
                tokio::spawn(async move { shutdown.wait_for_shutdown().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(10)).await;
        shutdown.request_shutdown();

        for waiter in waiters {
            tokio::time::timeout(Duration::from_millis(500), waiter)
                .await
                .expect("waiter woke")
                .unwrap();
        }
    }

    #[tokio::test]
    async fn test_late_waiter_returns_at_once() {
        let shutdown = ShutdownCoordinator::new();
        shutdown.request_shutdown();

        tokio::time::timeout(Duration::from_millis(100), shutdown.wait_for_shutdown())
            .await
            .expect("stop already requested");
    }
}
