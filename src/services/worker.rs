use crate::services::staging::LocalStagingStore;
use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{Duration, sleep};

/// Periodically removes staged files that outlived their request, e.g. after a
/// crash between staging and release.
pub struct StagingSweeper {
    store: Arc<LocalStagingStore>,
    max_age: Duration,
    interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl StagingSweeper {
    pub fn new(
        store: Arc<LocalStagingStore>,
        max_age: Duration,
        interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            store,
            max_age,
            interval,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!(
            "🧹 Staging sweeper started (max age {:?}, every {:?})",
            self.max_age,
            self.interval
        );

        // Leftovers from a previous run are collected straight away
        self.sweep().await;

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Staging sweeper shutting down");
                    break;
                }
                _ = sleep(self.interval) => {
                    self.sweep().await;
                }
            }
        }
    }

    pub async fn sweep(&self) -> usize {
        match self.store.sweep_older_than(self.max_age).await {
            Ok(0) => 0,
            Ok(removed) => {
                tracing::info!("✅ Swept {} stale staged file(s)", removed);
                removed
            }
            Err(e) => {
                tracing::error!("Staging sweep failed: {}", e);
                0
            }
        }
    }
}
