//! Background recovery sweeps over the connection registry.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast;

use crate::connection::ConnectionRegistry;

/// Periodically reconnects failed and disconnected outbound connections.
pub struct RecoveryTask {
    interval: Duration,
    registry: Arc<ConnectionRegistry>,
    shutdown: broadcast::Receiver<()>,
}

impl RecoveryTask {
    pub fn new(
        interval: Duration,
        registry: Arc<ConnectionRegistry>,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            interval,
            registry,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        let mut timer = tokio::time::interval(self.interval);
        // Skip immediate first tick
        timer.tick().await;

        tracing::info!(
            interval_secs = self.interval.as_secs(),
            "Recovery task started"
        );

        loop {
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("Recovery task received shutdown signal");
                    break;
                }
                _ = timer.tick() => {
                    self.sweep().await;
                }
            }
        }

        tracing::info!("Recovery task stopped");
    }

    async fn sweep(&self) {
        let results = self.registry.recover_all().await;
        if results.is_empty() {
            return;
        }

        let recovered = results.values().filter(|ok| **ok).count();
        let failed = results.len() - recovered;
        if failed > 0 {
            tracing::warn!(
                attempted = results.len(),
                recovered = recovered,
                failed = failed,
                "Recovery sweep left connections down"
            );
        }
    }
}
