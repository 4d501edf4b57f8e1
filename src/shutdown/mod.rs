//! Graceful shutdown handling for the session gateway.
//!
//! Coordinated teardown:
//! 1. Notify connected clients about the impending shutdown
//! 2. Signal background tasks to stop
//! 3. Disconnect and clear every registered connection

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use tokio::sync::broadcast;
use tokio::time::timeout;

use crate::connection::{ConnectionRegistry, ConnectionState};

/// Configuration for graceful shutdown behavior
#[derive(Debug, Clone)]
pub struct ShutdownConfig {
    /// Time to wait for clients to be notified (default: 5 seconds)
    pub client_notification_timeout: Duration,
    /// Suggested reconnect delay to send to clients (default: 5 seconds)
    pub reconnect_after_seconds: u64,
}

impl Default for ShutdownConfig {
    fn default() -> Self {
        Self {
            client_notification_timeout: Duration::from_secs(5),
            reconnect_after_seconds: 5,
        }
    }
}

/// Handles graceful shutdown of the session gateway
pub struct GracefulShutdown {
    registry: Arc<ConnectionRegistry>,
    shutdown_tx: broadcast::Sender<()>,
    config: ShutdownConfig,
}

impl GracefulShutdown {
    pub fn new(registry: Arc<ConnectionRegistry>, shutdown_tx: broadcast::Sender<()>) -> Self {
        Self {
            registry,
            shutdown_tx,
            config: ShutdownConfig::default(),
        }
    }

    pub fn with_config(
        registry: Arc<ConnectionRegistry>,
        shutdown_tx: broadcast::Sender<()>,
        config: ShutdownConfig,
    ) -> Self {
        Self {
            registry,
            shutdown_tx,
            config,
        }
    }

    /// Execute the shutdown sequence.
    #[tracing::instrument(
        name = "graceful_shutdown",
        skip(self),
        fields(total_connections = self.registry.connection_count())
    )]
    pub async fn execute(&self, reason: &str) -> ShutdownResult {
        let start = std::time::Instant::now();
        let mut result = ShutdownResult::default();

        tracing::info!(reason = %reason, "Starting graceful shutdown - Phase 1: Notifying clients");
        result.clients_notified = self.notify_clients(reason).await;

        tracing::info!("Phase 2: Signaling background tasks to stop");
        let _ = self.shutdown_tx.send(());

        tracing::info!("Phase 3: Disconnecting registered connections");
        result.connections_closed = self.registry.cleanup_all().await;

        result.duration = start.elapsed();
        result.success = true;

        tracing::info!(
            clients_notified = result.clients_notified,
            connections_closed = result.connections_closed,
            duration_ms = result.duration.as_millis() as u64,
            "Graceful shutdown completed"
        );

        result
    }

    /// Best-effort shutdown notice to every connected session.
    async fn notify_clients(&self, reason: &str) -> usize {
        let statuses = self.registry.get_all_status();
        let connected: Vec<String> = statuses
            .into_iter()
            .filter(|(_, s)| s.state == ConnectionState::Connected)
            .map(|(id, _)| id)
            .collect();

        if connected.is_empty() {
            return 0;
        }

        let mut notified = 0usize;
        let notify_future = async {
            for id in &connected {
                let Some(manager) = self.registry.get_connection(id) else {
                    continue;
                };
                let message = json!({
                    "type": "shutdown",
                    "reason": reason,
                    "reconnect_after_seconds": self.config.reconnect_after_seconds,
                });
                if manager.send_message(message, false).await {
                    notified += 1;
                }
            }
        };

        let _ = timeout(self.config.client_notification_timeout, notify_future).await;

        tracing::info!(
            notified = notified,
            total = connected.len(),
            "Shutdown notifications sent"
        );
        notified
    }
}

/// Result of a graceful shutdown operation
#[derive(Debug, Default)]
pub struct ShutdownResult {
    /// Whether shutdown completed successfully
    pub success: bool,
    /// Number of clients that were notified
    pub clients_notified: usize,
    /// Number of connections that were closed
    pub connections_closed: usize,
    /// Total time taken for shutdown
    pub duration: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{HeartbeatConfig, NoopEvents, ReconnectionConfig};
    use crate::testing::{MockConnector, MockTransport};

    #[tokio::test]
    async fn test_shutdown_no_connections() {
        let registry = Arc::new(ConnectionRegistry::new());
        let (tx, _) = broadcast::channel(1);
        let shutdown = GracefulShutdown::new(registry, tx);

        let result = shutdown.execute("test shutdown").await;

        assert!(result.success);
        assert_eq!(result.clients_notified, 0);
        assert_eq!(result.connections_closed, 0);
    }

    #[tokio::test]
    async fn test_shutdown_notifies_and_closes() {
        let registry = Arc::new(ConnectionRegistry::new());
        let connector = MockConnector::new();
        let transport = MockTransport::new();
        connector.push_transport(transport.clone());

        let manager = registry
            .create_connection(
                "c1",
                "ws://example.invalid/session",
                ReconnectionConfig::default(),
                HeartbeatConfig {
                    interval: Duration::from_secs(30),
                    ..Default::default()
                },
                connector,
                Arc::new(NoopEvents),
            )
            .await;
        assert!(manager.connect().await);

        let (tx, _) = broadcast::channel(1);
        let shutdown = GracefulShutdown::new(registry.clone(), tx);
        let result = shutdown.execute("deploy").await;

        assert!(result.success);
        assert_eq!(result.clients_notified, 1);
        assert_eq!(result.connections_closed, 1);
        assert_eq!(registry.connection_count(), 0);

        let frames = transport.sent_frames();
        let notice: serde_json::Value = serde_json::from_str(frames.last().unwrap()).unwrap();
        assert_eq!(notice["type"], "shutdown");
        assert_eq!(notice["reason"], "deploy");
    }

    #[test]
    fn test_shutdown_config_defaults() {
        let config = ShutdownConfig::default();
        assert_eq!(config.client_notification_timeout, Duration::from_secs(5));
        assert_eq!(config.reconnect_after_seconds, 5);
    }
}
