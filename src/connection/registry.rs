//! Process-wide registry of managed connections.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;

use crate::metrics::{CONNECTIONS_ACTIVE, CONNECTIONS_CLOSED, CONNECTIONS_OPENED};
use crate::transport::TransportConnector;

use super::events::ConnectionEvents;
use super::manager::ConnectionManager;
use super::types::{ConnectionStatus, HeartbeatConfig, ReconnectionConfig};

/// Extension point for persisting connection state out of process.
/// The default deployment runs without one; implementations may ship
/// snapshots to whatever store the operator chooses.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    async fn save(&self, connection_id: &str, data: serde_json::Value);
    async fn load(&self, connection_id: &str) -> Option<serde_json::Value>;
}

/// Holds every `ConnectionManager` keyed by connection id.
///
/// The registry map is the only cross-connection shared structure here;
/// everything inside a manager belongs to that connection alone.
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<ConnectionManager>>,
    snapshot_store: Option<Arc<dyn SnapshotStore>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
            snapshot_store: None,
        }
    }

    pub fn with_snapshot_store(snapshot_store: Arc<dyn SnapshotStore>) -> Self {
        Self {
            connections: DashMap::new(),
            snapshot_store: Some(snapshot_store),
        }
    }

    /// Construct and register a connection. An existing entry under the same
    /// id is disconnected and replaced, never rejected.
    pub async fn create_connection(
        &self,
        id: impl Into<String>,
        address: impl Into<String>,
        config: ReconnectionConfig,
        heartbeat_config: HeartbeatConfig,
        connector: Arc<dyn TransportConnector>,
        events: Arc<dyn ConnectionEvents>,
    ) -> Arc<ConnectionManager> {
        let id = id.into();

        if let Some(existing) = self.connections.get(&id).map(|e| e.value().clone()) {
            tracing::info!(connection_id = %id, "Replacing existing connection");
            existing.disconnect("removed").await;
            CONNECTIONS_CLOSED.inc();
        }

        let manager = ConnectionManager::new(
            id.clone(),
            address,
            config,
            heartbeat_config,
            connector,
            events,
        );
        self.connections.insert(id.clone(), manager.clone());
        CONNECTIONS_OPENED.inc();
        CONNECTIONS_ACTIVE.set(self.connections.len() as i64);

        tracing::info!(connection_id = %id, "Connection registered");
        manager
    }

    /// Disconnect and drop a connection. No-op when absent.
    pub async fn remove_connection(&self, id: &str) {
        if let Some((_, manager)) = self.connections.remove(id) {
            manager.disconnect("removed").await;
            CONNECTIONS_CLOSED.inc();
            CONNECTIONS_ACTIVE.set(self.connections.len() as i64);
            tracing::info!(connection_id = %id, "Connection removed");
        }
    }

    pub fn get_connection(&self, id: &str) -> Option<Arc<ConnectionManager>> {
        self.connections.get(id).map(|e| e.value().clone())
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Sweep every connection that needs recovery (`Failed` or
    /// `Disconnected`) and attempt to reconnect it. Connections already
    /// `Connected` or `Connecting` are skipped entirely. Never fails as a
    /// whole; the result carries per-connection outcomes.
    pub async fn recover_all(&self) -> HashMap<String, bool> {
        let candidates: Vec<Arc<ConnectionManager>> = self
            .connections
            .iter()
            .map(|e| e.value().clone())
            .collect();

        let mut results = HashMap::new();
        for manager in candidates {
            let state = manager.state();
            if !state.needs_recovery() {
                tracing::debug!(
                    connection_id = %manager.id(),
                    state = %state,
                    "Skipping connection during recovery sweep"
                );
                continue;
            }

            tracing::info!(connection_id = %manager.id(), state = %state, "Recovering connection");
            let recovered = manager.connect().await;
            results.insert(manager.id().to_string(), recovered);
        }

        let succeeded = results.values().filter(|ok| **ok).count();
        tracing::info!(
            attempted = results.len(),
            succeeded = succeeded,
            "Recovery sweep completed"
        );
        results
    }

    /// Snapshot of every connection's status, keyed by id.
    pub fn get_all_status(&self) -> HashMap<String, ConnectionStatus> {
        self.connections
            .iter()
            .map(|e| (e.key().clone(), e.value().get_status()))
            .collect()
    }

    /// Disconnect everything and clear the registry.
    pub async fn cleanup_all(&self) -> usize {
        let drained: Vec<(String, Arc<ConnectionManager>)> = self
            .connections
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect();
        self.connections.clear();
        CONNECTIONS_ACTIVE.set(0);

        let count = drained.len();
        for (id, manager) in drained {
            manager.disconnect("removed").await;
            CONNECTIONS_CLOSED.inc();
            tracing::debug!(connection_id = %id, "Connection cleaned up");
        }

        if count > 0 {
            tracing::info!(count = count, "All connections cleaned up");
        }
        count
    }

    /// Persist a state snapshot for one connection, when a store is wired.
    pub async fn save_state_snapshot(&self, connection_id: &str, data: serde_json::Value) {
        if let Some(store) = &self.snapshot_store {
            store.save(connection_id, data).await;
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
