//! End-to-end tests for the connection reliability core: queue bounds,
//! ack lifecycle, dedup, reconnection, and registry recovery over the
//! in-memory transport fakes.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use session_gateway::connection::{
    ConnectionEvents, ConnectionRegistry, ConnectionState, HeartbeatConfig, NoopEvents,
    ReconnectionConfig,
};
use session_gateway::testing::{MockConnector, MockTransport};

struct CollectingEvents {
    delivered: Mutex<Vec<String>>,
    disconnects: AtomicUsize,
}

impl CollectingEvents {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            delivered: Mutex::new(Vec::new()),
            disconnects: AtomicUsize::new(0),
        })
    }

    fn delivered_ids(&self) -> Vec<String> {
        self.delivered.lock().unwrap().clone()
    }
}

#[async_trait]
impl ConnectionEvents for CollectingEvents {
    async fn on_message(&self, _connection_id: &str, message: Value) {
        if let Some(id) = message.get("id").and_then(Value::as_str) {
            self.delivered.lock().unwrap().push(id.to_string());
        }
    }

    async fn on_disconnect(&self, _connection_id: &str, _reason: &str) {
        self.disconnects.fetch_add(1, Ordering::SeqCst);
    }
}

fn fast_config() -> ReconnectionConfig {
    ReconnectionConfig {
        max_attempts: 3,
        initial_delay: Duration::from_millis(2),
        max_delay: Duration::from_millis(10),
        backoff_multiplier: 2.0,
        jitter: false,
        connect_timeout: Duration::from_millis(500),
        ..Default::default()
    }
}

fn quiet_heartbeat() -> HeartbeatConfig {
    HeartbeatConfig {
        interval: Duration::from_secs(60),
        pong_timeout: Duration::from_secs(10),
        max_missed: 3,
    }
}

async fn wait_until<F: Fn() -> bool>(what: &str, predicate: F) {
    tokio::time::timeout(Duration::from_secs(3), async {
        while !predicate() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

/// Scenario: queue `max_pending_messages` messages while disconnected, then
/// one more. The pending count holds the bound; the overflow is dropped.
#[tokio::test]
async fn test_pending_queue_bound_holds_at_limit() {
    let registry = ConnectionRegistry::new();
    let connector = MockConnector::new();
    let manager = registry
        .create_connection(
            "bounded",
            "ws://example.invalid/session",
            ReconnectionConfig {
                max_pending_messages: 1000,
                ..fast_config()
            },
            quiet_heartbeat(),
            connector,
            Arc::new(NoopEvents),
        )
        .await;

    for n in 0..1000 {
        let queued = manager
            .send_message(json!({"type": "data", "id": format!("q{n}")}), false)
            .await;
        assert!(!queued);
    }
    assert_eq!(manager.pending_count(), 1000);

    // The 1001st is dropped, not queued
    manager
        .send_message(json!({"type": "data", "id": "overflow"}), false)
        .await;
    assert_eq!(manager.pending_count(), 1000);

    registry.cleanup_all().await;
}

/// Scenario: send `{id: "m1", ack_required: true}`, then receive the ack.
/// The sent map holds m1 until the ack lands, then releases it; a second
/// ack is a no-op.
#[tokio::test]
async fn test_ack_lifecycle_over_the_wire() {
    let registry = ConnectionRegistry::new();
    let connector = MockConnector::new();
    let transport = MockTransport::new();
    connector.push_transport(transport.clone());

    let manager = registry
        .create_connection(
            "acked",
            "ws://example.invalid/session",
            fast_config(),
            quiet_heartbeat(),
            connector,
            Arc::new(NoopEvents),
        )
        .await;

    assert!(manager.connect().await);
    assert!(
        manager
            .send_message(json!({"type": "data", "id": "m1"}), true)
            .await
    );
    assert_eq!(manager.unacked_count(), 1);

    transport.push_inbound(r#"{"type":"ack","id":"m1"}"#);
    wait_until("ack to be processed", || manager.unacked_count() == 0).await;

    // Duplicate ack is tolerated
    transport.push_inbound(r#"{"type":"ack","id":"m1"}"#);
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert_eq!(manager.unacked_count(), 0);
    assert_eq!(manager.state(), ConnectionState::Connected);

    registry.cleanup_all().await;
}

/// Repeated inbound ids reach the application exactly once each,
/// regardless of how often the peer retransmits.
#[tokio::test]
async fn test_duplicate_inbound_messages_delivered_once() {
    let events = CollectingEvents::new();
    let registry = ConnectionRegistry::new();
    let connector = MockConnector::new();
    let transport = MockTransport::new();
    connector.push_transport(transport.clone());

    let manager = registry
        .create_connection(
            "dedup",
            "ws://example.invalid/session",
            fast_config(),
            quiet_heartbeat(),
            connector,
            events.clone(),
        )
        .await;
    assert!(manager.connect().await);

    for _ in 0..5 {
        transport.push_inbound(r#"{"type":"data","id":"dup-a"}"#);
    }
    transport.push_inbound(r#"{"type":"data","id":"dup-b"}"#);
    for _ in 0..3 {
        transport.push_inbound(r#"{"type":"data","id":"dup-b"}"#);
    }
    transport.push_inbound(r#"{"type":"data","id":"final"}"#);

    wait_until("all frames to drain", || {
        events.delivered_ids().contains(&"final".to_string())
    })
    .await;

    assert_eq!(events.delivered_ids(), vec!["dup-a", "dup-b", "final"]);

    registry.cleanup_all().await;
}

/// A severed transport re-establishes through backoff and preserved
/// messages flush in order on the new transport.
#[tokio::test]
async fn test_reconnect_flushes_preserved_messages() {
    let registry = ConnectionRegistry::new();
    let connector = MockConnector::new();
    let first = MockTransport::new();
    let second = MockTransport::new();
    connector.push_transport(first.clone());
    connector.push_transport(second.clone());

    let manager = registry
        .create_connection(
            "resilient",
            "ws://example.invalid/session",
            fast_config(),
            quiet_heartbeat(),
            connector.clone(),
            Arc::new(NoopEvents),
        )
        .await;
    assert!(manager.connect().await);

    first.sever();
    // Whether the drop has been noticed yet or not, these must land on the
    // replacement transport in call order
    manager
        .send_message(json!({"type": "data", "id": "while-down-1"}), false)
        .await;
    manager
        .send_message(json!({"type": "data", "id": "while-down-2"}), false)
        .await;

    wait_until("reconnection", || {
        manager.state() == ConnectionState::Connected && manager.pending_count() == 0
    })
    .await;

    let ids: Vec<String> = second
        .sent_frames()
        .iter()
        .map(|f| {
            serde_json::from_str::<Value>(f).unwrap()["id"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    assert_eq!(ids, vec!["while-down-1", "while-down-2"]);

    let status = manager.get_status();
    assert_eq!(status.metrics.reconnect_count, 1);

    registry.cleanup_all().await;
}

/// Exhausting the attempt budget parks the connection in Failed, where the
/// recovery sweep can pick it up later.
#[tokio::test]
async fn test_exhausted_reconnection_then_sweep_recovers() {
    let registry = ConnectionRegistry::new();
    let connector = MockConnector::new();
    let first = MockTransport::new();
    connector.push_transport(first.clone());

    let manager = registry
        .create_connection(
            "swept",
            "ws://example.invalid/session",
            fast_config(),
            quiet_heartbeat(),
            connector.clone(),
            Arc::new(NoopEvents),
        )
        .await;
    assert!(manager.connect().await);

    first.sever();
    wait_until("failure after exhausted attempts", || {
        manager.state() == ConnectionState::Failed
    })
    .await;
    // Initial dial + max_attempts redials
    assert_eq!(connector.dial_count(), 4);

    // Now a transport is available again; the sweep brings it back
    connector.push_transport(MockTransport::new());
    let results = registry.recover_all().await;
    assert_eq!(results.len(), 1);
    assert!(results["swept"]);
    assert_eq!(manager.state(), ConnectionState::Connected);

    registry.cleanup_all().await;
}

/// Heartbeat timeout on a silent peer tears the connection down and the
/// recovery path takes over.
#[tokio::test]
async fn test_heartbeat_timeout_drives_reconnect() {
    let registry = ConnectionRegistry::new();
    let connector = MockConnector::new();
    let silent = MockTransport::new();
    let replacement = MockTransport::new();
    connector.push_transport(silent.clone());
    connector.push_transport(replacement.clone());

    let manager = registry
        .create_connection(
            "hb",
            "ws://example.invalid/session",
            fast_config(),
            HeartbeatConfig {
                interval: Duration::from_millis(20),
                pong_timeout: Duration::from_millis(10),
                max_missed: 2,
            },
            connector.clone(),
            Arc::new(NoopEvents),
        )
        .await;
    assert!(manager.connect().await);

    // The peer never answers pings; the heartbeat breach must reconnect
    wait_until("heartbeat-driven reconnect", || {
        connector.dial_count() >= 2 && manager.state() == ConnectionState::Connected
    })
    .await;

    assert!(silent.sent_frames().iter().any(|f| f.contains("ping")));

    registry.cleanup_all().await;
}

/// A replaced connection id disconnects the old session first.
#[tokio::test]
async fn test_registry_replacement_disconnects_old_session() {
    let events = CollectingEvents::new();
    let registry = ConnectionRegistry::new();

    let connector_a = MockConnector::new();
    connector_a.push_transport(MockTransport::new());
    let old = registry
        .create_connection(
            "tenant-7",
            "ws://example.invalid/a",
            fast_config(),
            quiet_heartbeat(),
            connector_a,
            events.clone(),
        )
        .await;
    assert!(old.connect().await);

    let connector_b = MockConnector::new();
    connector_b.push_transport(MockTransport::new());
    let replacement = registry
        .create_connection(
            "tenant-7",
            "ws://example.invalid/b",
            fast_config(),
            quiet_heartbeat(),
            connector_b,
            events.clone(),
        )
        .await;

    assert_eq!(old.state(), ConnectionState::Disconnected);
    assert_eq!(events.disconnects.load(Ordering::SeqCst), 1);
    assert!(replacement.connect().await);
    assert_eq!(registry.connection_count(), 1);

    registry.cleanup_all().await;
}

/// Connected sends keep call order on the wire.
#[tokio::test]
async fn test_send_ordering_preserved() {
    let registry = ConnectionRegistry::new();
    let connector = MockConnector::new();
    let transport = MockTransport::new();
    connector.push_transport(transport.clone());

    let manager = registry
        .create_connection(
            "ordered",
            "ws://example.invalid/session",
            fast_config(),
            quiet_heartbeat(),
            connector,
            Arc::new(NoopEvents),
        )
        .await;
    assert!(manager.connect().await);

    for n in 0..20 {
        assert!(
            manager
                .send_message(json!({"type": "data", "id": format!("s{n}")}), false)
                .await
        );
    }

    let ids: Vec<String> = transport
        .sent_frames()
        .iter()
        .map(|f| {
            serde_json::from_str::<Value>(f).unwrap()["id"]
                .as_str()
                .unwrap()
                .to_string()
        })
        .collect();
    let expected: Vec<String> = (0..20).map(|n| format!("s{n}")).collect();
    assert_eq!(ids, expected);

    registry.cleanup_all().await;
}
