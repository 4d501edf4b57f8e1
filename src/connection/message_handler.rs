//! Per-connection outbound queueing, inbound deduplication, and the ack
//! protocol.
//!
//! Two collections that are easy to conflate stay deliberately separate:
//! the received-id set gives at-most-once *local processing*, while the
//! awaiting-ack map gives at-least-once *delivery confirmation* to the peer.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Mutex;

use chrono::Utc;
use serde_json::{json, Value};
use std::sync::Arc;
use uuid::Uuid;

use crate::metrics::{
    ACKS_RECEIVED_TOTAL, ACKS_SENT_TOTAL, ACK_LATENCY_SECONDS, MESSAGES_DEDUPED_TOTAL,
    MESSAGES_DROPPED_TOTAL, MESSAGES_EXPIRED_TOTAL, MESSAGES_QUEUED_TOTAL,
};
use crate::transport::{Transport, TransportError};

use super::events::ConnectionEvents;
use super::types::MessageState;

/// Dedup set bound: past this many recorded ids, trim to the newest half.
const RECEIVED_IDS_MAX: usize = 10_000;
const RECEIVED_IDS_TRIM_TO: usize = 5_000;

/// Bounded, insertion-ordered record of recently seen message ids.
#[derive(Default)]
struct ReceivedIds {
    order: VecDeque<String>,
    set: HashSet<String>,
}

impl ReceivedIds {
    /// Record an id. Returns false if it was already present (a duplicate).
    fn record(&mut self, id: &str) -> bool {
        if self.set.contains(id) {
            return false;
        }
        self.set.insert(id.to_string());
        self.order.push_back(id.to_string());

        if self.set.len() > RECEIVED_IDS_MAX {
            while self.set.len() > RECEIVED_IDS_TRIM_TO {
                if let Some(oldest) = self.order.pop_front() {
                    self.set.remove(&oldest);
                } else {
                    break;
                }
            }
        }
        true
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.set.len()
    }
}

/// Outbound queueing, send execution, inbound dedup, and acknowledgments
/// for one connection.
pub struct MessageHandler {
    connection_id: String,
    pending: Mutex<VecDeque<MessageState>>,
    awaiting_ack: Mutex<HashMap<String, MessageState>>,
    received: Mutex<ReceivedIds>,
    events: Arc<dyn ConnectionEvents>,
}

impl MessageHandler {
    pub fn new(connection_id: impl Into<String>, events: Arc<dyn ConnectionEvents>) -> Self {
        Self {
            connection_id: connection_id.into(),
            pending: Mutex::new(VecDeque::new()),
            awaiting_ack: Mutex::new(HashMap::new()),
            received: Mutex::new(ReceivedIds::default()),
            events,
        }
    }

    /// Globally-unique message id.
    pub fn generate_message_id() -> String {
        Uuid::new_v4().to_string()
    }

    /// Pure construction; the timestamp is stamped here.
    pub fn create_message_state(
        content: Value,
        message_id: impl Into<String>,
        ack_required: bool,
    ) -> MessageState {
        MessageState {
            message_id: message_id.into(),
            content,
            timestamp: Utc::now(),
            ack_required,
            acknowledged: false,
            retry_count: 0,
        }
    }

    /// Append to the pending queue if there is room; drop otherwise.
    ///
    /// Always returns false: queueing is never "sent". Overflow is a normal,
    /// observable outcome, not an error.
    pub fn queue_pending_message(&self, message: MessageState, max_pending: usize) -> bool {
        let mut pending = self.pending.lock().unwrap();
        if pending.len() < max_pending {
            tracing::debug!(
                connection_id = %self.connection_id,
                message_id = %message.message_id,
                queue_size = pending.len() + 1,
                "Message queued while not connected"
            );
            pending.push_back(message);
            MESSAGES_QUEUED_TOTAL.inc();
        } else {
            tracing::warn!(
                connection_id = %self.connection_id,
                message_id = %message.message_id,
                max_pending = max_pending,
                "Pending queue full, dropping message"
            );
            MESSAGES_DROPPED_TOTAL.inc();
        }
        false
    }

    /// Serialize and write one message to the transport. Transport failures
    /// propagate for connection-error handling; only after a successful
    /// write does an ack-required message enter the awaiting-ack map.
    pub async fn execute_send(
        &self,
        transport: &dyn Transport,
        message: &MessageState,
    ) -> Result<(), TransportError> {
        let text = message.content.to_string();
        transport.send(&text).await?;

        if message.ack_required {
            self.awaiting_ack
                .lock()
                .unwrap()
                .insert(message.message_id.clone(), message.clone());
        }

        tracing::debug!(
            connection_id = %self.connection_id,
            message_id = %message.message_id,
            ack_required = message.ack_required,
            "Message sent"
        );
        Ok(())
    }

    /// Route one parsed inbound message.
    ///
    /// Acks and pongs never count as "received" for dedup purposes. A
    /// message without an id cannot be deduplicated and is always delivered.
    pub async fn process_received(&self, message: Value) {
        let msg_type = message.get("type").and_then(Value::as_str);

        if msg_type == Some("ack") {
            if let Some(id) = message.get("id").and_then(Value::as_str) {
                self.handle_acknowledgment(id);
            }
            return;
        }

        if msg_type == Some("pong") {
            // Pong handling belongs to the heartbeat monitor
            return;
        }

        if let Some(id) = message.get("id").and_then(Value::as_str) {
            let fresh = self.received.lock().unwrap().record(id);
            if !fresh {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    message_id = %id,
                    "Dropping duplicate message"
                );
                MESSAGES_DEDUPED_TOTAL.inc();
                return;
            }
        }

        self.events
            .on_message(&self.connection_id, message)
            .await;
    }

    /// Mark a sent message acknowledged and retire it. A late or duplicate
    /// ack is tolerated as a no-op.
    pub fn handle_acknowledgment(&self, message_id: &str) {
        let removed = self.awaiting_ack.lock().unwrap().remove(message_id);
        match removed {
            Some(mut message) => {
                message.acknowledged = true;
                let latency = Utc::now()
                    .signed_duration_since(message.timestamp)
                    .num_milliseconds()
                    .max(0);
                ACKS_RECEIVED_TOTAL.inc();
                ACK_LATENCY_SECONDS.observe(latency as f64 / 1000.0);
                tracing::debug!(
                    connection_id = %self.connection_id,
                    message_id = %message_id,
                    latency_ms = latency,
                    "Message acknowledged"
                );
            }
            None => {
                tracing::debug!(
                    connection_id = %self.connection_id,
                    message_id = %message_id,
                    "Ignoring ack for unknown message"
                );
            }
        }
    }

    /// Send an acknowledgment for a received message. Transport errors are
    /// logged and swallowed: an ack failure must not crash the receive path.
    pub async fn send_acknowledgment(&self, transport: &dyn Transport, message_id: &str) {
        let ack = json!({
            "type": "ack",
            "id": message_id,
            "timestamp": Utc::now().to_rfc3339(),
        });

        match transport.send(&ack.to_string()).await {
            Ok(()) => {
                ACKS_SENT_TOTAL.inc();
            }
            Err(e) => {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    message_id = %message_id,
                    error = %e,
                    "Failed to send acknowledgment"
                );
            }
        }
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn unacked_count(&self) -> usize {
        self.awaiting_ack.lock().unwrap().len()
    }

    pub fn clear_pending(&self) -> usize {
        let mut pending = self.pending.lock().unwrap();
        let cleared = pending.len();
        pending.clear();
        cleared
    }

    /// Defensive copy of the pending queue, oldest first.
    pub fn pending_snapshot(&self) -> Vec<MessageState> {
        self.pending.lock().unwrap().iter().cloned().collect()
    }

    /// Take the whole pending queue for a flush, discarding messages older
    /// than the retention window.
    pub fn drain_pending(&self, retention: chrono::Duration) -> Vec<MessageState> {
        let drained: Vec<MessageState> = self.pending.lock().unwrap().drain(..).collect();
        let now = Utc::now();
        let mut kept = Vec::with_capacity(drained.len());
        let mut expired = 0usize;

        for message in drained {
            if now.signed_duration_since(message.timestamp) > retention {
                expired += 1;
                MESSAGES_EXPIRED_TOTAL.inc();
            } else {
                kept.push(message);
            }
        }

        if expired > 0 {
            tracing::info!(
                connection_id = %self.connection_id,
                expired = expired,
                "Discarded expired pending messages during flush"
            );
        }
        kept
    }

    /// Put unsent messages back at the head of the queue, preserving order.
    pub fn requeue_front(&self, messages: Vec<MessageState>) {
        let mut pending = self.pending.lock().unwrap();
        for message in messages.into_iter().rev() {
            pending.push_front(message);
        }
    }

    #[cfg(test)]
    fn received_count(&self) -> usize {
        self.received.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::events::NoopEvents;
    use crate::testing::MockTransport;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use async_trait::async_trait;

    fn handler() -> MessageHandler {
        MessageHandler::new("conn-1", Arc::new(NoopEvents))
    }

    struct CountingEvents {
        delivered: AtomicUsize,
    }

    #[async_trait]
    impl ConnectionEvents for CountingEvents {
        async fn on_message(&self, _connection_id: &str, _message: Value) {
            self.delivered.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_queue_respects_bound() {
        let h = handler();
        for i in 0..5 {
            let msg = MessageHandler::create_message_state(json!({"n": i}), format!("m{i}"), false);
            assert!(!h.queue_pending_message(msg, 3));
        }
        // Fourth and fifth were dropped, not queued
        assert_eq!(h.pending_count(), 3);
    }

    #[test]
    fn test_queue_overflow_drops_newest_not_duplicates() {
        let h = handler();
        for i in 0..4 {
            let msg = MessageHandler::create_message_state(json!({"n": i}), format!("m{i}"), false);
            h.queue_pending_message(msg, 3);
        }
        let snapshot = h.pending_snapshot();
        let ids: Vec<&str> = snapshot.iter().map(|m| m.message_id.as_str()).collect();
        assert_eq!(ids, vec!["m0", "m1", "m2"]);
    }

    #[tokio::test]
    async fn test_execute_send_tracks_ack_required_only() {
        let h = handler();
        let transport = MockTransport::new();

        let no_ack = MessageHandler::create_message_state(json!({"id": "a"}), "a", false);
        let with_ack = MessageHandler::create_message_state(json!({"id": "b"}), "b", true);

        h.execute_send(transport.as_ref(), &no_ack).await.unwrap();
        h.execute_send(transport.as_ref(), &with_ack).await.unwrap();

        assert_eq!(transport.sent_count(), 2);
        assert_eq!(h.unacked_count(), 1);
    }

    #[tokio::test]
    async fn test_execute_send_failure_does_not_track() {
        let h = handler();
        let transport = MockTransport::new();
        transport.fail_sends(true);

        let msg = MessageHandler::create_message_state(json!({"id": "x"}), "x", true);
        assert!(h.execute_send(transport.as_ref(), &msg).await.is_err());
        assert_eq!(h.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_ack_lifecycle() {
        let h = handler();
        let transport = MockTransport::new();

        let msg = MessageHandler::create_message_state(json!({"id": "m1"}), "m1", true);
        h.execute_send(transport.as_ref(), &msg).await.unwrap();
        assert_eq!(h.unacked_count(), 1);

        h.process_received(json!({"type": "ack", "id": "m1"})).await;
        assert_eq!(h.unacked_count(), 0);

        // Duplicate ack is a no-op
        h.process_received(json!({"type": "ack", "id": "m1"})).await;
        assert_eq!(h.unacked_count(), 0);
    }

    #[tokio::test]
    async fn test_dedup_delivers_each_id_once() {
        let events = Arc::new(CountingEvents {
            delivered: AtomicUsize::new(0),
        });
        let h = MessageHandler::new("conn-1", events.clone());

        for _ in 0..3 {
            h.process_received(json!({"type": "data", "id": "dup-1"})).await;
        }
        h.process_received(json!({"type": "data", "id": "dup-2"})).await;

        assert_eq!(events.delivered.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_messages_without_id_always_delivered() {
        let events = Arc::new(CountingEvents {
            delivered: AtomicUsize::new(0),
        });
        let h = MessageHandler::new("conn-1", events.clone());

        h.process_received(json!({"type": "data"})).await;
        h.process_received(json!({"type": "data"})).await;

        assert_eq!(events.delivered.load(Ordering::SeqCst), 2);
        assert_eq!(h.received_count(), 0);
    }

    #[tokio::test]
    async fn test_ack_and_pong_not_recorded_for_dedup() {
        let events = Arc::new(CountingEvents {
            delivered: AtomicUsize::new(0),
        });
        let h = MessageHandler::new("conn-1", events.clone());

        h.process_received(json!({"type": "ack", "id": "a1"})).await;
        h.process_received(json!({"type": "pong"})).await;

        assert_eq!(events.delivered.load(Ordering::SeqCst), 0);
        assert_eq!(h.received_count(), 0);
    }

    #[test]
    fn test_received_ids_trim_bound() {
        let mut ids = ReceivedIds::default();
        for i in 0..=RECEIVED_IDS_MAX {
            ids.record(&format!("id-{i}"));
        }
        // The insert that crossed the threshold triggered the trim
        assert!(ids.len() <= RECEIVED_IDS_TRIM_TO + 1);

        // Newest ids survive, oldest are gone
        assert!(ids.set.contains(&format!("id-{RECEIVED_IDS_MAX}")));
        assert!(!ids.set.contains("id-0"));
    }

    #[tokio::test]
    async fn test_send_acknowledgment_swallows_transport_errors() {
        let h = handler();
        let transport = MockTransport::new();
        transport.fail_sends(true);

        // Must not panic or propagate
        h.send_acknowledgment(transport.as_ref(), "m9").await;
        assert_eq!(transport.sent_count(), 0);
    }

    #[tokio::test]
    async fn test_send_acknowledgment_wire_shape() {
        let h = handler();
        let transport = MockTransport::new();

        h.send_acknowledgment(transport.as_ref(), "m7").await;

        let frames = transport.sent_frames();
        assert_eq!(frames.len(), 1);
        let ack: Value = serde_json::from_str(&frames[0]).unwrap();
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["id"], "m7");
        assert!(ack["timestamp"].is_string());
    }

    #[test]
    fn test_drain_discards_expired() {
        let h = handler();
        let mut old = MessageHandler::create_message_state(json!({"id": "old"}), "old", false);
        old.timestamp = Utc::now() - chrono::Duration::hours(48);
        let fresh = MessageHandler::create_message_state(json!({"id": "new"}), "new", false);

        h.queue_pending_message(old, 10);
        h.queue_pending_message(fresh, 10);

        let drained = h.drain_pending(chrono::Duration::hours(24));
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].message_id, "new");
    }

    #[test]
    fn test_requeue_front_preserves_order() {
        let h = handler();
        let m3 = MessageHandler::create_message_state(json!({"id": "m3"}), "m3", false);
        h.queue_pending_message(m3, 10);

        let m1 = MessageHandler::create_message_state(json!({"id": "m1"}), "m1", false);
        let m2 = MessageHandler::create_message_state(json!({"id": "m2"}), "m2", false);
        h.requeue_front(vec![m1, m2]);

        let ids: Vec<String> = h
            .pending_snapshot()
            .into_iter()
            .map(|m| m.message_id)
            .collect();
        assert_eq!(ids, vec!["m1", "m2", "m3"]);
    }
}
