//! The per-connection state machine.
//!
//! One `ConnectionManager` composes a `MessageHandler`, a
//! `HeartbeatMonitor`, and a `ReconnectionController` around one transport.
//! At most one receive loop, one heartbeat loop, and one reconnection cycle
//! are active at a time, and `disconnect` joins every owned task before
//! returning.

use std::sync::{Arc, Mutex};

use serde_json::Value;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;

use crate::metrics::MESSAGES_SENT_TOTAL;
use crate::transport::{Transport, TransportConnector, TransportError};

use super::events::ConnectionEvents;
use super::heartbeat::HeartbeatMonitor;
use super::message_handler::MessageHandler;
use super::reconnect::ReconnectionController;
use super::types::{
    ConnectionMetrics, ConnectionState, ConnectionStatus, HeartbeatConfig, ReconnectionConfig,
    ReconnectionReason,
};

#[derive(Default)]
struct ConnectionTasks {
    recv_shutdown: Option<watch::Sender<bool>>,
    recv_handle: Option<JoinHandle<()>>,
    reconnect_handle: Option<JoinHandle<()>>,
    recovery_handle: Option<JoinHandle<()>>,
}

pub struct ConnectionManager {
    id: String,
    address: String,
    config: ReconnectionConfig,
    connector: Arc<dyn TransportConnector>,
    events: Arc<dyn ConnectionEvents>,

    state: Mutex<ConnectionState>,
    last_error: Mutex<Option<String>>,
    transport: tokio::sync::RwLock<Option<Arc<dyn Transport>>>,

    metrics: Arc<ConnectionMetrics>,
    messages: MessageHandler,
    heartbeat: Arc<HeartbeatMonitor>,
    reconnect: Arc<ReconnectionController>,

    tasks: Mutex<ConnectionTasks>,
    // Serializes connect() and disconnect(); never held by background tasks
    op_lock: tokio::sync::Mutex<()>,
    closed: Notify,
}

impl ConnectionManager {
    pub fn new(
        id: impl Into<String>,
        address: impl Into<String>,
        config: ReconnectionConfig,
        heartbeat_config: HeartbeatConfig,
        connector: Arc<dyn TransportConnector>,
        events: Arc<dyn ConnectionEvents>,
    ) -> Arc<Self> {
        let id = id.into();
        let metrics = Arc::new(ConnectionMetrics::new());

        Arc::new(Self {
            messages: MessageHandler::new(id.clone(), events.clone()),
            heartbeat: Arc::new(HeartbeatMonitor::new(
                id.clone(),
                heartbeat_config,
                metrics.clone(),
            )),
            reconnect: Arc::new(ReconnectionController::new(
                id.clone(),
                config.clone(),
                events.clone(),
            )),
            id,
            address: address.into(),
            config,
            connector,
            events,
            state: Mutex::new(ConnectionState::Disconnected),
            last_error: Mutex::new(None),
            transport: tokio::sync::RwLock::new(None),
            metrics,
            tasks: Mutex::new(ConnectionTasks::default()),
            op_lock: tokio::sync::Mutex::new(()),
            closed: Notify::new(),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, next: ConnectionState) {
        let previous = {
            let mut state = self.state.lock().unwrap();
            let previous = *state;
            *state = next;
            previous
        };
        if previous != next {
            tracing::debug!(
                connection_id = %self.id,
                from = %previous,
                to = %next,
                "Connection state changed"
            );
        }
        if matches!(next, ConnectionState::Disconnected | ConnectionState::Failed) {
            self.closed.notify_waiters();
        }
    }

    fn record_last_error(&self, error: &str) {
        *self.last_error.lock().unwrap() = Some(error.to_string());
    }

    /// Open the transport and bring the connection up.
    ///
    /// No-op returning true when already `Connected` or `Connecting`. On
    /// success the receive loop and heartbeat start and preserved pending
    /// messages are flushed oldest-first. On failure the connection is
    /// `Failed` and false is returned.
    pub async fn connect(self: &Arc<Self>) -> bool {
        let _guard = self.op_lock.lock().await;

        if matches!(
            self.state(),
            ConnectionState::Connected | ConnectionState::Connecting
        ) {
            tracing::debug!(connection_id = %self.id, "Already connected or connecting");
            return true;
        }

        self.set_state(ConnectionState::Connecting);
        tracing::info!(connection_id = %self.id, address = %self.address, "Connecting");

        match self.dial().await {
            Ok(transport) => {
                self.activate(transport).await;
                tracing::info!(connection_id = %self.id, "Connected");
                true
            }
            Err(error) => {
                self.set_state(ConnectionState::Failed);
                self.record_last_error(&error);
                self.metrics.record_error();
                self.events.on_error(&self.id, &error).await;
                tracing::warn!(
                    connection_id = %self.id,
                    error = %error,
                    "Connection attempt failed"
                );
                false
            }
        }
    }

    /// Tear the connection down and join every owned task.
    ///
    /// Idempotent once fully `Disconnected`. Close errors on the transport
    /// are logged and swallowed.
    pub async fn disconnect(self: &Arc<Self>, reason: &str) {
        let _guard = self.op_lock.lock().await;

        let idle = {
            let tasks = self.tasks.lock().unwrap();
            tasks.recv_handle.is_none()
                && tasks.reconnect_handle.is_none()
                && tasks.recovery_handle.is_none()
        };
        if self.state() == ConnectionState::Disconnected && idle {
            tracing::debug!(connection_id = %self.id, "Already disconnected");
            return;
        }

        self.set_state(ConnectionState::Closing);
        tracing::info!(connection_id = %self.id, reason = %reason, "Disconnecting");

        // Receive loop first: it may be mid connection-error handling, and
        // joining it guarantees any reconnection spawn has happened before
        // the cancel below
        self.join_receive_loop().await;

        let recovery_handle = self.tasks.lock().unwrap().recovery_handle.take();
        if let Some(handle) = recovery_handle {
            let _ = handle.await;
        }

        self.reconnect.cancel_reconnection();
        let reconnect_handle = self.tasks.lock().unwrap().reconnect_handle.take();
        if let Some(handle) = reconnect_handle {
            let _ = handle.await;
        }

        // A reconnect attempt that won its dial just before the cancel may
        // have restarted the loops; stopping after the join catches that
        self.heartbeat.stop().await;
        self.join_receive_loop().await;

        let transport = self.transport.write().await.take();
        if let Some(transport) = transport {
            if let Err(e) = transport.close().await {
                tracing::debug!(connection_id = %self.id, error = %e, "Transport close failed");
            }
        }

        self.set_state(ConnectionState::Disconnected);
        self.metrics.mark_disconnected();
        self.events.on_disconnect(&self.id, reason).await;
        tracing::info!(connection_id = %self.id, reason = %reason, "Disconnected");
    }

    /// Send an application message, queueing it when not connected.
    ///
    /// Returns true only for an immediate successful send; a queued or
    /// dropped message returns false. A message without an `id` field gets
    /// a generated one.
    pub async fn send_message(self: &Arc<Self>, content: Value, require_ack: bool) -> bool {
        let (content, message_id) = Self::ensure_message_id(content);
        let message = MessageHandler::create_message_state(content, message_id, require_ack);

        if self.state() != ConnectionState::Connected {
            return self
                .messages
                .queue_pending_message(message, self.config.max_pending_messages);
        }

        let transport = self.transport.read().await.clone();
        let Some(transport) = transport else {
            return self
                .messages
                .queue_pending_message(message, self.config.max_pending_messages);
        };

        match self.messages.execute_send(transport.as_ref(), &message).await {
            Ok(()) => {
                self.metrics.record_message();
                MESSAGES_SENT_TOTAL.inc();
                true
            }
            Err(e) => {
                // Back onto the queue behind anything already waiting; the
                // front is reserved for flush remainders, which are older
                let mut message = message;
                message.retry_count += 1;
                self.messages
                    .queue_pending_message(message, self.config.max_pending_messages);
                self.handle_connection_error(ReconnectionReason::NetworkError, &e.to_string())
                    .await;
                false
            }
        }
    }

    pub fn get_status(&self) -> ConnectionStatus {
        ConnectionStatus {
            id: self.id.clone(),
            state: self.state(),
            reconnect_attempts: self.reconnect.attempts(),
            pending_messages: self.messages.pending_count(),
            unacknowledged_messages: self.messages.unacked_count(),
            missed_heartbeats: self.heartbeat.missed_heartbeats(),
            last_error: self.last_error.lock().unwrap().clone(),
            metrics: self.metrics.snapshot(),
        }
    }

    pub fn pending_count(&self) -> usize {
        self.messages.pending_count()
    }

    pub fn unacked_count(&self) -> usize {
        self.messages.unacked_count()
    }

    /// Resolve once the connection settles in `Disconnected` or `Failed`.
    pub async fn wait_closed(&self) {
        loop {
            let notified = self.closed.notified();
            if matches!(
                self.state(),
                ConnectionState::Disconnected | ConnectionState::Failed
            ) {
                return;
            }
            notified.await;
        }
    }

    async fn join_receive_loop(&self) {
        let (recv_shutdown, recv_handle) = {
            let mut tasks = self.tasks.lock().unwrap();
            (tasks.recv_shutdown.take(), tasks.recv_handle.take())
        };
        if let Some(shutdown) = recv_shutdown {
            let _ = shutdown.send(true);
        }
        if let Some(handle) = recv_handle {
            let _ = handle.await;
        }
    }

    async fn dial(&self) -> Result<Arc<dyn Transport>, String> {
        match tokio::time::timeout(
            self.config.connect_timeout,
            self.connector.connect(&self.address),
        )
        .await
        {
            Ok(Ok(transport)) => Ok(transport),
            Ok(Err(e)) => Err(e.to_string()),
            Err(_) => Err(format!(
                "connect timed out after {}s",
                self.config.connect_timeout.as_secs()
            )),
        }
    }

    /// Bring a freshly dialed transport into service: store it, mark
    /// `Connected`, start the receive loop and heartbeat, flush preserved
    /// pending messages oldest-first.
    async fn activate(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        *self.transport.write().await = Some(transport.clone());

        self.set_state(ConnectionState::Connected);
        self.metrics.mark_connected();
        self.reconnect.reset_attempts();
        *self.last_error.lock().unwrap() = None;

        self.start_receive_loop(transport.clone());
        self.start_heartbeat(transport.clone());

        if self.config.preserve_pending_messages {
            self.flush_pending(transport).await;
        }
    }

    fn start_receive_loop(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            manager.receive_loop(transport, shutdown_rx).await;
        });

        let mut tasks = self.tasks.lock().unwrap();
        tasks.recv_shutdown = Some(shutdown_tx);
        tasks.recv_handle = Some(handle);
    }

    fn start_heartbeat(self: &Arc<Self>, transport: Arc<dyn Transport>) {
        let is_connected: Arc<dyn Fn() -> bool + Send + Sync> = {
            let manager = Arc::clone(self);
            Arc::new(move || manager.state() == ConnectionState::Connected)
        };

        let on_timeout: Box<dyn Fn() + Send + Sync> = {
            let manager = Arc::clone(self);
            Box::new(move || {
                let task_owner = Arc::clone(&manager);
                let manager = Arc::clone(&manager);
                let handle = tokio::spawn(async move {
                    manager
                        .handle_connection_error(ReconnectionReason::Timeout, "heartbeat timeout")
                        .await;
                });
                task_owner.tasks.lock().unwrap().recovery_handle = Some(handle);
            })
        };

        self.heartbeat.start(transport, is_connected, on_timeout);
    }

    async fn receive_loop(
        self: Arc<Self>,
        transport: Arc<dyn Transport>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        loop {
            let text = tokio::select! {
                _ = shutdown_rx.changed() => break,
                result = transport.recv() => match result {
                    Ok(text) => text,
                    Err(e) => {
                        let reason = match e {
                            TransportError::Closed => ReconnectionReason::ConnectionLost,
                            _ => ReconnectionReason::NetworkError,
                        };
                        self.handle_connection_error(reason, &e.to_string()).await;
                        break;
                    }
                }
            };

            let message: Value = match serde_json::from_str(&text) {
                Ok(value @ Value::Object(_)) => value,
                _ => {
                    // Malformed input loses only this frame, not the
                    // connection
                    tracing::warn!(
                        connection_id = %self.id,
                        "Discarding malformed frame"
                    );
                    continue;
                }
            };

            if message.get("type").and_then(Value::as_str) == Some("pong") {
                self.heartbeat.handle_pong();
            }

            if message.get("ack_required").and_then(Value::as_bool) == Some(true) {
                if let Some(id) = message.get("id").and_then(Value::as_str) {
                    self.messages
                        .send_acknowledgment(transport.as_ref(), id)
                        .await;
                }
            }

            self.messages.process_received(message).await;
        }

        tracing::debug!(connection_id = %self.id, "Receive loop exited");
    }

    /// Record a transport failure and, when currently `Connected`, move to
    /// `Disconnected` and either start a reconnection cycle or fail out.
    async fn handle_connection_error(self: &Arc<Self>, reason: ReconnectionReason, error: &str) {
        tracing::warn!(
            connection_id = %self.id,
            reason = %reason,
            error = %error,
            "Connection error"
        );

        self.record_last_error(error);
        self.metrics.record_error();
        self.events.on_error(&self.id, error).await;

        // Only the task that wins this transition may drive recovery; a
        // concurrent disconnect() has already moved the state to Closing
        let was_connected = {
            let mut state = self.state.lock().unwrap();
            if *state == ConnectionState::Connected {
                *state = ConnectionState::Disconnected;
                true
            } else {
                false
            }
        };
        if !was_connected {
            return;
        }
        self.closed.notify_waiters();
        self.metrics.mark_disconnected();

        self.heartbeat.stop().await;

        // Retire the receive loop without joining it: when this runs from
        // inside that loop the signal is a no-op and the loop breaks on
        // return. Closing the dead transport unblocks a reader stuck on it.
        let recv_shutdown = self.tasks.lock().unwrap().recv_shutdown.take();
        if let Some(shutdown) = recv_shutdown {
            let _ = shutdown.send(true);
        }
        let transport = self.transport.write().await.take();
        if let Some(transport) = transport {
            let _ = transport.close().await;
        }

        if !self.config.preserve_pending_messages {
            self.messages.clear_pending();
        }

        if self.reconnect.is_within_limits() {
            self.set_state(ConnectionState::Reconnecting);
            self.spawn_reconnection(reason);
        } else {
            tracing::warn!(
                connection_id = %self.id,
                attempts = self.reconnect.attempts(),
                "Reconnection limits exhausted, failing connection"
            );
            self.set_state(ConnectionState::Failed);
        }
    }

    fn spawn_reconnection(self: &Arc<Self>, reason: ReconnectionReason) {
        // Arm before spawning so a disconnect that lands after this point
        // still cancels the new cycle
        self.reconnect.arm();

        let manager = Arc::clone(self);
        let handle = tokio::spawn(async move {
            let dialer = Arc::clone(&manager);
            let reconnected = manager
                .reconnect
                .start_reconnection(reason, move || {
                    let manager = Arc::clone(&dialer);
                    async move { manager.try_reconnect().await }
                })
                .await;

            if reconnected {
                manager.metrics.record_reconnect();
            } else if manager.state() == ConnectionState::Reconnecting {
                manager.set_state(ConnectionState::Failed);
            }
        });

        self.tasks.lock().unwrap().reconnect_handle = Some(handle);
    }

    /// One reconnection attempt: dial and, on success, bring the transport
    /// into service. Never touches the attempt counter; the controller owns
    /// that.
    async fn try_reconnect(self: &Arc<Self>) -> bool {
        if self.state() != ConnectionState::Reconnecting {
            return false;
        }

        match self.dial().await {
            Ok(transport) => {
                // A disconnect may have begun while the dial was in flight
                if self.state() != ConnectionState::Reconnecting {
                    let _ = transport.close().await;
                    return false;
                }
                self.activate(transport).await;
                true
            }
            Err(error) => {
                self.record_last_error(&error);
                self.metrics.record_error();
                tracing::debug!(
                    connection_id = %self.id,
                    error = %error,
                    "Reconnection attempt failed"
                );
                false
            }
        }
    }

    /// Drain the preserved queue oldest-first. On a send failure the failed
    /// message and the unsent remainder go back to the head of the queue.
    async fn flush_pending(&self, transport: Arc<dyn Transport>) {
        let retention = chrono::Duration::from_std(self.config.message_retention)
            .unwrap_or_else(|_| chrono::Duration::hours(24));
        let queued = self.messages.drain_pending(retention);
        if queued.is_empty() {
            return;
        }

        tracing::info!(
            connection_id = %self.id,
            count = queued.len(),
            "Flushing pending messages"
        );

        let mut iter = queued.into_iter();
        while let Some(mut message) = iter.next() {
            match self.messages.execute_send(transport.as_ref(), &message).await {
                Ok(()) => {
                    self.metrics.record_message();
                    MESSAGES_SENT_TOTAL.inc();
                }
                Err(e) => {
                    tracing::warn!(
                        connection_id = %self.id,
                        message_id = %message.message_id,
                        error = %e,
                        "Flush interrupted, re-queueing remainder"
                    );
                    message.retry_count += 1;
                    let mut remainder = vec![message];
                    remainder.extend(iter);
                    self.messages.requeue_front(remainder);
                    break;
                }
            }
        }
    }

    fn ensure_message_id(mut content: Value) -> (Value, String) {
        let existing = content
            .get("id")
            .and_then(Value::as_str)
            .map(str::to_owned);
        match existing {
            Some(id) => (content, id),
            None => {
                let id = MessageHandler::generate_message_id();
                if let Value::Object(ref mut map) = content {
                    map.insert("id".to_string(), Value::String(id.clone()));
                }
                (content, id)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::events::NoopEvents;
    use crate::testing::{MockConnector, MockTransport};
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn test_config() -> ReconnectionConfig {
        ReconnectionConfig {
            max_attempts: 3,
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            backoff_multiplier: 2.0,
            jitter: false,
            connect_timeout: Duration::from_millis(200),
            ..Default::default()
        }
    }

    fn quiet_heartbeat() -> HeartbeatConfig {
        // Long enough that heartbeats never interfere with these tests
        HeartbeatConfig {
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            max_missed: 3,
        }
    }

    fn manager_with(connector: Arc<MockConnector>) -> Arc<ConnectionManager> {
        ConnectionManager::new(
            "conn-test",
            "ws://example.invalid/session",
            test_config(),
            quiet_heartbeat(),
            connector,
            Arc::new(NoopEvents),
        )
    }

    struct SlowConnector;

    #[async_trait]
    impl crate::transport::TransportConnector for SlowConnector {
        async fn connect(
            &self,
            _address: &str,
        ) -> Result<Arc<dyn Transport>, TransportError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Err(TransportError::Connect("unreachable".to_string()))
        }
    }

    #[tokio::test]
    async fn test_connect_success_transitions_to_connected() {
        let connector = MockConnector::new();
        connector.push_transport(MockTransport::new());
        let manager = manager_with(connector.clone());

        assert!(manager.connect().await);
        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(connector.dial_count(), 1);

        let status = manager.get_status();
        assert!(status.metrics.connect_time.is_some());
        assert!(status.last_error.is_none());

        manager.disconnect("test done").await;
    }

    #[tokio::test]
    async fn test_connect_is_noop_when_connected() {
        let connector = MockConnector::new();
        connector.push_transport(MockTransport::new());
        let manager = manager_with(connector.clone());

        assert!(manager.connect().await);
        assert!(manager.connect().await);
        assert_eq!(connector.dial_count(), 1);

        manager.disconnect("test done").await;
    }

    #[tokio::test]
    async fn test_connect_failure_transitions_to_failed() {
        let connector = MockConnector::new();
        connector.fail_next_dials(1);
        let manager = manager_with(connector);

        assert!(!manager.connect().await);
        assert_eq!(manager.state(), ConnectionState::Failed);

        let status = manager.get_status();
        assert!(status.last_error.is_some());
        assert_eq!(status.metrics.error_count, 1);
    }

    #[tokio::test]
    async fn test_connect_timeout_transitions_to_failed() {
        let manager = ConnectionManager::new(
            "conn-timeout",
            "ws://example.invalid/session",
            ReconnectionConfig {
                connect_timeout: Duration::from_millis(20),
                ..test_config()
            },
            quiet_heartbeat(),
            Arc::new(SlowConnector),
            Arc::new(NoopEvents),
        );

        assert!(!manager.connect().await);
        assert_eq!(manager.state(), ConnectionState::Failed);
        assert!(manager
            .get_status()
            .last_error
            .unwrap()
            .contains("timed out"));
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let connector = MockConnector::new();
        let manager = manager_with(connector);

        manager.disconnect("never connected").await;
        manager.disconnect("never connected").await;
        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_send_while_disconnected_queues() {
        let connector = MockConnector::new();
        let manager = manager_with(connector);

        assert!(!manager.send_message(json!({"type": "data", "n": 1}), false).await);
        assert_eq!(manager.pending_count(), 1);
    }

    #[tokio::test]
    async fn test_send_while_connected_goes_to_transport() {
        let connector = MockConnector::new();
        let transport = MockTransport::new();
        connector.push_transport(transport.clone());
        let manager = manager_with(connector);

        assert!(manager.connect().await);
        assert!(manager.send_message(json!({"type": "data", "n": 1}), false).await);

        assert_eq!(transport.sent_count(), 1);
        let frame: Value = serde_json::from_str(&transport.sent_frames()[0]).unwrap();
        // An id was assigned to the message on the way out
        assert!(frame["id"].is_string());

        manager.disconnect("test done").await;
    }

    #[tokio::test]
    async fn test_queued_messages_flush_on_connect_in_order() {
        let connector = MockConnector::new();
        let transport = MockTransport::new();
        connector.push_transport(transport.clone());
        let manager = manager_with(connector);

        for n in 0..3 {
            manager
                .send_message(json!({"type": "data", "id": format!("m{n}")}), false)
                .await;
        }
        assert_eq!(manager.pending_count(), 3);

        assert!(manager.connect().await);
        assert_eq!(manager.pending_count(), 0);

        let ids: Vec<String> = transport
            .sent_frames()
            .iter()
            .map(|f| serde_json::from_str::<Value>(f).unwrap()["id"]
                .as_str()
                .unwrap()
                .to_string())
            .collect();
        assert_eq!(ids, vec!["m0", "m1", "m2"]);

        manager.disconnect("test done").await;
    }

    #[tokio::test]
    async fn test_severed_transport_triggers_reconnect() {
        let connector = MockConnector::new();
        let first = MockTransport::new();
        let second = MockTransport::new();
        connector.push_transport(first.clone());
        connector.push_transport(second.clone());
        let manager = manager_with(connector.clone());

        assert!(manager.connect().await);
        first.sever();

        // Backoff is a few milliseconds; wait for the second dial to land
        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.state() != ConnectionState::Connected || connector.dial_count() < 2 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("reconnection should complete");

        assert_eq!(manager.state(), ConnectionState::Connected);
        assert_eq!(manager.get_status().metrics.reconnect_count, 1);

        manager.disconnect("test done").await;
    }

    #[tokio::test]
    async fn test_reconnect_limit_exhaustion_fails_connection() {
        let connector = MockConnector::new();
        let first = MockTransport::new();
        connector.push_transport(first.clone());
        // No replacement transports: every redial fails
        let manager = manager_with(connector.clone());

        assert!(manager.connect().await);
        first.sever();

        tokio::time::timeout(Duration::from_secs(2), manager.wait_closed())
            .await
            .expect("connection should settle");

        // Settles in Failed after max_attempts redials
        tokio::time::timeout(Duration::from_secs(2), async {
            while manager.state() != ConnectionState::Failed {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("connection should fail");

        assert_eq!(connector.dial_count(), 1 + 3);
    }

    #[tokio::test]
    async fn test_failed_send_requeues_message() {
        let connector = MockConnector::new();
        let transport = MockTransport::new();
        connector.push_transport(transport.clone());
        let manager = manager_with(connector);

        assert!(manager.connect().await);
        transport.fail_sends(true);

        assert!(!manager.send_message(json!({"type": "data", "id": "m1"}), false).await);
        // The message survived on the pending queue for the next flush
        let snapshot = manager.messages.pending_snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].message_id, "m1");
        assert_eq!(snapshot[0].retry_count, 1);

        manager.disconnect("test done").await;
    }

    #[tokio::test]
    async fn test_inbound_ack_required_message_is_acked() {
        let connector = MockConnector::new();
        let transport = MockTransport::new();
        connector.push_transport(transport.clone());
        let manager = manager_with(connector);

        assert!(manager.connect().await);
        transport.push_inbound(r#"{"type":"data","id":"in-1","ack_required":true}"#);

        tokio::time::timeout(Duration::from_secs(1), async {
            while transport.sent_count() == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("ack should be sent");

        let ack: Value = serde_json::from_str(&transport.sent_frames()[0]).unwrap();
        assert_eq!(ack["type"], "ack");
        assert_eq!(ack["id"], "in-1");

        manager.disconnect("test done").await;
    }

    #[tokio::test]
    async fn test_malformed_frame_does_not_kill_connection() {
        struct Recorder {
            delivered: AtomicUsize,
        }
        #[async_trait]
        impl ConnectionEvents for Recorder {
            async fn on_message(&self, _connection_id: &str, _message: Value) {
                self.delivered.fetch_add(1, Ordering::SeqCst);
            }
        }

        let events = Arc::new(Recorder {
            delivered: AtomicUsize::new(0),
        });
        let connector = MockConnector::new();
        let transport = MockTransport::new();
        connector.push_transport(transport.clone());
        let manager = ConnectionManager::new(
            "conn-malformed",
            "ws://example.invalid/session",
            test_config(),
            quiet_heartbeat(),
            connector,
            events.clone(),
        );

        assert!(manager.connect().await);
        transport.push_inbound("not json at all");
        transport.push_inbound(r#""a bare string""#);
        transport.push_inbound(r#"{"type":"data","id":"ok-1"}"#);

        tokio::time::timeout(Duration::from_secs(1), async {
            while events.delivered.load(Ordering::SeqCst) == 0 {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("well-formed message should still be delivered");

        assert_eq!(manager.state(), ConnectionState::Connected);
        manager.disconnect("test done").await;
    }

    #[tokio::test]
    async fn test_disconnect_cancels_inflight_reconnection() {
        let connector = MockConnector::new();
        let first = MockTransport::new();
        connector.push_transport(first.clone());
        let manager = ConnectionManager::new(
            "conn-cancel",
            "ws://example.invalid/session",
            ReconnectionConfig {
                max_attempts: 10,
                initial_delay: Duration::from_millis(500),
                jitter: false,
                ..test_config()
            },
            quiet_heartbeat(),
            connector,
            Arc::new(NoopEvents),
        );

        assert!(manager.connect().await);
        first.sever();

        // Let the error path enter its backoff sleep, then disconnect
        tokio::time::sleep(Duration::from_millis(50)).await;
        tokio::time::timeout(Duration::from_secs(1), manager.disconnect("operator"))
            .await
            .expect("disconnect must not hang on the backoff");

        assert_eq!(manager.state(), ConnectionState::Disconnected);
    }
}
