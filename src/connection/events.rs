use async_trait::async_trait;

/// Constructor-injected handler for connection lifecycle and inbound
/// application messages. One handler per connection; methods default to
/// no-ops so implementors subscribe only to what they need.
#[async_trait]
pub trait ConnectionEvents: Send + Sync {
    /// A deduplicated application message arrived.
    async fn on_message(&self, connection_id: &str, message: serde_json::Value) {
        let _ = (connection_id, message);
    }

    /// A connect or transport failure was recorded.
    async fn on_error(&self, connection_id: &str, error: &str) {
        let _ = (connection_id, error);
    }

    /// The connection finished transitioning to `Disconnected`.
    async fn on_disconnect(&self, connection_id: &str, reason: &str) {
        let _ = (connection_id, reason);
    }

    /// A reconnection cycle re-established the transport.
    async fn on_reconnect_success(&self, connection_id: &str) {
        let _ = connection_id;
    }

    /// A reconnection cycle exhausted its attempt budget.
    async fn on_reconnect_failure(&self, connection_id: &str) {
        let _ = connection_id;
    }
}

/// Default handler for connections that only need the state machine.
pub struct NoopEvents;

#[async_trait]
impl ConnectionEvents for NoopEvents {}
