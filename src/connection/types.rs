use std::sync::atomic::{AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::Serialize;

/// Milliseconds since the Unix epoch.
pub(crate) fn current_time_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Lifecycle state of a single managed connection.
///
/// Transitions are driven only by the owning `ConnectionManager`:
///
/// ```text
/// Disconnected --connect()--> Connecting --success--> Connected
/// Connecting --failure/timeout--> Failed
/// Connected --transport error / heartbeat timeout--> Disconnected
///     --(within limits)--> Reconnecting --success--> Connected
/// Reconnecting --limits exceeded--> Failed
/// any --disconnect()--> Closing --> Disconnected
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Reconnecting,
    Failed,
    Closing,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Failed => "failed",
            ConnectionState::Closing => "closing",
        }
    }

    /// Whether a bulk recovery sweep should attempt to reconnect this state.
    pub fn needs_recovery(&self) -> bool {
        matches!(self, ConnectionState::Failed | ConnectionState::Disconnected)
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a reconnection cycle was started. Diagnostic only, except that
/// `Manual` resets the attempt counter before the cycle begins.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconnectionReason {
    ConnectionLost,
    NetworkError,
    ServerError,
    Timeout,
    Manual,
}

impl ReconnectionReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconnectionReason::ConnectionLost => "connection_lost",
            ReconnectionReason::NetworkError => "network_error",
            ReconnectionReason::ServerError => "server_error",
            ReconnectionReason::Timeout => "timeout",
            ReconnectionReason::Manual => "manual",
        }
    }
}

impl std::fmt::Display for ReconnectionReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunable parameters for reconnection and outbound queueing.
///
/// Immutable per connection; supplied at construction.
#[derive(Debug, Clone)]
pub struct ReconnectionConfig {
    /// Maximum reconnection attempts before the connection is marked failed
    pub max_attempts: u32,
    /// Delay before the first reconnection attempt
    pub initial_delay: Duration,
    /// Upper bound on the backoff delay, jitter included
    pub max_delay: Duration,
    /// Multiplier for exponential growth
    pub backoff_multiplier: f64,
    /// Apply symmetric jitter (up to 20%) to each delay
    pub jitter: bool,
    /// Hard upper bound on a single connect attempt
    pub connect_timeout: Duration,
    /// Keep queued messages across a reconnect and flush them on success
    pub preserve_pending_messages: bool,
    /// Bound on the pending outbound queue; overflow is dropped
    pub max_pending_messages: usize,
    /// Retention window for preserved messages
    pub message_retention: Duration,
}

impl Default for ReconnectionConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            backoff_multiplier: 2.0,
            jitter: true,
            connect_timeout: Duration::from_secs(30),
            preserve_pending_messages: true,
            max_pending_messages: 1000,
            message_retention: Duration::from_secs(24 * 3600),
        }
    }
}

/// Heartbeat tuning. Deliberately separate from `ReconnectionConfig`:
/// liveness probing and retry policy are owned by different components.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Interval between pings
    pub interval: Duration,
    /// How long to wait for a pong after each ping
    pub pong_timeout: Duration,
    /// Missed pongs before the timeout callback fires
    pub max_missed: u32,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            pong_timeout: Duration::from_secs(10),
            max_missed: 3,
        }
    }
}

/// One outbound message and its delivery bookkeeping.
///
/// Owned exclusively by the `MessageHandler` of the connection that created
/// it; never shared across connections.
#[derive(Debug, Clone)]
pub struct MessageState {
    pub message_id: String,
    pub content: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    pub ack_required: bool,
    pub acknowledged: bool,
    pub retry_count: u32,
}

/// Per-connection counters. Mutated only by the owning manager and its
/// heartbeat monitor; external observers read snapshots.
#[derive(Debug, Default)]
pub struct ConnectionMetrics {
    connect_time_ms: AtomicI64,
    disconnect_time_ms: AtomicI64,
    message_count: AtomicU64,
    error_count: AtomicU64,
    reconnect_count: AtomicU32,
    last_ping_ms: AtomicI64,
    last_pong_ms: AtomicI64,
    latency_ms: AtomicI64,
}

impl ConnectionMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn mark_connected(&self) {
        self.connect_time_ms.store(current_time_ms(), Ordering::Release);
        self.disconnect_time_ms.store(0, Ordering::Release);
    }

    pub fn mark_disconnected(&self) {
        self.disconnect_time_ms
            .store(current_time_ms(), Ordering::Release);
    }

    pub fn record_message(&self) {
        self.message_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_reconnect(&self) {
        self.reconnect_count.fetch_add(1, Ordering::AcqRel);
    }

    pub fn record_ping(&self) -> i64 {
        let now = current_time_ms();
        self.last_ping_ms.store(now, Ordering::Release);
        now
    }

    pub fn record_pong(&self) {
        let now = current_time_ms();
        self.last_pong_ms.store(now, Ordering::Release);
        let last_ping = self.last_ping_ms.load(Ordering::Acquire);
        if last_ping > 0 {
            self.latency_ms.store(now - last_ping, Ordering::Release);
        }
    }

    pub fn last_ping_ms(&self) -> i64 {
        self.last_ping_ms.load(Ordering::Acquire)
    }

    pub fn last_pong_ms(&self) -> i64 {
        self.last_pong_ms.load(Ordering::Acquire)
    }

    pub fn snapshot(&self) -> ConnectionMetricsSnapshot {
        let to_datetime = |ms: i64| -> Option<DateTime<Utc>> {
            (ms > 0).then(|| Utc.timestamp_millis_opt(ms).single()).flatten()
        };

        ConnectionMetricsSnapshot {
            connect_time: to_datetime(self.connect_time_ms.load(Ordering::Acquire)),
            disconnect_time: to_datetime(self.disconnect_time_ms.load(Ordering::Acquire)),
            message_count: self.message_count.load(Ordering::Acquire),
            error_count: self.error_count.load(Ordering::Acquire),
            reconnect_count: self.reconnect_count.load(Ordering::Acquire),
            last_ping: to_datetime(self.last_ping_ms.load(Ordering::Acquire)),
            last_pong: to_datetime(self.last_pong_ms.load(Ordering::Acquire)),
            latency_ms: self.latency_ms.load(Ordering::Acquire),
        }
    }
}

/// Read-only view of `ConnectionMetrics` for status reporting.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionMetricsSnapshot {
    pub connect_time: Option<DateTime<Utc>>,
    pub disconnect_time: Option<DateTime<Utc>>,
    pub message_count: u64,
    pub error_count: u64,
    pub reconnect_count: u32,
    pub last_ping: Option<DateTime<Utc>>,
    pub last_pong: Option<DateTime<Utc>>,
    pub latency_ms: i64,
}

/// Point-in-time status of one connection, as exposed by `get_status()`.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub id: String,
    pub state: ConnectionState,
    pub reconnect_attempts: u32,
    pub pending_messages: usize,
    pub unacknowledged_messages: usize,
    pub missed_heartbeats: u32,
    pub last_error: Option<String>,
    pub metrics: ConnectionMetricsSnapshot,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_recovery_predicate() {
        assert!(ConnectionState::Failed.needs_recovery());
        assert!(ConnectionState::Disconnected.needs_recovery());
        assert!(!ConnectionState::Connected.needs_recovery());
        assert!(!ConnectionState::Connecting.needs_recovery());
        assert!(!ConnectionState::Closing.needs_recovery());
        assert!(!ConnectionState::Reconnecting.needs_recovery());
    }

    #[test]
    fn test_reconnection_config_defaults() {
        let config = ReconnectionConfig::default();
        assert_eq!(config.max_attempts, 10);
        assert_eq!(config.initial_delay, Duration::from_secs(1));
        assert_eq!(config.max_delay, Duration::from_secs(60));
        assert_eq!(config.backoff_multiplier, 2.0);
        assert!(config.jitter);
        assert_eq!(config.connect_timeout, Duration::from_secs(30));
        assert_eq!(config.max_pending_messages, 1000);
        assert_eq!(config.message_retention, Duration::from_secs(86_400));
    }

    #[test]
    fn test_metrics_pong_updates_latency() {
        let metrics = ConnectionMetrics::new();
        metrics.record_ping();
        metrics.record_pong();

        let snapshot = metrics.snapshot();
        assert!(snapshot.last_ping.is_some());
        assert!(snapshot.last_pong.is_some());
        assert!(snapshot.latency_ms >= 0);
    }

    #[test]
    fn test_metrics_snapshot_unset_times() {
        let metrics = ConnectionMetrics::new();
        let snapshot = metrics.snapshot();
        assert!(snapshot.connect_time.is_none());
        assert!(snapshot.disconnect_time.is_none());
        assert_eq!(snapshot.message_count, 0);
    }
}
