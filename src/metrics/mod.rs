//! Prometheus metrics for the session gateway.
//!
//! - Connection metrics (registered, opened, closed)
//! - Message metrics (sent, queued, dropped, deduplicated, expired)
//! - Ack metrics (sent, received, latency)
//! - Reliability metrics (reconnections, heartbeat timeouts)
//! - Readiness metrics (validations by outcome, phase-gate skips)

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};

/// Prefix for all metrics
const METRIC_PREFIX: &str = "sgw";

lazy_static! {
    // ============================================================================
    // Connection Metrics
    // ============================================================================

    /// Connections currently held by the registry
    pub static ref CONNECTIONS_ACTIVE: IntGauge = register_int_gauge!(
        format!("{}_connections_active", METRIC_PREFIX),
        "Connections currently registered"
    ).unwrap();

    /// Total connections registered since start
    pub static ref CONNECTIONS_OPENED: IntCounter = register_int_counter!(
        format!("{}_connections_opened_total", METRIC_PREFIX),
        "Total connections registered"
    ).unwrap();

    /// Total connections removed since start
    pub static ref CONNECTIONS_CLOSED: IntCounter = register_int_counter!(
        format!("{}_connections_closed_total", METRIC_PREFIX),
        "Total connections removed"
    ).unwrap();

    // ============================================================================
    // Message Metrics
    // ============================================================================

    /// Messages written to a transport
    pub static ref MESSAGES_SENT_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_sent_total", METRIC_PREFIX),
        "Total messages sent over a transport"
    ).unwrap();

    /// Messages queued while a connection was down
    pub static ref MESSAGES_QUEUED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_queued_total", METRIC_PREFIX),
        "Total messages queued while disconnected"
    ).unwrap();

    /// Messages dropped because the pending queue was full
    pub static ref MESSAGES_DROPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_dropped_total", METRIC_PREFIX),
        "Total messages dropped due to queue overflow"
    ).unwrap();

    /// Preserved messages discarded past their retention window
    pub static ref MESSAGES_EXPIRED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_expired_total", METRIC_PREFIX),
        "Total preserved messages expired before flush"
    ).unwrap();

    /// Inbound duplicates suppressed by the dedup set
    pub static ref MESSAGES_DEDUPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_messages_deduplicated_total", METRIC_PREFIX),
        "Total duplicate inbound messages dropped"
    ).unwrap();

    // ============================================================================
    // Ack Metrics
    // ============================================================================

    /// Acknowledgments sent for inbound messages
    pub static ref ACKS_SENT_TOTAL: IntCounter = register_int_counter!(
        format!("{}_acks_sent_total", METRIC_PREFIX),
        "Total acknowledgments sent"
    ).unwrap();

    /// Acknowledgments received for outbound messages
    pub static ref ACKS_RECEIVED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_acks_received_total", METRIC_PREFIX),
        "Total acknowledgments received"
    ).unwrap();

    /// Time from send to acknowledgment
    pub static ref ACK_LATENCY_SECONDS: Histogram = register_histogram!(
        format!("{}_ack_latency_seconds", METRIC_PREFIX),
        "Acknowledgment latency in seconds",
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 30.0]
    ).unwrap();

    // ============================================================================
    // Reliability Metrics
    // ============================================================================

    /// Successful reconnections
    pub static ref RECONNECTIONS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_reconnections_total", METRIC_PREFIX),
        "Total successful reconnections"
    ).unwrap();

    /// Heartbeat timeout breaches
    pub static ref HEARTBEAT_TIMEOUTS_TOTAL: IntCounter = register_int_counter!(
        format!("{}_heartbeat_timeouts_total", METRIC_PREFIX),
        "Total heartbeat timeout breaches"
    ).unwrap();

    // ============================================================================
    // Readiness Metrics
    // ============================================================================

    /// Readiness validations by service and outcome
    pub static ref READINESS_CHECKS_TOTAL: IntCounterVec = register_int_counter_vec!(
        format!("{}_readiness_checks_total", METRIC_PREFIX),
        "Readiness validations by service and outcome",
        &["service", "outcome"]
    ).unwrap();

    /// Validations skipped by the startup phase gate
    pub static ref READINESS_SKIPPED_TOTAL: IntCounter = register_int_counter!(
        format!("{}_readiness_skipped_total", METRIC_PREFIX),
        "Validations skipped by the startup phase gate"
    ).unwrap();
}

/// Render the default registry in the Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    encoder.encode_to_string(&metric_families)
}
