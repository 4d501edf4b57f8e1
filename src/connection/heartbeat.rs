//! Liveness probing for one connection.
//!
//! A periodic ping/pong cycle against the transport. Pongs are routed in by
//! the manager's receive loop via `handle_pong`; when pongs stop arriving the
//! timeout callback fires exactly once per breach.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::metrics::HEARTBEAT_TIMEOUTS_TOTAL;
use crate::transport::Transport;

use super::types::{ConnectionMetrics, HeartbeatConfig};

const PING_FRAME: &str = r#"{"type":"ping"}"#;

struct HeartbeatTask {
    shutdown: watch::Sender<bool>,
    handle: JoinHandle<()>,
}

pub struct HeartbeatMonitor {
    connection_id: String,
    config: HeartbeatConfig,
    metrics: Arc<ConnectionMetrics>,
    missed: AtomicU32,
    timeout_fired: AtomicBool,
    task: Mutex<Option<HeartbeatTask>>,
}

impl HeartbeatMonitor {
    pub fn new(
        connection_id: impl Into<String>,
        config: HeartbeatConfig,
        metrics: Arc<ConnectionMetrics>,
    ) -> Self {
        Self {
            connection_id: connection_id.into(),
            config,
            metrics,
            missed: AtomicU32::new(0),
            timeout_fired: AtomicBool::new(false),
            task: Mutex::new(None),
        }
    }

    /// Begin the ping loop. While `is_connected` holds, each cycle sends a
    /// ping and waits `pong_timeout` for `handle_pong` to land; a cycle
    /// without a pong (including a failed ping send) counts as missed.
    ///
    /// The timeout callback fires at most once per `start`; the loop then
    /// exits and waits for the manager to tear the connection down.
    pub fn start(
        self: &Arc<Self>,
        transport: Arc<dyn Transport>,
        is_connected: Arc<dyn Fn() -> bool + Send + Sync>,
        on_timeout: Box<dyn Fn() + Send + Sync>,
    ) {
        let mut task_slot = self.task.lock().unwrap();
        if task_slot.is_some() {
            tracing::warn!(
                connection_id = %self.connection_id,
                "Heartbeat already running, ignoring start"
            );
            return;
        }

        self.missed.store(0, Ordering::Release);
        self.timeout_fired.store(false, Ordering::Release);

        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
        let monitor = Arc::clone(self);

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(monitor.config.interval);
            // Skip immediate first tick
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = ticker.tick() => {}
                }

                if !is_connected() {
                    continue;
                }

                let ping_sent_ms = monitor.metrics.record_ping();
                if let Err(e) = transport.send(PING_FRAME).await {
                    // A dead transport cannot pong either; fold the send
                    // failure into the missed-pong accounting
                    tracing::debug!(
                        connection_id = %monitor.connection_id,
                        error = %e,
                        "Ping send failed"
                    );
                    if monitor.register_miss(&on_timeout) {
                        break;
                    }
                    continue;
                }

                tokio::select! {
                    _ = shutdown_rx.changed() => break,
                    _ = tokio::time::sleep(monitor.config.pong_timeout) => {}
                }

                if monitor.metrics.last_pong_ms() >= ping_sent_ms {
                    continue;
                }

                if monitor.register_miss(&on_timeout) {
                    break;
                }
            }

            tracing::debug!(connection_id = %monitor.connection_id, "Heartbeat loop stopped");
        });

        *task_slot = Some(HeartbeatTask {
            shutdown: shutdown_tx,
            handle,
        });
    }

    /// Returns true when the threshold breach fired and the loop should exit.
    fn register_miss(&self, on_timeout: &(dyn Fn() + Send + Sync)) -> bool {
        let missed = self.missed.fetch_add(1, Ordering::AcqRel) + 1;
        tracing::warn!(
            connection_id = %self.connection_id,
            missed = missed,
            max_missed = self.config.max_missed,
            "Missed heartbeat pong"
        );

        if missed >= self.config.max_missed && !self.timeout_fired.swap(true, Ordering::AcqRel) {
            HEARTBEAT_TIMEOUTS_TOTAL.inc();
            tracing::warn!(
                connection_id = %self.connection_id,
                missed = missed,
                "Heartbeat timeout"
            );
            on_timeout();
            return true;
        }
        false
    }

    /// Record a pong: stamps metrics, updates latency, resets the missed
    /// counter and re-arms the timeout.
    pub fn handle_pong(&self) {
        self.metrics.record_pong();
        self.missed.store(0, Ordering::Release);
        self.timeout_fired.store(false, Ordering::Release);
    }

    /// Cancel the loop and wait for it to exit. Safe to call when never
    /// started or already stopped.
    pub async fn stop(&self) {
        let task = self.task.lock().unwrap().take();
        if let Some(task) = task {
            let _ = task.shutdown.send(true);
            if let Err(e) = task.handle.await {
                if !e.is_cancelled() {
                    tracing::warn!(
                        connection_id = %self.connection_id,
                        error = %e,
                        "Heartbeat task join failed"
                    );
                }
            }
        }
    }

    pub fn missed_heartbeats(&self) -> u32 {
        self.missed.load(Ordering::Acquire)
    }
}
