//! Reconnection attempt counting and exponential backoff.
//!
//! Policy lives here, outside the connection manager: the controller owns
//! the retry loop and delay math, the manager supplies the connect future.

use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;

use crate::metrics::RECONNECTIONS_TOTAL;

use super::events::ConnectionEvents;
use super::types::{ReconnectionConfig, ReconnectionReason};

/// Symmetric jitter bound as a fraction of the computed delay.
const JITTER_FRACTION: f64 = 0.2;

pub struct ReconnectionController {
    connection_id: String,
    config: ReconnectionConfig,
    attempts: AtomicU32,
    cancel: watch::Sender<bool>,
    events: Arc<dyn ConnectionEvents>,
}

impl ReconnectionController {
    pub fn new(
        connection_id: impl Into<String>,
        config: ReconnectionConfig,
        events: Arc<dyn ConnectionEvents>,
    ) -> Self {
        let (cancel, _) = watch::channel(false);
        Self {
            connection_id: connection_id.into(),
            config,
            attempts: AtomicU32::new(0),
            cancel,
            events,
        }
    }

    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::Acquire)
    }

    pub fn is_within_limits(&self) -> bool {
        self.attempts() < self.config.max_attempts
    }

    /// Reset the attempt counter. Called on every successful connect, not
    /// only reconnects, so manual reconnects never inherit decayed state.
    pub fn reset_attempts(&self) {
        self.attempts.store(0, Ordering::Release);
    }

    /// Abort an in-flight backoff loop. No callbacks fire after this.
    pub fn cancel_reconnection(&self) {
        self.cancel.send_replace(true);
    }

    /// Re-arm after a cancellation. The manager calls this before spawning a
    /// new cycle; a cancel that lands afterwards is never lost.
    pub(crate) fn arm(&self) {
        self.cancel.send_replace(false);
    }

    /// Delay for the given pre-increment attempt number: attempt 0 sleeps
    /// `initial_delay`. Jitter is symmetric and the final value is clamped
    /// at `max_delay` even after jitter is applied.
    pub fn compute_delay(&self, attempt: u32) -> Duration {
        let base = self.config.initial_delay.as_secs_f64()
            * self.config.backoff_multiplier.powi(attempt as i32);
        let max = self.config.max_delay.as_secs_f64();
        let capped = base.min(max);

        let delayed = if self.config.jitter {
            let jitter_range = capped * JITTER_FRACTION;
            let jitter = if jitter_range > 0.0 {
                rand::rng().random_range(-jitter_range..jitter_range)
            } else {
                0.0
            };
            capped + jitter
        } else {
            capped
        };

        Duration::from_secs_f64(delayed.clamp(0.0, max))
    }

    /// Drive reconnection attempts until one succeeds, the attempt budget
    /// is exhausted, or the loop is cancelled. Returns whether the
    /// connection was re-established.
    pub async fn start_reconnection<F, Fut>(&self, reason: ReconnectionReason, connect_fn: F) -> bool
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: Future<Output = bool> + Send,
    {
        if reason == ReconnectionReason::Manual {
            self.reset_attempts();
        }

        let mut cancel_rx = self.cancel.subscribe();

        tracing::info!(
            connection_id = %self.connection_id,
            reason = %reason,
            attempts_so_far = self.attempts(),
            "Starting reconnection"
        );

        loop {
            if *cancel_rx.borrow() {
                return false;
            }

            let attempt = self.attempts();
            if attempt >= self.config.max_attempts {
                tracing::warn!(
                    connection_id = %self.connection_id,
                    attempts = attempt,
                    "Reconnection attempt limit exceeded"
                );
                if !*cancel_rx.borrow() {
                    self.events.on_reconnect_failure(&self.connection_id).await;
                }
                return false;
            }

            let delay = self.compute_delay(attempt);
            tracing::info!(
                connection_id = %self.connection_id,
                attempt = attempt + 1,
                max_attempts = self.config.max_attempts,
                delay_ms = delay.as_millis() as u64,
                "Waiting before reconnection attempt"
            );

            tokio::select! {
                _ = cancel_rx.changed() => {
                    if *cancel_rx.borrow() {
                        tracing::debug!(
                            connection_id = %self.connection_id,
                            "Reconnection cancelled during backoff"
                        );
                        return false;
                    }
                }
                _ = tokio::time::sleep(delay) => {}
            }

            if *cancel_rx.borrow() {
                return false;
            }

            if connect_fn().await {
                self.reset_attempts();
                if !*cancel_rx.borrow() {
                    RECONNECTIONS_TOTAL.inc();
                    self.events.on_reconnect_success(&self.connection_id).await;
                }
                tracing::info!(
                    connection_id = %self.connection_id,
                    "Reconnection succeeded"
                );
                return true;
            }

            self.attempts.fetch_add(1, Ordering::AcqRel);
        }
    }
}
