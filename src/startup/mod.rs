//! Ordered startup phases and the phase-aware readiness gate.
//!
//! Connection-critical services are constructed during the `Services`
//! phase. Validating one of them earlier cannot succeed and used to race
//! against construction; the gate turns that race into a deterministic,
//! observable "skipped" result that is distinguishable from a genuine
//! probe failure.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

use serde::Serialize;

use crate::metrics::READINESS_SKIPPED_TOTAL;
use crate::readiness::{
    Criticality, GroupValidationResult, ServiceReadinessValidator, ValidationOutcome,
    CONNECTION_CRITICAL_SERVICES,
};

/// The ordered phases of process startup. Ordering is the declaration
/// order; comparisons rely on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StartupPhase {
    Init,
    Dependencies,
    Database,
    Cache,
    Services,
    WebSocket,
    Finalize,
    Complete,
}

impl StartupPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            StartupPhase::Init => "init",
            StartupPhase::Dependencies => "dependencies",
            StartupPhase::Database => "database",
            StartupPhase::Cache => "cache",
            StartupPhase::Services => "services",
            StartupPhase::WebSocket => "websocket",
            StartupPhase::Finalize => "finalize",
            StartupPhase::Complete => "complete",
        }
    }
}

impl std::fmt::Display for StartupPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Process-wide startup progress, published by the composition root and
/// read by the gate.
#[derive(Default)]
pub struct StartupState {
    current: RwLock<Option<StartupPhase>>,
    completed: RwLock<HashSet<StartupPhase>>,
    in_progress: AtomicBool,
    complete: AtomicBool,
}

impl StartupState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn begin_phase(&self, phase: StartupPhase) {
        *self.current.write().unwrap() = Some(phase);
        self.in_progress.store(true, Ordering::Release);
        tracing::info!(phase = %phase, "Startup phase started");
    }

    pub fn complete_phase(&self, phase: StartupPhase) {
        self.completed.write().unwrap().insert(phase);
        tracing::info!(phase = %phase, "Startup phase completed");
    }

    pub fn mark_complete(&self) {
        *self.current.write().unwrap() = Some(StartupPhase::Complete);
        self.completed
            .write()
            .unwrap()
            .insert(StartupPhase::Complete);
        self.in_progress.store(false, Ordering::Release);
        self.complete.store(true, Ordering::Release);
        tracing::info!("Startup complete");
    }

    pub fn current_phase(&self) -> Option<StartupPhase> {
        *self.current.read().unwrap()
    }

    pub fn is_phase_completed(&self, phase: StartupPhase) -> bool {
        self.completed.read().unwrap().contains(&phase)
    }

    pub fn completed_phases(&self) -> Vec<StartupPhase> {
        let mut phases: Vec<StartupPhase> =
            self.completed.read().unwrap().iter().copied().collect();
        phases.sort();
        phases
    }

    pub fn is_in_progress(&self) -> bool {
        self.in_progress.load(Ordering::Acquire)
    }

    pub fn is_complete(&self) -> bool {
        self.complete.load(Ordering::Acquire)
    }
}

/// Summary handed to the connection-accept path.
#[derive(Debug, Clone, Serialize)]
pub struct ReadinessGuard {
    pub ready: bool,
    pub degradation_active: bool,
    pub critical_failures: Vec<String>,
    pub degraded_services: Vec<String>,
    pub elapsed_ms: u64,
}

/// Wraps the readiness validator with startup-phase awareness.
pub struct StartupPhaseGate {
    state: Arc<StartupState>,
    validator: Arc<ServiceReadinessValidator>,
    phase_gated: HashSet<&'static str>,
}

impl StartupPhaseGate {
    pub fn new(state: Arc<StartupState>, validator: Arc<ServiceReadinessValidator>) -> Self {
        Self {
            state,
            validator,
            phase_gated: CONNECTION_CRITICAL_SERVICES.iter().copied().collect(),
        }
    }

    pub fn validator(&self) -> &Arc<ServiceReadinessValidator> {
        &self.validator
    }

    pub fn startup_state(&self) -> &Arc<StartupState> {
        &self.state
    }

    /// Reason a service must be skipped right now, if any.
    ///
    /// Only connection-critical services are gated, and only while the
    /// current phase is earlier than `Services`. An unknown phase is
    /// treated conservatively: validation proceeds, so the system fails
    /// toward "attempt and report the real failure" rather than "silently
    /// skip forever".
    fn skip_reason(&self, name: &str) -> Option<String> {
        if !self.phase_gated.contains(name) {
            return None;
        }
        match self.state.current_phase() {
            Some(phase) if phase < StartupPhase::Services => {
                Some(format!("skipped: startup phase {}", phase))
            }
            Some(_) => None,
            None => {
                tracing::warn!(
                    service = %name,
                    "Startup phase unknown, attempting validation anyway"
                );
                None
            }
        }
    }

    /// Validate one service unless the startup phase forbids it.
    pub async fn validate_service(&self, name: &str, force_refresh: bool) -> ValidationOutcome {
        if let Some(reason) = self.skip_reason(name) {
            READINESS_SKIPPED_TOTAL.inc();
            tracing::info!(
                service = %name,
                phase = ?self.state.current_phase().map(|p| p.as_str()),
                "Validation skipped: service not yet created in startup sequence"
            );
            return ValidationOutcome::skipped(name, reason);
        }
        self.validator.validate_service(name, force_refresh).await
    }

    /// Phase-aware group validation: gated services are reported as
    /// skipped (and still count against readiness when critical); the rest
    /// go through normal dependency-ordered validation.
    pub async fn validate_group(
        &self,
        names: &[&str],
        fail_fast_on_critical: bool,
    ) -> GroupValidationResult {
        let started = Instant::now();

        let mut skipped = Vec::new();
        let mut validatable = Vec::new();
        for name in names {
            match self.skip_reason(name) {
                Some(reason) => skipped.push((*name, reason)),
                None => validatable.push(*name),
            }
        }

        let mut result = self
            .validator
            .validate_group(&validatable, fail_fast_on_critical)
            .await;

        for (name, reason) in skipped {
            READINESS_SKIPPED_TOTAL.inc();
            tracing::info!(
                service = %name,
                reason = %reason,
                "Validation skipped during group check"
            );
            if self.validator.criticality_of(name) == Some(Criticality::Critical) {
                result.critical_failures.push(name.to_string());
            }
            result
                .outcomes
                .insert(name.to_string(), ValidationOutcome::skipped(name, reason));
            result.total += 1;
        }

        result.overall_ready = result.critical_failures.is_empty();
        result.elapsed_ms = started.elapsed().as_millis() as u64;
        result
    }

    /// The check performed before accepting a connection.
    pub async fn readiness_guard(&self, names: &[&str]) -> ReadinessGuard {
        let result = self.validate_group(names, false).await;
        ReadinessGuard {
            ready: result.overall_ready,
            degradation_active: result.degradation_active,
            critical_failures: result.critical_failures,
            degraded_services: result.degraded_services,
            elapsed_ms: result.elapsed_ms,
        }
    }
}
