use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;

/// How much a dependency's failure matters: a Critical failure blocks
/// readiness, anything else degrades it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Critical,
    Important,
    Optional,
}

impl Criticality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Criticality::Critical => "critical",
            Criticality::Important => "important",
            Criticality::Optional => "optional",
        }
    }

    /// Timeout multiplier: critical services get more patience.
    pub fn timeout_multiplier(&self) -> f64 {
        match self {
            Criticality::Critical => 1.5,
            Criticality::Important => 1.2,
            Criticality::Optional => 0.8,
        }
    }
}

/// Deployment environment, scaling validation timeouts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Environment {
    Test,
    Development,
    Staging,
    Production,
}

impl Environment {
    pub fn timeout_multiplier(&self) -> f64 {
        match self {
            Environment::Test => 0.5,
            Environment::Development => 1.0,
            Environment::Staging => 2.0,
            Environment::Production => 3.0,
        }
    }

    pub fn from_run_mode(mode: &str) -> Self {
        match mode {
            "test" => Environment::Test,
            "staging" => Environment::Staging,
            "production" | "prod" => Environment::Production,
            _ => Environment::Development,
        }
    }
}

/// Outcome level a probe can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReadinessLevel {
    Ready,
    Degraded,
    NotReady,
}

impl ReadinessLevel {
    pub fn is_ready(&self) -> bool {
        matches!(self, ReadinessLevel::Ready)
    }
}

impl From<bool> for ReadinessLevel {
    fn from(ready: bool) -> Self {
        if ready {
            ReadinessLevel::Ready
        } else {
            ReadinessLevel::NotReady
        }
    }
}

/// Validation timeout that adapts to environment and criticality:
/// `min(base * env_multiplier * criticality_multiplier, max)`.
#[derive(Debug, Clone)]
pub struct AdaptiveTimeout {
    pub base: Duration,
    pub max: Duration,
}

impl AdaptiveTimeout {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    pub fn effective(&self, environment: Environment, criticality: Criticality) -> Duration {
        let scaled = self.base.as_secs_f64()
            * environment.timeout_multiplier()
            * criticality.timeout_multiplier();
        Duration::from_secs_f64(scaled.min(self.max.as_secs_f64()))
    }
}

impl Default for AdaptiveTimeout {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(5),
            max: Duration::from_secs(30),
        }
    }
}

/// A readiness probe against one external dependency. Probe errors count as
/// failed attempts, never as fatal validator errors.
#[async_trait]
pub trait ReadinessProbe: Send + Sync {
    async fn probe(&self) -> anyhow::Result<ReadinessLevel>;
}

/// Adapter for plain boolean probe closures.
pub struct FnProbe<F>(pub F);

#[async_trait]
impl<F> ReadinessProbe for FnProbe<F>
where
    F: Fn() -> bool + Send + Sync,
{
    async fn probe(&self) -> anyhow::Result<ReadinessLevel> {
        Ok(ReadinessLevel::from((self.0)()))
    }
}

/// Hook invoked when a non-critical service exhausts its attempts, letting
/// the system continue with reduced functionality.
#[async_trait]
pub trait DegradationHandler: Send + Sync {
    async fn degrade(&self, service: &str) -> anyhow::Result<()>;
}

/// Per-service validation configuration.
#[derive(Clone)]
pub struct ServiceReadinessConfig {
    pub name: String,
    pub probe: Arc<dyn ReadinessProbe>,
    pub criticality: Criticality,
    pub timeout: AdaptiveTimeout,
    pub depends_on: Vec<String>,
    pub degradation: Option<Arc<dyn DegradationHandler>>,
    pub retry_count: u32,
    pub retry_delay: Duration,
    pub exponential_backoff: bool,
}

impl ServiceReadinessConfig {
    pub fn new(
        name: impl Into<String>,
        criticality: Criticality,
        probe: Arc<dyn ReadinessProbe>,
    ) -> Self {
        Self {
            name: name.into(),
            probe,
            criticality,
            timeout: AdaptiveTimeout::default(),
            depends_on: Vec::new(),
            degradation: None,
            retry_count: 2,
            retry_delay: Duration::from_millis(200),
            exponential_backoff: true,
        }
    }

    pub fn with_dependencies(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|d| d.to_string()).collect();
        self
    }

    pub fn with_timeout(mut self, timeout: AdaptiveTimeout) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_degradation(mut self, handler: Arc<dyn DegradationHandler>) -> Self {
        self.degradation = Some(handler);
        self
    }

    pub fn with_retries(mut self, retry_count: u32, retry_delay: Duration) -> Self {
        self.retry_count = retry_count;
        self.retry_delay = retry_delay;
        self
    }
}

/// Result of validating one service.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationOutcome {
    pub service: String,
    pub ready: bool,
    pub level: ReadinessLevel,
    pub degraded: bool,
    pub can_gracefully_degrade: bool,
    pub attempts: u32,
    pub elapsed_ms: u64,
    pub from_cache: bool,
    /// Present only when validation was skipped (e.g. by the startup phase
    /// gate); distinguishes a skip from a genuine probe failure.
    pub skipped_reason: Option<String>,
    pub error: Option<String>,
}

impl ValidationOutcome {
    pub fn skipped(service: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            ready: false,
            level: ReadinessLevel::NotReady,
            degraded: false,
            can_gracefully_degrade: false,
            attempts: 0,
            elapsed_ms: 0,
            from_cache: false,
            skipped_reason: Some(reason.into()),
            error: None,
        }
    }

    pub fn is_skipped(&self) -> bool {
        self.skipped_reason.is_some()
    }
}

/// Aggregate result of validating a service group.
#[derive(Debug, Clone, Serialize)]
pub struct GroupValidationResult {
    pub total: usize,
    pub ready_count: usize,
    pub critical_failures: Vec<String>,
    pub degraded_services: Vec<String>,
    pub degradation_active: bool,
    /// True iff there are zero critical failures; degraded non-critical
    /// services do not block readiness.
    pub overall_ready: bool,
    pub elapsed_ms: u64,
    pub outcomes: HashMap<String, ValidationOutcome>,
}
