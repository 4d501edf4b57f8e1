//! Dependency-graph readiness validation.
//!
//! Each registered service gets a probe, a criticality, an adaptive
//! timeout, and an optional degradation handler. Validation retries with
//! backoff, caches recent results, and walks dependencies best-effort
//! before probing the dependent service.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::RwLock;
use std::time::Instant;

use dashmap::DashMap;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::metrics::READINESS_CHECKS_TOTAL;

use super::types::{
    Criticality, Environment, GroupValidationResult, ReadinessLevel, ServiceReadinessConfig,
    ValidationOutcome,
};

/// How long a validation result stays fresh.
const DEFAULT_CACHE_TTL: std::time::Duration = std::time::Duration::from_secs(30);

struct CachedValidation {
    outcome: ValidationOutcome,
    at: Instant,
}

pub struct ServiceReadinessValidator {
    services: RwLock<HashMap<String, ServiceReadinessConfig>>,
    cache: DashMap<String, CachedValidation>,
    cache_ttl: std::time::Duration,
    environment: Environment,
}

impl ServiceReadinessValidator {
    pub fn new(environment: Environment) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            cache: DashMap::new(),
            cache_ttl: DEFAULT_CACHE_TTL,
            environment,
        }
    }

    pub fn with_cache_ttl(environment: Environment, cache_ttl: std::time::Duration) -> Self {
        Self {
            cache_ttl,
            ..Self::new(environment)
        }
    }

    pub fn register(&self, config: ServiceReadinessConfig) {
        tracing::debug!(
            service = %config.name,
            criticality = %config.criticality.as_str(),
            dependencies = ?config.depends_on,
            "Service registered for readiness validation"
        );
        self.services
            .write()
            .unwrap()
            .insert(config.name.clone(), config);
    }

    pub fn registered_services(&self) -> Vec<String> {
        self.services.read().unwrap().keys().cloned().collect()
    }

    pub fn criticality_of(&self, name: &str) -> Option<Criticality> {
        self.services
            .read()
            .unwrap()
            .get(name)
            .map(|c| c.criticality)
    }

    /// Drop any cached result for a service.
    pub fn invalidate(&self, name: &str) {
        self.cache.remove(name);
    }

    /// Validate one service, honoring the result cache unless
    /// `force_refresh` is set.
    pub async fn validate_service(&self, name: &str, force_refresh: bool) -> ValidationOutcome {
        let mut visiting = HashSet::new();
        visiting.insert(name.to_string());
        self.validate_inner(name.to_string(), force_refresh, visiting)
            .await
    }

    fn validate_inner(
        &self,
        name: String,
        force_refresh: bool,
        visiting: HashSet<String>,
    ) -> BoxFuture<'_, ValidationOutcome> {
        async move {
            if !force_refresh {
                if let Some(cached) = self.cache.get(&name) {
                    if cached.at.elapsed() < self.cache_ttl {
                        let mut outcome = cached.outcome.clone();
                        outcome.from_cache = true;
                        return outcome;
                    }
                }
            }

            let Some(config) = self.services.read().unwrap().get(&name).cloned() else {
                tracing::warn!(service = %name, "Readiness requested for unregistered service");
                return ValidationOutcome {
                    service: name,
                    ready: false,
                    level: ReadinessLevel::NotReady,
                    degraded: false,
                    can_gracefully_degrade: false,
                    attempts: 0,
                    elapsed_ms: 0,
                    from_cache: false,
                    skipped_reason: None,
                    error: Some("service not registered".to_string()),
                };
            };

            self.precheck_dependencies(&config, &visiting).await;

            let outcome = self.run_validation(&config).await;

            self.cache.insert(
                name,
                CachedValidation {
                    outcome: outcome.clone(),
                    at: Instant::now(),
                },
            );
            READINESS_CHECKS_TOTAL
                .with_label_values(&[
                    outcome.service.as_str(),
                    if outcome.ready { "ready" } else { "not_ready" },
                ])
                .inc();
            outcome
        }
        .boxed()
    }

    /// Best-effort recursive validation of dependencies. A failed critical
    /// dependency is logged but never aborts: many services degrade rather
    /// than hard-fail, so the dependent's own probe still runs.
    async fn precheck_dependencies(
        &self,
        config: &ServiceReadinessConfig,
        visiting: &HashSet<String>,
    ) {
        for dep in &config.depends_on {
            if visiting.contains(dep) {
                tracing::warn!(
                    service = %config.name,
                    dependency = %dep,
                    "Dependency cycle detected, skipping pre-check"
                );
                continue;
            }

            let mut next_visiting = visiting.clone();
            next_visiting.insert(dep.clone());
            let dep_outcome = self
                .validate_inner(dep.clone(), false, next_visiting)
                .await;

            if !dep_outcome.ready {
                let dep_criticality = self.criticality_of(dep);
                tracing::warn!(
                    service = %config.name,
                    dependency = %dep,
                    dependency_criticality = ?dep_criticality.map(|c| c.as_str()),
                    "Dependency not ready before validation"
                );
            }
        }
    }

    /// The retry loop for one service: up to `retry_count + 1` attempts,
    /// each bounded by the effective adaptive timeout, with optionally
    /// exponential delay between attempts. Probe errors count as failed
    /// attempts.
    async fn run_validation(&self, config: &ServiceReadinessConfig) -> ValidationOutcome {
        let effective_timeout = config.timeout.effective(self.environment, config.criticality);
        let started = Instant::now();
        let max_attempts = config.retry_count + 1;

        let mut attempts = 0u32;
        let mut last_error: Option<String> = None;

        while attempts < max_attempts {
            if attempts > 0 {
                let delay = if config.exponential_backoff {
                    config.retry_delay * 2u32.saturating_pow(attempts - 1)
                } else {
                    config.retry_delay
                };
                tokio::time::sleep(delay).await;

                if started.elapsed() >= effective_timeout {
                    last_error =
                        Some(format!("validation timed out after {:?}", effective_timeout));
                    break;
                }
            }
            attempts += 1;

            let remaining = effective_timeout.saturating_sub(started.elapsed());
            match tokio::time::timeout(remaining, config.probe.probe()).await {
                Ok(Ok(level)) if level.is_ready() => {
                    tracing::debug!(
                        service = %config.name,
                        attempts = attempts,
                        elapsed_ms = started.elapsed().as_millis() as u64,
                        "Service validated"
                    );
                    return ValidationOutcome {
                        service: config.name.clone(),
                        ready: true,
                        level,
                        degraded: false,
                        can_gracefully_degrade: config.degradation.is_some(),
                        attempts,
                        elapsed_ms: started.elapsed().as_millis() as u64,
                        from_cache: false,
                        skipped_reason: None,
                        error: None,
                    };
                }
                Ok(Ok(level)) => {
                    last_error = Some(format!("probe reported {:?}", level));
                }
                Ok(Err(e)) => {
                    // A probe exception is a failed attempt, not a fatal
                    // validator error
                    last_error = Some(e.to_string());
                    tracing::debug!(
                        service = %config.name,
                        attempt = attempts,
                        error = %e,
                        "Probe attempt failed"
                    );
                }
                Err(_) => {
                    last_error =
                        Some(format!("probe timed out after {:?}", remaining));
                }
            }
        }

        self.handle_exhaustion(config, attempts, started, last_error)
            .await
    }

    async fn handle_exhaustion(
        &self,
        config: &ServiceReadinessConfig,
        attempts: u32,
        started: Instant,
        last_error: Option<String>,
    ) -> ValidationOutcome {
        tracing::warn!(
            service = %config.name,
            criticality = %config.criticality.as_str(),
            attempts = attempts,
            error = ?last_error,
            "Service validation exhausted its attempts"
        );

        let can_degrade =
            config.degradation.is_some() && config.criticality != Criticality::Critical;

        if can_degrade {
            if let Some(handler) = &config.degradation {
                if let Err(e) = handler.degrade(&config.name).await {
                    tracing::warn!(
                        service = %config.name,
                        error = %e,
                        "Degradation handler failed"
                    );
                }
            }
            tracing::info!(service = %config.name, "Service degraded gracefully");
        }

        ValidationOutcome {
            service: config.name.clone(),
            ready: false,
            level: if can_degrade {
                ReadinessLevel::Degraded
            } else {
                ReadinessLevel::NotReady
            },
            degraded: can_degrade,
            can_gracefully_degrade: can_degrade,
            attempts,
            elapsed_ms: started.elapsed().as_millis() as u64,
            from_cache: false,
            skipped_reason: None,
            error: last_error,
        }
    }

    /// Validate a set of services dependency-first.
    ///
    /// With `fail_fast_on_critical`, validation stops at the first failed
    /// Critical service. The group is `overall_ready` iff no critical
    /// service failed; degraded non-critical services do not block it.
    pub async fn validate_group(
        &self,
        names: &[&str],
        fail_fast_on_critical: bool,
    ) -> GroupValidationResult {
        let ordered = self.topological_order(names);
        let started = Instant::now();

        let mut outcomes = HashMap::new();
        let mut critical_failures = Vec::new();
        let mut degraded_services = Vec::new();
        let mut ready_count = 0usize;

        for name in &ordered {
            let outcome = self.validate_service(name, false).await;
            let criticality = self.criticality_of(name);

            if outcome.ready {
                ready_count += 1;
            } else if criticality == Some(Criticality::Critical) {
                critical_failures.push(name.clone());
            }
            if outcome.degraded {
                degraded_services.push(name.clone());
            }

            let failed_critical = !outcome.ready && criticality == Some(Criticality::Critical);
            outcomes.insert(name.clone(), outcome);

            if fail_fast_on_critical && failed_critical {
                tracing::warn!(
                    service = %name,
                    "Critical service failed, aborting group validation"
                );
                break;
            }
        }

        let degradation_active = !degraded_services.is_empty();
        let overall_ready = critical_failures.is_empty();

        GroupValidationResult {
            total: ordered.len(),
            ready_count,
            critical_failures,
            degraded_services,
            degradation_active,
            overall_ready,
            elapsed_ms: started.elapsed().as_millis() as u64,
            outcomes,
        }
    }

    /// Kahn's algorithm over the requested subset; edges only between
    /// requested services. A cycle falls back to the original order rather
    /// than looping forever.
    fn topological_order(&self, names: &[&str]) -> Vec<String> {
        let requested: HashSet<&str> = names.iter().copied().collect();
        let services = self.services.read().unwrap();

        let mut in_degree: HashMap<&str, usize> = names.iter().map(|n| (*n, 0)).collect();
        let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();

        for name in names {
            if let Some(config) = services.get(*name) {
                for dep in &config.depends_on {
                    if requested.contains(dep.as_str()) {
                        *in_degree.get_mut(*name).unwrap() += 1;
                        dependents
                            .entry(*requested.get(dep.as_str()).unwrap())
                            .or_default()
                            .push(*name);
                    }
                }
            }
        }

        // Seed in request order so independent services keep a stable order
        let mut queue: VecDeque<&str> = names
            .iter()
            .copied()
            .filter(|n| in_degree[*n] == 0)
            .collect();
        let mut ordered = Vec::with_capacity(names.len());

        while let Some(current) = queue.pop_front() {
            ordered.push(current.to_string());
            if let Some(children) = dependents.get(current) {
                for child in children {
                    let degree = in_degree.get_mut(*child).unwrap();
                    *degree -= 1;
                    if *degree == 0 {
                        queue.push_back(child);
                    }
                }
            }
        }

        if ordered.len() != names.len() {
            tracing::warn!(
                requested = names.len(),
                ordered = ordered.len(),
                "Dependency cycle in service group, using request order"
            );
            return names.iter().map(|n| n.to_string()).collect();
        }
        ordered
    }
}
