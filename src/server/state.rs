use std::sync::Arc;
use std::time::Instant;

use crate::config::Settings;
use crate::connection::ConnectionRegistry;
use crate::readiness::{register_default_services, ServiceDirectory, ServiceReadinessValidator};
use crate::startup::{StartupPhaseGate, StartupState};

/// The composition root: every shared component is constructed here and
/// handed to request handlers by reference, never through globals.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub registry: Arc<ConnectionRegistry>,
    pub directory: Arc<ServiceDirectory>,
    pub validator: Arc<ServiceReadinessValidator>,
    pub startup: Arc<StartupState>,
    pub gate: Arc<StartupPhaseGate>,
    pub start_time: Instant,
}

impl AppState {
    pub fn new(settings: Settings) -> Self {
        let validator = Arc::new(ServiceReadinessValidator::with_cache_ttl(
            settings.environment(),
            settings.readiness_cache_ttl(),
        ));
        let directory = Arc::new(ServiceDirectory::new());
        register_default_services(&validator, &directory);

        let startup = Arc::new(StartupState::new());
        let gate = Arc::new(StartupPhaseGate::new(startup.clone(), validator.clone()));
        let registry = Arc::new(ConnectionRegistry::new());

        Self {
            settings: Arc::new(settings),
            registry,
            directory,
            validator,
            startup,
            gate,
            start_time: Instant::now(),
        }
    }
}
