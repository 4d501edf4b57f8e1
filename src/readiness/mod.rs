//! Service readiness validation: dependency graph, adaptive timeouts,
//! retries, and graceful degradation.

mod directory;
mod types;
mod validator;

pub use directory::{
    register_default_services, ServiceDirectory, ServiceHandle, StaticHandle,
    AGENT_SUPERVISOR, AUTH_SYSTEM, CACHE, CONNECTION_CRITICAL_SERVICES, DATABASE, EVENT_BRIDGE,
    THREAD_SERVICE,
};
pub use types::{
    AdaptiveTimeout, Criticality, DegradationHandler, Environment, FnProbe, GroupValidationResult,
    ReadinessLevel, ReadinessProbe, ServiceReadinessConfig, ValidationOutcome,
};
pub use validator::ServiceReadinessValidator;
