//! Typed directory of the external services this gateway depends on.
//!
//! Presence or absence of a dependency is a type-level `Option`, not a
//! runtime reflection check; probes read the directory and ask the handle
//! itself whether it is ready.

use std::sync::{Arc, RwLock};

use async_trait::async_trait;

use super::types::{
    Criticality, ReadinessLevel, ReadinessProbe, ServiceReadinessConfig,
};
use super::validator::ServiceReadinessValidator;

pub const DATABASE: &str = "database";
pub const CACHE: &str = "cache";
pub const AUTH_SYSTEM: &str = "auth_system";
pub const AGENT_SUPERVISOR: &str = "agent_supervisor";
pub const THREAD_SERVICE: &str = "thread_service";
pub const EVENT_BRIDGE: &str = "event_bridge";

/// Services that only exist from the `Services` startup phase onward.
pub const CONNECTION_CRITICAL_SERVICES: [&str; 3] =
    [AGENT_SUPERVISOR, THREAD_SERVICE, EVENT_BRIDGE];

/// A handle to an external service that can report its own readiness.
#[async_trait]
pub trait ServiceHandle: Send + Sync {
    async fn is_ready(&self) -> bool {
        true
    }
}

/// Always-ready handle for services whose mere presence means ready.
pub struct StaticHandle;

#[async_trait]
impl ServiceHandle for StaticHandle {}

type Slot = RwLock<Option<Arc<dyn ServiceHandle>>>;

/// One `Option` slot per known dependency.
#[derive(Default)]
pub struct ServiceDirectory {
    database: Slot,
    cache: Slot,
    auth_system: Slot,
    agent_supervisor: Slot,
    thread_service: Slot,
    event_bridge: Slot,
}

macro_rules! slot_accessors {
    ($get:ident, $set:ident, $clear:ident, $field:ident) => {
        pub fn $get(&self) -> Option<Arc<dyn ServiceHandle>> {
            self.$field.read().unwrap().clone()
        }

        pub fn $set(&self, handle: Arc<dyn ServiceHandle>) {
            *self.$field.write().unwrap() = Some(handle);
        }

        pub fn $clear(&self) {
            *self.$field.write().unwrap() = None;
        }
    };
}

impl ServiceDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    slot_accessors!(database, set_database, clear_database, database);
    slot_accessors!(cache, set_cache, clear_cache, cache);
    slot_accessors!(auth_system, set_auth_system, clear_auth_system, auth_system);
    slot_accessors!(
        agent_supervisor,
        set_agent_supervisor,
        clear_agent_supervisor,
        agent_supervisor
    );
    slot_accessors!(
        thread_service,
        set_thread_service,
        clear_thread_service,
        thread_service
    );
    slot_accessors!(event_bridge, set_event_bridge, clear_event_bridge, event_bridge);

    fn slot_by_name(&self, name: &str) -> Option<Arc<dyn ServiceHandle>> {
        match name {
            DATABASE => self.database(),
            CACHE => self.cache(),
            AUTH_SYSTEM => self.auth_system(),
            AGENT_SUPERVISOR => self.agent_supervisor(),
            THREAD_SERVICE => self.thread_service(),
            EVENT_BRIDGE => self.event_bridge(),
            _ => None,
        }
    }
}

/// Probe that resolves a directory slot and defers to the handle.
/// An empty slot is simply not ready; the phase gate decides whether that
/// is expected or a failure.
struct DirectoryProbe {
    directory: Arc<ServiceDirectory>,
    service: &'static str,
}

#[async_trait]
impl ReadinessProbe for DirectoryProbe {
    async fn probe(&self) -> anyhow::Result<ReadinessLevel> {
        match self.directory.slot_by_name(self.service) {
            Some(handle) => Ok(ReadinessLevel::from(handle.is_ready().await)),
            None => Ok(ReadinessLevel::NotReady),
        }
    }
}

fn directory_probe(
    directory: &Arc<ServiceDirectory>,
    service: &'static str,
) -> Arc<dyn ReadinessProbe> {
    Arc::new(DirectoryProbe {
        directory: directory.clone(),
        service,
    })
}

/// Register the gateway's dependency graph against a validator.
///
/// database, cache, auth: Critical leaves. agent_supervisor and
/// thread_service: Critical, layered on the leaves. event_bridge:
/// Important, layered on the supervisor.
pub fn register_default_services(
    validator: &ServiceReadinessValidator,
    directory: &Arc<ServiceDirectory>,
) {
    validator.register(ServiceReadinessConfig::new(
        DATABASE,
        Criticality::Critical,
        directory_probe(directory, DATABASE),
    ));
    validator.register(ServiceReadinessConfig::new(
        CACHE,
        Criticality::Critical,
        directory_probe(directory, CACHE),
    ));
    validator.register(ServiceReadinessConfig::new(
        AUTH_SYSTEM,
        Criticality::Critical,
        directory_probe(directory, AUTH_SYSTEM),
    ));
    validator.register(
        ServiceReadinessConfig::new(
            AGENT_SUPERVISOR,
            Criticality::Critical,
            directory_probe(directory, AGENT_SUPERVISOR),
        )
        .with_dependencies(&[DATABASE, CACHE, AUTH_SYSTEM]),
    );
    validator.register(
        ServiceReadinessConfig::new(
            THREAD_SERVICE,
            Criticality::Critical,
            directory_probe(directory, THREAD_SERVICE),
        )
        .with_dependencies(&[DATABASE, AUTH_SYSTEM]),
    );
    validator.register(
        ServiceReadinessConfig::new(
            EVENT_BRIDGE,
            Criticality::Important,
            directory_probe(directory, EVENT_BRIDGE),
        )
        .with_dependencies(&[AGENT_SUPERVISOR]),
    );
}
