//! Health check and statistics endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

use crate::connection::ConnectionStatus;
use crate::readiness::{
    AGENT_SUPERVISOR, AUTH_SYSTEM, CACHE, DATABASE, EVENT_BRIDGE, THREAD_SERVICE,
};
use crate::server::AppState;
use crate::startup::StartupPhase;

const ALL_SERVICES: [&str; 6] = [
    DATABASE,
    CACHE,
    AUTH_SYSTEM,
    AGENT_SUPERVISOR,
    THREAD_SERVICE,
    EVENT_BRIDGE,
];

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_seconds: u64,
    pub startup: StartupHealthResponse,
    pub connections: ConnectionHealthResponse,
}

#[derive(Debug, Serialize)]
pub struct StartupHealthResponse {
    pub current_phase: Option<StartupPhase>,
    pub completed_phases: Vec<StartupPhase>,
    pub in_progress: bool,
    pub complete: bool,
}

#[derive(Debug, Serialize)]
pub struct ConnectionHealthResponse {
    pub total: usize,
}

#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub connections: std::collections::HashMap<String, ConnectionStatus>,
    pub totals: ConnectionTotals,
}

#[derive(Debug, Serialize)]
pub struct ConnectionTotals {
    pub registered: usize,
    pub connected: usize,
    pub pending_messages: usize,
    pub unacknowledged_messages: usize,
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.startup.is_complete() {
        "healthy"
    } else {
        "starting"
    };

    Json(HealthResponse {
        status: status.to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_seconds: state.start_time.elapsed().as_secs(),
        startup: StartupHealthResponse {
            current_phase: state.startup.current_phase(),
            completed_phases: state.startup.completed_phases(),
            in_progress: state.startup.is_in_progress(),
            complete: state.startup.is_complete(),
        },
        connections: ConnectionHealthResponse {
            total: state.registry.connection_count(),
        },
    })
}

/// Readiness for taking new connections: the same guard the accept path
/// runs, exposed for load balancers and probes.
pub async fn ready(State(state): State<AppState>) -> Response {
    let guard = state.gate.readiness_guard(&ALL_SERVICES).await;
    let status = if guard.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(guard)).into_response()
}

pub async fn stats(State(state): State<AppState>) -> Json<StatsResponse> {
    let connections = state.registry.get_all_status();

    let connected = connections
        .values()
        .filter(|s| s.state == crate::connection::ConnectionState::Connected)
        .count();
    let pending = connections.values().map(|s| s.pending_messages).sum();
    let unacked = connections
        .values()
        .map(|s| s.unacknowledged_messages)
        .sum();

    Json(StatsResponse {
        totals: ConnectionTotals {
            registered: connections.len(),
            connected,
            pending_messages: pending,
            unacknowledged_messages: unacked,
        },
        connections,
    })
}
