//! The gated WebSocket accept path.
//!
//! The readiness guard runs before the protocol upgrade: a connection made
//! while the system is still starting is rejected with 503 and the guard
//! report, never accepted and then abruptly severed. Accepted sockets are
//! registered as managed connections so inbound sessions get the same
//! heartbeat, dedup, and ack machinery as outbound ones.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{ws::WebSocket, Query, State, WebSocketUpgrade},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use crate::connection::{ConnectionEvents, ReconnectionConfig};
use crate::readiness::{
    AGENT_SUPERVISOR, AUTH_SYSTEM, CACHE, DATABASE, EVENT_BRIDGE, THREAD_SERVICE,
};
use crate::server::AppState;
use crate::transport::{AxumWsTransport, PreEstablishedConnector};

/// Services the accept path requires before taking a session.
const ACCEPT_GUARD_SERVICES: [&str; 6] = [
    DATABASE,
    CACHE,
    AUTH_SYSTEM,
    AGENT_SUPERVISOR,
    THREAD_SERVICE,
    EVENT_BRIDGE,
];

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub session_id: Option<String>,
}

/// Default event handler for inbound sessions: structured logging only.
/// Deployments route messages onward by swapping in their own handler.
pub struct GatewaySessionEvents;

#[async_trait]
impl ConnectionEvents for GatewaySessionEvents {
    async fn on_message(&self, connection_id: &str, message: Value) {
        tracing::debug!(
            connection_id = %connection_id,
            message_type = message.get("type").and_then(|v| v.as_str()).unwrap_or("unknown"),
            "Inbound message delivered"
        );
    }

    async fn on_disconnect(&self, connection_id: &str, reason: &str) {
        tracing::info!(
            connection_id = %connection_id,
            reason = %reason,
            "Session disconnected"
        );
    }
}

/// WebSocket upgrade handler.
#[tracing::instrument(
    name = "ws.upgrade",
    skip(ws, state, query),
    fields(session_id = ?query.session_id)
)]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(query): Query<WsQuery>,
) -> Response {
    // Readiness gate first: reject before the upgrade, not after
    let guard = state.gate.readiness_guard(&ACCEPT_GUARD_SERVICES).await;
    if !guard.ready {
        tracing::warn!(
            critical_failures = ?guard.critical_failures,
            phase = ?state.startup.current_phase().map(|p| p.as_str()),
            "Rejecting connection: system not ready"
        );
        return (StatusCode::SERVICE_UNAVAILABLE, Json(guard)).into_response();
    }

    if guard.degradation_active {
        tracing::info!(
            degraded = ?guard.degraded_services,
            "Accepting connection with degraded services"
        );
    }

    let session_id = query
        .session_id
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    ws.on_upgrade(move |socket| handle_socket(socket, state, session_id))
}

/// Register an accepted socket as a managed connection and hold the axum
/// task open until the session settles.
#[tracing::instrument(name = "ws.session", skip(socket, state), fields(session_id = %session_id))]
async fn handle_socket(socket: WebSocket, state: AppState, session_id: String) {
    let transport = Arc::new(AxumWsTransport::new(socket));
    let connector = Arc::new(PreEstablishedConnector::new(transport));

    // An inbound session cannot be redialed from this side; reconnection
    // is the client's job, so the attempt budget is zero
    let config = ReconnectionConfig {
        max_attempts: 0,
        ..state.settings.reconnection_config()
    };

    let manager = state
        .registry
        .create_connection(
            session_id.clone(),
            format!("inbound:{session_id}"),
            config,
            state.settings.heartbeat_config(),
            connector,
            Arc::new(GatewaySessionEvents),
        )
        .await;

    if !manager.connect().await {
        tracing::warn!(session_id = %session_id, "Failed to activate accepted session");
        state.registry.remove_connection(&session_id).await;
        return;
    }

    tracing::info!(session_id = %session_id, "Session established");

    manager.wait_closed().await;

    state.registry.remove_connection(&session_id).await;
    tracing::info!(session_id = %session_id, "Session closed");
}
