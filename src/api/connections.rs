//! Connection administration endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    Json,
};
use serde::{Deserialize, Serialize};

use crate::connection::ConnectionStatus;
use crate::error::{GatewayError, Result};
use crate::server::AppState;
use crate::transport::WsClientConnector;
use crate::websocket::GatewaySessionEvents;

#[derive(Debug, Deserialize)]
pub struct CreateConnectionRequest {
    pub id: String,
    pub address: String,
    /// Connect immediately instead of waiting for the recovery sweep
    #[serde(default = "default_connect_now")]
    pub connect: bool,
}

fn default_connect_now() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct CreateConnectionResponse {
    pub id: String,
    pub connected: bool,
    pub status: ConnectionStatus,
}

#[derive(Debug, Serialize)]
pub struct RecoveryResponse {
    pub attempted: usize,
    pub recovered: usize,
    pub results: HashMap<String, bool>,
}

/// Register an outbound session to an upstream endpoint.
///
/// Replace semantics: an existing connection under the same id is
/// disconnected first.
pub async fn create_connection(
    State(state): State<AppState>,
    Json(request): Json<CreateConnectionRequest>,
) -> Result<Json<CreateConnectionResponse>> {
    let manager = state
        .registry
        .create_connection(
            request.id.clone(),
            request.address.clone(),
            state.settings.reconnection_config(),
            state.settings.heartbeat_config(),
            Arc::new(WsClientConnector::new()),
            Arc::new(GatewaySessionEvents),
        )
        .await;

    let connected = if request.connect {
        manager.connect().await
    } else {
        false
    };

    if request.connect && !connected {
        tracing::warn!(
            connection_id = %request.id,
            address = %request.address,
            "Outbound connection registered but initial dial failed"
        );
    }

    Ok(Json(CreateConnectionResponse {
        id: request.id,
        connected,
        status: manager.get_status(),
    }))
}

pub async fn get_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ConnectionStatus>> {
    let manager = state
        .registry
        .get_connection(&id)
        .ok_or_else(|| GatewayError::NotFound(format!("connection {id}")))?;
    Ok(Json(manager.get_status()))
}

pub async fn delete_connection(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<serde_json::Value>> {
    if state.registry.get_connection(&id).is_none() {
        return Err(GatewayError::NotFound(format!("connection {id}")));
    }
    state.registry.remove_connection(&id).await;
    Ok(Json(serde_json::json!({ "removed": id })))
}

/// Run a bulk recovery sweep over failed and disconnected connections.
pub async fn recover_connections(State(state): State<AppState>) -> Json<RecoveryResponse> {
    let results = state.registry.recover_all().await;
    let recovered = results.values().filter(|ok| **ok).count();

    Json(RecoveryResponse {
        attempted: results.len(),
        recovered,
        results,
    })
}

pub async fn list_connections(
    State(state): State<AppState>,
) -> Json<HashMap<String, ConnectionStatus>> {
    Json(state.registry.get_all_status())
}
