use axum::{
    routing::{get, post},
    Router,
};

use crate::server::AppState;

use super::connections::{
    create_connection, delete_connection, get_connection, list_connections, recover_connections,
};
use super::health::{health, ready, stats};
use super::metrics::prometheus_metrics;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        // Health & Stats
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/stats", get(stats))
        .route("/metrics", get(prometheus_metrics))
        // Connection administration
        .nest(
            "/api/v1",
            Router::new()
                .route("/connections", get(list_connections).post(create_connection))
                .route(
                    "/connections/{id}",
                    get(get_connection).delete(delete_connection),
                )
                .route("/connections/recover", post(recover_connections)),
        )
}
