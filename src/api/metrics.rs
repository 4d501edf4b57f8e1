use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
};

use crate::metrics::encode_metrics;

/// Prometheus scrape endpoint.
pub async fn prometheus_metrics() -> Response {
    match encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, "encoding failure").into_response()
        }
    }
}
