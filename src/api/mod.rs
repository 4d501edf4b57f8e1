//! API layer - HTTP endpoint handlers organized by domain.

mod connections;
mod health;
mod metrics;
mod routes;

pub use connections::{
    create_connection, delete_connection, get_connection, list_connections, recover_connections,
};
pub use health::{health, ready, stats};
pub use metrics::prometheus_metrics;
pub use routes::api_routes;
