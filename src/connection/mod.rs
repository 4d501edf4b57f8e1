//! WebSocket connection reliability core.
//!
//! One `ConnectionManager` per session composes queueing/dedup/acks
//! (`MessageHandler`), liveness (`HeartbeatMonitor`), and retry policy
//! (`ReconnectionController`); the `ConnectionRegistry` holds them all.

mod events;
mod heartbeat;
mod manager;
mod message_handler;
mod reconnect;
mod registry;
mod types;

pub use events::{ConnectionEvents, NoopEvents};
pub use heartbeat::HeartbeatMonitor;
pub use manager::ConnectionManager;
pub use message_handler::MessageHandler;
pub use reconnect::ReconnectionController;
pub use registry::{ConnectionRegistry, SnapshotStore};
pub use types::{
    ConnectionMetrics, ConnectionMetricsSnapshot, ConnectionState, ConnectionStatus,
    HeartbeatConfig, MessageState, ReconnectionConfig, ReconnectionReason,
};
