mod settings;

pub use settings::{
    ReadinessSettings, ReconnectionSettings, RecoverySettings, ServerConfig, Settings,
    WebSocketConfig,
};
