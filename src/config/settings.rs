use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment as EnvSource, File};
use serde::Deserialize;

use crate::connection::{HeartbeatConfig, ReconnectionConfig};
use crate::readiness::Environment;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    pub server: ServerConfig,
    #[serde(default = "default_run_mode")]
    pub run_mode: String,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub reconnection: ReconnectionSettings,
    #[serde(default)]
    pub readiness: ReadinessSettings,
    #[serde(default)]
    pub recovery: RecoverySettings,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    /// Heartbeat interval in seconds (gateway sends ping)
    #[serde(default = "default_heartbeat_interval")]
    pub heartbeat_interval: u64,
    /// How long to wait for a pong, in seconds
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout: u64,
    /// Missed pongs before the connection is considered dead
    #[serde(default = "default_max_missed_heartbeats")]
    pub max_missed_heartbeats: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReconnectionSettings {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay_secs")]
    pub initial_delay_secs: f64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: f64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default = "default_jitter")]
    pub jitter: bool,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_preserve_pending")]
    pub preserve_pending_messages: bool,
    #[serde(default = "default_max_pending")]
    pub max_pending_messages: usize,
    #[serde(default = "default_retention_hours")]
    pub message_retention_hours: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ReadinessSettings {
    #[serde(default = "default_cache_ttl_secs")]
    pub cache_ttl_secs: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RecoverySettings {
    /// Whether the periodic recovery sweep runs
    #[serde(default = "default_recovery_enabled")]
    pub enabled: bool,
    /// Sweep interval in seconds
    #[serde(default = "default_recovery_interval")]
    pub interval_secs: u64,
}

fn default_run_mode() -> String {
    "development".to_string()
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8082
}

fn default_heartbeat_interval() -> u64 {
    30
}

fn default_heartbeat_timeout() -> u64 {
    10
}

fn default_max_missed_heartbeats() -> u32 {
    3
}

fn default_max_attempts() -> u32 {
    10
}

fn default_initial_delay_secs() -> f64 {
    1.0
}

fn default_max_delay_secs() -> f64 {
    60.0
}

fn default_backoff_multiplier() -> f64 {
    2.0
}

fn default_jitter() -> bool {
    true
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_preserve_pending() -> bool {
    true
}

fn default_max_pending() -> usize {
    1000
}

fn default_retention_hours() -> u64 {
    24
}

fn default_cache_ttl_secs() -> u64 {
    30
}

fn default_recovery_enabled() -> bool {
    true
}

fn default_recovery_interval() -> u64 {
    60
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            // Start with default values
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8082)?
            .set_default("run_mode", run_mode.clone())?
            .set_default("websocket.heartbeat_interval", 30)?
            .set_default("websocket.heartbeat_timeout", 10)?
            .set_default("websocket.max_missed_heartbeats", 3)?
            // Load config file if exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Load from environment variables
            // SERVER_HOST, SERVER_PORT, RECONNECTION_MAX_ATTEMPTS, etc.
            .add_source(
                EnvSource::default()
                    .separator("_")
                    .try_parsing(true)
                    .list_separator(","),
            );

        builder.build()?.try_deserialize()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn environment(&self) -> Environment {
        Environment::from_run_mode(&self.run_mode)
    }

    pub fn reconnection_config(&self) -> ReconnectionConfig {
        ReconnectionConfig {
            max_attempts: self.reconnection.max_attempts,
            initial_delay: Duration::from_secs_f64(self.reconnection.initial_delay_secs),
            max_delay: Duration::from_secs_f64(self.reconnection.max_delay_secs),
            backoff_multiplier: self.reconnection.backoff_multiplier,
            jitter: self.reconnection.jitter,
            connect_timeout: Duration::from_secs(self.reconnection.connect_timeout_secs),
            preserve_pending_messages: self.reconnection.preserve_pending_messages,
            max_pending_messages: self.reconnection.max_pending_messages,
            message_retention: Duration::from_secs(
                self.reconnection.message_retention_hours * 3600,
            ),
        }
    }

    pub fn heartbeat_config(&self) -> HeartbeatConfig {
        HeartbeatConfig {
            interval: Duration::from_secs(self.websocket.heartbeat_interval),
            pong_timeout: Duration::from_secs(self.websocket.heartbeat_timeout),
            max_missed: self.websocket.max_missed_heartbeats,
        }
    }

    pub fn readiness_cache_ttl(&self) -> Duration {
        Duration::from_secs(self.readiness.cache_ttl_secs)
    }
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            run_mode: default_run_mode(),
            websocket: WebSocketConfig::default(),
            reconnection: ReconnectionSettings::default(),
            readiness: ReadinessSettings::default(),
            recovery: RecoverySettings::default(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: default_heartbeat_interval(),
            heartbeat_timeout: default_heartbeat_timeout(),
            max_missed_heartbeats: default_max_missed_heartbeats(),
        }
    }
}

impl Default for ReconnectionSettings {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            backoff_multiplier: default_backoff_multiplier(),
            jitter: default_jitter(),
            connect_timeout_secs: default_connect_timeout_secs(),
            preserve_pending_messages: default_preserve_pending(),
            max_pending_messages: default_max_pending(),
            message_retention_hours: default_retention_hours(),
        }
    }
}

impl Default for ReadinessSettings {
    fn default() -> Self {
        Self {
            cache_ttl_secs: default_cache_ttl_secs(),
        }
    }
}

impl Default for RecoverySettings {
    fn default() -> Self {
        Self {
            enabled: default_recovery_enabled(),
            interval_secs: default_recovery_interval(),
        }
    }
}
