use config::{Config, ConfigBuilder, ConfigError, Environment, File};
use config::builder::DefaultState;
use serde::Deserialize;
use std::env;
use std::time::Duration;

use crate::websocket::{CollisionPolicy, ServerOptions, SessionConfig};

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub workers: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SignalingConfig {
    pub host: String,
    pub port: u16,
    pub path: String,
    pub max_message_size: usize,
    pub send_queue_capacity: usize,
    pub registry_intake_capacity: usize,
    pub pong_wait_secs: u64,
    pub ping_interval_secs: u64,
    pub write_wait_secs: u64,
    pub collision_policy: CollisionPolicy,
}

impl SignalingConfig {
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            send_queue_capacity: self.send_queue_capacity,
            pong_wait: Duration::from_secs(self.pong_wait_secs),
            ping_interval: Duration::from_secs(self.ping_interval_secs),
            write_wait: Duration::from_secs(self.write_wait_secs),
        }
    }

    pub fn server_options(&self) -> ServerOptions {
        ServerOptions {
            path: self.path.clone(),
            max_message_size: self.max_message_size,
            session: self.session_config(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    pub database_url: String,
    pub max_connections: u32,
    pub acquire_timeout_secs: u64,
    pub upload_dir: String,
    pub max_upload_bytes: usize,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CorsConfig {
    pub enabled: bool,
    pub allow_any_origin: bool,
    pub max_age: u32,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub environment: String,
    pub server: ServerConfig,
    pub signaling: SignalingConfig,
    pub storage: StorageConfig,
    pub cors: CorsConfig,
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        Self::with_defaults(Config::builder())?
            // Add in settings from the config file if it exists
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // Add in settings from environment variables (with prefix "APP_")
            // E.g., `APP_SIGNALING__PORT=9001` would set `Settings.signaling.port`
            .add_source(Self::environment())
            .build()?
            .try_deserialize::<Settings>()?
            .validate()
    }

    #[cfg(test)]
    pub fn new_for_test() -> Result<Self, ConfigError> {
        Self::with_defaults(Config::builder())?
            .set_default("environment", "test")?
            .set_default("server.port", 0)?
            .set_default("signaling.port", 0)?
            .set_default("storage.database_url", "sqlite::memory:")?
            .build()?
            .try_deserialize::<Settings>()?
            .validate()
    }

    /// `APP_` prefix, `__` between nested keys: `APP_SIGNALING__PORT`.
    fn environment() -> Environment {
        Environment::with_prefix("app")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
    }

    fn with_defaults(
        builder: ConfigBuilder<DefaultState>,
    ) -> Result<ConfigBuilder<DefaultState>, ConfigError> {
        builder
            .set_default("environment", "development")?
            .set_default("server.host", "127.0.0.1")?
            .set_default("server.port", 8080)?
            .set_default("server.workers", num_cpus::get() as i64)?
            .set_default("signaling.host", "127.0.0.1")?
            .set_default("signaling.port", 8081)?
            .set_default("signaling.path", "/ws")?
            .set_default("signaling.max_message_size", 64 * 1024)?
            .set_default("signaling.send_queue_capacity", 256)?
            .set_default("signaling.registry_intake_capacity", 64)?
            .set_default("signaling.pong_wait_secs", 60)?
            .set_default("signaling.ping_interval_secs", 54)?
            .set_default("signaling.write_wait_secs", 10)?
            .set_default("signaling.collision_policy", "reject")?
            .set_default("storage.database_url", "sqlite://voip.db")?
            .set_default("storage.max_connections", 5)?
            .set_default("storage.acquire_timeout_secs", 5)?
            .set_default("storage.upload_dir", "./uploads")?
            .set_default("storage.max_upload_bytes", 32 * 1024 * 1024)?
            .set_default("cors.enabled", true)?
            .set_default("cors.allow_any_origin", true)?
            .set_default("cors.max_age", 3600)
    }

    /// Reject combinations the signaling layer cannot run with.
    pub fn validate(self) -> Result<Self, ConfigError> {
        let signaling = &self.signaling;
        if signaling.ping_interval_secs >= signaling.pong_wait_secs {
            return Err(ConfigError::Message(format!(
                "signaling.ping_interval_secs ({}) must be lower than signaling.pong_wait_secs ({})",
                signaling.ping_interval_secs, signaling.pong_wait_secs
            )));
        }
        if signaling.send_queue_capacity == 0 || signaling.registry_intake_capacity == 0 {
            return Err(ConfigError::Message(
                "signaling queue capacities must be greater than zero".to_string(),
            ));
        }
        if signaling.max_message_size == 0 {
            return Err(ConfigError::Message(
                "signaling.max_message_size must be greater than zero".to_string(),
            ));
        }
        if !signaling.path.starts_with('/') {
            return Err(ConfigError::Message(format!(
                "signaling.path must start with '/', got {:?}",
                signaling.path
            )));
        }
        let storage = &self.storage;
        if storage.max_connections == 0 || storage.max_upload_bytes == 0 {
            return Err(ConfigError::Message(
                "storage.max_connections and storage.max_upload_bytes must be greater than zero".to_string(),
            ));
        }
        Ok(self)
    }
}
