//! Application configuration.
//!
//! Aggregates configuration into a single Config struct that can be loaded
//! from YAML files or environment variables.

mod messaging;

pub use messaging::{
    AuthConfig, AuthMethod, ConnectionConfig, MessagingConfig, MiddlewareConfig,
    PersistenceConfig, StreamConfig, SubscriberConfig, TlsConfig, TransportType,
};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "courier.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "COURIER_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "COURIER";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "COURIER_LOG";

use serde::Deserialize;

/// Application host configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Logical application name. Prefix of control topics and queue group.
    pub name: String,
    /// Activate business subscriptions without waiting for `<app>.start`.
    pub auto_start: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "courier".to_string(),
            auto_start: true,
        }
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Application host configuration.
    pub app: AppConfig,
    /// Messaging configuration.
    pub messaging: MessagingConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `courier.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 4. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, Box<dyn std::error::Error>> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = config.try_deserialize()?;
        Ok(config)
    }

    /// Create config for testing: in-process broker, logging only.
    pub fn for_test(name: &str) -> Self {
        Self {
            app: AppConfig {
                name: name.to_string(),
                auto_start: true,
            },
            messaging: MessagingConfig {
                connection: ConnectionConfig::channel(name),
                ..Default::default()
            },
        }
    }
}
