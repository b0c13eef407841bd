//! Application configuration.
//!
//! Aggregates configuration from all modules into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod messaging;
mod server;
mod services;

pub use messaging::{ListenerConfig, MessagingConfig};
pub use server::ServerConfig;
pub use services::{RoutesConfig, ServicesConfig};

use serde::Deserialize;

use crate::lifecycle::RetryPolicy;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "SWITCHBOARD_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "SWITCHBOARD";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "SWITCHBOARD_LOG";

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to load config: {0}")]
    Load(#[from] ::config::ConfigError),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Gateway HTTP surface.
    pub server: ServerConfig,
    /// Broker connection.
    pub messaging: MessagingConfig,
    /// Connection retry policy for the broker.
    pub retry: RetryPolicy,
    /// Downstream services.
    pub services: ServicesConfig,
    /// Transport per action.
    pub routes: RoutesConfig,
    /// Listener consumer.
    pub listener: ListenerConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. Built-in defaults
    /// 2. `config.yaml` in current directory (if exists)
    /// 3. File specified by `path` argument (if provided)
    /// 4. File specified by `CONFIG_ENV_VAR` environment variable (if set)
    /// 5. Environment variables with `CONFIG_ENV_PREFIX` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config: Config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("listener.patterns")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject values no component can run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.messaging.url.is_empty() {
            return Err(ConfigError::Invalid("messaging.url is empty".to_string()));
        }
        if self.messaging.exchange.is_empty() {
            return Err(ConfigError::Invalid("messaging.exchange is empty".to_string()));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".to_string(),
            ));
        }
        // Written so NaN is rejected too
        if !(self.retry.multiplier >= 1.0) {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be at least 1.0".to_string(),
            ));
        }
        let services = &self.services;
        for (key, value) in [
            ("http_timeout_ms", services.http_timeout_ms),
            ("rpc_timeout_ms", services.rpc_timeout_ms),
            ("grpc_deadline_ms", services.grpc_deadline_ms),
            ("queue_timeout_ms", services.queue_timeout_ms),
        ] {
            if value == 0 {
                return Err(ConfigError::Invalid(format!(
                    "services.{} must be greater than 0",
                    key
                )));
            }
        }
        if self.listener.patterns.is_empty() {
            return Err(ConfigError::Invalid("listener.patterns is empty".to_string()));
        }
        for (action, kind) in self.routes.kinds() {
            if !kind.supports(action) {
                return Err(ConfigError::Invalid(format!(
                    "routes.{}: {} transport cannot carry this action",
                    action, kind
                )));
            }
        }
        Ok(())
    }
}
