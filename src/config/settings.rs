//! # Configuration Settings
//!
//! Defines the configuration structure for the plugin host and the bundled
//! plugin binary.

use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

/// Minimum number of base62 symbols in a session identifier.
pub const MIN_SESSION_ID_LENGTH: usize = 10;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default)]
pub struct Config {
    /// Connection manager configuration
    #[validate(nested)]
    pub manager: ManagerConfig,

    /// Observability configuration
    #[validate(nested)]
    pub observability: ObservabilityConfig,

    /// Path of the plugin catalog (TOML)
    pub catalog_path: Option<PathBuf>,
}

impl Config {
    /// Build configuration from `DBPLUGIN_*` environment variables
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let manager = ManagerConfig {
            spawn_timeout_seconds: parse_var(
                &lookup,
                "DBPLUGIN_SPAWN_TIMEOUT_SECONDS",
                defaults.manager.spawn_timeout_seconds,
            )?,
            handshake_timeout_seconds: parse_var(
                &lookup,
                "DBPLUGIN_HANDSHAKE_TIMEOUT_SECONDS",
                defaults.manager.handshake_timeout_seconds,
            )?,
            connect_timeout_seconds: parse_var(
                &lookup,
                "DBPLUGIN_CONNECT_TIMEOUT_SECONDS",
                defaults.manager.connect_timeout_seconds,
            )?,
            session_id_length: parse_var(
                &lookup,
                "DBPLUGIN_SESSION_ID_LENGTH",
                defaults.manager.session_id_length,
            )?,
            max_id_attempts: parse_var(
                &lookup,
                "DBPLUGIN_MAX_ID_ATTEMPTS",
                defaults.manager.max_id_attempts,
            )?,
        };

        let observability = ObservabilityConfig {
            log_level: lookup("DBPLUGIN_LOG_LEVEL")
                .unwrap_or(defaults.observability.log_level),
            json_logging: parse_var(
                &lookup,
                "DBPLUGIN_JSON_LOGGING",
                defaults.observability.json_logging,
            )?,
            enable_metrics: parse_var(
                &lookup,
                "DBPLUGIN_ENABLE_METRICS",
                defaults.observability.enable_metrics,
            )?,
            metrics_port: parse_var(
                &lookup,
                "DBPLUGIN_METRICS_PORT",
                defaults.observability.metrics_port,
            )?,
            service_name: lookup("DBPLUGIN_SERVICE_NAME")
                .unwrap_or(defaults.observability.service_name),
        };

        let config = Self {
            manager,
            observability,
            catalog_path: lookup("DBPLUGIN_CATALOG").map(PathBuf::from),
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate the entire configuration
    pub fn validate(&self) -> Result<()> {
        Validate::validate(self).map_err(Error::from)
    }
}

fn parse_var<F, T>(lookup: &F, key: &str, default: T) -> Result<T>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::config(format!("Invalid value for {}: {}", key, e))),
        None => Ok(default),
    }
}

/// Connection manager and spawn configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ManagerConfig {
    /// Deadline for spawn + handshake + dispense
    #[validate(range(
        min = 1,
        max = 600,
        message = "Spawn timeout must be between 1 and 600 seconds"
    ))]
    pub spawn_timeout_seconds: u64,

    /// Time a plugin has to print its handshake line
    #[validate(range(
        min = 1,
        max = 300,
        message = "Handshake timeout must be between 1 and 300 seconds"
    ))]
    pub handshake_timeout_seconds: u64,

    /// Transport connect timeout
    #[validate(range(
        min = 1,
        max = 60,
        message = "Connect timeout must be between 1 and 60 seconds"
    ))]
    pub connect_timeout_seconds: u64,

    /// Length of generated session identifiers
    #[validate(range(
        min = 10,
        max = 64,
        message = "Session ID length must be between 10 and 64"
    ))]
    pub session_id_length: usize,

    /// How many identifiers to try before giving up on a collision
    #[validate(range(min = 1, max = 32, message = "Max ID attempts must be between 1 and 32"))]
    pub max_id_attempts: u32,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            spawn_timeout_seconds: 30,
            handshake_timeout_seconds: 10,
            connect_timeout_seconds: 5,
            session_id_length: MIN_SESSION_ID_LENGTH,
            max_id_attempts: 5,
        }
    }
}

impl ManagerConfig {
    pub fn spawn_timeout(&self) -> Duration {
        Duration::from_secs(self.spawn_timeout_seconds)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_seconds)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

/// Observability configuration
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error)
    #[validate(length(min = 1, message = "Log level cannot be empty"))]
    pub log_level: String,

    /// Enable JSON structured logging
    pub json_logging: bool,

    /// Enable metrics collection
    pub enable_metrics: bool,

    /// Metrics server port (0 = disabled)
    pub metrics_port: u16,

    /// Service name attached to metrics
    #[validate(length(min = 1, message = "Service name cannot be empty"))]
    pub service_name: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            json_logging: false,
            enable_metrics: false,
            metrics_port: 9464,
            service_name: crate::APP_NAME.to_string(),
        }
    }
}

impl ObservabilityConfig {
    /// Get metrics bind address (None if disabled)
    pub fn metrics_bind_address(&self) -> Option<String> {
        if self.metrics_port == 0 {
            None
        } else {
            Some(format!("0.0.0.0:{}", self.metrics_port))
        }
    }
}
