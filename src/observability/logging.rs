//! # Structured Logging
//!
//! Subscriber setup and span helpers built on the tracing ecosystem.
//!
//! Plugin processes must never log to stdout: the first stdout line is the
//! handshake the host parses. [`LogTarget::Stderr`] exists for them.

use crate::config::{Config, ObservabilityConfig};
use tracing_subscriber::{fmt, EnvFilter};

/// Where formatted log lines go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogTarget {
    Stdout,
    Stderr,
}

/// Create a tracing span for plugin lifecycle operations.
///
/// ```rust,ignore
/// let span = plugin_span!("acquire", "postgres");
/// let span = plugin_span!("release", "postgres", session_id = %id);
/// ```
#[macro_export]
macro_rules! plugin_span {
    ($operation:expr, $plugin:expr) => {
        tracing::info_span!(
            "plugin_operation",
            operation = %$operation,
            plugin = %$plugin,
            session_id = tracing::field::Empty
        )
    };
    ($operation:expr, $plugin:expr, $($field:tt)*) => {
        tracing::info_span!(
            "plugin_operation",
            operation = %$operation,
            plugin = %$plugin,
            $($field)*
        )
    };
}

/// Create a tracing span for backend database operations
#[macro_export]
macro_rules! db_span {
    ($operation:expr) => {
        tracing::debug_span!(
            "db_operation",
            operation = %$operation,
            status = tracing::field::Empty
        )
    };
    ($operation:expr, $($field:tt)*) => {
        tracing::debug_span!(
            "db_operation",
            operation = %$operation,
            status = tracing::field::Empty,
            $($field)*
        )
    };
}

/// Install the global subscriber.
///
/// `RUST_LOG` wins over `log_level`. If a subscriber is already installed
/// (tests, embedding hosts) the call is a no-op.
pub fn init_logging(config: &ObservabilityConfig, target: LogTarget) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.log_level.as_str()));

    let builder = fmt().with_env_filter(filter).with_target(true);

    // A subscriber already set elsewhere (tests, embedding hosts) wins.
    let _ = match (config.json_logging, target) {
        (true, LogTarget::Stdout) => builder.json().with_writer(std::io::stdout).try_init(),
        (true, LogTarget::Stderr) => builder.json().with_writer(std::io::stderr).try_init(),
        (false, LogTarget::Stdout) => builder.with_writer(std::io::stdout).try_init(),
        (false, LogTarget::Stderr) => {
            builder.with_ansi(false).with_writer(std::io::stderr).try_init()
        }
    };
}

/// Log configuration at startup
pub fn log_config_info(config: &Config) {
    tracing::info!(
        spawn_timeout_seconds = config.manager.spawn_timeout_seconds,
        handshake_timeout_seconds = config.manager.handshake_timeout_seconds,
        session_id_length = config.manager.session_id_length,
        catalog = ?config.catalog_path,
        metrics_enabled = %config.observability.enable_metrics,
        "dbplugin host configuration"
    );
}
