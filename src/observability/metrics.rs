//! # Metrics Collection
//!
//! Prometheus metrics for plugin lifecycle, sessions and backend operations.
//! Recording goes through the `metrics` facade and is a no-op until
//! [`init_metrics`] installs an exporter.

use crate::config::ObservabilityConfig;
use crate::errors::{Error, Result};
use ::tracing::{info, warn};
use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram, Unit,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;

/// Metrics recorder that tracks plugin host metrics
#[derive(Debug, Clone, Default)]
pub struct MetricsRecorder;

impl MetricsRecorder {
    /// Create a new metrics recorder instance
    pub fn new() -> Self {
        Self
    }

    /// Record a spawn attempt and its outcome (`success`, `error`, `cancelled`)
    pub fn record_spawn(&self, plugin: &str, outcome: &str) {
        let labels = [("plugin", plugin.to_string()), ("outcome", outcome.to_string())];
        counter!("plugin_spawns_total", &labels).increment(1);
    }

    /// Record a subprocess kill
    pub fn record_kill(&self, plugin: &str) {
        let labels = [("plugin", plugin.to_string())];
        counter!("plugin_kills_total", &labels).increment(1);
    }

    /// Update the active session gauge for one plugin
    pub fn set_active_sessions(&self, plugin: &str, count: usize) {
        let labels = [("plugin", plugin.to_string())];
        gauge!("plugin_sessions_active", &labels).set(count as f64);
    }

    /// Record a handed-out session; `mode` is `shared` or `dedicated`
    pub fn record_session_acquired(&self, plugin: &str, mode: &str) {
        let labels = [("plugin", plugin.to_string()), ("mode", mode.to_string())];
        counter!("plugin_sessions_acquired_total", &labels).increment(1);
    }

    /// Update the number of backend instances held by a multiplexed dispatcher
    pub fn set_dispatch_instances(&self, count: usize) {
        gauge!("plugin_dispatch_instances").set(count as f64);
    }

    /// Record a backend operation with execution timing
    pub fn record_database_operation(&self, operation: &str, duration: f64, success: bool) {
        let status = if success { "success" } else { "error" };
        let labels = [("operation", operation.to_string()), ("status", status.to_string())];
        counter!("database_operations_total", &labels).increment(1);

        let duration_labels = [("operation", operation.to_string())];
        histogram!("database_operation_duration_seconds", &duration_labels).record(duration);
    }

    /// Register metric descriptions
    pub fn register_plugin_metrics(&self) {
        describe_counter!(
            "plugin_spawns_total",
            Unit::Count,
            "Plugin subprocess spawn attempts grouped by outcome"
        );
        describe_counter!("plugin_kills_total", Unit::Count, "Plugin subprocesses killed");
        describe_gauge!(
            "plugin_sessions_active",
            Unit::Count,
            "Active logical sessions per plugin subprocess"
        );
        describe_counter!(
            "plugin_sessions_acquired_total",
            Unit::Count,
            "Sessions handed out, by shared or dedicated mode"
        );
        describe_gauge!(
            "plugin_dispatch_instances",
            Unit::Count,
            "Backend instances held by the multiplexed dispatcher"
        );
        describe_counter!(
            "database_operations_total",
            Unit::Count,
            "Backend operations grouped by outcome"
        );
        describe_histogram!(
            "database_operation_duration_seconds",
            Unit::Seconds,
            "Backend operation latency"
        );
    }
}

/// Initialize metrics collection and Prometheus exporter
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.enable_metrics {
        return Ok(());
    }

    let metrics_addr = match config.metrics_bind_address() {
        Some(addr) => addr,
        None => {
            warn!("Metrics disabled: no bind address configured");
            return Ok(());
        }
    };

    let socket_addr: SocketAddr = metrics_addr.parse().map_err(|e| {
        Error::config(format!("Invalid metrics bind address '{}': {}", metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(socket_addr)
        .add_global_label("service", &config.service_name)
        .install()
        .map_err(|e| Error::config(format!("Failed to initialize metrics exporter: {}", e)))?;

    MetricsRecorder::new().register_plugin_metrics();

    info!(
        metrics_addr = %metrics_addr,
        service_name = %config.service_name,
        "Metrics collection initialized"
    );

    Ok(())
}
