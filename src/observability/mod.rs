//! # Observability Infrastructure
//!
//! Structured logging, Prometheus metrics and gRPC request spans for both the
//! host and plugin processes.

pub mod grpc_tracing;
pub mod logging;
pub mod metrics;

pub use grpc_tracing::{grpc_trace_layer, GrpcMakeSpan};
pub use logging::{init_logging, log_config_info, LogTarget};
pub use metrics::{init_metrics, MetricsRecorder};

use crate::config::ObservabilityConfig;
use crate::errors::Result;
use ::tracing::info;

/// Initialize logging and, if enabled, metrics.
pub fn init_observability(config: &ObservabilityConfig, target: LogTarget) -> Result<()> {
    init_logging(config, target);

    if config.enable_metrics {
        init_metrics(config)?;
    }

    info!(
        service_name = %config.service_name,
        log_level = %config.log_level,
        metrics_enabled = %config.enable_metrics,
        "Observability initialized successfully"
    );

    Ok(())
}
