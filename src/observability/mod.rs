// src/observability/mod.rs
//! Tracing and metrics setup
//!
//! Unit threads never write to the subscriber for vuser-visible messages;
//! they post log records to the manager, which re-emits them here.

use crate::utils::config::{LoggingConfig, MetricsConfig};
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Metric names
pub mod names {
    pub const ACTIVE_VUSERS: &str = "vuser_engine_active_vusers";
    pub const SYNC_CALLS: &str = "vuser_engine_sync_calls_total";
    pub const ASYNC_CALLS: &str = "vuser_engine_async_calls_total";
    pub const PROTOCOL_ERRORS: &str = "vuser_engine_protocol_errors_total";
    pub const HANDOFF_FLIPS: &str = "vuser_engine_handoff_flips_total";
}

/// Install the global tracing subscriber
///
/// `RUST_LOG` takes precedence over the configured level.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| EngineError::ConfigError(format!("Invalid log filter: {}", e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_thread_names(true);

    let installed = if config.json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    installed.map_err(|e| EngineError::ConfigError(format!("Failed to init tracing: {}", e)))
}

/// Install the Prometheus exporter when a listener is configured
///
/// Must be called from within a Tokio runtime.
pub fn init_metrics(config: &MetricsConfig) -> Result<()> {
    let Some(addr) = config.listen_addr else {
        return Ok(());
    };

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::ConfigError(format!("Failed to install metrics exporter: {}", e)))?;

    metrics::describe_gauge!(names::ACTIVE_VUSERS, "Vusers with a live unit pair");
    metrics::describe_counter!(names::SYNC_CALLS, "Completed blocking round trips");
    metrics::describe_counter!(names::ASYNC_CALLS, "Async requests posted");
    metrics::describe_counter!(names::PROTOCOL_ERRORS, "Dropped backend frames");
    metrics::describe_counter!(names::HANDOFF_FLIPS, "Handoff buffer flips");

    info!("Prometheus exporter listening on {}", addr);
    Ok(())
}
