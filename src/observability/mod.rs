// src/observability/mod.rs
//! Logging and metrics
//!
//! - **Subscriber**: `tracing-subscriber` registry with an env filter and a
//!   text or JSON formatter
//! - **Metrics**: Prometheus recorder plus the counter names emitted by the
//!   engine
//! - **Request logger**: per-request asynchronous log funnel

pub mod request_logger;

pub use request_logger::{short_id, LogLevel, RequestLogger};

use crate::utils::config::{LogFormat, LoggingConfig};
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// Counter: contexts created from scratch
pub const CONTEXTS_CREATED: &str = "context_created_total";
/// Counter: forks created
pub const CONTEXTS_FORKED: &str = "context_forked_total";
/// Counter: contexts released
pub const CONTEXTS_RELEASED: &str = "context_released_total";
/// Counter: interrupt signals accepted by a listener
pub const INTERRUPT_SIGNALS: &str = "interrupt_signals_total";
/// Counter: progress events handed to a consumer
pub const BATCH_PROGRESS_EVENTS: &str = "batch_progress_events_total";
/// Counter: any/race results that arrived after the batch returned
pub const BATCH_DISCARDED_RESULTS: &str = "batch_discarded_results_total";
/// Counter: resource handles released
pub const RESOURCES_RELEASED: &str = "resources_released_total";

/// Install the global tracing subscriber
///
/// `RUST_LOG` wins over the configured level when set. Calling this twice
/// returns an error rather than panicking.
pub fn init_tracing(config: &LoggingConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.level))
        .map_err(|e| EngineError::ConfigError(format!("invalid log level: {}", e)))?;

    let registry = tracing_subscriber::registry().with(filter);

    let result = match config.format {
        LogFormat::Json => registry
            .with(tracing_subscriber::fmt::layer().json().with_target(true))
            .try_init(),
        LogFormat::Text => registry
            .with(tracing_subscriber::fmt::layer().with_target(true))
            .try_init(),
    };

    result.map_err(|e| EngineError::ConfigError(format!("tracing already initialized: {}", e)))
}

/// Install the Prometheus recorder and return its render handle
pub fn init_metrics() -> Result<PrometheusHandle> {
    PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| EngineError::ConfigError(format!("failed to install metrics recorder: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_tracing_once() {
        let config = LoggingConfig {
            level: "debug".to_string(),
            format: LogFormat::Json,
        };
        // Only this test installs a global subscriber
        assert!(init_tracing(&config).is_ok());
        assert!(init_tracing(&config).is_err());
    }

    #[test]
    fn test_metrics_recorder_renders_counters() {
        let handle = init_metrics().unwrap();
        metrics::counter!(RESOURCES_RELEASED).increment(2);
        assert!(handle.render().contains(RESOURCES_RELEASED));
    }
}
