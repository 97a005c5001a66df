// src/observability/mod.rs
//! Logging, metrics and lifecycle events
//!
//! - `init_tracing`: fmt subscriber with `EnvFilter` (`RUST_LOG` wins over
//!   the configured level), plain or JSON lines
//! - `init_metrics`: Prometheus exporter behind the `metrics` facade
//! - `events`: typed engine events on a broadcast bus

pub mod events;

pub use events::{EngineEvent, EventBus, EventBusStats};

use crate::utils::config::ObservabilityConfig;
use crate::utils::errors::{EngineError, Result};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::EnvFilter;

/// Submissions received (counter)
pub const SUBMISSIONS_TOTAL: &str = "signal_engine_submissions_total";
/// Cache hits (counter)
pub const CACHE_HITS_TOTAL: &str = "signal_engine_cache_hits_total";
/// Cache misses (counter)
pub const CACHE_MISSES_TOTAL: &str = "signal_engine_cache_misses_total";
/// Tasks completed (counter)
pub const TASKS_COMPLETED_TOTAL: &str = "signal_engine_tasks_completed_total";
/// Tasks failed terminally (counter, labels: kind)
pub const TASKS_FAILED_TOTAL: &str = "signal_engine_tasks_failed_total";
/// Retry attempts scheduled (counter)
pub const TASKS_RETRIED_TOTAL: &str = "signal_engine_tasks_retried_total";
/// Workers replaced after a failure (counter)
pub const WORKER_REPLACEMENTS_TOTAL: &str = "signal_engine_worker_replacements_total";
/// Tasks waiting for a worker (gauge)
pub const QUEUE_DEPTH: &str = "signal_engine_queue_depth";
/// Workers running a task (gauge)
pub const BUSY_WORKERS: &str = "signal_engine_busy_workers";
/// Estimated prompt tokens per built prompt (histogram)
pub const PROMPT_TOKENS: &str = "signal_engine_prompt_tokens";
/// End-to-end submission time in milliseconds (histogram)
pub const PROCESSING_TIME_MS: &str = "signal_engine_processing_time_ms";

/// Install the global tracing subscriber.
///
/// Fails if a subscriber is already installed.
pub fn init_tracing(config: &ObservabilityConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .map_err(|e| EngineError::Config(format!("Invalid log level '{}': {}", config.log_level, e)))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(true);

    let installed = if config.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    installed.map_err(|e| EngineError::Config(format!("Failed to install tracing subscriber: {}", e)))
}

/// Install the Prometheus recorder and its scrape listener when enabled.
///
/// With metrics disabled the `metrics` macros stay no-ops.
pub fn init_metrics(config: &ObservabilityConfig) -> Result<()> {
    if !config.metrics_enabled {
        return Ok(());
    }

    let addr: SocketAddr = config.metrics_addr.parse().map_err(|e| {
        EngineError::Config(format!("Invalid metrics address '{}': {}", config.metrics_addr, e))
    })?;

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| EngineError::Config(format!("Failed to install metrics exporter: {}", e)))?;

    info!("Prometheus metrics listening on {}", addr);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_disabled_is_noop() {
        let config = ObservabilityConfig {
            metrics_enabled: false,
            metrics_addr: "not an address".into(),
            ..Default::default()
        };
        assert!(init_metrics(&config).is_ok());
    }

    #[test]
    fn test_bad_metrics_addr_rejected() {
        let config = ObservabilityConfig {
            metrics_enabled: true,
            metrics_addr: "not an address".into(),
            ..Default::default()
        };
        assert!(matches!(init_metrics(&config), Err(EngineError::Config(_))));
    }

    #[test]
    fn test_metric_names_are_prefixed() {
        for name in [
            SUBMISSIONS_TOTAL,
            CACHE_HITS_TOTAL,
            QUEUE_DEPTH,
            PROMPT_TOKENS,
            PROCESSING_TIME_MS,
        ] {
            assert!(name.starts_with("signal_engine_"));
        }
    }
}
