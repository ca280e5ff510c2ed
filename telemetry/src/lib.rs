//! Logging and metrics bootstrap for the ReBAC authorization core
//!
//! The authorization crate only emits `tracing` spans and `metrics`
//! counters; this crate decides where they go:
//! - Structured logging: pretty output in development, JSON elsewhere
//! - A Prometheus recorder whose handle renders the scrape payload
//! - Metric descriptions for every series the engine emits
//!
//! # Example
//!
//! ```rust,no_run
//! use telemetry::{init_tracing, install_prometheus_recorder, TelemetryConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     init_tracing(&TelemetryConfig::from_env())?;
//!     let handle = install_prometheus_recorder()?;
//!     println!("{}", handle.render());
//!     Ok(())
//! }
//! ```

pub mod error;

pub use error::{Result, TelemetryError};
pub use metrics_exporter_prometheus::PrometheusHandle;

use metrics::{describe_counter, describe_histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use serde::{Deserialize, Serialize};
use std::env;
use std::sync::OnceLock;
use tracing_subscriber::{fmt, fmt::time::ChronoUtc, prelude::*, EnvFilter};

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Pretty,
    Json,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    pub service_name: String,
    /// Fallback directive when `RUST_LOG` is unset.
    pub level: String,
    pub format: LogFormat,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            service_name: "auth-rebac".to_string(),
            level: "info".to_string(),
            format: LogFormat::Pretty,
        }
    }
}

impl TelemetryConfig {
    /// `REBAC_ENV=development` (the default) selects pretty output; any
    /// other value selects JSON. `REBAC_LOG_LEVEL` overrides the level.
    pub fn from_env() -> Self {
        let is_development =
            env::var("REBAC_ENV").unwrap_or_else(|_| "development".to_string()) == "development";
        let mut config = Self {
            format: if is_development { LogFormat::Pretty } else { LogFormat::Json },
            ..Self::default()
        };
        if let Ok(level) = env::var("REBAC_LOG_LEVEL") {
            config.level = level;
        }
        config
    }

    fn env_filter(&self) -> Result<EnvFilter> {
        match EnvFilter::try_from_default_env() {
            Ok(filter) => Ok(filter),
            Err(_) => {
                let directives = format!("auth_rebac={},sqlx=warn", self.level);
                EnvFilter::try_new(&directives).map_err(|e| TelemetryError::FilterError(e.to_string()))
            }
        }
    }
}

/// Install the global subscriber. Fails if one is already installed.
pub fn init_tracing(config: &TelemetryConfig) -> Result<()> {
    let env_filter = config.env_filter()?;

    let installed = match config.format {
        LogFormat::Pretty => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(true)
                    .with_thread_ids(true)
                    .with_line_number(true)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(env::var("NO_COLOR").is_err()),
            )
            .try_init(),
        LogFormat::Json => tracing_subscriber::registry()
            .with(env_filter)
            .with(
                fmt::layer()
                    .with_target(false)
                    .with_timer(ChronoUtc::rfc_3339())
                    .with_ansi(false)
                    .json(),
            )
            .try_init(),
    };
    installed.map_err(|e| TelemetryError::TracingError(e.to_string()))?;

    tracing::info!(service = %config.service_name, format = ?config.format, "Tracing initialized");
    Ok(())
}

/// Install the Prometheus recorder once per process and return its handle.
/// Later calls return the same handle.
pub fn install_prometheus_recorder() -> Result<PrometheusHandle> {
    if let Some(handle) = METRICS_HANDLE.get() {
        return Ok(handle.clone());
    }
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .map_err(|e| TelemetryError::ExporterError(e.to_string()))?;
    let handle = METRICS_HANDLE.get_or_init(|| handle).clone();
    describe_rebac_metrics();
    Ok(handle)
}

/// Quiet subscriber writing through the test harness. Safe to call from
/// every test.
pub fn init_for_tests() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("auth_rebac=debug"));
    // Another test may have installed it already.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_test_writer()
        .try_init();
}

fn describe_rebac_metrics() {
    describe_counter!("rebac_check_total", "Permission checks by deciding layer, source and result");
    describe_histogram!("rebac_check_duration_seconds", Unit::Seconds, "Permission check latency");
    describe_counter!("rebac_cache_hits_total", "Decision cache hits");
    describe_counter!("rebac_cache_misses_total", "Decision cache misses");
    describe_counter!(
        "rebac_cache_fallback_total",
        "Decisions served from the last-known-good table while revisions were unavailable"
    );
    describe_counter!("rebac_cache_zone_invalidations_total", "Zone-wide cache invalidations");
    describe_counter!("rebac_circuit_transitions_total", "Circuit breaker state transitions");
    describe_counter!("rebac_circuit_rejected_total", "Calls rejected by an open circuit");
    describe_counter!("rebac_graph_limit_total", "Checks denied by a traversal bound");
    describe_counter!("rebac_writes_total", "Tuples written");
    describe_counter!("rebac_deletes_total", "Tuples deleted");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = TelemetryConfig::default();
        assert_eq!(config.service_name, "auth-rebac");
        assert_eq!(config.format, LogFormat::Pretty);
        assert!(config.env_filter().is_ok());
    }

    #[test]
    fn test_config_deserializes_partial() {
        let config: TelemetryConfig = serde_json::from_str(r#"{"format":"json"}"#).unwrap();
        assert_eq!(config.format, LogFormat::Json);
        assert_eq!(config.level, "info");
    }

    #[test]
    fn test_init_for_tests_is_idempotent() {
        init_for_tests();
        init_for_tests();
        tracing::debug!("still alive");
    }

    #[test]
    fn test_prometheus_handle_is_shared() {
        let first = install_prometheus_recorder().unwrap();
        metrics::counter!("rebac_writes_total").increment(2);
        let second = install_prometheus_recorder().unwrap();
        let rendered = second.render();
        assert!(rendered.contains("rebac_writes_total"));
        assert!(first.render().contains("rebac_writes_total"));
    }
}
