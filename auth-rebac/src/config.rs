//! Engine configuration
//!
//! Every knob has a default so an engine can be built with
//! `RebacConfig::default()`. Deployments load overrides from a YAML/TOML
//! file and `REBAC__*` environment variables, e.g.
//! `REBAC__CACHE__WINDOW_SIZE=25` or `REBAC__TRAVERSAL__MAX_DEPTH=8`.

use crate::{
    error::{RebacError, Result},
    models::SharingScope,
    schema::Schema,
};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RebacConfig {
    pub cache: CacheConfig,
    pub traversal: TraversalConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub iterator: IteratorConfig,
    pub tracing: TracingConfig,
    pub revocation: RevocationConfig,
    pub ownership: OwnershipConfig,
    pub schema: Schema,
}

/// Revision-quantized check cache
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub enabled: bool,
    /// Number of zone revisions that share one cache bucket.
    pub window_size: u64,
    pub ttl_seconds: u64,
    pub max_entries: u64,
    /// Capacity of the last-known-good table used while the breaker is open.
    pub fallback_entries: u64,
    /// Memoized group and hierarchy closures.
    pub closure_entries: u64,
    pub closure_ttl_seconds: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_size: 10,
            ttl_seconds: 300,
            max_entries: 100_000,
            fallback_entries: 100_000,
            closure_entries: 10_000,
            closure_ttl_seconds: 300,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }

    pub fn closure_ttl(&self) -> Duration {
        Duration::from_secs(self.closure_ttl_seconds)
    }
}

/// Hard bounds on graph traversal. Exceeding any of them denies.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TraversalConfig {
    pub max_depth: u32,
    pub max_fan_out: usize,
    pub timeout_ms: u64,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            max_depth: 10,
            max_fan_out: 1_000,
            timeout_ms: 250,
        }
    }
}

impl TraversalConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures that open the circuit
    pub failure_threshold: usize,
    /// Successes in half-open state that close it again
    pub success_threshold: usize,
    /// Calls admitted while half-open
    pub half_open_max_calls: usize,
    pub break_duration_ms: u64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            half_open_max_calls: 3,
            break_duration_ms: 30_000,
        }
    }
}

impl CircuitBreakerConfig {
    pub fn break_duration(&self) -> Duration {
        Duration::from_millis(self.break_duration_ms)
    }
}

/// Cursor cache for paginated list/expand results
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IteratorConfig {
    pub max_cursors: u64,
    pub ttl_seconds: u64,
    pub page_size: usize,
}

impl Default for IteratorConfig {
    fn default() -> Self {
        Self {
            max_cursors: 1_000,
            ttl_seconds: 300,
            page_size: 100,
        }
    }
}

impl IteratorConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_seconds)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TracingConfig {
    /// When false, operations run under `Span::none()`.
    pub enabled: bool,
}

impl Default for TracingConfig {
    fn default() -> Self {
        Self { enabled: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RevocationConfig {
    /// Drop a zone's cached decisions as soon as one of its tuples is deleted,
    /// instead of waiting for the next revision bucket.
    pub immediate: bool,
}

impl Default for RevocationConfig {
    fn default() -> Self {
        Self { immediate: true }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OwnershipConfig {
    pub enabled: bool,
    /// Entity type that inherits from its owner.
    pub agent_type: String,
    /// Scope assumed for objects the registry does not know.
    pub default_scope: SharingScope,
}

impl Default for OwnershipConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            agent_type: "agent".to_string(),
            default_scope: SharingScope::User,
        }
    }
}

impl RebacConfig {
    /// Load configuration from an optional file plus `REBAC__` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("REBAC")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let loaded: RebacConfig = settings.try_deserialize()?;
        loaded.validate()?;
        Ok(loaded)
    }

    pub fn validate(&self) -> Result<()> {
        if self.cache.window_size == 0 {
            return Err(RebacError::InvalidConfig(
                "cache.window_size must be at least 1".to_string(),
            ));
        }
        if self.traversal.max_depth == 0 {
            return Err(RebacError::InvalidConfig(
                "traversal.max_depth must be at least 1".to_string(),
            ));
        }
        if self.traversal.max_fan_out == 0 {
            return Err(RebacError::InvalidConfig(
                "traversal.max_fan_out must be at least 1".to_string(),
            ));
        }
        if self.traversal.timeout_ms == 0 {
            return Err(RebacError::InvalidConfig(
                "traversal.timeout_ms must be positive".to_string(),
            ));
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0
        {
            return Err(RebacError::InvalidConfig(
                "circuit breaker thresholds must be at least 1".to_string(),
            ));
        }
        if self.iterator.page_size == 0 {
            return Err(RebacError::InvalidConfig(
                "iterator.page_size must be at least 1".to_string(),
            ));
        }
        self.schema.validate()
    }
}
