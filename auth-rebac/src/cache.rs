//! Revision-quantized decision cache (L1)
//!
//! Entries are keyed by the request plus `revision / window_size` and the
//! zone's epoch. Advancing the zone past a bucket boundary, or bumping the
//! epoch through `invalidate_zone`, makes older entries unreachable; moka
//! evicts them in the background.
//!
//! Tuple expiry does not advance the revision, so a decision that carries a
//! `valid_until` is only served until then.
//!
//! Revision fetches go through a circuit breaker. While the source is
//! failing, the last decision computed for a request is served marked as
//! `fallback`; without one the request is recomputed directly.

use crate::{
    circuit::{CircuitBreaker, CircuitBreakerStats, CircuitState},
    config::{CacheConfig, CircuitBreakerConfig},
    error::{RebacError, Result},
    models::{AuthorizationDecision, CheckRequest, DecisionSource, GraphLimit, ZoneId},
    revision::{revision_bucket, RevisionSource},
};
use chrono::Utc;
use dashmap::DashMap;
use moka::future::Cache;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    request: CheckRequest,
    bucket: u64,
    epoch: u64,
}

/// Cache statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub fallbacks: u64,
    pub entries: u64,
}

pub struct RevisionCache {
    entries: Cache<CacheKey, AuthorizationDecision>,
    /// Last decision per request regardless of bucket, for breaker fallback.
    last_known_good: Cache<CheckRequest, AuthorizationDecision>,
    epochs: DashMap<ZoneId, u64>,
    source: Arc<dyn RevisionSource>,
    breaker: CircuitBreaker,
    enabled: bool,
    window_size: u64,
    hits: AtomicU64,
    misses: AtomicU64,
    fallbacks: AtomicU64,
}

impl RevisionCache {
    pub fn new(config: &CacheConfig, breaker: &CircuitBreakerConfig, source: Arc<dyn RevisionSource>) -> Self {
        Self {
            entries: Cache::builder()
                .max_capacity(config.max_entries)
                .time_to_live(config.ttl())
                .build(),
            last_known_good: Cache::builder()
                .max_capacity(config.fallback_entries)
                .build(),
            epochs: DashMap::new(),
            source,
            breaker: CircuitBreaker::new(breaker),
            enabled: config.enabled,
            window_size: config.window_size.max(1),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            fallbacks: AtomicU64::new(0),
        }
    }

    /// Current revision of a zone, fetched through the circuit breaker.
    pub async fn revision(&self, zone: &ZoneId) -> Result<u64> {
        self.breaker
            .call(|| self.source.current_revision(zone))
            .await
    }

    fn epoch(&self, zone: &ZoneId) -> u64 {
        self.epochs.get(zone).map(|e| *e.value()).unwrap_or(0)
    }

    /// Probe for `request`, computing and storing on a miss.
    ///
    /// `compute` receives the revision it runs at, or `None` when the
    /// revision source is unavailable.
    pub async fn get_or_compute<F, Fut>(&self, request: &CheckRequest, compute: F) -> Result<AuthorizationDecision>
    where
        F: Fn(Option<u64>) -> Fut,
        Fut: Future<Output = Result<AuthorizationDecision>>,
    {
        let revision = self.revision(&request.zone).await;
        self.resolve(request, revision, compute).await
    }

    /// Same as [`get_or_compute`](Self::get_or_compute) with a revision the
    /// caller already fetched, so a batch pays one fetch per zone.
    pub async fn resolve<F, Fut>(
        &self,
        request: &CheckRequest,
        revision: Result<u64>,
        compute: F,
    ) -> Result<AuthorizationDecision>
    where
        F: Fn(Option<u64>) -> Fut,
        Fut: Future<Output = Result<AuthorizationDecision>>,
    {
        let revision = match revision {
            Ok(revision) => revision,
            Err(err) => return self.fallback(request, err, compute).await,
        };

        if !self.enabled {
            let decision = compute(Some(revision)).await?;
            self.remember(request, &decision).await;
            return Ok(decision);
        }

        let key = CacheKey {
            request: request.clone(),
            bucket: revision_bucket(revision, self.window_size),
            epoch: self.epoch(&request.zone),
        };

        // Concurrent misses on one key share a single computation.
        let mut entry = self
            .entries
            .entry(key.clone())
            .or_try_insert_with(compute(Some(revision)))
            .await
            .map_err(RebacError::from)?;

        // Expiry does not advance the revision; a decision built on a tuple
        // that has since expired is recomputed.
        if !entry.is_fresh() && entry.value().is_outlived(Utc::now()) {
            debug!("Cached decision for {} outlived an expiring tuple", request.subject);
            self.entries.invalidate(&key).await;
            entry = self
                .entries
                .entry(key.clone())
                .or_try_insert_with(compute(Some(revision)))
                .await
                .map_err(RebacError::from)?;
        }

        if !entry.is_fresh() {
            self.hits.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("rebac_cache_hits_total").increment(1);
            return Ok(entry.into_value().with_source(DecisionSource::Cache));
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rebac_cache_misses_total").increment(1);
        let decision = entry.into_value();
        if decision.limit == Some(GraphLimit::Timeout) {
            // A timeout says nothing about the graph; recompute next time.
            self.entries.invalidate(&key).await;
        } else {
            self.remember(request, &decision).await;
        }
        Ok(decision)
    }

    async fn remember(&self, request: &CheckRequest, decision: &AuthorizationDecision) {
        if decision.limit != Some(GraphLimit::Timeout) {
            self.last_known_good.insert(request.clone(), decision.clone()).await;
        }
    }

    async fn fallback<F, Fut>(&self, request: &CheckRequest, err: RebacError, compute: F) -> Result<AuthorizationDecision>
    where
        F: Fn(Option<u64>) -> Fut,
        Fut: Future<Output = Result<AuthorizationDecision>>,
    {
        self.fallbacks.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("rebac_cache_fallback_total").increment(1);
        warn!("Revision source unavailable for zone {}: {}", request.zone, err);

        if let Some(decision) = self
            .last_known_good
            .get(request)
            .await
            .filter(|d| !d.is_outlived(Utc::now()))
        {
            debug!("Serving last-known-good decision for {} {} {}", request.subject, request.permission, request.object);
            return Ok(decision.with_source(DecisionSource::Fallback));
        }

        match compute(None).await {
            Ok(decision) => Ok(decision),
            Err(recompute) => Err(RebacError::BackingStoreFailure(format!(
                "revision source: {}; direct recompute: {}",
                err, recompute
            ))),
        }
    }

    /// Make every cached decision of `zone` unreachable.
    pub async fn invalidate_zone(&self, zone: &ZoneId) {
        *self.epochs.entry(zone.clone()).or_insert(0) += 1;
        let stale: Vec<Arc<CheckRequest>> = self
            .last_known_good
            .iter()
            .filter(|(request, _)| &request.zone == zone)
            .map(|(request, _)| request)
            .collect();
        for request in stale {
            self.last_known_good.invalidate(request.as_ref()).await;
        }
        metrics::counter!("rebac_cache_zone_invalidations_total").increment(1);
        debug!("Invalidated cached decisions for zone {}", zone);
    }

    pub fn clear(&self) {
        self.entries.invalidate_all();
        self.last_known_good.invalidate_all();
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            fallbacks: self.fallbacks.load(Ordering::Relaxed),
            entries: self.entries.entry_count(),
        }
    }

    pub fn breaker_state(&self) -> CircuitState {
        self.breaker.state()
    }

    pub fn breaker_stats(&self) -> CircuitBreakerStats {
        self.breaker.stats()
    }
}
