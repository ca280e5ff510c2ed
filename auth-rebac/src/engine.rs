use crate::{
    cache::{CacheStats, RevisionCache},
    check::PermissionChecker,
    closure::TupleReader,
    config::RebacConfig,
    error::{RebacError, Result},
    expand::SubjectExpander,
    iterator::{query_hash, IteratorCache},
    models::*,
    providers::{AclProvider, EntityRegistry, ModeBitsSource},
    repository::TupleRepository,
    revision::{revision_bucket, RepositoryRevisionSource, RevisionSource},
    schema::Schema,
    trace,
};
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, Instrument};

/// Everything that only exists once a tuple store is configured.
struct Backend {
    repository: Arc<dyn TupleRepository>,
    checker: Arc<PermissionChecker>,
    expander: SubjectExpander,
    cache: RevisionCache,
}

/// ReBAC authorization engine
///
/// Entry point for the filesystem kernel: tuple writes, layered permission
/// checks behind the revision-quantized cache, and paged reverse queries
/// behind the iterator cache. Without a tuple store every operation reports
/// `Unavailable` rather than a deny.
pub struct AuthorizationEngine {
    backend: Option<Backend>,
    schema: Arc<Schema>,
    config: RebacConfig,
    iterators: IteratorCache<Entity>,
}

/// Builder for [`AuthorizationEngine`]
#[derive(Default)]
pub struct AuthorizationEngineBuilder {
    config: RebacConfig,
    repository: Option<Arc<dyn TupleRepository>>,
    revision_source: Option<Arc<dyn RevisionSource>>,
    registry: Option<Arc<dyn EntityRegistry>>,
    acl: Option<Arc<dyn AclProvider>>,
    mode_bits: Option<Arc<dyn ModeBitsSource>>,
}

impl AuthorizationEngineBuilder {
    pub fn with_config(mut self, config: RebacConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_repository(mut self, repository: Arc<dyn TupleRepository>) -> Self {
        self.repository = Some(repository);
        self
    }

    /// Override where cached checks read zone revisions from. Defaults to the repository.
    pub fn with_revision_source(mut self, source: Arc<dyn RevisionSource>) -> Self {
        self.revision_source = Some(source);
        self
    }

    pub fn with_entity_registry(mut self, registry: Arc<dyn EntityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_acl_provider(mut self, acl: Arc<dyn AclProvider>) -> Self {
        self.acl = Some(acl);
        self
    }

    pub fn with_mode_bits_source(mut self, mode_bits: Arc<dyn ModeBitsSource>) -> Self {
        self.mode_bits = Some(mode_bits);
        self
    }

    pub fn build(self) -> Result<AuthorizationEngine> {
        self.config.validate()?;
        let config = self.config;
        let schema = Arc::new(config.schema.clone());

        let backend = self.repository.map(|repository| {
            let checker = Arc::new(
                PermissionChecker::new(Arc::clone(&repository), Arc::clone(&schema), config.traversal.clone())
                    .with_cache_config(&config.cache)
                    .with_ownership(config.ownership.clone())
                    .with_registry(self.registry)
                    .with_acl(self.acl)
                    .with_mode_bits(self.mode_bits),
            );
            let source: Arc<dyn RevisionSource> = match self.revision_source {
                Some(source) => source,
                None => Arc::new(RepositoryRevisionSource::new(Arc::clone(&repository))),
            };
            Backend {
                expander: SubjectExpander::new(Arc::clone(&checker)),
                cache: RevisionCache::new(&config.cache, &config.circuit_breaker, source),
                checker,
                repository,
            }
        });

        match backend {
            Some(ref b) => info!("ReBAC engine initialized with {} backend", b.repository.backend_name()),
            None => info!("ReBAC engine initialized without a tuple store"),
        }

        Ok(AuthorizationEngine {
            backend,
            schema,
            iterators: IteratorCache::new(&config.iterator),
            config,
        })
    }
}

impl AuthorizationEngine {
    pub fn builder() -> AuthorizationEngineBuilder {
        AuthorizationEngineBuilder::default()
    }

    /// Create an engine over `repository` with default configuration.
    pub fn new(repository: Arc<dyn TupleRepository>) -> Result<Self> {
        Self::builder().with_repository(repository).build()
    }

    fn backend(&self) -> Result<&Backend> {
        self.backend
            .as_ref()
            .ok_or_else(|| RebacError::Unavailable("no tuple store configured".to_string()))
    }

    pub fn schema(&self) -> Arc<Schema> {
        Arc::clone(&self.schema)
    }

    pub fn config(&self) -> &RebacConfig {
        &self.config
    }

    fn tracing_enabled(&self) -> bool {
        self.config.tracing.enabled
    }

    // =============================================================================
    // Tuple Management
    // =============================================================================

    /// Write a relationship tuple, returning its id.
    pub async fn write(&self, tuple: NewTuple) -> Result<TupleId> {
        let started = Instant::now();
        let span = trace::write_span(
            self.tracing_enabled(),
            &tuple.subject,
            &tuple.relation,
            &tuple.object,
            &tuple.zone,
        );
        let result = async {
            self.schema.validate_tuple(&tuple)?;
            let backend = self.backend()?;
            debug!("Writing tuple: {} {} {}", tuple.subject, tuple.relation, tuple.object);
            backend.repository.write_tuple(tuple).await
        }
        .instrument(span.clone())
        .await;

        trace::record_latency(&span, started);
        let outcome = result?;
        span.record("revision", outcome.revision);
        metrics::counter!("rebac_writes_total").increment(1);
        outcome
            .tuple_ids
            .into_iter()
            .next()
            .ok_or_else(|| RebacError::Internal("store returned no tuple id".to_string()))
    }

    /// Write several tuples atomically. An empty batch is a no-op.
    pub async fn write_batch(&self, tuples: Vec<NewTuple>) -> Result<Vec<TupleId>> {
        let started = Instant::now();
        let span = trace::write_batch_span(self.tracing_enabled(), tuples.len());
        let result = async {
            for tuple in &tuples {
                self.schema.validate_tuple(tuple)?;
            }
            let backend = self.backend()?;
            if tuples.is_empty() {
                return Ok(None);
            }
            backend.repository.write_batch(tuples).await.map(Some)
        }
        .instrument(span.clone())
        .await;

        trace::record_latency(&span, started);
        match result? {
            Some(outcome) => {
                span.record("revision", outcome.revision);
                metrics::counter!("rebac_writes_total").increment(outcome.tuple_ids.len() as u64);
                info!("Batch wrote {} tuples", outcome.tuple_ids.len());
                Ok(outcome.tuple_ids)
            }
            None => Ok(Vec::new()),
        }
    }

    /// Delete a tuple by id. Returns false when no such tuple exists.
    pub async fn delete(&self, tuple_id: TupleId) -> Result<bool> {
        let started = Instant::now();
        let span = trace::delete_span(self.tracing_enabled(), &tuple_id.to_string());
        let result = async {
            let backend = self.backend()?;
            backend.repository.delete_tuple(tuple_id).await
        }
        .instrument(span.clone())
        .await;

        trace::record_latency(&span, started);
        let Some((removed, revision)) = result? else {
            span.record("deleted", false);
            return Ok(false);
        };
        span.record("deleted", true);
        span.record("zone", removed.zone.as_str());
        span.record("revision", revision);
        metrics::counter!("rebac_deletes_total").increment(1);

        if self.config.revocation.immediate {
            self.invalidate_zone(&removed.zone).await;
        }
        Ok(true)
    }

    /// Keyset-paginated tuple listing. `cursor` is the `next_cursor` of a previous page.
    pub async fn list_tuples(&self, filter: TupleFilter, cursor: Option<&str>, limit: usize) -> Result<TuplePage> {
        let started = Instant::now();
        let span = trace::list_span(self.tracing_enabled(), "tuples", filter.zone.as_ref());
        let result = async {
            filter.validate()?;
            let cursor = cursor.map(ListCursor::decode).transpose()?;
            let backend = self.backend()?;
            backend.repository.list_tuples(&filter, cursor, limit).await
        }
        .instrument(span.clone())
        .await;

        trace::record_latency(&span, started);
        let page = result?;
        span.record("items", page.tuples.len());
        Ok(page)
    }

    // =============================================================================
    // Core Authorization Operations
    // =============================================================================

    /// Check if a subject has permission to perform an action on an object
    pub async fn check(&self, subject: Entity, permission: &str, object: Entity, zone: ZoneId) -> Result<bool> {
        self.check_with_context(subject, permission, object, zone, CallerContext::default())
            .await
    }

    /// Check permission with caller attributes (admin/system flags, POSIX groups)
    pub async fn check_with_context(
        &self,
        subject: Entity,
        permission: &str,
        object: Entity,
        zone: ZoneId,
        context: CallerContext,
    ) -> Result<bool> {
        let request = CheckRequest::new(subject, permission, object, zone).with_context(context);
        Ok(self.check_detailed(&request).await?.allowed)
    }

    /// Check and report which layer decided and where the answer came from.
    pub async fn check_detailed(&self, request: &CheckRequest) -> Result<AuthorizationDecision> {
        let started = Instant::now();
        let span = trace::check_span(self.tracing_enabled(), request);
        let result = async {
            request.validate()?;
            let backend = self.backend()?;
            if request.context.bypasses() {
                return backend.checker.check(request, None).await;
            }
            backend
                .cache
                .get_or_compute(request, |revision| backend.checker.check(request, revision))
                .await
        }
        .instrument(span.clone())
        .await;

        let decision = result?;
        trace::record_decision(&span, &decision, started);
        record_check_metrics(&decision, started);
        Ok(decision)
    }

    /// Check many requests. One revision fetch per zone and one shared read memo per zone.
    pub async fn check_batch(&self, requests: Vec<CheckRequest>) -> Result<Vec<bool>> {
        Ok(self
            .check_batch_detailed(requests)
            .await?
            .into_iter()
            .map(|d| d.allowed)
            .collect())
    }

    pub async fn check_batch_detailed(&self, requests: Vec<CheckRequest>) -> Result<Vec<AuthorizationDecision>> {
        let started = Instant::now();
        let span = trace::check_batch_span(self.tracing_enabled(), requests.len());
        let result = async {
            for request in &requests {
                request.validate()?;
            }
            let backend = self.backend()?;

            let mut distinct: Vec<&ZoneId> = requests.iter().map(|r| &r.zone).collect();
            distinct.sort();
            distinct.dedup();
            let revisions = join_all(distinct.iter().map(|zone| backend.cache.revision(zone))).await;
            let zones: HashMap<&ZoneId, (Result<u64>, TupleReader)> = distinct
                .into_iter()
                .zip(revisions)
                .map(|(zone, revision)| (zone, (revision, backend.checker.reader(zone))))
                .collect();

            let mut decisions = Vec::with_capacity(requests.len());
            for request in &requests {
                let item_started = Instant::now();
                let (revision, reader) = zones
                    .get(&request.zone)
                    .ok_or_else(|| RebacError::Internal("batch zone not prepared".to_string()))?;
                let decision = if request.context.bypasses() {
                    backend.checker.check_with_reader(request, reader, None).await?
                } else {
                    backend
                        .cache
                        .resolve(request, revision.clone(), |rev| {
                            backend.checker.check_with_reader(request, reader, rev)
                        })
                        .await?
                };
                record_check_metrics(&decision, item_started);
                decisions.push(decision);
            }
            Ok::<_, RebacError>(decisions)
        }
        .instrument(span.clone())
        .await;

        trace::record_latency(&span, started);
        let decisions = result?;
        span.record("allowed", decisions.iter().filter(|d| d.allowed).count());
        Ok(decisions)
    }

    // =============================================================================
    // Reverse Queries
    // =============================================================================

    /// All subjects holding `permission` on `object`.
    pub async fn expand(&self, permission: &str, object: Entity, zone: ZoneId) -> Result<Vec<Entity>> {
        Ok(self.expand_page(permission, object, zone, Some(usize::MAX)).await?.items)
    }

    /// First page of an expansion; continue with [`expand_next`](Self::expand_next).
    pub async fn expand_page(
        &self,
        permission: &str,
        object: Entity,
        zone: ZoneId,
        page_size: Option<usize>,
    ) -> Result<Page<Entity>> {
        let started = Instant::now();
        let span = trace::expand_span(self.tracing_enabled(), permission, &object, &zone);
        let result = async {
            object.validate("object")?;
            zone.validate()?;
            let backend = self.backend()?;
            let revision = self.observed_revision(backend, &zone).await;
            let hash = query_hash(&[
                "expand",
                permission,
                &object.to_string(),
                &bucket_token(revision, self.config.cache.window_size),
            ]);
            self.iterators
                .get_or_create(
                    &hash,
                    &zone,
                    || backend.expander.expand(permission, &object, &zone, revision),
                    page_size.unwrap_or(self.config.iterator.page_size),
                )
                .await
        }
        .instrument(span.clone())
        .await;

        trace::record_latency(&span, started);
        let page = result?;
        span.record("subjects", page.total);
        Ok(page)
    }

    /// Continue a paged expansion or object listing.
    pub async fn expand_next(&self, cursor_id: &str, offset: usize, limit: usize) -> Result<Page<Entity>> {
        self.iterators.get_page(cursor_id, offset, limit).await
    }

    /// Objects `subject` may exercise `permission` on, paged through the iterator cache.
    pub async fn list_objects(
        &self,
        subject: Entity,
        permission: &str,
        zone: ZoneId,
        object_type: Option<&str>,
        page_size: Option<usize>,
    ) -> Result<Page<Entity>> {
        let started = Instant::now();
        let span = trace::list_span(self.tracing_enabled(), "objects", Some(&zone));
        let result = async {
            subject.validate("subject")?;
            zone.validate()?;
            let backend = self.backend()?;
            let revision = self.observed_revision(backend, &zone).await;
            let hash = query_hash(&[
                "list_objects",
                permission,
                &subject.to_string(),
                object_type.unwrap_or("*"),
                &bucket_token(revision, self.config.cache.window_size),
            ]);
            self.iterators
                .get_or_create(
                    &hash,
                    &zone,
                    || backend.expander.list_objects(&subject, permission, &zone, object_type, revision),
                    page_size.unwrap_or(self.config.iterator.page_size),
                )
                .await
        }
        .instrument(span.clone())
        .await;

        trace::record_latency(&span, started);
        let page = result?;
        span.record("items", page.total);
        Ok(page)
    }

    async fn observed_revision(&self, backend: &Backend, zone: &ZoneId) -> Option<u64> {
        match backend.cache.revision(zone).await {
            Ok(revision) => Some(revision),
            Err(err) => {
                debug!("Reverse query in zone {} without revision: {}", zone, err);
                None
            }
        }
    }

    // =============================================================================
    // Cache and Zone Lifecycle
    // =============================================================================

    /// Drop every cached decision and result set of `zone`.
    pub async fn invalidate_zone(&self, zone: &ZoneId) {
        if let Some(ref backend) = self.backend {
            backend.cache.invalidate_zone(zone).await;
        }
        let dropped = self.iterators.invalidate_zone(zone).await;
        debug!("Zone {} invalidated ({} cursors dropped)", zone, dropped);
    }

    /// Forget every cached decision and memoized closure across all zones.
    pub fn clear_caches(&self) {
        if let Some(ref backend) = self.backend {
            backend.cache.clear();
            backend.checker.closure().invalidate_all();
        }
        debug!("Decision caches cleared");
    }

    pub async fn invalidate_cursor(&self, cursor_id: &str) -> bool {
        self.iterators.invalidate_cursor(cursor_id).await
    }

    /// Remove all tuples of a zone and restart its revision counter.
    pub async fn teardown_zone(&self, zone: &ZoneId) -> Result<u64> {
        zone.validate()?;
        let backend = self.backend()?;
        let removed = backend.repository.teardown_zone(zone).await?;
        // Revisions restart at zero, so closures memoized by revision are stale.
        backend.checker.closure().invalidate_all();
        self.invalidate_zone(zone).await;
        info!("Zone {} torn down, {} tuples removed", zone, removed);
        Ok(removed)
    }

    pub fn cache_stats(&self) -> Option<CacheStats> {
        self.backend.as_ref().map(|b| b.cache.stats())
    }

    pub async fn health_check(&self) -> HealthStatus {
        match self.backend {
            Some(ref backend) => HealthStatus {
                backend: backend.repository.backend_name().to_string(),
                initialized: true,
                healthy: backend.repository.health().await,
                circuit_state: backend.cache.breaker_state().to_string(),
            },
            None => HealthStatus {
                backend: "none".to_string(),
                initialized: false,
                healthy: false,
                circuit_state: "none".to_string(),
            },
        }
    }
}

fn bucket_token(revision: Option<u64>, window_size: u64) -> String {
    revision.map_or_else(
        || "unversioned".to_string(),
        |r| revision_bucket(r, window_size).to_string(),
    )
}

fn record_check_metrics(decision: &AuthorizationDecision, started: Instant) {
    metrics::counter!(
        "rebac_check_total",
        "layer" => decision.layer.as_str(),
        "source" => decision.source.as_str(),
        "allowed" => if decision.allowed { "true" } else { "false" }
    )
    .increment(1);
    metrics::histogram!("rebac_check_duration_seconds").record(started.elapsed().as_secs_f64());
}
