use crate::{
    closure::{EdgeKind, GroupClosure, TraversalBudget, TraversalError, TraversalResult, TupleReader},
    config::{CacheConfig, OwnershipConfig, TraversalConfig},
    error::Result,
    models::*,
    providers::{AclProvider, EntityRegistry, ModeBitsSource},
    repository::TupleRepository,
    schema::Schema,
};
use ahash::AHashSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Result of a single decision layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayerOutcome {
    Allow,
    Deny,
    /// The layer has no opinion; evaluation continues with the next one.
    Indeterminate,
}

enum Reach {
    Granted,
    /// No grant found; carries the bound that cut the group walk, if any.
    NotFound(Option<GraphLimit>),
}

fn grants(tuples: &[RelationshipTuple], relations: &AHashSet<String>, targets: &AHashSet<Entity>) -> bool {
    tuples
        .iter()
        .any(|t| relations.contains(&t.relation) && targets.contains(&t.object))
}

/// Permission checker evaluates a request through the decision layers:
/// - Admin/system bypass
/// - Relationship graph (direct, group closure, folder hierarchy, agent ownership)
/// - Access-control lists
/// - UNIX mode bits, deny by default
pub struct PermissionChecker {
    repository: Arc<dyn TupleRepository>,
    schema: Arc<Schema>,
    closure: GroupClosure,
    traversal: TraversalConfig,
    ownership: OwnershipConfig,
    registry: Option<Arc<dyn EntityRegistry>>,
    acl: Option<Arc<dyn AclProvider>>,
    mode_bits: Option<Arc<dyn ModeBitsSource>>,
}

impl PermissionChecker {
    pub fn new(repository: Arc<dyn TupleRepository>, schema: Arc<Schema>, traversal: TraversalConfig) -> Self {
        let closure = GroupClosure::new(Arc::clone(&schema), &CacheConfig::default());
        Self {
            repository,
            schema,
            closure,
            traversal,
            ownership: OwnershipConfig::default(),
            registry: None,
            acl: None,
            mode_bits: None,
        }
    }

    /// Size the closure memo from the cache settings.
    pub fn with_cache_config(mut self, cache: &CacheConfig) -> Self {
        self.closure = GroupClosure::new(Arc::clone(&self.schema), cache);
        self
    }

    pub fn with_ownership(mut self, ownership: OwnershipConfig) -> Self {
        self.ownership = ownership;
        self
    }

    pub fn with_registry(mut self, registry: Option<Arc<dyn EntityRegistry>>) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_acl(mut self, acl: Option<Arc<dyn AclProvider>>) -> Self {
        self.acl = acl;
        self
    }

    pub fn with_mode_bits(mut self, mode_bits: Option<Arc<dyn ModeBitsSource>>) -> Self {
        self.mode_bits = mode_bits;
        self
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn closure(&self) -> &GroupClosure {
        &self.closure
    }

    pub fn registry(&self) -> Option<&Arc<dyn EntityRegistry>> {
        self.registry.as_ref()
    }

    pub fn ownership(&self) -> &OwnershipConfig {
        &self.ownership
    }

    pub fn budget(&self) -> TraversalBudget {
        TraversalBudget::new(&self.traversal)
    }

    /// A fresh read memo for one check, or one zone of a batch.
    pub fn reader(&self, zone: &ZoneId) -> TupleReader {
        TupleReader::new(Arc::clone(&self.repository), zone)
    }

    /// Evaluate all layers with a private read memo.
    pub async fn check(&self, request: &CheckRequest, revision: Option<u64>) -> Result<AuthorizationDecision> {
        let reader = self.reader(&request.zone);
        self.check_with_reader(request, &reader, revision).await
    }

    /// Evaluate all layers, stopping at the first definitive one.
    ///
    /// The decision is stamped with the revision it ran at and with the
    /// earliest expiry among the tuples it read.
    pub async fn check_with_reader(
        &self,
        request: &CheckRequest,
        reader: &TupleReader,
        revision: Option<u64>,
    ) -> Result<AuthorizationDecision> {
        request.validate()?;
        let decision = self.decide(request, reader, revision).await?;
        Ok(decision.at_revision(revision).valid_until(reader.valid_until()))
    }

    async fn decide(
        &self,
        request: &CheckRequest,
        reader: &TupleReader,
        revision: Option<u64>,
    ) -> Result<AuthorizationDecision> {
        if request.context.bypasses() {
            debug!("Admin/system bypass for {}", request.subject);
            return Ok(AuthorizationDecision::new(true, DecisionLayer::Admin));
        }

        match self.rebac_layer(request, reader, revision).await {
            Ok(LayerOutcome::Allow) => return Ok(AuthorizationDecision::new(true, DecisionLayer::Rebac)),
            Ok(LayerOutcome::Deny) => return Ok(AuthorizationDecision::new(false, DecisionLayer::Rebac)),
            Ok(LayerOutcome::Indeterminate) => {}
            Err(TraversalError::Limit(limit)) => return Ok(self.limited(request, limit)),
            Err(TraversalError::Store(err)) => return Err(err),
        }

        match self.acl_layer(request).await? {
            LayerOutcome::Allow => return Ok(AuthorizationDecision::new(true, DecisionLayer::Acl)),
            LayerOutcome::Deny => return Ok(AuthorizationDecision::new(false, DecisionLayer::Acl)),
            LayerOutcome::Indeterminate => {}
        }

        self.unix_layer(request).await
    }

    /// The relationship-graph layer alone, as used to verify expand results.
    pub async fn check_rebac(
        &self,
        request: &CheckRequest,
        reader: &TupleReader,
        revision: Option<u64>,
    ) -> Result<AuthorizationDecision> {
        request.validate()?;
        let decision = match self.rebac_layer(request, reader, revision).await {
            Ok(LayerOutcome::Allow) => AuthorizationDecision::new(true, DecisionLayer::Rebac),
            Ok(LayerOutcome::Deny) | Ok(LayerOutcome::Indeterminate) => {
                AuthorizationDecision::new(false, DecisionLayer::Rebac)
            }
            Err(TraversalError::Limit(limit)) => self.limited(request, limit),
            Err(TraversalError::Store(err)) => return Err(err),
        };
        Ok(decision.at_revision(revision).valid_until(reader.valid_until()))
    }

    fn limited(&self, request: &CheckRequest, limit: GraphLimit) -> AuthorizationDecision {
        warn!(
            "Graph limit '{}' hit checking {} {} {} in zone {}",
            limit.as_str(),
            request.subject,
            request.permission,
            request.object,
            request.zone
        );
        metrics::counter!("rebac_graph_limit_total", "limit" => limit.as_str()).increment(1);
        AuthorizationDecision::limited(limit)
    }

    // =============================================================================
    // ReBAC layer
    // =============================================================================

    async fn rebac_layer(
        &self,
        request: &CheckRequest,
        reader: &TupleReader,
        revision: Option<u64>,
    ) -> TraversalResult<LayerOutcome> {
        let budget = self.budget();
        match tokio::time::timeout(
            self.traversal.timeout(),
            self.evaluate_rebac(request, reader, revision, &budget),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(TraversalError::Limit(GraphLimit::Timeout)),
        }
    }

    async fn evaluate_rebac(
        &self,
        request: &CheckRequest,
        reader: &TupleReader,
        revision: Option<u64>,
        budget: &TraversalBudget,
    ) -> TraversalResult<LayerOutcome> {
        let relations: AHashSet<String> = self
            .schema
            .relations_for(&request.object.entity_type, &request.permission)
            .into_iter()
            .collect();

        let mut principals = vec![request.subject.clone()];
        if let Some(owner) = self.inherited_owner(&request.subject, &request.object).await? {
            debug!("{} inherits grants of owner {}", request.subject, owner);
            principals.push(owner);
        }

        // Direct tuples on the object need no traversal.
        let mut targets: AHashSet<Entity> = AHashSet::from_iter([request.object.clone()]);
        for principal in &principals {
            if grants(&reader.by_subject(principal).await?, &relations, &targets) {
                return Ok(LayerOutcome::Allow);
            }
        }

        // Then every folder the object lives under, and every group of each principal.
        let ancestors = self
            .closure
            .ancestors(reader, &request.object, EdgeKind::Hierarchy, revision, budget)
            .await?;
        targets.extend(ancestors.entities.iter().cloned());
        let mut limit = ancestors.limit;

        for principal in &principals {
            match self
                .reaches(reader, principal, &relations, &targets, revision, budget)
                .await?
            {
                Reach::Granted => return Ok(LayerOutcome::Allow),
                Reach::NotFound(cut) => limit = limit.or(cut),
            }
        }

        // A bound only decides when no path was found within it.
        match limit {
            Some(limit) => Err(TraversalError::Limit(limit)),
            None => Ok(LayerOutcome::Indeterminate),
        }
    }

    /// Does `subject`, directly or through any of its groups, hold one of
    /// `relations` on one of `targets`?
    async fn reaches(
        &self,
        reader: &TupleReader,
        subject: &Entity,
        relations: &AHashSet<String>,
        targets: &AHashSet<Entity>,
        revision: Option<u64>,
        budget: &TraversalBudget,
    ) -> TraversalResult<Reach> {
        if grants(&reader.by_subject(subject).await?, relations, targets) {
            return Ok(Reach::Granted);
        }

        let groups = self
            .closure
            .ancestors(reader, subject, EdgeKind::Membership, revision, budget)
            .await?;
        for group in &groups.entities {
            budget.check_deadline()?;
            if grants(&reader.by_subject(group).await?, relations, targets) {
                return Ok(Reach::Granted);
            }
        }
        Ok(Reach::NotFound(groups.limit))
    }

    /// Owner whose grants `subject` inherits on `object`, if any.
    ///
    /// Only agents inherit, and never on agent-scoped objects. Objects the
    /// registry does not know take the configured default scope.
    pub async fn inherited_owner(&self, subject: &Entity, object: &Entity) -> Result<Option<Entity>> {
        if !self.ownership.enabled || subject.entity_type != self.ownership.agent_type {
            return Ok(None);
        }
        let Some(ref registry) = self.registry else {
            return Ok(None);
        };
        let Some(owner) = registry
            .lookup_entity_by_id(subject)
            .await?
            .and_then(|record| record.owner)
        else {
            return Ok(None);
        };

        let scope = registry
            .lookup_entity_by_id(object)
            .await?
            .and_then(|record| record.sharing_scope)
            .unwrap_or(self.ownership.default_scope);

        Ok(scope.allows_owner_inheritance().then_some(owner))
    }

    // =============================================================================
    // Legacy layers
    // =============================================================================

    async fn acl_layer(&self, request: &CheckRequest) -> Result<LayerOutcome> {
        let Some(ref acl) = self.acl else {
            return Ok(LayerOutcome::Indeterminate);
        };
        let outcome = match acl
            .check_acl(&request.object.entity_id, &request.permission, request)
            .await?
        {
            Some(true) => LayerOutcome::Allow,
            Some(false) => LayerOutcome::Deny,
            None => LayerOutcome::Indeterminate,
        };
        Ok(outcome)
    }

    /// Always definitive. Missing source or missing entry denies.
    async fn unix_layer(&self, request: &CheckRequest) -> Result<AuthorizationDecision> {
        let no_entry = AuthorizationDecision {
            no_entry: true,
            ..AuthorizationDecision::new(false, DecisionLayer::Unix)
        };
        let Some(ref source) = self.mode_bits else {
            return Ok(no_entry);
        };
        let Some(mode) = source.mode_bits(&request.object.entity_id).await? else {
            return Ok(no_entry);
        };

        let allowed = mode.permits(
            &[request.subject.entity_id.as_str()],
            &request.context.groups,
            &request.permission,
        );
        Ok(AuthorizationDecision::new(allowed, DecisionLayer::Unix))
    }
}
