use crate::{
    check::PermissionChecker,
    closure::{ClosureWalk, EdgeKind, TraversalBudget, TraversalError, TraversalResult, TupleReader},
    error::{RebacError, Result},
    models::*,
};
use ahash::AHashSet;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, warn};

/// Subject expander answers the reverse questions: who may do P on O, and
/// which objects may S do P on.
///
/// Candidates are gathered by walking the graph backwards, then each one is
/// re-checked forwards with the relationship layer at the same revision.
/// Nothing appears in an expansion that a check would deny.
///
/// Backward walks keep the depth bound but not the per-node fan-out cap: a
/// wide group seen from above is narrow from each member's side, so the
/// forward check alone decides who passes. A backward walk that runs out of
/// time fails the expansion instead of returning a partial answer.
pub struct SubjectExpander {
    checker: Arc<PermissionChecker>,
}

impl SubjectExpander {
    pub fn new(checker: Arc<PermissionChecker>) -> Self {
        Self { checker }
    }

    /// All subjects holding `permission` on `object`, sorted.
    pub async fn expand(
        &self,
        permission: &str,
        object: &Entity,
        zone: &ZoneId,
        revision: Option<u64>,
    ) -> Result<Vec<Entity>> {
        object.validate("object")?;
        zone.validate()?;
        require_permission(permission)?;

        let reader = self.checker.reader(zone);
        let budget = self.checker.budget().without_fan_out_cap();
        let candidates = self
            .subject_candidates(permission, object, &reader, revision, &budget)
            .await?;
        debug!("Expand {} on {}: {} candidates", permission, object, candidates.len());

        let mut subjects = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let request = CheckRequest::new(candidate.clone(), permission, object.clone(), zone.clone());
            if self.checker.check_rebac(&request, &reader, revision).await?.allowed {
                subjects.push(candidate);
            }
        }
        Ok(subjects)
    }

    /// All objects `subject` may exercise `permission` on, sorted, optionally
    /// restricted to one object type.
    pub async fn list_objects(
        &self,
        subject: &Entity,
        permission: &str,
        zone: &ZoneId,
        object_type: Option<&str>,
        revision: Option<u64>,
    ) -> Result<Vec<Entity>> {
        subject.validate("subject")?;
        zone.validate()?;
        require_permission(permission)?;

        let reader = self.checker.reader(zone);
        let budget = self.checker.budget().without_fan_out_cap();
        let candidates = self
            .object_candidates(subject, permission, &reader, revision, &budget)
            .await?;

        let mut objects = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if object_type.is_some_and(|t| t != candidate.entity_type) {
                continue;
            }
            let request = CheckRequest::new(subject.clone(), permission, candidate.clone(), zone.clone());
            if self.checker.check_rebac(&request, &reader, revision).await?.allowed {
                objects.push(candidate);
            }
        }
        Ok(objects)
    }

    async fn subject_candidates(
        &self,
        permission: &str,
        object: &Entity,
        reader: &TupleReader,
        revision: Option<u64>,
        budget: &TraversalBudget,
    ) -> Result<BTreeSet<Entity>> {
        let closure = self.checker.closure();
        let relations: AHashSet<String> = self
            .checker
            .schema()
            .relations_for(&object.entity_type, permission)
            .into_iter()
            .collect();

        let mut targets = vec![object.clone()];
        targets.extend(gathered(
            closure
                .ancestors(reader, object, EdgeKind::Hierarchy, revision, budget)
                .await,
        )?);

        let mut grantees = BTreeSet::new();
        for target in &targets {
            for tuple in reader.by_object(target).await?.iter() {
                if relations.contains(&tuple.relation) {
                    grantees.insert(tuple.subject.clone());
                }
            }
        }

        let mut candidates = grantees.clone();
        for grantee in &grantees {
            candidates.extend(gathered(
                closure
                    .descendants(reader, grantee, EdgeKind::Membership, revision, budget)
                    .await,
            )?);
        }

        // Agents inherit from their owning user; the forward check applies sharing scope.
        let ownership = self.checker.ownership();
        if let (true, Some(registry)) = (ownership.enabled, self.checker.registry()) {
            let owners: Vec<Entity> = candidates
                .iter()
                .filter(|c| c.entity_type != ownership.agent_type)
                .cloned()
                .collect();
            for owner in owners {
                for child in registry.children_of(&owner).await? {
                    if child.entity_type == ownership.agent_type {
                        candidates.insert(child);
                    }
                }
            }
        }

        Ok(candidates)
    }

    async fn object_candidates(
        &self,
        subject: &Entity,
        permission: &str,
        reader: &TupleReader,
        revision: Option<u64>,
        budget: &TraversalBudget,
    ) -> Result<BTreeSet<Entity>> {
        let closure = self.checker.closure();
        let schema = self.checker.schema();

        let mut principals = vec![subject.clone()];
        let ownership = self.checker.ownership();
        if let (true, Some(registry)) = (ownership.enabled, self.checker.registry()) {
            if subject.entity_type == ownership.agent_type {
                if let Some(owner) = registry
                    .lookup_entity_by_id(subject)
                    .await?
                    .and_then(|record| record.owner)
                {
                    principals.push(owner);
                }
            }
        }
        for principal in principals.clone() {
            principals.extend(gathered(
                closure
                    .ancestors(reader, &principal, EdgeKind::Membership, revision, budget)
                    .await,
            )?);
        }

        let mut granted = BTreeSet::new();
        for principal in &principals {
            for tuple in reader.by_subject(principal).await?.iter() {
                if schema.is_membership(&tuple.relation) || schema.is_hierarchy(&tuple.relation) {
                    continue;
                }
                let satisfies = schema
                    .relations_for(&tuple.object.entity_type, permission)
                    .iter()
                    .any(|r| *r == tuple.relation);
                if satisfies {
                    granted.insert(tuple.object.clone());
                }
            }
        }

        let mut candidates = granted.clone();
        for object in &granted {
            candidates.extend(gathered(
                closure
                    .descendants(reader, object, EdgeKind::Hierarchy, revision, budget)
                    .await,
            )?);
        }
        Ok(candidates)
    }
}

fn require_permission(permission: &str) -> Result<()> {
    if permission.trim().is_empty() {
        return Err(RebacError::Validation("permission must not be empty".to_string()));
    }
    Ok(())
}

/// Entities a backward walk reached. Depth cuts are shared with the forward
/// check and need no handling; running out of time does.
fn gathered(result: TraversalResult<Arc<ClosureWalk>>) -> Result<Vec<Entity>> {
    let walk = result.map_err(|err| match err {
        TraversalError::Store(err) => err,
        TraversalError::Limit(limit) => RebacError::TraversalTimeout(limit.as_str().to_string()),
    })?;
    if walk.limit == Some(GraphLimit::Timeout) {
        warn!("Reverse traversal timed out after {} entities", walk.entities.len());
        return Err(RebacError::TraversalTimeout("reverse traversal".to_string()));
    }
    Ok(walk.entities.clone())
}
