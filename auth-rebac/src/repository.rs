use crate::{
    error::{RebacError, Result},
    models::*,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};

pub mod postgres;

pub use postgres::PostgresTupleRepository;

/// Outcome of a mutating call: the ids touched and the zone revision it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub tuple_ids: Vec<TupleId>,
    pub revision: u64,
}

/// Repository interface for storing relationship tuples
///
/// Every mutating call bumps the zone revision by exactly one inside the same
/// transaction as the tuple change, so a reader that observes revision `R`
/// also observes every mutation committed at or before `R`.
#[async_trait]
pub trait TupleRepository: Send + Sync {
    /// Short backend name reported by health checks.
    fn backend_name(&self) -> &'static str;

    /// Write a single tuple. Re-writing a live fact returns its existing id.
    async fn write_tuple(&self, tuple: NewTuple) -> Result<WriteOutcome>;

    /// Write several tuples atomically. Each zone touched advances once.
    async fn write_batch(&self, tuples: Vec<NewTuple>) -> Result<WriteOutcome>;

    /// Delete by id, returning the removed tuple. Unknown ids leave the revision alone.
    async fn delete_tuple(&self, tuple_id: TupleId) -> Result<Option<(RelationshipTuple, u64)>>;

    /// Read live tuples matching the given filter
    async fn read_tuples(&self, filter: &TupleFilter) -> Result<Vec<RelationshipTuple>>;

    /// Keyset-paginated listing ordered by (created_at, tuple_id).
    async fn list_tuples(
        &self,
        filter: &TupleFilter,
        cursor: Option<ListCursor>,
        limit: usize,
    ) -> Result<TuplePage>;

    /// Current revision of a zone; zones never written to are at 0.
    async fn current_revision(&self, zone: &ZoneId) -> Result<u64>;

    /// Drop every tuple of a zone and reset its revision counter.
    async fn teardown_zone(&self, zone: &ZoneId) -> Result<u64>;

    async fn health(&self) -> bool;
}

#[derive(Default)]
struct MemoryState {
    /// Ordered by the same key as list cursors.
    tuples: BTreeMap<(DateTime<Utc>, TupleId), RelationshipTuple>,
    by_id: HashMap<TupleId, DateTime<Utc>>,
    revisions: HashMap<ZoneId, u64>,
}

impl MemoryState {
    fn find_fact(&self, tuple: &NewTuple) -> Option<&RelationshipTuple> {
        self.tuples.values().find(|t| t.same_fact(tuple))
    }

    /// Insert or reuse a live duplicate. Expired duplicates are replaced.
    fn upsert(&mut self, tuple: NewTuple, now: DateTime<Utc>) -> TupleId {
        if let Some(existing) = self.find_fact(&tuple) {
            if existing.is_live_at(now) {
                return existing.tuple_id;
            }
            let stale = existing.tuple_id;
            self.remove(stale);
        }

        let stored = RelationshipTuple::from_new(tuple, now);
        let id = stored.tuple_id;
        self.by_id.insert(id, stored.created_at);
        self.tuples.insert((stored.created_at, id), stored);
        id
    }

    fn remove(&mut self, tuple_id: TupleId) -> Option<RelationshipTuple> {
        let created_at = self.by_id.remove(&tuple_id)?;
        self.tuples.remove(&(created_at, tuple_id))
    }

    fn bump(&mut self, zone: &ZoneId) -> u64 {
        let revision = self.revisions.entry(zone.clone()).or_insert(0);
        *revision += 1;
        *revision
    }
}

/// In-memory tuple repository for testing and embedded use
///
/// A single `RwLock` covers tuples and revisions so that a mutation and its
/// revision bump are observed together.
pub struct InMemoryTupleRepository {
    state: RwLock<MemoryState>,
}

impl InMemoryTupleRepository {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(MemoryState::default()),
        }
    }

    /// Number of stored tuples, including expired ones not yet removed.
    pub fn len(&self) -> usize {
        self.state.read().tuples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryTupleRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TupleRepository for InMemoryTupleRepository {
    fn backend_name(&self) -> &'static str {
        "memory"
    }

    async fn write_tuple(&self, tuple: NewTuple) -> Result<WriteOutcome> {
        tuple.validate()?;
        let now = Utc::now();
        let mut state = self.state.write();
        let zone = tuple.zone.clone();
        let id = state.upsert(tuple, now);
        let revision = state.bump(&zone);
        Ok(WriteOutcome {
            tuple_ids: vec![id],
            revision,
        })
    }

    async fn write_batch(&self, tuples: Vec<NewTuple>) -> Result<WriteOutcome> {
        for tuple in &tuples {
            tuple.validate()?;
        }
        let now = Utc::now();
        let mut state = self.state.write();

        let mut zones: Vec<ZoneId> = tuples.iter().map(|t| t.zone.clone()).collect();
        zones.sort();
        zones.dedup();

        let tuple_ids = tuples.into_iter().map(|t| state.upsert(t, now)).collect();
        let mut revision = 0;
        for zone in &zones {
            revision = state.bump(zone);
        }
        Ok(WriteOutcome { tuple_ids, revision })
    }

    async fn delete_tuple(&self, tuple_id: TupleId) -> Result<Option<(RelationshipTuple, u64)>> {
        let mut state = self.state.write();
        match state.remove(tuple_id) {
            Some(removed) => {
                let revision = state.bump(&removed.zone);
                Ok(Some((removed, revision)))
            }
            None => Ok(None),
        }
    }

    async fn read_tuples(&self, filter: &TupleFilter) -> Result<Vec<RelationshipTuple>> {
        let now = Utc::now();
        let state = self.state.read();
        Ok(state
            .tuples
            .values()
            .filter(|t| t.is_live_at(now) && filter.matches(t))
            .cloned()
            .collect())
    }

    async fn list_tuples(
        &self,
        filter: &TupleFilter,
        cursor: Option<ListCursor>,
        limit: usize,
    ) -> Result<TuplePage> {
        if limit == 0 {
            return Err(RebacError::Validation("limit must be at least 1".to_string()));
        }
        let now = Utc::now();
        let state = self.state.read();

        let mut tuples: Vec<RelationshipTuple> = Vec::with_capacity(limit);
        let mut has_more = false;
        for ((created_at, id), tuple) in state.tuples.iter() {
            if let Some(ref after) = cursor {
                if (*created_at, *id) <= (after.created_at, after.tuple_id) {
                    continue;
                }
            }
            if !tuple.is_live_at(now) || !filter.matches(tuple) {
                continue;
            }
            if tuples.len() == limit {
                has_more = true;
                break;
            }
            tuples.push(tuple.clone());
        }

        let next_cursor = if has_more {
            tuples.last().map(|t| ListCursor::after(t).encode())
        } else {
            None
        };
        Ok(TuplePage { tuples, next_cursor })
    }

    async fn current_revision(&self, zone: &ZoneId) -> Result<u64> {
        Ok(self.state.read().revisions.get(zone).copied().unwrap_or(0))
    }

    async fn teardown_zone(&self, zone: &ZoneId) -> Result<u64> {
        let mut state = self.state.write();
        let doomed: Vec<TupleId> = state
            .tuples
            .values()
            .filter(|t| &t.zone == zone)
            .map(|t| t.tuple_id)
            .collect();
        for id in &doomed {
            state.remove(*id);
        }
        state.revisions.remove(zone);
        Ok(doomed.len() as u64)
    }

    async fn health(&self) -> bool {
        true
    }
}
