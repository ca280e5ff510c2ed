//! Group membership and hierarchy closure
//!
//! Walks `member-of`/`member` edges (subject is a member of object) and
//! `parent` edges (subject lives under object) breadth-first. Walks are
//! bounded by depth, per-node fan-out and a deadline; revisits are dead ends
//! so cyclic graphs terminate. A bound stops the walk where it is hit: what
//! was reached so far is returned together with the limit, and callers
//! decide whether the partial closure is enough.
//!
//! Complete closures are a pure function of the zone's tuples at a revision
//! and the bounds they ran under. They are memoized per (zone, revision,
//! bounds) until the earliest expiring edge they followed runs out.

use crate::{
    config::{CacheConfig, TraversalConfig},
    error::RebacError,
    models::{Entity, GraphLimit, RelationshipTuple, TupleFilter, ZoneId},
    repository::TupleRepository,
    schema::Schema,
};
use ahash::AHashSet;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use moka::future::Cache;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::debug;

/// Why a traversal stopped without an answer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TraversalError {
    /// A bound was hit; resolved to DENY by the caller.
    Limit(GraphLimit),
    Store(RebacError),
}

impl From<RebacError> for TraversalError {
    fn from(err: RebacError) -> Self {
        TraversalError::Store(err)
    }
}

pub type TraversalResult<T> = std::result::Result<T, TraversalError>;

/// Hard bounds for one traversal.
#[derive(Debug, Clone, Copy)]
pub struct TraversalBudget {
    pub max_depth: u32,
    pub max_fan_out: usize,
    pub deadline: Instant,
}

impl TraversalBudget {
    pub fn new(config: &TraversalConfig) -> Self {
        Self::with_timeout(config, config.timeout())
    }

    pub fn with_timeout(config: &TraversalConfig, timeout: Duration) -> Self {
        Self {
            max_depth: config.max_depth,
            max_fan_out: config.max_fan_out,
            deadline: Instant::now() + timeout,
        }
    }

    /// Same depth and deadline, no per-node fan-out cap.
    pub fn without_fan_out_cap(self) -> Self {
        Self {
            max_fan_out: usize::MAX,
            ..self
        }
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.deadline
    }

    pub fn check_deadline(&self) -> TraversalResult<()> {
        if self.is_expired() {
            return Err(TraversalError::Limit(GraphLimit::Timeout));
        }
        Ok(())
    }
}

fn earliest(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> Option<DateTime<Utc>> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Zone-scoped tuple reads, memoized for the lifetime of one check or batch.
///
/// Also tracks the earliest expiry among everything read, so a decision
/// derived from these reads knows when it stops being true.
pub struct TupleReader {
    repository: Arc<dyn TupleRepository>,
    zone: ZoneId,
    memo: DashMap<TupleFilter, Arc<Vec<RelationshipTuple>>>,
    valid_until: Mutex<Option<DateTime<Utc>>>,
}

impl TupleReader {
    pub fn new(repository: Arc<dyn TupleRepository>, zone: &ZoneId) -> Self {
        Self {
            repository,
            zone: zone.clone(),
            memo: DashMap::new(),
            valid_until: Mutex::new(None),
        }
    }

    pub fn zone(&self) -> &ZoneId {
        &self.zone
    }

    async fn read(&self, filter: TupleFilter) -> Result<Arc<Vec<RelationshipTuple>>, RebacError> {
        if let Some(hit) = self.memo.get(&filter) {
            return Ok(Arc::clone(hit.value()));
        }
        let tuples = Arc::new(self.repository.read_tuples(&filter).await?);
        self.note_expiry(tuples.iter().filter_map(|t| t.expires_at).min());
        self.memo.insert(filter, Arc::clone(&tuples));
        Ok(tuples)
    }

    /// Live tuples whose subject is `subject`.
    pub async fn by_subject(&self, subject: &Entity) -> Result<Arc<Vec<RelationshipTuple>>, RebacError> {
        self.read(TupleFilter::in_zone(&self.zone).with_subject(subject)).await
    }

    /// Live tuples whose object is `object`.
    pub async fn by_object(&self, object: &Entity) -> Result<Arc<Vec<RelationshipTuple>>, RebacError> {
        self.read(TupleFilter::in_zone(&self.zone).with_object(object)).await
    }

    pub fn note_expiry(&self, expires_at: Option<DateTime<Utc>>) {
        if expires_at.is_some() {
            let mut guard = self.valid_until.lock();
            *guard = earliest(*guard, expires_at);
        }
    }

    /// Earliest expiry seen so far, `None` when nothing read expires.
    pub fn valid_until(&self) -> Option<DateTime<Utc>> {
        *self.valid_until.lock()
    }

    pub fn memoized_reads(&self) -> usize {
        self.memo.len()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EdgeKind {
    Membership,
    Hierarchy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Follow edges from subject to object: groups of a member, parents of a child.
    Up,
    /// Follow edges from object to subject: members of a group, children of a folder.
    Down,
}

/// Entities reached by one walk.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClosureWalk {
    /// Nearest first. Excludes the start.
    pub entities: Vec<Entity>,
    /// First bound that cut the walk short; `None` when the closure is complete.
    pub limit: Option<GraphLimit>,
    /// Earliest expiry among the edges followed.
    pub valid_until: Option<DateTime<Utc>>,
}

impl ClosureWalk {
    pub fn is_complete(&self) -> bool {
        self.limit.is_none()
    }

    fn cut(&mut self, limit: GraphLimit) {
        self.limit.get_or_insert(limit);
    }

    fn is_outlived(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|until| until <= now)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ClosureKey {
    zone: ZoneId,
    revision: u64,
    entity: Entity,
    kind: EdgeKind,
    direction: Direction,
    /// Capped and uncapped walks of the same node can differ.
    max_depth: u32,
    max_fan_out: usize,
}

/// Transitive closure over membership and hierarchy edges.
pub struct GroupClosure {
    schema: Arc<Schema>,
    memo: Cache<ClosureKey, Arc<ClosureWalk>>,
}

impl GroupClosure {
    pub fn new(schema: Arc<Schema>, config: &CacheConfig) -> Self {
        Self {
            schema,
            memo: Cache::builder()
                .max_capacity(config.closure_entries)
                .time_to_live(config.closure_ttl())
                .build(),
        }
    }

    fn follows(&self, kind: EdgeKind, relation: &str) -> bool {
        match kind {
            EdgeKind::Membership => self.schema.is_membership(relation),
            EdgeKind::Hierarchy => self.schema.is_hierarchy(relation),
        }
    }

    /// Groups `subject` transitively belongs to (or folders it lives under).
    pub async fn ancestors(
        &self,
        reader: &TupleReader,
        subject: &Entity,
        kind: EdgeKind,
        revision: Option<u64>,
        budget: &TraversalBudget,
    ) -> TraversalResult<Arc<ClosureWalk>> {
        self.closure(reader, subject, kind, Direction::Up, revision, budget).await
    }

    /// Members (or children) of `object`, transitively.
    pub async fn descendants(
        &self,
        reader: &TupleReader,
        object: &Entity,
        kind: EdgeKind,
        revision: Option<u64>,
        budget: &TraversalBudget,
    ) -> TraversalResult<Arc<ClosureWalk>> {
        self.closure(reader, object, kind, Direction::Down, revision, budget).await
    }

    async fn closure(
        &self,
        reader: &TupleReader,
        start: &Entity,
        kind: EdgeKind,
        direction: Direction,
        revision: Option<u64>,
        budget: &TraversalBudget,
    ) -> TraversalResult<Arc<ClosureWalk>> {
        let key = revision.map(|revision| ClosureKey {
            zone: reader.zone().clone(),
            revision,
            entity: start.clone(),
            kind,
            direction,
            max_depth: budget.max_depth,
            max_fan_out: budget.max_fan_out,
        });
        if let Some(ref key) = key {
            if let Some(hit) = self.memo.get(key).await {
                if !hit.is_outlived(Utc::now()) {
                    reader.note_expiry(hit.valid_until);
                    return Ok(hit);
                }
                debug!("Memoized closure from {} outlived an expiring edge", start);
                self.memo.invalidate(key).await;
            }
        }

        let walk = Arc::new(self.walk(reader, start, kind, direction, budget).await?);
        if let (Some(key), true) = (key, walk.is_complete()) {
            self.memo.insert(key, Arc::clone(&walk)).await;
        }
        Ok(walk)
    }

    async fn walk(
        &self,
        reader: &TupleReader,
        start: &Entity,
        kind: EdgeKind,
        direction: Direction,
        budget: &TraversalBudget,
    ) -> TraversalResult<ClosureWalk> {
        let mut visited: AHashSet<Entity> = AHashSet::from_iter([start.clone()]);
        let mut walk = ClosureWalk::default();
        let mut frontier: VecDeque<(Entity, u32)> = VecDeque::from([(start.clone(), 0)]);

        while let Some((node, depth)) = frontier.pop_front() {
            if budget.is_expired() {
                walk.cut(GraphLimit::Timeout);
                break;
            }

            let tuples = match direction {
                Direction::Up => reader.by_subject(&node).await?,
                Direction::Down => reader.by_object(&node).await?,
            };
            let edges: Vec<&RelationshipTuple> = tuples
                .iter()
                .filter(|t| self.follows(kind, &t.relation))
                .collect();
            if edges.len() > budget.max_fan_out {
                debug!("{} has {} edges, over fan-out {}", node, edges.len(), budget.max_fan_out);
                walk.cut(GraphLimit::FanOut);
                continue;
            }

            for edge in edges {
                let neighbour = match direction {
                    Direction::Up => &edge.object,
                    Direction::Down => &edge.subject,
                };
                if visited.contains(neighbour) {
                    continue;
                }
                if depth + 1 > budget.max_depth {
                    debug!("Closure from {} stopped at depth {}", start, budget.max_depth);
                    walk.cut(GraphLimit::Depth);
                    break;
                }
                visited.insert(neighbour.clone());
                walk.valid_until = earliest(walk.valid_until, edge.expires_at);
                walk.entities.push(neighbour.clone());
                frontier.push_back((neighbour.clone(), depth + 1));
            }
        }

        Ok(walk)
    }

    pub fn invalidate_all(&self) {
        self.memo.invalidate_all();
    }
}
