use crate::error::{RebacError, Result};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, SubsecRound, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// A typed node of the authorization graph.
///
/// Subjects (users, agents, groups) and objects (files, folders, groups)
/// share the same shape: groups show up on both sides of a tuple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Entity {
    pub entity_type: String,
    pub entity_id: String,
}

impl Entity {
    pub fn new(entity_type: &str, entity_id: &str) -> Self {
        Self {
            entity_type: entity_type.to_string(),
            entity_id: entity_id.to_string(),
        }
    }

    pub fn user(user_id: &str) -> Self {
        Self::new("user", user_id)
    }

    pub fn agent(agent_id: &str) -> Self {
        Self::new("agent", agent_id)
    }

    pub fn group(group_id: &str) -> Self {
        Self::new("group", group_id)
    }

    pub fn file(path: &str) -> Self {
        Self::new("file", path)
    }

    pub fn folder(path: &str) -> Self {
        Self::new("folder", path)
    }

    /// Reject entities with an empty type or id.
    pub fn validate(&self, role: &str) -> Result<()> {
        if self.entity_type.trim().is_empty() {
            return Err(RebacError::Validation(format!("{} type must not be empty", role)));
        }
        if self.entity_id.trim().is_empty() {
            return Err(RebacError::Validation(format!("{} id must not be empty", role)));
        }
        Ok(())
    }
}

impl fmt::Display for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.entity_type, self.entity_id)
    }
}

/// Tenant isolation boundary. Revisions, caches and tuples are all zone-scoped.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ZoneId(String);

impl ZoneId {
    pub fn new(zone: &str) -> Self {
        Self(zone.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn validate(&self) -> Result<()> {
        if self.0.trim().is_empty() {
            return Err(RebacError::Validation("zone id must not be empty".to_string()));
        }
        Ok(())
    }
}

impl Default for ZoneId {
    fn default() -> Self {
        Self::new("default")
    }
}

impl From<&str> for ZoneId {
    fn from(zone: &str) -> Self {
        Self::new(zone)
    }
}

impl fmt::Display for ZoneId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque identifier of a stored tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TupleId(pub Uuid);

impl TupleId {
    pub fn generate() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TupleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A tuple as submitted by a writer, before the store assigns id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewTuple {
    pub subject: Entity,
    pub relation: String,
    pub object: Entity,
    pub zone: ZoneId,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewTuple {
    pub fn new(subject: Entity, relation: &str, object: Entity, zone: ZoneId) -> Self {
        Self {
            subject,
            relation: relation.to_string(),
            object,
            zone,
            expires_at: None,
        }
    }

    pub fn expiring_at(mut self, expires_at: DateTime<Utc>) -> Self {
        self.expires_at = Some(expires_at);
        self
    }

    /// Structural validation; vocabulary checks live in the schema.
    pub fn validate(&self) -> Result<()> {
        self.subject.validate("subject")?;
        self.object.validate("object")?;
        self.zone.validate()?;
        if self.relation.trim().is_empty() {
            return Err(RebacError::Validation("relation must not be empty".to_string()));
        }
        Ok(())
    }
}

/// The atomic authorization fact: subject has relation to object within a zone.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RelationshipTuple {
    pub tuple_id: TupleId,
    pub subject: Entity,
    pub relation: String,
    pub object: Entity,
    pub zone: ZoneId,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl RelationshipTuple {
    /// Timestamps are truncated to microseconds, the precision of list cursors.
    pub fn from_new(tuple: NewTuple, created_at: DateTime<Utc>) -> Self {
        Self {
            tuple_id: TupleId::generate(),
            subject: tuple.subject,
            relation: tuple.relation,
            object: tuple.object,
            zone: tuple.zone,
            created_at: created_at.trunc_subsecs(6),
            expires_at: tuple.expires_at,
        }
    }

    /// Expired tuples are treated as absent.
    pub fn is_live_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.map_or(true, |expires| expires > now)
    }

    pub fn same_fact(&self, tuple: &NewTuple) -> bool {
        self.zone == tuple.zone
            && self.relation == tuple.relation
            && self.subject == tuple.subject
            && self.object == tuple.object
    }
}

impl fmt::Display for RelationshipTuple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} {} @{}", self.subject, self.relation, self.object, self.zone)
    }
}

/// Optional filters for reading and listing tuples. `None` acts as a wildcard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TupleFilter {
    pub zone: Option<ZoneId>,
    pub subject: Option<Entity>,
    pub relation: Option<String>,
    pub object: Option<Entity>,
}

impl TupleFilter {
    pub fn in_zone(zone: &ZoneId) -> Self {
        Self {
            zone: Some(zone.clone()),
            ..Self::default()
        }
    }

    pub fn with_subject(mut self, subject: &Entity) -> Self {
        self.subject = Some(subject.clone());
        self
    }

    pub fn with_relation(mut self, relation: &str) -> Self {
        self.relation = Some(relation.to_string());
        self
    }

    pub fn with_object(mut self, object: &Entity) -> Self {
        self.object = Some(object.clone());
        self
    }

    pub fn matches(&self, tuple: &RelationshipTuple) -> bool {
        self.zone.as_ref().map_or(true, |z| *z == tuple.zone)
            && self.subject.as_ref().map_or(true, |s| *s == tuple.subject)
            && self.relation.as_ref().map_or(true, |r| *r == tuple.relation)
            && self.object.as_ref().map_or(true, |o| *o == tuple.object)
    }

    pub fn validate(&self) -> Result<()> {
        if let Some(ref zone) = self.zone {
            zone.validate()?;
        }
        if let Some(ref subject) = self.subject {
            subject.validate("subject")?;
        }
        if let Some(ref object) = self.object {
            object.validate("object")?;
        }
        Ok(())
    }
}

/// One page of a tuple listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TuplePage {
    pub tuples: Vec<RelationshipTuple>,
    pub next_cursor: Option<String>,
}

/// Keyset position for tuple listings, ordered by (created_at, tuple_id).
///
/// Serialized as URL-safe base64 so callers treat it as opaque.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ListCursor {
    pub created_at: DateTime<Utc>,
    pub tuple_id: TupleId,
}

impl ListCursor {
    pub fn after(tuple: &RelationshipTuple) -> Self {
        Self {
            created_at: tuple.created_at,
            tuple_id: tuple.tuple_id,
        }
    }

    pub fn encode(&self) -> String {
        let raw = format!("{}:{}", self.created_at.timestamp_micros(), self.tuple_id);
        URL_SAFE_NO_PAD.encode(raw.as_bytes())
    }

    pub fn decode(cursor: &str) -> Result<Self> {
        let invalid = || RebacError::Validation(format!("malformed list cursor: {}", cursor));
        let bytes = URL_SAFE_NO_PAD.decode(cursor).map_err(|_| invalid())?;
        let raw = String::from_utf8(bytes).map_err(|_| invalid())?;
        let (micros, id) = raw.split_once(':').ok_or_else(invalid)?;
        let micros: i64 = micros.parse().map_err(|_| invalid())?;
        let created_at = Utc.timestamp_micros(micros).single().ok_or_else(invalid)?;
        let tuple_id = Uuid::parse_str(id).map_err(|_| invalid())?;
        Ok(Self {
            created_at,
            tuple_id: TupleId(tuple_id),
        })
    }
}

/// Caller attributes supplied by the filesystem kernel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerContext {
    pub is_admin: bool,
    pub is_system: bool,
    /// POSIX-style group names, used by the mode-bit layer.
    pub groups: Vec<String>,
}

impl CallerContext {
    pub fn admin() -> Self {
        Self {
            is_admin: true,
            ..Self::default()
        }
    }

    pub fn system() -> Self {
        Self {
            is_system: true,
            ..Self::default()
        }
    }

    pub fn with_groups(groups: &[&str]) -> Self {
        Self {
            groups: groups.iter().map(|g| (*g).to_string()).collect(),
            ..Self::default()
        }
    }

    pub fn bypasses(&self) -> bool {
        self.is_admin || self.is_system
    }
}

/// Authorization check request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CheckRequest {
    pub subject: Entity,
    pub permission: String,
    pub object: Entity,
    pub zone: ZoneId,
    #[serde(default)]
    pub context: CallerContext,
}

impl CheckRequest {
    pub fn new(subject: Entity, permission: &str, object: Entity, zone: ZoneId) -> Self {
        Self {
            subject,
            permission: permission.to_string(),
            object,
            zone,
            context: CallerContext::default(),
        }
    }

    pub fn with_context(mut self, context: CallerContext) -> Self {
        self.context = context;
        self
    }

    pub fn validate(&self) -> Result<()> {
        self.subject.validate("subject")?;
        self.object.validate("object")?;
        self.zone.validate()?;
        if self.permission.trim().is_empty() {
            return Err(RebacError::Validation("permission must not be empty".to_string()));
        }
        Ok(())
    }
}

/// Which layer produced a decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionLayer {
    Admin,
    Rebac,
    Acl,
    Unix,
}

impl DecisionLayer {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionLayer::Admin => "admin",
            DecisionLayer::Rebac => "rebac",
            DecisionLayer::Acl => "acl",
            DecisionLayer::Unix => "unix",
        }
    }
}

impl fmt::Display for DecisionLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where a decision was served from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecisionSource {
    Computed,
    Cache,
    Fallback,
}

impl DecisionSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            DecisionSource::Computed => "computed",
            DecisionSource::Cache => "cache",
            DecisionSource::Fallback => "fallback",
        }
    }
}

/// Traversal bound that cut a graph walk short.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GraphLimit {
    Depth,
    FanOut,
    Timeout,
}

impl GraphLimit {
    pub fn as_str(&self) -> &'static str {
        match self {
            GraphLimit::Depth => "depth",
            GraphLimit::FanOut => "fan_out",
            GraphLimit::Timeout => "timeout",
        }
    }
}

/// Ephemeral result of a permission check. Never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthorizationDecision {
    pub allowed: bool,
    pub layer: DecisionLayer,
    pub source: DecisionSource,
    /// Set when a traversal bound forced the deny.
    pub limit: Option<GraphLimit>,
    /// The final layer had nothing on record for the object.
    pub no_entry: bool,
    pub revision: Option<u64>,
    pub evaluated_at: DateTime<Utc>,
    /// Earliest expiry among the tuples the decision was derived from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<DateTime<Utc>>,
}

impl AuthorizationDecision {
    pub fn new(allowed: bool, layer: DecisionLayer) -> Self {
        Self {
            allowed,
            layer,
            source: DecisionSource::Computed,
            limit: None,
            no_entry: false,
            revision: None,
            evaluated_at: Utc::now(),
            valid_until: None,
        }
    }

    pub fn limited(limit: GraphLimit) -> Self {
        Self {
            limit: Some(limit),
            ..Self::new(false, DecisionLayer::Rebac)
        }
    }

    pub fn with_source(mut self, source: DecisionSource) -> Self {
        self.source = source;
        self
    }

    pub fn at_revision(mut self, revision: Option<u64>) -> Self {
        self.revision = revision;
        self
    }

    pub fn valid_until(mut self, valid_until: Option<DateTime<Utc>>) -> Self {
        self.valid_until = valid_until;
        self
    }

    /// A tuple this decision relied on has expired since it was computed.
    pub fn is_outlived(&self, now: DateTime<Utc>) -> bool {
        self.valid_until.is_some_and(|until| until <= now)
    }
}

/// How far an object may be shared with the agents of its owner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SharingScope {
    Agent,
    User,
    Tenant,
    Global,
}

impl SharingScope {
    /// Agents inherit their owner's grants on everything except agent-private objects.
    pub fn allows_owner_inheritance(&self) -> bool {
        !matches!(self, SharingScope::Agent)
    }
}

/// Identity registry record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityRecord {
    pub entity: Entity,
    /// Owning entity, e.g. the user that runs an agent.
    pub owner: Option<Entity>,
    pub sharing_scope: Option<SharingScope>,
}

impl EntityRecord {
    pub fn new(entity: Entity) -> Self {
        Self {
            entity,
            owner: None,
            sharing_scope: None,
        }
    }

    pub fn owned_by(mut self, owner: Entity) -> Self {
        self.owner = Some(owner);
        self
    }

    pub fn scoped(mut self, scope: SharingScope) -> Self {
        self.sharing_scope = Some(scope);
        self
    }
}

/// UNIX ownership and permission bits for an object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMode {
    pub owner: String,
    pub group: String,
    pub mode: u32,
}

impl FileMode {
    pub fn new(owner: &str, group: &str, mode: u32) -> Self {
        Self {
            owner: owner.to_string(),
            group: group.to_string(),
            mode,
        }
    }
}

/// One page served from the iterator cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Page<T> {
    pub cursor_id: String,
    pub items: Vec<T>,
    /// Equal to `cursor_id` while more items remain.
    pub next_cursor: Option<String>,
    pub total: usize,
}

/// Health of the configured backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthStatus {
    pub backend: String,
    pub initialized: bool,
    pub healthy: bool,
    pub circuit_state: String,
}
