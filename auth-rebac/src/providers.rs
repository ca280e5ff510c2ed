//! Collaborators consulted by the permission check but owned elsewhere:
//! the identity registry, legacy ACLs and UNIX mode bits.
//!
//! Each trait ships with a small `DashMap`-backed implementation for
//! embedding and tests.

use crate::{
    error::Result,
    models::{CheckRequest, Entity, EntityRecord, FileMode},
};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Identity registry lookups used for ownership inheritance.
#[async_trait]
pub trait EntityRegistry: Send + Sync {
    async fn lookup_entity_by_id(&self, entity: &Entity) -> Result<Option<EntityRecord>>;

    /// Entities whose owner is `owner`, e.g. the agents a user runs.
    async fn children_of(&self, owner: &Entity) -> Result<Vec<Entity>>;
}

/// Legacy access-control list lookup.
///
/// `Ok(None)` means no entry for the path and the check falls through.
#[async_trait]
pub trait AclProvider: Send + Sync {
    async fn check_acl(
        &self,
        path: &str,
        permission: &str,
        request: &CheckRequest,
    ) -> Result<Option<bool>>;
}

/// Source of UNIX ownership and permission bits.
#[async_trait]
pub trait ModeBitsSource: Send + Sync {
    async fn mode_bits(&self, path: &str) -> Result<Option<FileMode>>;
}

#[derive(Default)]
pub struct InMemoryEntityRegistry {
    records: DashMap<Entity, EntityRecord>,
}

impl InMemoryEntityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, record: EntityRecord) {
        self.records.insert(record.entity.clone(), record);
    }

    pub fn remove(&self, entity: &Entity) -> Option<EntityRecord> {
        self.records.remove(entity).map(|(_, record)| record)
    }
}

#[async_trait]
impl EntityRegistry for InMemoryEntityRegistry {
    async fn lookup_entity_by_id(&self, entity: &Entity) -> Result<Option<EntityRecord>> {
        Ok(self.records.get(entity).map(|r| r.value().clone()))
    }

    async fn children_of(&self, owner: &Entity) -> Result<Vec<Entity>> {
        let mut children: Vec<Entity> = self
            .records
            .iter()
            .filter(|r| r.owner.as_ref() == Some(owner))
            .map(|r| r.entity.clone())
            .collect();
        children.sort();
        Ok(children)
    }
}

/// One ACL line: who, which permissions, allow or deny.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AclEntry {
    pub principal: AclPrincipal,
    pub permissions: Vec<String>,
    pub allow: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AclPrincipal {
    /// Matches the requesting subject exactly.
    Subject(Entity),
    /// Matches any caller carrying this POSIX group.
    Group(String),
    Everyone,
}

impl AclEntry {
    pub fn allow(principal: AclPrincipal, permissions: &[&str]) -> Self {
        Self {
            principal,
            permissions: permissions.iter().map(|p| (*p).to_string()).collect(),
            allow: true,
        }
    }

    pub fn deny(principal: AclPrincipal, permissions: &[&str]) -> Self {
        Self {
            allow: false,
            ..Self::allow(principal, permissions)
        }
    }

    fn applies_to(&self, permission: &str, request: &CheckRequest) -> bool {
        let principal = match &self.principal {
            AclPrincipal::Subject(entity) => *entity == request.subject,
            AclPrincipal::Group(group) => request.context.groups.iter().any(|g| g == group),
            AclPrincipal::Everyone => true,
        };
        principal && self.permissions.iter().any(|p| p == permission || p == "*")
    }
}

/// Path-keyed ACLs. Explicit deny entries win over allows.
#[derive(Default)]
pub struct StaticAclStore {
    entries: DashMap<String, Vec<AclEntry>>,
}

impl StaticAclStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_entry(&self, path: &str, entry: AclEntry) {
        self.entries.entry(path.to_string()).or_default().push(entry);
    }

    pub fn clear_path(&self, path: &str) {
        self.entries.remove(path);
    }
}

#[async_trait]
impl AclProvider for StaticAclStore {
    async fn check_acl(
        &self,
        path: &str,
        permission: &str,
        request: &CheckRequest,
    ) -> Result<Option<bool>> {
        let Some(entries) = self.entries.get(path) else {
            return Ok(None);
        };
        if entries.is_empty() {
            return Ok(None);
        }

        let mut granted = false;
        for entry in entries.iter().filter(|e| e.applies_to(permission, request)) {
            if !entry.allow {
                return Ok(Some(false));
            }
            granted = true;
        }
        Ok(Some(granted))
    }
}

#[derive(Default)]
pub struct StaticModeBits {
    modes: DashMap<String, FileMode>,
}

impl StaticModeBits {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, path: &str, mode: FileMode) {
        self.modes.insert(path.to_string(), mode);
    }
}

#[async_trait]
impl ModeBitsSource for StaticModeBits {
    async fn mode_bits(&self, path: &str) -> Result<Option<FileMode>> {
        Ok(self.modes.get(path).map(|m| m.value().clone()))
    }
}

/// Permission bit (r=4, w=2, x=1) a permission maps to; `None` for anything
/// mode bits cannot express.
pub fn mode_bit_for(permission: &str) -> Option<u32> {
    match permission {
        "read" => Some(0o4),
        "write" | "delete" => Some(0o2),
        "execute" | "traverse" => Some(0o1),
        _ => None,
    }
}

impl FileMode {
    /// POSIX class selection: the owner class alone applies to the owner, the
    /// group class to group members, other bits to everyone else.
    pub fn permits(&self, owners: &[&str], groups: &[String], permission: &str) -> bool {
        let Some(bit) = mode_bit_for(permission) else {
            return false;
        };
        let shift = if owners.iter().any(|o| *o == self.owner) {
            6
        } else if groups.iter().any(|g| *g == self.group) {
            3
        } else {
            0
        };
        (self.mode >> shift) & bit != 0
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::models::{CallerContext, SharingScope, ZoneId};

    fn request(subject: Entity, permission: &str, path: &str) -> CheckRequest {
        CheckRequest::new(subject, permission, Entity::file(path), ZoneId::default())
    }

    #[tokio::test]
    async fn test_registry_children() {
        let registry = InMemoryEntityRegistry::new();
        registry.register(EntityRecord::new(Entity::agent("bot-1")).owned_by(Entity::user("alice")));
        registry.register(EntityRecord::new(Entity::agent("bot-2")).owned_by(Entity::user("bob")));
        registry.register(EntityRecord::new(Entity::file("/notes")).scoped(SharingScope::Agent));

        let children = registry.children_of(&Entity::user("alice")).await.unwrap();
        assert_eq!(children, vec![Entity::agent("bot-1")]);

        let record = registry
            .lookup_entity_by_id(&Entity::file("/notes"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(record.sharing_scope, Some(SharingScope::Agent));
    }

    #[tokio::test]
    async fn test_acl_without_entry_falls_through() {
        let acl = StaticAclStore::new();
        let req = request(Entity::user("alice"), "read", "/a");
        assert_eq!(acl.check_acl("/a", "read", &req).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_acl_deny_wins() {
        let acl = StaticAclStore::new();
        acl.add_entry("/a", AclEntry::allow(AclPrincipal::Everyone, &["read"]));
        acl.add_entry(
            "/a",
            AclEntry::deny(AclPrincipal::Subject(Entity::user("mallory")), &["*"]),
        );

        let alice = request(Entity::user("alice"), "read", "/a");
        let mallory = request(Entity::user("mallory"), "read", "/a");
        assert_eq!(acl.check_acl("/a", "read", &alice).await.unwrap(), Some(true));
        assert_eq!(acl.check_acl("/a", "read", &mallory).await.unwrap(), Some(false));
        // Entry exists but grants nothing for write: definitive deny.
        assert_eq!(acl.check_acl("/a", "write", &alice).await.unwrap(), Some(false));
    }

    #[tokio::test]
    async fn test_acl_group_principal() {
        let acl = StaticAclStore::new();
        acl.add_entry("/b", AclEntry::allow(AclPrincipal::Group("staff".to_string()), &["write"]));
        let req = request(Entity::user("carol"), "write", "/b")
            .with_context(CallerContext::with_groups(&["staff"]));
        assert_eq!(acl.check_acl("/b", "write", &req).await.unwrap(), Some(true));
    }

    #[test]
    fn test_mode_bits_class_selection() {
        let mode = FileMode::new("alice", "staff", 0o640);
        let staff = vec!["staff".to_string()];

        assert!(mode.permits(&["alice"], &[], "write"));
        assert!(mode.permits(&["bob"], &staff, "read"));
        assert!(!mode.permits(&["bob"], &staff, "write"));
        assert!(!mode.permits(&["eve"], &[], "read"));
        assert!(!mode.permits(&["alice"], &[], "share"));
    }
}
