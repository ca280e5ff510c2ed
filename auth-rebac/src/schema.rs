use crate::{error::RebacError, models::NewTuple};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// Permission schema definition
///
/// Maps externally requested permissions ("read", "write", ...) to the
/// stored relations that satisfy them. The table is data: it is loaded from
/// configuration at startup and consulted by traversal, never hard-coded at
/// call sites.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Schema {
    /// Global permission table, applied to every object type.
    #[serde(default)]
    pub permissions: HashMap<String, Vec<String>>,

    /// Per object type overrides (e.g. "folder" may add "traverse").
    #[serde(default)]
    pub namespaces: HashMap<String, NamespaceDefinition>,

    /// Relations whose tuples mean "subject is a member of object".
    #[serde(default = "default_membership_relations")]
    pub membership_relations: Vec<String>,

    /// Relations whose tuples mean "subject lives under object" (folder nesting).
    #[serde(default = "default_hierarchy_relations")]
    pub hierarchy_relations: Vec<String>,

    /// Additional relations writers may use that no permission references.
    #[serde(default)]
    pub extra_relations: Vec<String>,
}

impl Default for Schema {
    fn default() -> Self {
        Self::filesystem_schema()
    }
}

fn default_membership_relations() -> Vec<String> {
    vec!["member-of".to_string(), "member".to_string()]
}

fn default_hierarchy_relations() -> Vec<String> {
    vec!["parent".to_string()]
}

fn relations(names: &[&str]) -> Vec<String> {
    names.iter().map(|n| (*n).to_string()).collect()
}

impl Schema {
    pub fn new() -> Self {
        Self {
            permissions: HashMap::new(),
            namespaces: HashMap::new(),
            membership_relations: default_membership_relations(),
            hierarchy_relations: default_hierarchy_relations(),
            extra_relations: Vec::new(),
        }
    }

    /// Default vocabulary for the agent file system.
    pub fn filesystem_schema() -> Self {
        let mut permissions = HashMap::new();
        permissions.insert(
            "read".to_string(),
            relations(&["direct_viewer", "direct_editor", "direct_owner"]),
        );
        permissions.insert("write".to_string(), relations(&["direct_editor", "direct_owner"]));
        permissions.insert("execute".to_string(), relations(&["direct_owner"]));
        permissions.insert("delete".to_string(), relations(&["direct_owner"]));
        permissions.insert("share".to_string(), relations(&["direct_owner"]));

        let mut namespaces = HashMap::new();
        namespaces.insert(
            "folder".to_string(),
            NamespaceDefinition {
                name: "folder".to_string(),
                permissions: HashMap::from([(
                    "traverse".to_string(),
                    relations(&["direct_viewer", "direct_editor", "direct_owner"]),
                )]),
            },
        );

        Self {
            permissions,
            namespaces,
            ..Self::new()
        }
    }

    /// Relations that satisfy `permission` on an object of `object_type`.
    ///
    /// The permission name itself is always included so callers may check a
    /// raw relation such as "direct_owner".
    pub fn relations_for(&self, object_type: &str, permission: &str) -> Vec<String> {
        let mut resolved: BTreeSet<String> = BTreeSet::new();
        resolved.insert(permission.to_string());

        if let Some(global) = self.permissions.get(permission) {
            resolved.extend(global.iter().cloned());
        }
        if let Some(local) = self
            .namespaces
            .get(object_type)
            .and_then(|ns| ns.permissions.get(permission))
        {
            resolved.extend(local.iter().cloned());
        }

        resolved.into_iter().collect()
    }

    pub fn is_membership(&self, relation: &str) -> bool {
        self.membership_relations.iter().any(|r| r == relation)
    }

    pub fn is_hierarchy(&self, relation: &str) -> bool {
        self.hierarchy_relations.iter().any(|r| r == relation)
    }

    /// The closed relation vocabulary writers may use.
    pub fn known_relations(&self) -> BTreeSet<&str> {
        let mut known: BTreeSet<&str> = BTreeSet::new();
        for rels in self.permissions.values() {
            known.extend(rels.iter().map(String::as_str));
        }
        for ns in self.namespaces.values() {
            for rels in ns.permissions.values() {
                known.extend(rels.iter().map(String::as_str));
            }
        }
        known.extend(self.membership_relations.iter().map(String::as_str));
        known.extend(self.hierarchy_relations.iter().map(String::as_str));
        known.extend(self.extra_relations.iter().map(String::as_str));
        known
    }

    /// Validate that a tuple conforms to the schema
    pub fn validate_tuple(&self, tuple: &NewTuple) -> Result<(), RebacError> {
        tuple.validate()?;
        if !self.known_relations().contains(tuple.relation.as_str()) {
            return Err(RebacError::Validation(format!(
                "Unknown relation '{}' for object type '{}'",
                tuple.relation, tuple.object.entity_type
            )));
        }
        Ok(())
    }

    /// Validate the entire schema is well-formed
    pub fn validate(&self) -> Result<(), RebacError> {
        for (name, namespace) in &self.namespaces {
            if name != &namespace.name {
                return Err(RebacError::InvalidSchema(format!(
                    "Namespace key '{}' doesn't match name '{}'",
                    name, namespace.name
                )));
            }
            for (permission, rels) in &namespace.permissions {
                check_relations(permission, rels)?;
            }
        }

        for (permission, rels) in &self.permissions {
            check_relations(permission, rels)?;
        }

        if self.membership_relations.iter().any(|m| self.is_hierarchy(m)) {
            return Err(RebacError::InvalidSchema(
                "A relation cannot be both a membership and a hierarchy relation".to_string(),
            ));
        }
        Ok(())
    }
}

fn check_relations(permission: &str, rels: &[String]) -> Result<(), RebacError> {
    if permission.trim().is_empty() {
        return Err(RebacError::InvalidSchema("Permission name must not be empty".to_string()));
    }
    if rels.is_empty() {
        return Err(RebacError::InvalidSchema(format!(
            "Permission '{}' maps to no relations",
            permission
        )));
    }
    if rels.iter().any(|r| r.trim().is_empty()) {
        return Err(RebacError::InvalidSchema(format!(
            "Permission '{}' maps to an empty relation name",
            permission
        )));
    }
    Ok(())
}

/// Definition of a namespace (object type)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamespaceDefinition {
    pub name: String,
    #[serde(default)]
    pub permissions: HashMap<String, Vec<String>>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, ZoneId};

    #[test]
    fn test_filesystem_schema() {
        let schema = Schema::filesystem_schema();
        assert!(schema.validate().is_ok());
        assert!(schema.namespaces.contains_key("folder"));
    }

    #[test]
    fn test_read_resolves_to_all_direct_relations() {
        let schema = Schema::filesystem_schema();
        let rels = schema.relations_for("file", "read");
        for expected in ["direct_viewer", "direct_editor", "direct_owner", "read"] {
            assert!(rels.iter().any(|r| r == expected), "missing {}", expected);
        }
        assert!(!schema
            .relations_for("file", "write")
            .iter()
            .any(|r| r == "direct_viewer"));
    }

    #[test]
    fn test_namespace_override_only_applies_to_its_type() {
        let schema = Schema::filesystem_schema();
        assert!(schema
            .relations_for("folder", "traverse")
            .iter()
            .any(|r| r == "direct_viewer"));
        assert_eq!(schema.relations_for("file", "traverse"), vec!["traverse".to_string()]);
    }

    #[test]
    fn test_validate_tuple() {
        let schema = Schema::filesystem_schema();
        let tuple = NewTuple::new(
            Entity::user("alice"),
            "direct_owner",
            Entity::file("/doc.txt"),
            ZoneId::default(),
        );
        assert!(schema.validate_tuple(&tuple).is_ok());

        let invalid = NewTuple::new(
            Entity::user("alice"),
            "invalid_relation",
            Entity::file("/doc.txt"),
            ZoneId::default(),
        );
        assert!(matches!(
            schema.validate_tuple(&invalid),
            Err(RebacError::Validation(_))
        ));
    }

    #[test]
    fn test_schema_rejects_empty_mapping() {
        let mut schema = Schema::new();
        schema.permissions.insert("read".to_string(), Vec::new());
        assert!(matches!(schema.validate(), Err(RebacError::InvalidSchema(_))));
    }
}
