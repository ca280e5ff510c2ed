//! Relationship-based authorization core for a multi-tenant agent file system
//!
//! This crate answers "may subject S perform permission P on object O in
//! zone Z?" for every file-system operation. It provides:
//! - A relationship-tuple store with a per-zone revision counter (PostgreSQL or in-memory)
//! - Group membership and folder hierarchy closure with bounded traversal
//! - A layered check: admin bypass, relationship graph, ACL, UNIX mode bits
//! - A revision-quantized decision cache guarded by a circuit breaker
//! - A cursor cache for paged expand and object listings
//!
//! # Core Concepts
//!
//! - **Entity**: a typed node, e.g. `user:alice`, `agent:bot-7`, `group:eng`, `file:/doc.txt`
//! - **Tuple**: "subject has relation to object" inside a zone
//! - **Zone**: tenant boundary; revisions, caches and tuples never cross it
//! - **Revision bucket**: `revision / window_size`, the cache invalidation quantum
//!
//! # Example
//!
//! ```rust
//! use auth_rebac::{AuthorizationEngine, Entity, NewTuple, ZoneId};
//! use auth_rebac::repository::InMemoryTupleRepository;
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let engine = AuthorizationEngine::new(Arc::new(InMemoryTupleRepository::new()))?;
//! let zone = ZoneId::new("acme");
//!
//! engine
//!     .write(NewTuple::new(Entity::user("alice"), "member-of", Entity::group("eng"), zone.clone()))
//!     .await?;
//! engine
//!     .write(NewTuple::new(Entity::group("eng"), "direct_viewer", Entity::file("/doc.txt"), zone.clone()))
//!     .await?;
//!
//! assert!(engine.check(Entity::user("alice"), "read", Entity::file("/doc.txt"), zone).await?);
//! # Ok(())
//! # }
//! ```

pub mod cache;
pub mod check;
pub mod circuit;
pub mod closure;
pub mod config;
pub mod engine;
pub mod error;
pub mod expand;
pub mod iterator;
pub mod models;
pub mod providers;
pub mod repository;
pub mod revision;
pub mod schema;
pub mod trace;

pub use cache::{CacheStats, RevisionCache};
pub use check::{LayerOutcome, PermissionChecker};
pub use circuit::{CircuitBreaker, CircuitBreakerStats, CircuitState};
pub use config::RebacConfig;
pub use engine::{AuthorizationEngine, AuthorizationEngineBuilder};
pub use error::*;
pub use models::*;
pub use providers::*;
pub use revision::{RepositoryRevisionSource, RevisionSource};
pub use schema::*;
