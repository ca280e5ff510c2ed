use crate::{error::Result, models::ZoneId, repository::TupleRepository};
use async_trait::async_trait;
use std::sync::Arc;

/// Read-only view of zone revisions.
///
/// The counter itself is owned by the tuple store's transactions; caches only
/// ever fetch it through this trait.
#[async_trait]
pub trait RevisionSource: Send + Sync {
    async fn current_revision(&self, zone: &ZoneId) -> Result<u64>;
}

/// Reads revisions straight from a tuple repository.
pub struct RepositoryRevisionSource {
    repository: Arc<dyn TupleRepository>,
}

impl RepositoryRevisionSource {
    pub fn new(repository: Arc<dyn TupleRepository>) -> Self {
        Self { repository }
    }
}

#[async_trait]
impl RevisionSource for RepositoryRevisionSource {
    async fn current_revision(&self, zone: &ZoneId) -> Result<u64> {
        self.repository.current_revision(zone).await
    }
}

/// Cache-invalidation quantum for a revision.
pub fn revision_bucket(revision: u64, window_size: u64) -> u64 {
    revision / window_size.max(1)
}
