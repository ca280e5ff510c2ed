//! Cursor cache for paginated list and expand results
//!
//! A result set is computed once per (query shape, zone), stored immutably
//! and served page by page through an opaque cursor id. Identical concurrent
//! queries share one computation. Expired or invalidated cursors report
//! `ExpiredCursor` so callers re-issue the query instead of seeing empty data.

use crate::{
    config::IteratorConfig,
    error::{RebacError, Result},
    models::{Page, ZoneId},
};
use chrono::{DateTime, Utc};
use moka::future::Cache;
use sha2::{Digest, Sha256};
use std::future::Future;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Immutable snapshot of one query's results.
#[derive(Debug)]
pub struct CachedResultSet<T> {
    pub cursor_id: String,
    pub query_key: String,
    pub zone: ZoneId,
    pub items: Vec<T>,
    pub created_at: DateTime<Utc>,
}

impl<T: Clone> CachedResultSet<T> {
    pub fn total(&self) -> usize {
        self.items.len()
    }

    fn page(&self, offset: usize, limit: usize) -> Page<T> {
        let start = offset.min(self.items.len());
        let end = start.saturating_add(limit).min(self.items.len());
        Page {
            cursor_id: self.cursor_id.clone(),
            items: self.items[start..end].to_vec(),
            next_cursor: (end < self.items.len()).then(|| self.cursor_id.clone()),
            total: self.items.len(),
        }
    }
}

/// Stable hash of a query shape; the zone is hashed in by `get_or_create`.
pub fn query_hash(parts: &[&str]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part.as_bytes());
        // Separator keeps ["ab", "c"] and ["a", "bc"] apart.
        hasher.update([0u8]);
    }
    format!("{:x}", hasher.finalize())
}

pub struct IteratorCache<T: Clone + Send + Sync + 'static> {
    by_query: Cache<String, Arc<CachedResultSet<T>>>,
    by_cursor: Cache<String, Arc<CachedResultSet<T>>>,
}

impl<T: Clone + Send + Sync + 'static> IteratorCache<T> {
    pub fn new(config: &IteratorConfig) -> Self {
        Self {
            by_query: Cache::builder()
                .max_capacity(config.max_cursors)
                .time_to_live(config.ttl())
                .build(),
            by_cursor: Cache::builder()
                .max_capacity(config.max_cursors)
                .time_to_live(config.ttl())
                .build(),
        }
    }

    /// Return the first page of the result set for `query_hash`, computing it
    /// at most once while it stays cached.
    pub async fn get_or_create<F, Fut>(
        &self,
        query_hash: &str,
        zone: &ZoneId,
        compute: F,
        page_size: usize,
    ) -> Result<Page<T>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        if page_size == 0 {
            return Err(RebacError::Validation("page size must be at least 1".to_string()));
        }
        let query_key = format!("{}:{}", zone, query_hash);

        let set = self
            .by_query
            .try_get_with(query_key.clone(), async {
                let items = compute().await?;
                debug!("Cached result set of {} items for query {}", items.len(), query_key);
                Ok::<_, RebacError>(Arc::new(CachedResultSet {
                    cursor_id: Uuid::new_v4().to_string(),
                    query_key: query_key.clone(),
                    zone: zone.clone(),
                    items,
                    created_at: Utc::now(),
                }))
            })
            .await
            .map_err(RebacError::from)?;

        let registered = Arc::clone(&set);
        self.by_cursor
            .get_with(set.cursor_id.clone(), async move { registered })
            .await;

        Ok(set.page(0, page_size))
    }

    pub async fn get_page(&self, cursor_id: &str, offset: usize, limit: usize) -> Result<Page<T>> {
        if limit == 0 {
            return Err(RebacError::Validation("page size must be at least 1".to_string()));
        }
        match self.by_cursor.get(cursor_id).await {
            Some(set) => Ok(set.page(offset, limit)),
            None => Err(RebacError::ExpiredCursor(cursor_id.to_string())),
        }
    }

    pub async fn invalidate_cursor(&self, cursor_id: &str) -> bool {
        match self.by_cursor.remove(cursor_id).await {
            Some(set) => {
                self.by_query.invalidate(&set.query_key).await;
                true
            }
            None => false,
        }
    }

    /// Drop every result set computed for `zone`.
    pub async fn invalidate_zone(&self, zone: &ZoneId) -> usize {
        let doomed: Vec<Arc<CachedResultSet<T>>> = self
            .by_query
            .iter()
            .filter(|(_, set)| &set.zone == zone)
            .map(|(_, set)| set)
            .collect();
        for set in &doomed {
            self.by_query.invalidate(&set.query_key).await;
            self.by_cursor.invalidate(&set.cursor_id).await;
        }
        // Cursors whose query entry was already evicted.
        let orphans: Vec<String> = self
            .by_cursor
            .iter()
            .filter(|(_, set)| &set.zone == zone)
            .map(|(cursor, _)| String::clone(&cursor))
            .collect();
        for cursor in &orphans {
            self.by_cursor.invalidate(cursor).await;
        }
        doomed.len() + orphans.len()
    }

    pub fn invalidate_all(&self) {
        self.by_query.invalidate_all();
        self.by_cursor.invalidate_all();
    }
}
