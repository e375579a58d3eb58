//! Content-addressed LRU on read queries, write-driven invalidation.
//! Never used for writes.

use crate::types::{NodeId, Signature};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Cache key for a `ReadSince` query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ReadSinceKey {
    pub cursor: u64,
    pub exclude_node: Option<NodeId>,
}

pub struct QueryCache {
    inner: Mutex<LruCache<ReadSinceKey, Arc<Vec<Signature>>>>,
}

impl QueryCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(LruCache::new(
                NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::new(1).unwrap()),
            )),
        }
    }

    pub fn get(&self, key: &ReadSinceKey) -> Option<Arc<Vec<Signature>>> {
        self.inner.lock().get(key).cloned()
    }

    pub fn put(&self, key: ReadSinceKey, value: Vec<Signature>) {
        self.inner.lock().put(key, Arc::new(value));
    }

    /// Writes invalidate cache entries whose predicates intersect the new
    /// id: concretely every `ReadSince` entry and the max-id entry. Since
    /// any cached `ReadSince(cursor, _)` with `cursor` below the new id
    /// predicate intersects it, clearing the whole cache is the correct
    /// (and simplest) superset-safe invalidation.
    pub fn invalidate_all(&self) {
        self.inner.lock().clear();
    }
}
