//! §4.2 Ledger: an append-only store of signature entries with monotonic
//! ids, concurrent readers, single-writer semantics, and cached reads.

mod cache;

use crate::error::{EngineError, EngineResult};
use crate::types::{NodeId, Signature, UnassignedSignature};
use cache::{QueryCache, ReadSinceKey};
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, instrument, warn};

const SCHEMA_VERSION: u64 = 1;
const TREE_SIGNATURES: &str = "signatures";
const TREE_META: &str = "meta";
const META_SCHEMA_VERSION_KEY: &[u8] = b"schema_version";

fn id_key(id: u64) -> [u8; 8] {
    id.to_be_bytes()
}

/// Aggregate counters read by the (external) dashboard.
#[derive(Debug, Clone, Copy, Default)]
pub struct LedgerStats {
    pub size: u64,
    pub cache_hits: u64,
    pub cache_misses: u64,
}

/// Single-writer, multi-reader transactional store backing the ledger.
/// Built on `sled`, whose single-writer/lock-free-reader model already
/// matches the concurrency discipline this component requires.
pub struct Ledger {
    db: sled::Db,
    signatures: sled::Tree,
    writer_lock: Mutex<()>,
    next_id: AtomicU64,
    read_pool: Semaphore,
    acquire_timeout: Duration,
    retry_attempts: u32,
    cache: QueryCache,
    closed: AtomicBool,
    cache_hits: AtomicU64,
    cache_misses: AtomicU64,
    /// Bumped on every successful append. `read_since` captures this
    /// before its range scan and only caches the result if it is still
    /// unchanged afterward, so a write racing the scan can never get
    /// masked by a stale cache entry.
    write_generation: AtomicU64,
}

impl Ledger {
    /// Open (creating if absent) the backing store at `path`. Verifies
    /// schema version and id monotonicity; mismatches raise `ErrCorrupt`.
    #[instrument(skip(path))]
    pub fn open(
        path: impl AsRef<Path>,
        pool_size: usize,
        acquire_timeout: Duration,
        retry_attempts: u32,
        cache_capacity: usize,
    ) -> EngineResult<Self> {
        let db: sled::Db = sled::open(path)?;
        let signatures = db.open_tree(TREE_SIGNATURES)?;
        let meta = db.open_tree(TREE_META)?;

        match meta.get(META_SCHEMA_VERSION_KEY)? {
            Some(bytes) => {
                let stored = u64::from_be_bytes(
                    bytes
                        .as_ref()
                        .try_into()
                        .map_err(|_| EngineError::Corrupt("malformed schema version".into()))?,
                );
                if stored != SCHEMA_VERSION {
                    return Err(EngineError::Corrupt(format!(
                        "schema version mismatch: on-disk {stored}, expected {SCHEMA_VERSION}"
                    )));
                }
            }
            None => {
                meta.insert(META_SCHEMA_VERSION_KEY, &SCHEMA_VERSION.to_be_bytes())?;
            }
        }

        let mut max_id = 0u64;
        let mut prev: Option<u64> = None;
        for entry in signatures.iter() {
            let (key, _) = entry?;
            let id = u64::from_be_bytes(
                key.as_ref()
                    .try_into()
                    .map_err(|_| EngineError::Corrupt("malformed ledger key".into()))?,
            );
            if let Some(p) = prev {
                if id <= p {
                    return Err(EngineError::Corrupt(
                        "ledger ids are not strictly increasing".into(),
                    ));
                }
            }
            prev = Some(id);
            max_id = id;
        }

        Ok(Self {
            db,
            signatures,
            writer_lock: Mutex::new(()),
            next_id: AtomicU64::new(max_id + 1),
            read_pool: Semaphore::new(pool_size.max(1)),
            acquire_timeout,
            retry_attempts,
            cache: QueryCache::new(cache_capacity.max(1)),
            closed: AtomicBool::new(false),
            cache_hits: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            write_generation: AtomicU64::new(0),
        })
    }

    fn ensure_open(&self) -> EngineResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(EngineError::Closed);
        }
        Ok(())
    }

    async fn with_retries<T>(
        &self,
        mut op: impl FnMut() -> EngineResult<T>,
    ) -> EngineResult<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(v) => return Ok(v),
                Err(e) if e.is_recoverable() && attempt < self.retry_attempts => {
                    attempt += 1;
                    let backoff = Duration::from_millis(10 * 2u64.pow(attempt));
                    warn!(attempt, backoff_ms = backoff.as_millis() as u64, "retrying ledger backend op");
                    tokio::time::sleep(backoff).await;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Assigns the next id, persists, updates the read cache, returns the
    /// id. Consecutive calls observe strictly increasing ids because id
    /// assignment happens inside the writer lock.
    #[instrument(skip(self, sig))]
    pub async fn append(&self, sig: UnassignedSignature) -> EngineResult<u64> {
        self.ensure_open()?;
        let _guard = self.writer_lock.lock().await;

        let id = self.next_id.fetch_add(1, Ordering::AcqRel);
        let signature = Signature {
            id,
            timestamp_nanos: sig.timestamp_nanos,
            node_id: sig.node_id,
            features: sig.features,
            confidence: sig.confidence,
        };

        let encoded = bincode::serialize(&signature)?;
        let tree = self.signatures.clone();
        let key = id_key(id);

        self.with_retries(|| {
            tree.insert(key, encoded.clone())
                .map(|_| ())
                .map_err(EngineError::from)
        })
        .await?;

        // Write-driven invalidation: clear every ReadSince snapshot and
        // the max-id entry, since both predicates intersect the new id.
        // Bumping the generation first closes the race where a reader's
        // scan straddles this append: it will see a changed generation
        // and skip re-populating the cache with what it just read.
        self.write_generation.fetch_add(1, Ordering::Release);
        self.cache.invalidate_all();

        debug!(id, "signature appended");
        Ok(id)
    }

    /// Returns all entries strictly above `cursor`, optionally excluding
    /// one originator, ordered by id ascending.
    #[instrument(skip(self))]
    pub async fn read_since(
        &self,
        cursor: u64,
        exclude_node: Option<NodeId>,
    ) -> EngineResult<Vec<Signature>> {
        self.ensure_open()?;

        let key = ReadSinceKey {
            cursor,
            exclude_node,
        };
        if let Some(cached) = self.cache.get(&key) {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            return Ok((*cached).clone());
        }
        self.cache_misses.fetch_add(1, Ordering::Relaxed);

        let _permit = tokio::time::timeout(self.acquire_timeout, self.read_pool.acquire())
            .await
            .map_err(|_| EngineError::Busy)?
            .map_err(|_| EngineError::Closed)?;

        let generation_before = self.write_generation.load(Ordering::Acquire);

        let tree = self.signatures.clone();
        let start = id_key(cursor + 1);
        let results = self
            .with_retries(move || {
                let mut out = Vec::new();
                for item in tree.range(start..) {
                    let (_, value) = item.map_err(EngineError::from)?;
                    let sig: Signature = bincode::deserialize(&value)?;
                    if exclude_node.map(|n| n == sig.node_id).unwrap_or(false) {
                        continue;
                    }
                    out.push(sig);
                }
                Ok(out)
            })
            .await?;

        // Only cache the result if no append landed while we were scanning;
        // otherwise this snapshot may already be missing a committed id, and
        // caching it would mask that id from every subsequent cache hit.
        if self.write_generation.load(Ordering::Acquire) == generation_before {
            self.cache.put(key, results.clone());
        }
        Ok(results)
    }

    /// Point lookup; `None` for `id` above the current max.
    #[instrument(skip(self))]
    pub async fn get_by_id(&self, id: u64) -> EngineResult<Option<Signature>> {
        self.ensure_open()?;

        let _permit = tokio::time::timeout(self.acquire_timeout, self.read_pool.acquire())
            .await
            .map_err(|_| EngineError::Busy)?
            .map_err(|_| EngineError::Closed)?;

        let tree = self.signatures.clone();
        let key = id_key(id);
        self.with_retries(move || match tree.get(key).map_err(EngineError::from)? {
            Some(bytes) => Ok(Some(bincode::deserialize(&bytes)?)),
            None => Ok(None),
        })
        .await
    }

    pub fn size(&self) -> u64 {
        self.next_id.load(Ordering::Acquire).saturating_sub(1)
    }

    pub fn stats(&self) -> LedgerStats {
        LedgerStats {
            size: self.size(),
            cache_hits: self.cache_hits.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
        }
    }

    pub async fn close(&self) -> EngineResult<()> {
        self.closed.store(true, Ordering::Release);
        self.db.flush_async().await.map_err(EngineError::from)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::AnomalyFeatures;
    use std::collections::BTreeSet;

    fn sig(node: u64) -> UnassignedSignature {
        UnassignedSignature {
            timestamp_nanos: 0,
            node_id: NodeId(node),
            features: AnomalyFeatures {
                source_ids: BTreeSet::new(),
                feature_vector: vec![1.0, 2.0],
                confidence: 0.9,
            },
            confidence: 0.9,
        }
    }

    async fn open_ledger() -> (Ledger, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let ledger = Ledger::open(dir.path(), 4, Duration::from_millis(200), 2, 64).unwrap();
        (ledger, dir)
    }

    #[tokio::test]
    async fn append_assigns_strictly_increasing_ids() {
        let (ledger, _dir) = open_ledger().await;
        let id1 = ledger.append(sig(1)).await.unwrap();
        let id2 = ledger.append(sig(2)).await.unwrap();
        let id3 = ledger.append(sig(3)).await.unwrap();
        assert!(id1 < id2 && id2 < id3);
        assert_eq!(ledger.size(), 3);
    }

    #[tokio::test]
    async fn append_then_get_by_id_round_trips() {
        let (ledger, _dir) = open_ledger().await;
        let id = ledger.append(sig(7)).await.unwrap();
        let fetched = ledger.get_by_id(id).await.unwrap().unwrap();
        assert_eq!(fetched.node_id, NodeId(7));
        assert_eq!(fetched.id, id);
    }

    #[tokio::test]
    async fn get_by_id_above_max_is_none() {
        let (ledger, _dir) = open_ledger().await;
        ledger.append(sig(1)).await.unwrap();
        assert!(ledger.get_by_id(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn read_since_excludes_originator_and_is_ordered() {
        let (ledger, _dir) = open_ledger().await;
        ledger.append(sig(1)).await.unwrap();
        ledger.append(sig(2)).await.unwrap();
        ledger.append(sig(1)).await.unwrap();

        let entries = ledger.read_since(0, Some(NodeId(1))).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].node_id, NodeId(2));

        let ids: Vec<u64> = ledger.read_since(0, None).await.unwrap().iter().map(|s| s.id).collect();
        let mut sorted = ids.clone();
        sorted.sort();
        assert_eq!(ids, sorted);
    }

    #[tokio::test]
    async fn append_invalidates_cache_for_subsequent_reads() {
        let (ledger, _dir) = open_ledger().await;
        ledger.append(sig(1)).await.unwrap();
        let first = ledger.read_since(0, None).await.unwrap();
        assert_eq!(first.len(), 1);

        ledger.append(sig(2)).await.unwrap();
        let second = ledger.read_since(0, None).await.unwrap();
        assert_eq!(second.len(), 2);
    }

    #[tokio::test]
    async fn reopen_preserves_monotonic_ids() {
        let dir = tempfile::tempdir().unwrap();
        {
            let ledger =
                Ledger::open(dir.path(), 4, Duration::from_millis(200), 2, 64).unwrap();
            ledger.append(sig(1)).await.unwrap();
            ledger.append(sig(2)).await.unwrap();
            ledger.close().await.unwrap();
        }
        let reopened =
            Ledger::open(dir.path(), 4, Duration::from_millis(200), 2, 64).unwrap();
        assert_eq!(reopened.size(), 2);
        let id = reopened.append(sig(3)).await.unwrap();
        assert_eq!(id, 3);
    }

    #[tokio::test]
    async fn concurrent_append_and_read_do_not_leave_a_stale_cache() {
        let (ledger, _dir) = open_ledger().await;
        ledger.append(sig(1)).await.unwrap();
        let ledger = Arc::new(ledger);

        let reader = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.read_since(0, None).await.unwrap() })
        };
        let writer = {
            let ledger = ledger.clone();
            tokio::spawn(async move { ledger.append(sig(2)).await.unwrap() })
        };
        let _ = tokio::join!(reader, writer);

        // Whichever order the two tasks interleaved in, a subsequent
        // read_since must see both entries. If the reader's in-flight scan
        // had been cached after the writer's invalidation, this would
        // still return only the first entry.
        let final_read = ledger.read_since(0, None).await.unwrap();
        assert_eq!(final_read.len(), 2);
    }

    #[tokio::test]
    async fn closed_ledger_rejects_operations() {
        let (ledger, _dir) = open_ledger().await;
        ledger.close().await.unwrap();
        assert!(matches!(ledger.append(sig(1)).await, Err(EngineError::Closed)));
        assert!(matches!(ledger.get_by_id(1).await, Err(EngineError::Closed)));
    }
}
