//! In-memory transaction store

use super::{BatchOp, StoreStats, TxStore, WriteBatch};
use crate::error::{Result, TabletError};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

/// In-memory store for testing and development
///
/// Hand the same `Arc<InMemoryTxStore>` to a new tablet to simulate a
/// restart. [`InMemoryTxStore::set_fail_writes`] makes every following
/// batch fail, which is how tests kill a tablet mid-transition.
#[derive(Debug, Default)]
pub struct InMemoryTxStore {
    data: RwLock<BTreeMap<String, Bytes>>,
    fail_writes: AtomicBool,
    stats: InMemoryTxStoreStats,
}

#[derive(Debug, Default)]
struct InMemoryTxStoreStats {
    reads: AtomicU64,
    batches: AtomicU64,
    puts: AtomicU64,
    deletes: AtomicU64,
}

impl InMemoryTxStore {
    /// Create a new in-memory store
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every following write fail (or succeed again)
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.data.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.read().is_empty()
    }

    /// Whether `key` is present
    pub fn contains(&self, key: &str) -> bool {
        self.data.read().contains_key(key)
    }

    /// All stored keys, in order
    pub fn keys(&self) -> Vec<String> {
        self.data.read().keys().cloned().collect()
    }
}

#[async_trait]
impl TxStore for InMemoryTxStore {
    async fn read(&self, key: &str) -> Result<Option<Bytes>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        Ok(self.data.read().get(key).cloned())
    }

    async fn read_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>> {
        self.stats.reads.fetch_add(1, Ordering::Relaxed);
        let data = self.data.read();
        Ok(data
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, value)| (key.clone(), value.clone()))
            .collect())
    }

    async fn write(&self, batch: WriteBatch) -> Result<()> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(TabletError::storage_msg("write rejected: store is failing"));
        }

        let mut data = self.data.write();
        self.stats.batches.fetch_add(1, Ordering::Relaxed);
        for op in batch.into_ops() {
            match op {
                BatchOp::Put { key, value } => {
                    self.stats.puts.fetch_add(1, Ordering::Relaxed);
                    data.insert(key, value);
                }
                BatchOp::Delete { key } => {
                    self.stats.deletes.fetch_add(1, Ordering::Relaxed);
                    data.remove(&key);
                }
            }
        }
        Ok(())
    }

    fn stats(&self) -> StoreStats {
        StoreStats {
            reads: self.stats.reads.load(Ordering::Relaxed),
            batches: self.stats.batches.load(Ordering::Relaxed),
            puts: self.stats.puts.load(Ordering::Relaxed),
            deletes: self.stats.deletes.load(Ordering::Relaxed),
        }
    }
}
