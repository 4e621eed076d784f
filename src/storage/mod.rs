//! Durable key/value store for transaction state
//!
//! The tablet keeps three kinds of records:
//!
//! - `_txinfo`: the tablet transaction index (execution step, tx-write records)
//! - `_config`: the current topic configuration
//! - `tx_{id}`: one record per live transaction
//! - `sp_{partition}`: one ownership record per supportive partition
//!
//! Every state change is written as a single [`WriteBatch`] whose puts and
//! deletes are applied atomically. The tablet never has two batches in
//! flight at once.
//!
//! ## Backends
//!
//! - [`InMemoryTxStore`]: for tests; survives a tablet "restart" as long as
//!   the same `Arc` is handed to the new tablet.
//! - [`FileTxStore`]: append-only JSON-lines batch log with snapshots.

mod log;
mod memory;

pub use log::FileTxStore;
pub use memory::InMemoryTxStore;

use crate::error::{Result, TabletError};
use crate::types::{PartitionId, TxId};
use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;

/// Key of the tablet transaction index
pub const TX_INFO_KEY: &str = "_txinfo";

/// Key of the current topic configuration
pub const CONFIG_KEY: &str = "_config";

/// Prefix of per-transaction records
pub const TX_KEY_PREFIX: &str = "tx_";

/// Prefix of supportive partition ownership records
pub const SUPPORTIVE_KEY_PREFIX: &str = "sp_";

/// Key of the record for a transaction
///
/// Zero padded so that a prefix scan returns transactions in id order.
pub fn tx_key(tx_id: TxId) -> String {
    format!("{}{:020}", TX_KEY_PREFIX, tx_id)
}

/// Key of the ownership record for a supportive partition
pub fn supportive_key(partition_id: PartitionId) -> String {
    format!("{}{:010}", SUPPORTIVE_KEY_PREFIX, partition_id)
}

/// Parse a transaction id back out of a `tx_` key
pub fn parse_tx_key(key: &str) -> Option<TxId> {
    key.strip_prefix(TX_KEY_PREFIX)?.parse().ok()
}

/// One mutation inside a batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum BatchOp {
    Put { key: String, value: Bytes },
    Delete { key: String },
}

impl BatchOp {
    pub fn key(&self) -> &str {
        match self {
            BatchOp::Put { key, .. } | BatchOp::Delete { key } => key,
        }
    }
}

/// Puts and deletes applied atomically by [`TxStore::write`]
#[derive(Debug, Clone, Default)]
pub struct WriteBatch {
    ops: Vec<BatchOp>,
}

impl WriteBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&mut self, key: impl Into<String>, value: Bytes) {
        self.ops.push(BatchOp::Put {
            key: key.into(),
            value,
        });
    }

    /// Serialize `value` as JSON and put it under `key`
    pub fn put_json<T: Serialize>(&mut self, key: impl Into<String>, value: &T) -> Result<()> {
        let bytes = serde_json::to_vec(value)?;
        self.put(key, Bytes::from(bytes));
        Ok(())
    }

    pub fn delete(&mut self, key: impl Into<String>) {
        self.ops.push(BatchOp::Delete { key: key.into() });
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn ops(&self) -> &[BatchOp] {
        &self.ops
    }

    pub fn into_ops(self) -> Vec<BatchOp> {
        self.ops
    }
}

/// Counters reported by a store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StoreStats {
    /// Point and prefix reads
    pub reads: u64,
    /// Batches written
    pub batches: u64,
    /// Individual puts across all batches
    pub puts: u64,
    /// Individual deletes across all batches
    pub deletes: u64,
}

/// Durable key/value store used by the transaction manager
#[async_trait]
pub trait TxStore: Send + Sync + Debug {
    /// Read a single key
    async fn read(&self, key: &str) -> Result<Option<Bytes>>;

    /// Read every key starting with `prefix`, in key order
    async fn read_prefix(&self, prefix: &str) -> Result<Vec<(String, Bytes)>>;

    /// Apply a batch atomically
    ///
    /// Either every operation of the batch is durable when this returns
    /// `Ok`, or none is.
    async fn write(&self, batch: WriteBatch) -> Result<()>;

    /// Store statistics
    fn stats(&self) -> StoreStats;
}

/// Read and decode a JSON value
pub async fn read_json<T: DeserializeOwned>(store: &dyn TxStore, key: &str) -> Result<Option<T>> {
    match store.read(key).await? {
        Some(bytes) => decode_json(key, &bytes).map(Some),
        None => Ok(None),
    }
}

/// Decode a JSON value read from `key`
pub fn decode_json<T: DeserializeOwned>(key: &str, bytes: &[u8]) -> Result<T> {
    serde_json::from_slice(bytes).map_err(|e| TabletError::CorruptedRecord {
        key: key.to_string(),
        reason: e.to_string(),
    })
}
