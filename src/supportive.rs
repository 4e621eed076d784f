//! Supportive partitions of producer transactions
//!
//! A writer that has not yet proposed its transaction may ask a tablet to
//! reserve an invisible "supportive" partition next to a regular one and
//! buffer its writes there. The reservation is a [`TxWriteInfo`] record in
//! the tablet transaction index, keyed by (write id, partition).
//!
//! Records are removed in two ways:
//!
//! - together with the transaction that bound them, once it is deleted
//! - by the reaper, for producer-transaction write ids only, once the record
//!   is older than the producer transaction timeout plus a grace delay and
//!   no live transaction holds it
//!
//! Age is measured from creation. Later writes do not extend it.

use crate::config::ProducerTxnConfig;
use crate::types::{PartitionId, TxId, WriteId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;
use uuid::Uuid;

/// One transaction-write record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxWriteInfo {
    pub write_id: WriteId,
    /// Regular partition the writes are headed for
    pub partition_id: PartitionId,
    pub supportive_partition: PartitionId,
    pub created_at_ms: i64,
    /// Subject to timeout-based expiry
    pub producer_txn: bool,
    /// Transaction that consumed the record, once proposed
    #[serde(default)]
    pub tx_id: Option<TxId>,
}

impl TxWriteInfo {
    pub fn age_ms(&self, now_ms: i64) -> i64 {
        now_ms.saturating_sub(self.created_at_ms)
    }
}

/// Ownership record of a supportive partition, stored under `sp_{id}`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SupportiveOwnership {
    pub supportive_partition: PartitionId,
    pub parent_partition: PartitionId,
    pub write_id: WriteId,
    pub owner: String,
    pub owner_cookie: String,
    pub created_at_ms: i64,
}

/// Request to own a partition for writing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipRequest {
    pub partition_id: PartitionId,
    pub owner: String,
    pub write_id: Option<WriteId>,
    /// Reserve a supportive partition if none exists for the write id
    pub need_supportive: bool,
    pub cookie: u64,
}

impl OwnershipRequest {
    pub fn new(partition_id: PartitionId, owner: impl Into<String>) -> Self {
        Self {
            partition_id,
            owner: owner.into(),
            write_id: None,
            need_supportive: false,
            cookie: 0,
        }
    }

    /// Ask for a supportive partition bound to `write_id`
    pub fn supportive(mut self, write_id: WriteId) -> Self {
        self.write_id = Some(write_id);
        self.need_supportive = true;
        self
    }

    /// Look up an existing reservation for `write_id` only
    pub fn existing(mut self, write_id: WriteId) -> Self {
        self.write_id = Some(write_id);
        self.need_supportive = false;
        self
    }

    pub fn with_cookie(mut self, cookie: u64) -> Self {
        self.cookie = cookie;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OwnershipStatus {
    Ok,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OwnershipResponse {
    pub cookie: u64,
    pub status: OwnershipStatus,
    pub owner_cookie: Option<String>,
    pub supportive_partition: Option<PartitionId>,
    pub reason: Option<String>,
}

impl OwnershipResponse {
    pub fn ok(cookie: u64, owner_cookie: String, supportive_partition: Option<PartitionId>) -> Self {
        Self {
            cookie,
            status: OwnershipStatus::Ok,
            owner_cookie: Some(owner_cookie),
            supportive_partition,
            reason: None,
        }
    }

    pub fn error(cookie: u64, reason: impl Into<String>) -> Self {
        Self {
            cookie,
            status: OwnershipStatus::Error,
            owner_cookie: None,
            supportive_partition: None,
            reason: Some(reason.into()),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == OwnershipStatus::Ok
    }
}

/// In-memory view of every reservation of a tablet
#[derive(Debug, Clone)]
pub struct SupportivePartitions {
    writes: BTreeMap<(WriteId, PartitionId), TxWriteInfo>,
    owners: BTreeMap<PartitionId, SupportiveOwnership>,
    next_id: PartitionId,
    expiry: ProducerTxnConfig,
}

impl SupportivePartitions {
    pub fn new(next_id: PartitionId, expiry: ProducerTxnConfig) -> Self {
        Self {
            writes: BTreeMap::new(),
            owners: BTreeMap::new(),
            next_id,
            expiry,
        }
    }

    /// Rebuild from the index and the `sp_` records
    pub fn restore(
        writes: Vec<TxWriteInfo>,
        owners: Vec<SupportiveOwnership>,
        next_id: PartitionId,
        expiry: ProducerTxnConfig,
    ) -> Self {
        Self {
            writes: writes
                .into_iter()
                .map(|w| ((w.write_id, w.partition_id), w))
                .collect(),
            owners: owners
                .into_iter()
                .map(|o| (o.supportive_partition, o))
                .collect(),
            next_id,
            expiry,
        }
    }

    pub fn next_id(&self) -> PartitionId {
        self.next_id
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn get(&self, write_id: WriteId, partition_id: PartitionId) -> Option<&TxWriteInfo> {
        self.writes.get(&(write_id, partition_id))
    }

    pub fn owner(&self, supportive_partition: PartitionId) -> Option<&SupportiveOwnership> {
        self.owners.get(&supportive_partition)
    }

    /// Records for the index, in key order
    pub fn write_records(&self) -> Vec<TxWriteInfo> {
        self.writes.values().cloned().collect()
    }

    /// Reserve a new supportive partition next to `partition_id`
    pub fn allocate(
        &mut self,
        write_id: WriteId,
        partition_id: PartitionId,
        owner: &str,
        now_ms: i64,
    ) -> (TxWriteInfo, SupportiveOwnership) {
        let supportive_partition = self.next_id;
        self.next_id += 1;

        let info = TxWriteInfo {
            write_id,
            partition_id,
            supportive_partition,
            created_at_ms: now_ms,
            producer_txn: write_id.is_producer_txn(),
            tx_id: None,
        };
        let ownership = SupportiveOwnership {
            supportive_partition,
            parent_partition: partition_id,
            write_id,
            owner: owner.to_string(),
            owner_cookie: Uuid::new_v4().to_string(),
            created_at_ms: now_ms,
        };

        self.writes.insert((write_id, partition_id), info.clone());
        self.owners.insert(supportive_partition, ownership.clone());
        debug!(%write_id, partition_id, supportive_partition, "Supportive partition reserved");
        (info, ownership)
    }

    /// Bind the record of (`write_id`, `partition_id`) to a transaction
    pub fn bind(&mut self, write_id: WriteId, partition_id: PartitionId, tx_id: TxId) -> bool {
        match self.writes.get_mut(&(write_id, partition_id)) {
            Some(info) if info.tx_id.is_none() => {
                info.tx_id = Some(tx_id);
                true
            }
            _ => false,
        }
    }

    /// Release every record bound to `tx_id`; returns whether any was bound
    pub fn unbind(&mut self, tx_id: TxId) -> bool {
        let mut changed = false;
        for info in self.writes.values_mut() {
            if info.tx_id == Some(tx_id) {
                info.tx_id = None;
                changed = true;
            }
        }
        changed
    }

    /// Remove every record bound to `tx_id`
    pub fn remove_bound(&mut self, tx_id: TxId) -> Vec<TxWriteInfo> {
        let keys: Vec<(WriteId, PartitionId)> = self
            .writes
            .iter()
            .filter(|(_, info)| info.tx_id == Some(tx_id))
            .map(|(key, _)| *key)
            .collect();
        keys.into_iter().filter_map(|key| self.remove(key)).collect()
    }

    fn remove(&mut self, key: (WriteId, PartitionId)) -> Option<TxWriteInfo> {
        let info = self.writes.remove(&key)?;
        self.owners.remove(&info.supportive_partition);
        Some(info)
    }

    /// Remove every expired producer-transaction record
    ///
    /// `is_live` tells whether a transaction is still known to the tablet;
    /// records held by a live transaction are kept regardless of age.
    pub fn reap<F>(&mut self, now_ms: i64, is_live: F) -> Vec<TxWriteInfo>
    where
        F: Fn(TxId) -> bool,
    {
        let expiry_ms = self.expiry.expiry_ms();
        let expired: Vec<(WriteId, PartitionId)> = self
            .writes
            .iter()
            .filter(|(_, info)| info.producer_txn)
            .filter(|(_, info)| !info.tx_id.is_some_and(&is_live))
            .filter(|(_, info)| info.age_ms(now_ms) > expiry_ms)
            .map(|(key, _)| *key)
            .collect();
        expired.into_iter().filter_map(|key| self.remove(key)).collect()
    }
}
