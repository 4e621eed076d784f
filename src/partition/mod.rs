//! Partition coordinator interface
//!
//! The transaction manager never touches message data. It asks each local
//! partition involved in a transaction for a predicate (data transactions)
//! or whether a configuration can be applied (config transactions), and
//! later tells it to commit or roll back. Partitions answer asynchronously
//! through the tablet's event inbox.

mod local;

pub use local::LocalPartitions;

use crate::types::{PartitionId, Step, TabletId, TxId, WriteId};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// Consumer offset commit carried by an operation
///
/// Moves the committed offset of `consumer` from `begin` to `end`. The
/// range is half-open.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OffsetCommit {
    pub consumer: String,
    pub begin: u64,
    pub end: u64,
}

/// One operation of a data transaction
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOperation {
    pub partition_id: PartitionId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<OffsetCommit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// Supportive partition holding the transaction's buffered writes
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub supportive_partition: Option<PartitionId>,
}

impl TxOperation {
    /// Operation that only writes to `partition_id`
    pub fn write(partition_id: PartitionId) -> Self {
        Self {
            partition_id,
            commit: None,
            path: None,
            supportive_partition: None,
        }
    }

    /// Operation that commits `consumer` offsets `[begin, end)`
    pub fn commit_offsets(
        partition_id: PartitionId,
        consumer: impl Into<String>,
        begin: u64,
        end: u64,
    ) -> Self {
        Self {
            partition_id,
            commit: Some(OffsetCommit {
                consumer: consumer.into(),
                begin,
                end,
            }),
            path: None,
            supportive_partition: None,
        }
    }

    pub fn with_supportive_partition(mut self, supportive: PartitionId) -> Self {
        self.supportive_partition = Some(supportive);
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

/// Placement of one partition in the topic graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionPlacement {
    pub partition_id: PartitionId,
    pub tablet_id: TabletId,
    #[serde(default)]
    pub parents: Vec<PartitionId>,
    #[serde(default)]
    pub children: Vec<PartitionId>,
}

/// Topic configuration carried by config transactions
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TopicConfig {
    pub version: u64,
    pub path: String,
    #[serde(default)]
    pub consumers: Vec<String>,
    /// Every partition of the topic, including the ones of other tablets
    pub partitions: Vec<PartitionPlacement>,
}

impl TopicConfig {
    pub fn new(path: impl Into<String>, version: u64) -> Self {
        Self {
            version,
            path: path.into(),
            consumers: Vec::new(),
            partitions: Vec::new(),
        }
    }

    /// Topic whose partitions `0..count` all live on `tablet_id`
    pub fn single_tablet(path: impl Into<String>, tablet_id: TabletId, count: u32) -> Self {
        let mut config = Self::new(path, 1);
        for partition_id in 0..count {
            config = config.with_partition(partition_id, tablet_id);
        }
        config
    }

    pub fn with_partition(mut self, partition_id: PartitionId, tablet_id: TabletId) -> Self {
        self.partitions.push(PartitionPlacement {
            partition_id,
            tablet_id,
            parents: Vec::new(),
            children: Vec::new(),
        });
        self
    }

    /// Add a split/merge edge from `parent` to `child`
    pub fn with_edge(mut self, parent: PartitionId, child: PartitionId) -> Self {
        for placement in &mut self.partitions {
            if placement.partition_id == parent && !placement.children.contains(&child) {
                placement.children.push(child);
            }
            if placement.partition_id == child && !placement.parents.contains(&parent) {
                placement.parents.push(parent);
            }
        }
        self
    }

    pub fn with_consumer(mut self, consumer: impl Into<String>) -> Self {
        self.consumers.push(consumer.into());
        self
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = version;
        self
    }

    pub fn placement(&self, partition_id: PartitionId) -> Option<&PartitionPlacement> {
        self.partitions
            .iter()
            .find(|p| p.partition_id == partition_id)
    }

    /// Tablet owning `partition_id`
    pub fn owner(&self, partition_id: PartitionId) -> Option<TabletId> {
        self.placement(partition_id).map(|p| p.tablet_id)
    }

    /// Partitions owned by `tablet_id`
    pub fn local_partitions(&self, tablet_id: TabletId) -> BTreeSet<PartitionId> {
        self.partitions
            .iter()
            .filter(|p| p.tablet_id == tablet_id)
            .map(|p| p.partition_id)
            .collect()
    }

    pub fn is_local(&self, tablet_id: TabletId, partition_id: PartitionId) -> bool {
        self.owner(partition_id) == Some(tablet_id)
    }

    /// Tablets owning a parent or child of any partition of `tablet_id`
    pub fn peer_tablets(&self, tablet_id: TabletId) -> BTreeSet<TabletId> {
        self.partitions
            .iter()
            .filter(|p| p.tablet_id == tablet_id)
            .flat_map(|p| p.parents.iter().chain(p.children.iter()))
            .filter_map(|id| self.owner(*id))
            .filter(|owner| *owner != tablet_id)
            .collect()
    }

    pub fn max_partition_id(&self) -> Option<PartitionId> {
        self.partitions.iter().map(|p| p.partition_id).max()
    }
}

/// Ask a partition for the predicate of a data transaction
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CalcPredicate {
    pub step: Step,
    pub tx_id: TxId,
    pub partition_id: PartitionId,
    /// Operations of the transaction that touch this partition
    pub operations: Vec<TxOperation>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CalcPredicateResult {
    pub step: Step,
    pub tx_id: TxId,
    pub partition_id: PartitionId,
    pub predicate: bool,
}

/// Ask a partition whether it can apply a configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposePartitionConfig {
    pub step: Step,
    pub tx_id: TxId,
    pub partition_id: PartitionId,
    pub config: TopicConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposePartitionConfigResult {
    pub step: Step,
    pub tx_id: TxId,
    pub partition_id: PartitionId,
    pub applied: bool,
}

/// Apply a committed transaction on a partition
///
/// Partitions must ignore a commit for a transaction they already applied;
/// the manager repeats it after a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommitTx {
    pub step: Step,
    pub tx_id: TxId,
    pub partition_id: PartitionId,
    pub operations: Vec<TxOperation>,
    pub config: Option<TopicConfig>,
}

/// Discard an aborted transaction on a partition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RollbackTx {
    pub step: Step,
    pub tx_id: TxId,
    pub partition_id: PartitionId,
}

/// A partition finished a commit or rollback
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxDone {
    pub step: Step,
    pub tx_id: TxId,
    pub partition_id: PartitionId,
}

/// Outbound calls to local partitions
pub trait PartitionLink: Send + Sync {
    fn calc_predicate(&self, request: CalcPredicate);

    fn propose_config(&self, request: ProposePartitionConfig);

    fn commit_tx(&self, request: CommitTx);

    fn rollback_tx(&self, request: RollbackTx);

    fn create_supportive_partition(
        &self,
        parent: PartitionId,
        supportive: PartitionId,
        write_id: WriteId,
    );

    fn delete_supportive_partition(&self, supportive: PartitionId, write_id: WriteId);
}
