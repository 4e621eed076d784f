//! In-process partitions
//!
//! [`LocalPartitions`] stands in for the per-partition actors of a tablet
//! when the tablet runs inside one process: it keeps consumer offsets and
//! the applied configuration version per partition, and answers every
//! request by posting the result back into the tablet inbox.

use super::{
    CalcPredicate, CalcPredicateResult, CommitTx, PartitionLink, ProposePartitionConfig,
    ProposePartitionConfigResult, RollbackTx, TopicConfig, TxDone, TxOperation,
};
use crate::tablet::{TabletEvent, TabletHandle};
use crate::types::{PartitionId, TxId, WriteId};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct PartitionState {
    /// Offset one past the last message
    end_offset: u64,
    /// Committed offset per consumer
    consumers: HashMap<String, u64>,
    /// Transactions already committed here
    applied: HashSet<TxId>,
    config_version: u64,
}

#[derive(Debug, Default)]
struct Partitions {
    regular: HashMap<PartitionId, PartitionState>,
    supportive: HashMap<PartitionId, (PartitionId, WriteId)>,
}

/// In-process partitions of one tablet
pub struct LocalPartitions {
    tablet: TabletHandle,
    inner: Mutex<Partitions>,
}

impl LocalPartitions {
    /// Create the partitions `config` places on the tablet behind `tablet`
    pub fn new(tablet: TabletHandle, config: &TopicConfig) -> Self {
        let mut inner = Partitions::default();
        for partition_id in config.local_partitions(tablet.tablet_id()) {
            inner.regular.insert(
                partition_id,
                PartitionState {
                    config_version: config.version,
                    ..PartitionState::default()
                },
            );
        }
        Self {
            tablet,
            inner: Mutex::new(inner),
        }
    }

    /// Pretend `offset` messages were written to a partition
    pub fn set_end_offset(&self, partition_id: PartitionId, offset: u64) {
        if let Some(state) = self.inner.lock().regular.get_mut(&partition_id) {
            state.end_offset = offset;
        }
    }

    /// Committed offset of `consumer`, if the partition exists
    pub fn committed_offset(&self, partition_id: PartitionId, consumer: &str) -> Option<u64> {
        self.inner
            .lock()
            .regular
            .get(&partition_id)
            .map(|state| state.consumers.get(consumer).copied().unwrap_or(0))
    }

    pub fn config_version(&self, partition_id: PartitionId) -> Option<u64> {
        self.inner
            .lock()
            .regular
            .get(&partition_id)
            .map(|state| state.config_version)
    }

    pub fn has_partition(&self, partition_id: PartitionId) -> bool {
        self.inner.lock().regular.contains_key(&partition_id)
    }

    /// Supportive partitions that currently exist, in id order
    pub fn supportive_partitions(&self) -> Vec<PartitionId> {
        let mut ids: Vec<PartitionId> = self.inner.lock().supportive.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn post(&self, event: TabletEvent) {
        if self.tablet.send(event).is_err() {
            debug!(
                tablet_id = self.tablet.tablet_id(),
                "Tablet stopped, dropping partition reply"
            );
        }
    }

    fn check_operation(state: &PartitionState, op: &TxOperation) -> bool {
        match &op.commit {
            None => true,
            Some(commit) => {
                let committed = state.consumers.get(&commit.consumer).copied().unwrap_or(0);
                committed == commit.begin
                    && commit.begin <= commit.end
                    && commit.end <= state.end_offset
            }
        }
    }
}

impl PartitionLink for LocalPartitions {
    fn calc_predicate(&self, request: CalcPredicate) {
        let predicate = {
            let inner = self.inner.lock();
            match inner.regular.get(&request.partition_id) {
                Some(state) => request
                    .operations
                    .iter()
                    .all(|op| Self::check_operation(state, op)),
                None => {
                    warn!(
                        partition_id = request.partition_id,
                        tx_id = request.tx_id,
                        "Predicate requested for unknown partition"
                    );
                    false
                }
            }
        };

        self.post(TabletEvent::CalcPredicateResult(CalcPredicateResult {
            step: request.step,
            tx_id: request.tx_id,
            partition_id: request.partition_id,
            predicate,
        }));
    }

    fn propose_config(&self, request: ProposePartitionConfig) {
        let applied = self
            .inner
            .lock()
            .regular
            .get(&request.partition_id)
            .map(|state| request.config.version >= state.config_version)
            .unwrap_or(false);

        self.post(TabletEvent::ProposeConfigResult(ProposePartitionConfigResult {
            step: request.step,
            tx_id: request.tx_id,
            partition_id: request.partition_id,
            applied,
        }));
    }

    fn commit_tx(&self, request: CommitTx) {
        {
            let mut inner = self.inner.lock();
            let first_commit = match inner.regular.get_mut(&request.partition_id) {
                Some(state) if !state.applied.contains(&request.tx_id) => {
                    state.applied.insert(request.tx_id);
                    for op in &request.operations {
                        if let Some(commit) = &op.commit {
                            state.consumers.insert(commit.consumer.clone(), commit.end);
                        }
                    }
                    if let Some(config) = &request.config {
                        state.config_version = config.version;
                    }
                    true
                }
                _ => false,
            };

            if first_commit {
                if let Some(config) = &request.config {
                    for partition_id in config.local_partitions(self.tablet.tablet_id()) {
                        inner
                            .regular
                            .entry(partition_id)
                            .or_insert_with(|| PartitionState {
                                config_version: config.version,
                                ..PartitionState::default()
                            });
                    }
                }
            }
        }

        self.post(TabletEvent::TxDone(TxDone {
            step: request.step,
            tx_id: request.tx_id,
            partition_id: request.partition_id,
        }));
    }

    fn rollback_tx(&self, request: RollbackTx) {
        self.post(TabletEvent::TxDone(TxDone {
            step: request.step,
            tx_id: request.tx_id,
            partition_id: request.partition_id,
        }));
    }

    fn create_supportive_partition(
        &self,
        parent: PartitionId,
        supportive: PartitionId,
        write_id: WriteId,
    ) {
        debug!(parent, supportive, %write_id, "Creating supportive partition");
        self.inner
            .lock()
            .supportive
            .insert(supportive, (parent, write_id));
    }

    fn delete_supportive_partition(&self, supportive: PartitionId, write_id: WriteId) {
        debug!(supportive, %write_id, "Deleting supportive partition");
        self.inner.lock().supportive.remove(&supportive);
    }
}
