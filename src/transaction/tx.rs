//! The per-transaction state machine

use crate::partition::{TopicConfig, TxOperation};
use crate::transaction::record::TxRecord;
use crate::transaction::state::TransactionState;
use crate::types::{Decision, PartitionId, Step, TabletId, TxId, WriteId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

/// A proposal as submitted by a client
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProposeRequest {
    pub tx_id: TxId,
    pub operations: Vec<TxOperation>,
    pub config: Option<TopicConfig>,
    pub senders: Vec<TabletId>,
    pub receivers: Vec<TabletId>,
    pub write_id: Option<WriteId>,
}

impl ProposeRequest {
    /// Data transaction over `operations`
    pub fn data(tx_id: TxId, operations: Vec<TxOperation>) -> Self {
        Self {
            tx_id,
            operations,
            ..Self::default()
        }
    }

    /// Config transaction applying `config`
    pub fn config(tx_id: TxId, config: TopicConfig) -> Self {
        Self {
            tx_id,
            config: Some(config),
            ..Self::default()
        }
    }

    pub fn with_senders(mut self, senders: impl IntoIterator<Item = TabletId>) -> Self {
        self.senders = senders.into_iter().collect();
        self
    }

    pub fn with_receivers(mut self, receivers: impl IntoIterator<Item = TabletId>) -> Self {
        self.receivers = receivers.into_iter().collect();
        self
    }

    /// Use the same tablets as senders and receivers
    pub fn with_peers(self, peers: impl IntoIterator<Item = TabletId>) -> Self {
        let peers: Vec<TabletId> = peers.into_iter().collect();
        self.with_senders(peers.clone()).with_receivers(peers)
    }

    pub fn with_write_id(mut self, write_id: WriteId) -> Self {
        self.write_id = Some(write_id);
        self
    }
}

/// What a transaction does: either data operations or a configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TxBody {
    Data { operations: Vec<TxOperation> },
    Config { config: TopicConfig },
}

impl TxBody {
    /// Build the body from a proposal, or explain why it is malformed
    pub fn from_parts(
        operations: Vec<TxOperation>,
        config: Option<TopicConfig>,
    ) -> Result<Self, String> {
        match (operations.is_empty(), config) {
            (false, None) => Ok(TxBody::Data { operations }),
            (true, Some(config)) => Ok(TxBody::Config { config }),
            (true, None) => Err("missing operations".to_string()),
            (false, Some(_)) => Err("operations and config are mutually exclusive".to_string()),
        }
    }

    pub fn is_config(&self) -> bool {
        matches!(self, TxBody::Config { .. })
    }

    pub fn operations(&self) -> &[TxOperation] {
        match self {
            TxBody::Data { operations } => operations,
            TxBody::Config { .. } => &[],
        }
    }

    pub fn config(&self) -> Option<&TopicConfig> {
        match self {
            TxBody::Data { .. } => None,
            TxBody::Config { config } => Some(config),
        }
    }

    /// Operations touching `partition_id`
    pub fn operations_for(&self, partition_id: PartitionId) -> Vec<TxOperation> {
        self.operations()
            .iter()
            .filter(|op| op.partition_id == partition_id)
            .cloned()
            .collect()
    }
}

/// A distributed transaction owned by one tablet
#[derive(Debug, Clone)]
pub struct DistributedTx {
    pub(super) tx_id: TxId,
    pub(super) step: Option<Step>,
    pub(super) body: TxBody,
    pub(super) senders: BTreeSet<TabletId>,
    pub(super) receivers: BTreeSet<TabletId>,
    pub(super) write_id: Option<WriteId>,
    pub(super) state: TransactionState,
    /// Partitions involved on this tablet
    pub(super) partitions: BTreeSet<PartitionId>,
    /// Partitions that still owe a reply in the current phase
    pub(super) pending: BTreeSet<PartitionId>,
    pub(super) predicate: Option<bool>,
    pub(super) decisions: BTreeMap<TabletId, Decision>,
    /// Senders whose read set actually arrived, as opposed to injected
    pub(super) supplied: BTreeSet<TabletId>,
    /// Decisions that arrived before the plan step
    pub(super) early_decisions: BTreeMap<TabletId, (Step, Decision)>,
    pub(super) acks: BTreeSet<TabletId>,
    pub(super) outcome: Option<Decision>,
}

impl DistributedTx {
    pub fn new(
        tx_id: TxId,
        body: TxBody,
        senders: BTreeSet<TabletId>,
        receivers: BTreeSet<TabletId>,
        write_id: Option<WriteId>,
        partitions: BTreeSet<PartitionId>,
    ) -> Self {
        Self {
            tx_id,
            step: None,
            body,
            senders,
            receivers,
            write_id,
            state: TransactionState::Preparing,
            partitions,
            pending: BTreeSet::new(),
            predicate: None,
            decisions: BTreeMap::new(),
            supplied: BTreeSet::new(),
            early_decisions: BTreeMap::new(),
            acks: BTreeSet::new(),
            outcome: None,
        }
    }

    /// Rebuild a transaction from its durable record
    pub fn from_record(record: TxRecord, partitions: BTreeSet<PartitionId>) -> Self {
        Self {
            tx_id: record.tx_id,
            step: record.step,
            body: record.body,
            senders: record.senders,
            receivers: record.receivers,
            write_id: record.write_id,
            state: record.state,
            partitions,
            pending: BTreeSet::new(),
            predicate: record.predicate,
            decisions: record.decisions,
            supplied: record.supplied,
            early_decisions: BTreeMap::new(),
            acks: record.acks,
            outcome: record.outcome,
        }
    }

    pub fn to_record(&self) -> TxRecord {
        let executed = self.state.is_executed();
        TxRecord {
            tx_id: self.tx_id,
            step: self.step,
            state: self.persisted_state(),
            body: self.body.clone(),
            senders: self.senders.clone(),
            receivers: self.receivers.clone(),
            write_id: self.write_id,
            predicate: self.predicate,
            outcome: self.outcome,
            decisions: if executed {
                self.decisions.clone()
            } else {
                BTreeMap::new()
            },
            supplied: if executed {
                self.supplied.clone()
            } else {
                BTreeSet::new()
            },
            acks: self.acks.clone(),
        }
    }

    /// State to write for the in-memory state
    fn persisted_state(&self) -> TransactionState {
        match self.state {
            TransactionState::Preparing | TransactionState::Prepared => TransactionState::Prepared,
            TransactionState::Planned | TransactionState::Calculating => TransactionState::Planned,
            TransactionState::WaitRs | TransactionState::Executing => TransactionState::WaitRs,
            TransactionState::Executed
            | TransactionState::WaitRsAcks
            | TransactionState::Deleting => TransactionState::Executed,
        }
    }

    pub fn tx_id(&self) -> TxId {
        self.tx_id
    }

    pub fn step(&self) -> Option<Step> {
        self.step
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn body(&self) -> &TxBody {
        &self.body
    }

    pub fn senders(&self) -> &BTreeSet<TabletId> {
        &self.senders
    }

    pub fn receivers(&self) -> &BTreeSet<TabletId> {
        &self.receivers
    }

    pub fn write_id(&self) -> Option<WriteId> {
        self.write_id
    }

    pub fn predicate(&self) -> Option<bool> {
        self.predicate
    }

    pub fn outcome(&self) -> Option<Decision> {
        self.outcome
    }

    pub fn decision_from(&self, sender: TabletId) -> Option<Decision> {
        self.decisions.get(&sender).copied()
    }

    /// Position in the execution queue
    pub fn queue_key(&self) -> Option<(Step, TxId)> {
        self.step.map(|step| (step, self.tx_id))
    }

    /// Whether the transaction talks to other tablets at all
    pub fn has_peers(&self) -> bool {
        !self.senders.is_empty() || !self.receivers.is_empty()
    }

    /// Decision this tablet sends to receivers
    pub fn local_decision(&self) -> Option<Decision> {
        self.predicate.map(Decision::from_predicate)
    }

    /// Bind the transaction to a plan step
    ///
    /// Decisions that arrived early for the same step are kept, the rest
    /// are dropped.
    pub fn plan(&mut self, step: Step) {
        self.step = Some(step);
        self.state = TransactionState::Planned;
        for (sender, (early_step, decision)) in std::mem::take(&mut self.early_decisions) {
            if early_step == step {
                self.decisions.entry(sender).or_insert(decision);
                self.supplied.insert(sender);
            } else {
                debug!(
                    tx_id = self.tx_id,
                    sender, early_step, step, "Dropping read set for another step"
                );
            }
        }
    }

    /// Keep a decision that arrived before the plan step
    pub fn record_early_decision(&mut self, sender: TabletId, step: Step, decision: Decision) {
        self.early_decisions.entry(sender).or_insert((step, decision));
    }

    /// Record the decision of `sender`; returns false for unknown senders
    /// and duplicates
    pub fn record_decision(&mut self, sender: TabletId, decision: Decision) -> bool {
        if !self.senders.contains(&sender) {
            return false;
        }
        self.supplied.insert(sender);
        if self.decisions.contains_key(&sender) {
            return false;
        }
        self.decisions.insert(sender, decision);
        true
    }

    /// AND-fold a synthetic decision into the one recorded for `sender`
    pub fn inject_decision(&mut self, sender: TabletId, decision: Decision) {
        self.decisions
            .entry(sender)
            .and_modify(|current| *current = current.and(decision))
            .or_insert(decision);
    }

    /// Senders that sent a read set and so expect an acknowledgment
    pub fn supplied_senders(&self) -> Vec<TabletId> {
        self.supplied.iter().copied().collect()
    }

    pub fn missing_senders(&self) -> Vec<TabletId> {
        self.senders
            .iter()
            .filter(|sender| !self.decisions.contains_key(sender))
            .copied()
            .collect()
    }

    pub fn all_decisions_received(&self) -> bool {
        self.senders
            .iter()
            .all(|sender| self.decisions.contains_key(sender))
    }

    /// Fold the reply of one partition into the local predicate
    pub fn add_predicate(&mut self, value: bool) {
        self.predicate = Some(self.predicate.unwrap_or(true) && value);
    }

    /// Final outcome from the local predicate and every sender decision
    ///
    /// A sender without a decision counts as unknown, which aborts.
    pub fn compute_outcome(&self) -> Decision {
        Decision::fold(
            self.predicate.unwrap_or(false),
            self.senders
                .iter()
                .map(|sender| self.decisions.get(sender).copied().unwrap_or(Decision::Unknown)),
        )
    }

    /// Record that `receiver` acknowledged our decision
    pub fn record_ack(&mut self, receiver: TabletId) -> bool {
        self.receivers.contains(&receiver) && self.acks.insert(receiver)
    }

    pub fn all_acks_received(&self) -> bool {
        self.receivers.iter().all(|r| self.acks.contains(r))
    }

    pub fn unacked_receivers(&self) -> Vec<TabletId> {
        self.receivers
            .iter()
            .filter(|r| !self.acks.contains(r))
            .copied()
            .collect()
    }
}
