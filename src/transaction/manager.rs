//! Transaction manager
//!
//! The TxManager owns every transaction of one tablet and is responsible for:
//! - Admission control (a hard cap on in-flight transactions)
//! - Step-ordered execution of planned transactions
//! - The decision exchange with peer tablets
//! - Restart recovery and re-emission of owed protocol messages
//! - Supportive partition reservations and their expiry
//!
//! # Concurrency
//!
//! All handlers take `&mut self` and are driven by a single event loop, so
//! a transition is atomic with respect to every other event on the tablet.
//! Each handler awaits at most one store batch at a time, and nothing
//! observable for a transition is emitted before its batch is durable.
//!
//! # Execution order
//!
//! Planned transactions wait in a queue ordered by `(step, tx_id)`. All
//! transactions of the lowest queued step may compute predicates and
//! exchange decisions concurrently; only the queue head may execute, so
//! outcomes become visible in strict `(step, tx_id)` order and no
//! transaction of a later step starts before the earlier step is done.

use crate::client::{
    ClientLink, DropStatus, DropTabletReply, PlanStepAccepted, PlanStepAck, ProposeResult,
    ProposeStatus, TabletState,
};
use crate::config::TabletConfig;
use crate::error::{Result, TabletError};
use crate::partition::{
    CalcPredicate, CalcPredicateResult, CommitTx, PartitionLink, ProposePartitionConfig,
    ProposePartitionConfigResult, RollbackTx, TopicConfig, TxDone,
};
use crate::peer::{PeerLink, ReadSet, ReadSetAck};
use crate::storage::{
    decode_json, parse_tx_key, read_json, supportive_key, tx_key, TxStore, WriteBatch, CONFIG_KEY,
    SUPPORTIVE_KEY_PREFIX, TX_INFO_KEY, TX_KEY_PREFIX,
};
use crate::supportive::{
    OwnershipRequest, OwnershipResponse, SupportiveOwnership, SupportivePartitions,
};
use crate::transaction::record::{TabletTxInfo, TxRecord};
use crate::transaction::state::TransactionState;
use crate::transaction::tx::{DistributedTx, ProposeRequest, TxBody};
use crate::types::{Decision, PartitionId, Step, TabletId, TxId};

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Everything the manager talks to outside the tablet
#[derive(Clone)]
pub struct TabletLinks {
    pub peers: Arc<dyn PeerLink>,
    pub partitions: Arc<dyn PartitionLink>,
    pub client: Arc<dyn ClientLink>,
}

/// Counters of the transaction manager
#[derive(Debug, Default)]
pub struct ManagerStats {
    proposals: AtomicU64,
    prepared: AtomicU64,
    overloaded: AtomicU64,
    rejected: AtomicU64,
    committed: AtomicU64,
    aborted: AtomicU64,
    read_sets_sent: AtomicU64,
    read_set_acks_sent: AtomicU64,
    supportive_reaped: AtomicU64,
}

/// Point-in-time copy of [`ManagerStats`]
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManagerStatsSnapshot {
    pub proposals: u64,
    pub prepared: u64,
    pub overloaded: u64,
    pub rejected: u64,
    pub committed: u64,
    pub aborted: u64,
    pub read_sets_sent: u64,
    pub read_set_acks_sent: u64,
    pub supportive_reaped: u64,
}

impl ManagerStats {
    fn record(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> ManagerStatsSnapshot {
        ManagerStatsSnapshot {
            proposals: self.proposals.load(Ordering::Relaxed),
            prepared: self.prepared.load(Ordering::Relaxed),
            overloaded: self.overloaded.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            committed: self.committed.load(Ordering::Relaxed),
            aborted: self.aborted.load(Ordering::Relaxed),
            read_sets_sent: self.read_sets_sent.load(Ordering::Relaxed),
            read_set_acks_sent: self.read_set_acks_sent.load(Ordering::Relaxed),
            supportive_reaped: self.supportive_reaped.load(Ordering::Relaxed),
        }
    }
}

/// Transaction manager of one tablet
pub struct TxManager {
    tablet_id: TabletId,
    max_in_flight: usize,
    /// First supportive partition id; regular partitions stay below it
    supportive_base: PartitionId,
    store: Arc<dyn TxStore>,
    links: TabletLinks,
    info: TabletTxInfo,
    topic: TopicConfig,
    txs: BTreeMap<TxId, DistributedTx>,
    /// Planned transactions that have not executed yet
    queue: BTreeSet<(Step, TxId)>,
    /// Drop requests waiting for the queue to drain, in arrival order
    pending_drops: Vec<TxId>,
    supportive: SupportivePartitions,
    /// Plain partition ownership: owner name and cookie
    owners: HashMap<PartitionId, (String, String)>,
    stats: Arc<ManagerStats>,
}

impl TxManager {
    /// Recover the manager from `store` and resume pending work
    ///
    /// `bootstrap` is the topic configuration used when the store holds
    /// none yet. Every transaction found in WAIT_RS or later gets its owed
    /// decisions re-sent; nothing is re-evaluated by local partitions.
    pub async fn boot(
        config: &TabletConfig,
        store: Arc<dyn TxStore>,
        links: TabletLinks,
        bootstrap: TopicConfig,
    ) -> Result<Self> {
        config.validate()?;
        let tablet_id = config.tablet_id;

        let info: TabletTxInfo = read_json(store.as_ref(), TX_INFO_KEY)
            .await?
            .unwrap_or_else(|| TabletTxInfo::new(config.supportive_partition_base));
        let topic: TopicConfig = read_json(store.as_ref(), CONFIG_KEY)
            .await?
            .unwrap_or(bootstrap);

        if let Some(max) = topic.max_partition_id() {
            if max >= config.supportive_partition_base {
                return Err(TabletError::config_msg(format!(
                    "partition {} collides with supportive partition base {}",
                    max, config.supportive_partition_base
                )));
            }
        }

        let mut owners = Vec::new();
        for (key, bytes) in store.read_prefix(SUPPORTIVE_KEY_PREFIX).await? {
            owners.push(decode_json::<SupportiveOwnership>(&key, &bytes)?);
        }
        let supportive = SupportivePartitions::restore(
            info.tx_writes.clone(),
            owners,
            info.next_supportive_partition,
            config.producer_txn.clone(),
        );

        let mut manager = Self {
            tablet_id,
            max_in_flight: config.max_in_flight_txs,
            supportive_base: config.supportive_partition_base,
            store,
            links,
            info,
            topic,
            txs: BTreeMap::new(),
            queue: BTreeSet::new(),
            pending_drops: Vec::new(),
            supportive,
            owners: HashMap::new(),
            stats: Arc::new(ManagerStats::default()),
        };

        for (key, bytes) in manager.store.read_prefix(TX_KEY_PREFIX).await? {
            let record: TxRecord = decode_json(&key, &bytes)?;
            if parse_tx_key(&key) != Some(record.tx_id) {
                return Err(TabletError::CorruptedRecord {
                    key,
                    reason: format!("holds transaction {}", record.tx_id),
                });
            }
            manager.restore_tx(record);
        }
        manager.resume().await?;
        Ok(manager)
    }

    fn restore_tx(&mut self, record: TxRecord) {
        let partitions = self.tx_partitions(&record.body);
        let mut tx = DistributedTx::from_record(record, partitions);

        match tx.state {
            TransactionState::Prepared => {}
            TransactionState::Planned | TransactionState::WaitRs => {
                if let Some(key) = tx.queue_key() {
                    self.queue.insert(key);
                }
            }
            TransactionState::Executed => tx.state = TransactionState::WaitRsAcks,
            other => {
                warn!(tx_id = tx.tx_id, state = %other, "Unexpected persisted state, treating as prepared");
                tx.state = TransactionState::Prepared;
            }
        }
        self.txs.insert(tx.tx_id, tx);
    }

    /// Re-send everything owed to peers and continue execution
    async fn resume(&mut self) -> Result<()> {
        let mut resent = 0;
        for tx in self.txs.values() {
            if !tx.state.has_local_decision() {
                continue;
            }
            let unacked = tx.unacked_receivers();
            resent += unacked.len();
            self.send_read_sets(tx, &unacked)?;
            if tx.state.is_executed() {
                self.send_acks(tx, tx.supplied_senders());
            }
        }

        let finished: Vec<TxId> = self
            .txs
            .values()
            .filter(|tx| tx.state == TransactionState::WaitRsAcks && tx.all_acks_received())
            .map(|tx| tx.tx_id)
            .collect();
        for tx_id in finished {
            self.delete_tx(tx_id).await?;
        }

        info!(
            tablet_id = self.tablet_id,
            transactions = self.txs.len(),
            planned = self.queue.len(),
            read_sets_resent = resent,
            exec_step = self.info.exec_step,
            supportive = self.supportive.len(),
            "Tablet transactions recovered"
        );

        self.advance().await
    }

    /// Partitions of this tablet a transaction involves
    fn tx_partitions(&self, body: &TxBody) -> BTreeSet<PartitionId> {
        match body {
            TxBody::Data { operations } => operations.iter().map(|op| op.partition_id).collect(),
            TxBody::Config { .. } => self.topic.local_partitions(self.tablet_id),
        }
    }

    // ------------------------------------------------------------------
    // Proposals
    // ------------------------------------------------------------------

    /// Handle a proposal
    ///
    /// Answers PREPARED once the transaction is durable, ABORTED when the
    /// proposal is invalid or the tablet is dropped, and OVERLOADED at the
    /// in-flight cap. Rejections persist nothing.
    pub async fn propose(&mut self, request: ProposeRequest) -> Result<()> {
        ManagerStats::record(&self.stats.proposals, 1);
        let tx_id = request.tx_id;

        if let Some(tx) = self.txs.get(&tx_id) {
            debug!(tx_id, state = %tx.state, "Duplicate proposal");
            let status = match tx.outcome {
                Some(outcome) if tx.state.is_executed() => {
                    if outcome.is_commit() {
                        ProposeStatus::Complete
                    } else {
                        ProposeStatus::Aborted
                    }
                }
                _ => ProposeStatus::Prepared,
            };
            self.reply(tx_id, status, None);
            return Ok(());
        }

        if self.info.tablet_state == TabletState::Dropped {
            self.reject(tx_id, "tablet is dropped".to_string());
            return Ok(());
        }

        if self.txs.len() >= self.max_in_flight {
            ManagerStats::record(&self.stats.overloaded, 1);
            debug!(tx_id, in_flight = self.txs.len(), "Proposal rejected, tablet overloaded");
            self.reply(tx_id, ProposeStatus::Overloaded, None);
            return Ok(());
        }

        let mut tx = match self.validate(request) {
            Ok(tx) => tx,
            Err(reason) => {
                self.reject(tx_id, reason);
                return Ok(());
            }
        };
        tx.state = TransactionState::Prepared;

        let mut batch = WriteBatch::new();
        batch.put_json(tx_key(tx_id), &tx.to_record())?;
        if let Some(write_id) = tx.write_id {
            for partition_id in &tx.partitions {
                self.supportive.bind(write_id, *partition_id, tx_id);
            }
            self.put_info(&mut batch)?;
        }
        self.store.write(batch).await?;

        debug!(
            tx_id,
            senders = tx.senders.len(),
            receivers = tx.receivers.len(),
            config = tx.body.is_config(),
            "Transaction prepared"
        );
        self.txs.insert(tx_id, tx);
        ManagerStats::record(&self.stats.prepared, 1);
        self.reply(tx_id, ProposeStatus::Prepared, None);
        Ok(())
    }

    fn validate(&self, request: ProposeRequest) -> std::result::Result<DistributedTx, String> {
        let body = TxBody::from_parts(request.operations, request.config)?;
        let mut senders: BTreeSet<TabletId> = request.senders.into_iter().collect();
        let mut receivers: BTreeSet<TabletId> = request.receivers.into_iter().collect();

        match &body {
            TxBody::Data { operations } => {
                for op in operations {
                    if !self.is_known_partition(op.partition_id) {
                        return Err(format!("unknown partition {}", op.partition_id));
                    }
                    match (request.write_id, op.supportive_partition) {
                        (None, Some(supportive)) => {
                            return Err(format!(
                                "supportive partition {} without write id",
                                supportive
                            ));
                        }
                        (Some(write_id), supportive) => {
                            let info = self
                                .supportive
                                .get(write_id, op.partition_id)
                                .ok_or_else(|| {
                                    format!(
                                        "unknown write id {} for partition {}",
                                        write_id, op.partition_id
                                    )
                                })?;
                            if let Some(bound) = info.tx_id {
                                return Err(format!(
                                    "write id {} is bound to transaction {}",
                                    write_id, bound
                                ));
                            }
                            if supportive.is_some_and(|s| s != info.supportive_partition) {
                                return Err(format!(
                                    "write id {} does not own supportive partition on {}",
                                    write_id, op.partition_id
                                ));
                            }
                        }
                        (None, None) => {}
                    }
                }
            }
            TxBody::Config { config } => {
                if config.version < self.topic.version {
                    return Err(format!(
                        "config version {} is older than {}",
                        config.version, self.topic.version
                    ));
                }
                if config.local_partitions(self.tablet_id).is_empty() {
                    return Err("config places no partition on this tablet".to_string());
                }
                if let Some(max) = config
                    .max_partition_id()
                    .filter(|max| *max >= self.supportive_base)
                {
                    return Err(format!(
                        "partition {} collides with supportive partition base {}",
                        max, self.supportive_base
                    ));
                }
                if senders.is_empty() && receivers.is_empty() {
                    let peers = config.peer_tablets(self.tablet_id);
                    senders = peers.clone();
                    receivers = peers;
                }
            }
        }

        let partitions = self.tx_partitions(&body);
        Ok(DistributedTx::new(
            request.tx_id,
            body,
            senders,
            receivers,
            request.write_id,
            partitions,
        ))
    }

    /// A partition of this tablet, or one an unexecuted config transaction adds
    fn is_known_partition(&self, partition_id: PartitionId) -> bool {
        self.topic.is_local(self.tablet_id, partition_id)
            || self.txs.values().any(|tx| {
                !tx.state.is_executed()
                    && tx
                        .body
                        .config()
                        .is_some_and(|config| config.is_local(self.tablet_id, partition_id))
            })
    }

    fn reject(&self, tx_id: TxId, reason: String) {
        ManagerStats::record(&self.stats.rejected, 1);
        debug!(tx_id, reason = %reason, "Proposal rejected");
        self.reply(tx_id, ProposeStatus::Aborted, Some(reason));
    }

    fn reply(&self, tx_id: TxId, status: ProposeStatus, reason: Option<String>) {
        self.links.client.propose_result(ProposeResult {
            tx_id,
            tablet_id: self.tablet_id,
            status,
            reason,
        });
    }

    /// Cancel a transaction that has not been planned yet
    pub async fn cancel_proposal(&mut self, tx_id: TxId) -> Result<()> {
        match self.txs.get(&tx_id) {
            Some(tx) if tx.state.can_cancel() => {}
            Some(tx) => {
                debug!(tx_id, state = %tx.state, "Cancel ignored, transaction is planned");
                return Ok(());
            }
            None => return Ok(()),
        }

        let mut batch = WriteBatch::new();
        batch.delete(tx_key(tx_id));
        if self.supportive.unbind(tx_id) {
            self.put_info(&mut batch)?;
        }
        self.store.write(batch).await?;
        self.txs.remove(&tx_id);

        info!(tx_id, "Proposal cancelled");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Planning and execution
    // ------------------------------------------------------------------

    /// Bind transactions to a plan step
    pub async fn plan_step(&mut self, step: Step, tx_ids: Vec<TxId>) -> Result<()> {
        let mut batch = WriteBatch::new();
        let mut planned = Vec::new();

        for &tx_id in &tx_ids {
            match self.txs.get_mut(&tx_id) {
                Some(tx) if tx.state == TransactionState::Prepared => {
                    tx.plan(step);
                    batch.put_json(tx_key(tx_id), &tx.to_record())?;
                    planned.push(tx_id);
                }
                Some(tx) => {
                    if tx.step != Some(step) {
                        warn!(
                            tx_id,
                            step,
                            planned_step = ?tx.step,
                            "Transaction already planned for another step"
                        );
                    }
                }
                None => warn!(tx_id, step, "Plan step names unknown transaction"),
            }
        }

        if step > self.info.plan_step {
            self.info.plan_step = step;
            self.put_info(&mut batch)?;
        }
        if !batch.is_empty() {
            self.store.write(batch).await?;
        }

        for tx_id in &planned {
            self.queue.insert((step, *tx_id));
        }
        debug!(step, planned = planned.len(), "Plan step accepted");

        self.links.client.plan_step_ack(PlanStepAck {
            step,
            tablet_id: self.tablet_id,
            tx_ids,
        });
        self.links.client.plan_step_accepted(PlanStepAccepted {
            step,
            tablet_id: self.tablet_id,
        });

        self.advance().await
    }

    /// Drive the execution queue as far as it can go
    async fn advance(&mut self) -> Result<()> {
        while let Some(&(head_step, head_id)) = self.queue.first() {
            let to_start: Vec<TxId> = self
                .queue
                .range((head_step, TxId::MIN)..=(head_step, TxId::MAX))
                .map(|(_, tx_id)| *tx_id)
                .filter(|tx_id| {
                    self.txs
                        .get(tx_id)
                        .is_some_and(|tx| tx.state == TransactionState::Planned)
                })
                .collect();
            for tx_id in to_start {
                self.start_calculating(tx_id).await?;
            }

            let Some(head) = self.txs.get(&head_id) else {
                self.queue.remove(&(head_step, head_id));
                continue;
            };

            let state = head.state;
            let decided = head.all_decisions_received();
            let applied = head.pending.is_empty();

            match state {
                TransactionState::WaitRs if decided => self.start_executing(head_id),
                TransactionState::Executing if applied => self.persist_executed(head_id).await?,
                _ => break,
            }
        }
        Ok(())
    }

    async fn start_calculating(&mut self, tx_id: TxId) -> Result<()> {
        let Some(tx) = self.txs.get_mut(&tx_id) else {
            return Ok(());
        };
        let Some(step) = tx.step else {
            return Err(TabletError::protocol_msg(format!(
                "transaction {} queued without a step",
                tx_id
            )));
        };

        tx.state = TransactionState::Calculating;
        tx.predicate = None;
        tx.pending = tx.partitions.clone();
        debug!(tx_id, step, partitions = tx.pending.len(), "Calculating");

        for &partition_id in &tx.pending {
            match &tx.body {
                TxBody::Data { .. } => self.links.partitions.calc_predicate(CalcPredicate {
                    step,
                    tx_id,
                    partition_id,
                    operations: tx.body.operations_for(partition_id),
                }),
                TxBody::Config { config } => {
                    self.links.partitions.propose_config(ProposePartitionConfig {
                        step,
                        tx_id,
                        partition_id,
                        config: config.clone(),
                    })
                }
            }
        }

        if tx.pending.is_empty() {
            tx.predicate = Some(true);
            self.on_calculated(tx_id).await?;
        }
        Ok(())
    }

    /// Handle a predicate computed by a local partition
    pub async fn calc_predicate_result(&mut self, result: CalcPredicateResult) -> Result<()> {
        self.partition_result(result.step, result.tx_id, result.partition_id, result.predicate)
            .await
    }

    /// Handle a configuration check by a local partition
    pub async fn propose_config_result(
        &mut self,
        result: ProposePartitionConfigResult,
    ) -> Result<()> {
        self.partition_result(result.step, result.tx_id, result.partition_id, result.applied)
            .await
    }

    async fn partition_result(
        &mut self,
        step: Step,
        tx_id: TxId,
        partition_id: PartitionId,
        value: bool,
    ) -> Result<()> {
        let Some(tx) = self.txs.get_mut(&tx_id) else {
            debug!(tx_id, partition_id, "Partition result for unknown transaction");
            return Ok(());
        };
        if tx.state != TransactionState::Calculating
            || tx.step != Some(step)
            || !tx.pending.remove(&partition_id)
        {
            debug!(tx_id, partition_id, state = %tx.state, "Stale partition result");
            return Ok(());
        }

        tx.add_predicate(value);
        if tx.pending.is_empty() {
            self.on_calculated(tx_id).await?;
            self.advance().await?;
        }
        Ok(())
    }

    /// Local decision is known: persist it and send it to every receiver
    async fn on_calculated(&mut self, tx_id: TxId) -> Result<()> {
        let Some(tx) = self.txs.get_mut(&tx_id) else {
            return Ok(());
        };
        tx.state = TransactionState::WaitRs;
        debug!(tx_id, step = ?tx.step, predicate = ?tx.predicate, "Local decision computed");

        if !tx.has_peers() {
            return Ok(());
        }

        let mut batch = WriteBatch::new();
        batch.put_json(tx_key(tx_id), &tx.to_record())?;
        self.store.write(batch).await?;

        if let Some(tx) = self.txs.get(&tx_id) {
            self.send_read_sets(tx, &tx.unacked_receivers())?;
        }
        Ok(())
    }

    /// Every input is known: compute the outcome and apply it locally
    fn start_executing(&mut self, tx_id: TxId) {
        let Some(tx) = self.txs.get_mut(&tx_id) else {
            return;
        };
        let step = tx.step.unwrap_or_default();
        let outcome = tx.compute_outcome();
        tx.outcome = Some(outcome);
        tx.state = TransactionState::Executing;
        tx.pending = tx.partitions.clone();
        debug!(tx_id, step, outcome = %outcome, "Executing");

        for &partition_id in &tx.pending {
            if outcome.is_commit() {
                self.links.partitions.commit_tx(CommitTx {
                    step,
                    tx_id,
                    partition_id,
                    operations: tx.body.operations_for(partition_id),
                    config: tx.body.config().cloned(),
                });
            } else {
                self.links.partitions.rollback_tx(RollbackTx {
                    step,
                    tx_id,
                    partition_id,
                });
            }
        }
    }

    /// Handle a partition finishing its commit or rollback
    pub async fn tx_done(&mut self, done: TxDone) -> Result<()> {
        let Some(tx) = self.txs.get_mut(&done.tx_id) else {
            return Ok(());
        };
        if tx.state != TransactionState::Executing
            || tx.step != Some(done.step)
            || !tx.pending.remove(&done.partition_id)
        {
            debug!(tx_id = done.tx_id, partition_id = done.partition_id, "Stale tx done");
            return Ok(());
        }
        if tx.pending.is_empty() {
            self.advance().await?;
        }
        Ok(())
    }

    /// Make the outcome durable, then answer and acknowledge
    async fn persist_executed(&mut self, tx_id: TxId) -> Result<()> {
        let Some(tx) = self.txs.get_mut(&tx_id) else {
            return Ok(());
        };
        let step = tx.step.unwrap_or_default();
        let outcome = tx.outcome.unwrap_or(Decision::Abort);
        tx.state = TransactionState::Executed;

        let new_config = match tx.body.config() {
            Some(config) if outcome.is_commit() => Some(config.clone()),
            _ => None,
        };

        let mut batch = WriteBatch::new();
        batch.put_json(tx_key(tx_id), &tx.to_record())?;
        if let Some(config) = &new_config {
            batch.put_json(CONFIG_KEY, config)?;
        }
        self.info.advance_exec(step, tx_id);
        self.put_info(&mut batch)?;
        self.store.write(batch).await?;

        self.queue.remove(&(step, tx_id));
        if let Some(config) = new_config {
            info!(tx_id, version = config.version, "Topic configuration applied");
            self.topic = config;
        }

        let status = if outcome.is_commit() {
            ManagerStats::record(&self.stats.committed, 1);
            ProposeStatus::Complete
        } else {
            ManagerStats::record(&self.stats.aborted, 1);
            ProposeStatus::Aborted
        };
        info!(tx_id, step, outcome = %outcome, "Transaction executed");
        self.reply(tx_id, status, None);

        let done = match self.txs.get_mut(&tx_id) {
            Some(tx) => {
                tx.state = TransactionState::WaitRsAcks;
                tx.all_acks_received()
            }
            None => false,
        };
        if let Some(tx) = self.txs.get(&tx_id) {
            self.send_acks(tx, tx.supplied_senders());
        }
        if done {
            self.delete_tx(tx_id).await?;
        }

        self.flush_drops();
        Ok(())
    }

    async fn delete_tx(&mut self, tx_id: TxId) -> Result<()> {
        let Some(tx) = self.txs.get_mut(&tx_id) else {
            return Ok(());
        };
        tx.state = TransactionState::Deleting;

        let removed = self.supportive.remove_bound(tx_id);
        let mut batch = WriteBatch::new();
        batch.delete(tx_key(tx_id));
        for write in &removed {
            batch.delete(supportive_key(write.supportive_partition));
        }
        if !removed.is_empty() {
            self.put_info(&mut batch)?;
        }
        self.store.write(batch).await?;

        self.txs.remove(&tx_id);
        for write in removed {
            self.links
                .partitions
                .delete_supportive_partition(write.supportive_partition, write.write_id);
        }
        debug!(tx_id, "Transaction deleted");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Peer exchange
    // ------------------------------------------------------------------

    fn send_read_sets(&self, tx: &DistributedTx, targets: &[TabletId]) -> Result<()> {
        let (Some(step), Some(decision)) = (tx.step, tx.local_decision().or(tx.outcome)) else {
            return Ok(());
        };
        for &target in targets {
            let read_set = ReadSet::new(step, tx.tx_id, self.tablet_id, target, decision)?;
            self.links.peers.send_read_set(read_set);
        }
        ManagerStats::record(&self.stats.read_sets_sent, targets.len() as u64);
        Ok(())
    }

    fn send_acks(&self, tx: &DistributedTx, senders: impl IntoIterator<Item = TabletId>) {
        let Some(step) = tx.step else {
            return;
        };
        for source in senders {
            self.links.peers.send_read_set_ack(ReadSetAck {
                step,
                tx_id: tx.tx_id,
                source,
                target: self.tablet_id,
                consumer: self.tablet_id,
            });
            ManagerStats::record(&self.stats.read_set_acks_sent, 1);
        }
    }

    fn ack_read_set(&self, read_set: &ReadSet) {
        self.links
            .peers
            .send_read_set_ack(read_set.ack(self.tablet_id));
        ManagerStats::record(&self.stats.read_set_acks_sent, 1);
    }

    /// Handle a decision sent by a peer
    pub async fn read_set(&mut self, read_set: ReadSet) -> Result<()> {
        let tx_id = read_set.tx_id;
        let decision = read_set.decision();

        let Some(tx) = self.txs.get_mut(&tx_id) else {
            debug!(tx_id, source = read_set.source, "Read set for unknown transaction, acknowledging");
            self.ack_read_set(&read_set);
            return Ok(());
        };

        if tx.state.is_executed() {
            debug!(tx_id, source = read_set.source, "Read set for executed transaction, acknowledging");
            self.ack_read_set(&read_set);
            return Ok(());
        }

        if !tx.senders.contains(&read_set.source) {
            warn!(tx_id, source = read_set.source, "Read set from unexpected sender");
            return Ok(());
        }

        match tx.step {
            None => {
                debug!(tx_id, source = read_set.source, step = read_set.step, "Read set before plan step");
                tx.record_early_decision(read_set.source, read_set.step, decision);
                return Ok(());
            }
            Some(step) if step != read_set.step => {
                warn!(
                    tx_id,
                    source = read_set.source,
                    step,
                    read_set_step = read_set.step,
                    "Read set step mismatch"
                );
                return Ok(());
            }
            Some(_) => {}
        }

        if !tx.state.accepts_decisions() {
            // The outcome is being applied; ack the sender once it is durable
            tx.supplied.insert(read_set.source);
            debug!(tx_id, source = read_set.source, state = %tx.state, "Late read set ignored");
            return Ok(());
        }

        if tx.record_decision(read_set.source, decision) {
            debug!(tx_id, source = read_set.source, decision = %decision, "Read set received");
            if tx.state == TransactionState::WaitRs {
                self.advance().await?;
            }
        } else {
            debug!(tx_id, source = read_set.source, "Duplicate read set");
        }
        Ok(())
    }

    /// Handle a peer acknowledging our decision
    pub async fn read_set_ack(&mut self, ack: ReadSetAck) -> Result<()> {
        let Some(tx) = self.txs.get_mut(&ack.tx_id) else {
            debug!(tx_id = ack.tx_id, consumer = ack.consumer, "Ack for unknown transaction");
            return Ok(());
        };
        if tx.step != Some(ack.step) {
            warn!(tx_id = ack.tx_id, step = ack.step, "Ack step mismatch");
            return Ok(());
        }
        if !tx.record_ack(ack.consumer) {
            return Ok(());
        }
        debug!(tx_id = ack.tx_id, consumer = ack.consumer, "Read set acknowledged");
        self.after_ack(ack.tx_id).await
    }

    async fn after_ack(&mut self, tx_id: TxId) -> Result<()> {
        let Some(tx) = self.txs.get(&tx_id) else {
            return Ok(());
        };
        if tx.state == TransactionState::WaitRsAcks && tx.all_acks_received() {
            return self.delete_tx(tx_id).await;
        }
        if tx.state.has_local_decision() {
            let mut batch = WriteBatch::new();
            batch.put_json(tx_key(tx_id), &tx.to_record())?;
            self.store.write(batch).await?;
        }
        Ok(())
    }

    /// Handle the loss of the connection to a peer tablet
    ///
    /// A dead peer will never acknowledge, so its pending acknowledgments
    /// count as received. A peer that merely reconnected gets every owed
    /// decision and acknowledgment again.
    pub async fn peer_disconnected(&mut self, peer: TabletId, dead: bool) -> Result<()> {
        if dead {
            let affected: Vec<TxId> = self
                .txs
                .values()
                .filter(|tx| tx.state.has_local_decision())
                .filter(|tx| tx.receivers.contains(&peer) && !tx.acks.contains(&peer))
                .map(|tx| tx.tx_id)
                .collect();
            info!(peer, transactions = affected.len(), "Peer is gone, substituting acks");
            for tx_id in affected {
                if let Some(tx) = self.txs.get_mut(&tx_id) {
                    tx.record_ack(peer);
                }
                self.after_ack(tx_id).await?;
            }
            return Ok(());
        }

        debug!(peer, "Peer reconnected, re-sending owed messages");
        for tx in self.txs.values() {
            if tx.state.has_local_decision()
                && tx.receivers.contains(&peer)
                && !tx.acks.contains(&peer)
            {
                self.send_read_sets(tx, &[peer])?;
            }
            if tx.state.is_executed() && tx.supplied.contains(&peer) {
                self.send_acks(tx, [peer]);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Administration and diagnostics
    // ------------------------------------------------------------------

    /// Handle a drop-tablet request
    ///
    /// Answered once no planned transaction is left to execute. Later
    /// proposals are aborted. Waiting requests are not persisted: after a
    /// restart the caller must send the drop again, which is answered
    /// from the durable dropped state.
    pub async fn drop_tablet(&mut self, tx_id: TxId) -> Result<()> {
        if self.info.tablet_state != TabletState::Dropped {
            self.info.tablet_state = TabletState::Dropped;
            let mut batch = WriteBatch::new();
            self.put_info(&mut batch)?;
            self.store.write(batch).await?;
            info!(tablet_id = self.tablet_id, tx_id, "Tablet dropped");
        }

        self.pending_drops.push(tx_id);
        if !self.queue.is_empty() {
            debug!(tx_id, planned = self.queue.len(), "Drop waits for planned transactions");
        }
        self.flush_drops();
        Ok(())
    }

    fn flush_drops(&mut self) {
        if !self.queue.is_empty() {
            return;
        }
        for tx_id in self.pending_drops.drain(..) {
            self.links.client.drop_tablet_reply(DropTabletReply {
                status: DropStatus::Ok,
                tx_id,
                tablet_id: self.tablet_id,
                state: self.info.tablet_state,
            });
        }
    }

    /// Re-send our decision for a transaction stuck in WAIT_RS
    ///
    /// Returns false when `(step, tx_id)` is not waiting, every sender
    /// decision is already in, or `target` is not a receiver.
    pub fn force_send_read_set(
        &mut self,
        step: Step,
        tx_id: TxId,
        target: Option<TabletId>,
    ) -> Result<bool> {
        let Some(tx) = self.txs.get(&tx_id) else {
            return Ok(false);
        };
        if tx.step != Some(step)
            || tx.state != TransactionState::WaitRs
            || tx.all_decisions_received()
        {
            return Ok(false);
        }

        let targets: Vec<TabletId> = match target {
            Some(target) if tx.receivers.contains(&target) => vec![target],
            Some(_) => return Ok(false),
            None => tx.receivers.iter().copied().collect(),
        };
        if targets.is_empty() {
            return Ok(false);
        }

        info!(tx_id, step, targets = targets.len(), "Forcing read set transmission");
        self.send_read_sets(tx, &targets)?;
        Ok(true)
    }

    /// Inject a synthetic decision for one or every sender
    ///
    /// The decision is AND-folded into whatever the sender already sent,
    /// so an injected abort cannot be undone. Returns false when the
    /// transaction is not waiting for decisions at `step` or already has
    /// every one of them.
    pub async fn inject_read_set(
        &mut self,
        step: Step,
        tx_id: TxId,
        sender: Option<TabletId>,
        decision: Decision,
    ) -> Result<bool> {
        let Some(tx) = self.txs.get_mut(&tx_id) else {
            return Ok(false);
        };
        if tx.step != Some(step)
            || !tx.state.is_planned()
            || !tx.state.accepts_decisions()
            || tx.all_decisions_received()
        {
            return Ok(false);
        }

        let senders: Vec<TabletId> = match sender {
            Some(sender) if tx.senders.contains(&sender) => vec![sender],
            Some(_) => return Ok(false),
            None => tx.senders.iter().copied().collect(),
        };
        for sender in &senders {
            tx.inject_decision(*sender, decision);
        }
        info!(tx_id, step, senders = senders.len(), decision = %decision, "Read set injected");

        if tx.state == TransactionState::WaitRs {
            self.advance().await?;
        }
        Ok(true)
    }

    // ------------------------------------------------------------------
    // Supportive partitions
    // ------------------------------------------------------------------

    /// Handle a request to own a partition for writing
    pub async fn get_ownership(
        &mut self,
        request: OwnershipRequest,
        now_ms: i64,
    ) -> Result<OwnershipResponse> {
        let cookie = request.cookie;
        let partition_id = request.partition_id;
        if !self.topic.is_local(self.tablet_id, partition_id) {
            return Ok(OwnershipResponse::error(
                cookie,
                format!("unknown partition {}", partition_id),
            ));
        }

        let Some(write_id) = request.write_id else {
            let owner = self
                .owners
                .entry(partition_id)
                .and_modify(|(owner, owner_cookie)| {
                    if *owner != request.owner {
                        *owner = request.owner.clone();
                        *owner_cookie = Uuid::new_v4().to_string();
                    }
                })
                .or_insert_with(|| (request.owner.clone(), Uuid::new_v4().to_string()));
            return Ok(OwnershipResponse::ok(cookie, owner.1.clone(), None));
        };

        if let Some(info) = self.supportive.get(write_id, partition_id) {
            if let Some(bound) = info.tx_id.filter(|tx_id| self.txs.contains_key(tx_id)) {
                return Ok(OwnershipResponse::error(
                    cookie,
                    format!("write id {} is bound to transaction {}", write_id, bound),
                ));
            }
            let owner_cookie = self
                .supportive
                .owner(info.supportive_partition)
                .map(|o| o.owner_cookie.clone())
                .unwrap_or_default();
            return Ok(OwnershipResponse::ok(
                cookie,
                owner_cookie,
                Some(info.supportive_partition),
            ));
        }

        if !request.need_supportive {
            return Ok(OwnershipResponse::error(
                cookie,
                format!("no supportive partition for write id {}", write_id),
            ));
        }
        if self.info.tablet_state == TabletState::Dropped {
            return Ok(OwnershipResponse::error(cookie, "tablet is dropped"));
        }

        let (info, ownership) =
            self.supportive
                .allocate(write_id, partition_id, &request.owner, now_ms);
        let mut batch = WriteBatch::new();
        batch.put_json(supportive_key(info.supportive_partition), &ownership)?;
        self.put_info(&mut batch)?;
        self.store.write(batch).await?;

        self.links.partitions.create_supportive_partition(
            partition_id,
            info.supportive_partition,
            write_id,
        );
        info!(
            %write_id,
            partition_id,
            supportive_partition = info.supportive_partition,
            producer_txn = info.producer_txn,
            "Supportive partition created"
        );
        Ok(OwnershipResponse::ok(
            cookie,
            ownership.owner_cookie,
            Some(info.supportive_partition),
        ))
    }

    /// Periodic wake-up: reap expired producer-transaction reservations
    pub async fn wakeup(&mut self, now_ms: i64) -> Result<()> {
        let txs = &self.txs;
        let reaped = self
            .supportive
            .reap(now_ms, |tx_id| txs.contains_key(&tx_id));
        if reaped.is_empty() {
            return Ok(());
        }

        let mut batch = WriteBatch::new();
        for write in &reaped {
            batch.delete(supportive_key(write.supportive_partition));
        }
        self.put_info(&mut batch)?;
        self.store.write(batch).await?;

        for write in &reaped {
            self.links
                .partitions
                .delete_supportive_partition(write.supportive_partition, write.write_id);
        }
        ManagerStats::record(&self.stats.supportive_reaped, reaped.len() as u64);
        info!(count = reaped.len(), "Reaped expired supportive partitions");
        Ok(())
    }

    fn put_info(&mut self, batch: &mut WriteBatch) -> Result<()> {
        self.info.tx_writes = self.supportive.write_records();
        self.info.next_supportive_partition = self.supportive.next_id();
        batch.put_json(TX_INFO_KEY, &self.info)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    pub fn tx(&self, tx_id: TxId) -> Option<&DistributedTx> {
        self.txs.get(&tx_id)
    }

    pub fn tx_state(&self, tx_id: TxId) -> Option<TransactionState> {
        self.txs.get(&tx_id).map(|tx| tx.state)
    }

    /// Transactions proposed and not yet deleted
    pub fn tx_count(&self) -> usize {
        self.txs.len()
    }

    /// Planned transactions that have not executed yet, in execution order
    pub fn planned(&self) -> Vec<(Step, TxId)> {
        self.queue.iter().copied().collect()
    }

    /// `(step, tx_id)` of the last executed transaction
    pub fn exec_step(&self) -> (Step, TxId) {
        (self.info.exec_step, self.info.exec_tx_id)
    }

    pub fn plan_step_watermark(&self) -> Step {
        self.info.plan_step
    }

    pub fn tablet_state(&self) -> TabletState {
        self.info.tablet_state
    }

    pub fn pending_drops(&self) -> usize {
        self.pending_drops.len()
    }

    pub fn topic_config(&self) -> &TopicConfig {
        &self.topic
    }

    pub fn supportive(&self) -> &SupportivePartitions {
        &self.supportive
    }

    pub fn stats(&self) -> Arc<ManagerStats> {
        Arc::clone(&self.stats)
    }
}

impl std::fmt::Debug for TxManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TxManager")
            .field("tablet_id", &self.tablet_id)
            .field("transactions", &self.txs.len())
            .field("planned", &self.queue.len())
            .field("exec_step", &self.info.exec_step)
            .field("tablet_state", &self.info.tablet_state)
            .finish()
    }
}
