//! Shared test fixtures for pq-tablet integration tests
//!
//! # Usage
//!
//! In your test file, add:
//! ```rust,ignore
//! mod common;
//! use common::*;
//! ```
//!
//! # Features
//!
//! - `Recorder`: records every message a tablet sends to peers, partitions
//!   and clients
//! - `Harness`: one `TxManager` over a shared in-memory store, driven
//!   directly, with helpers to answer partition requests and to restart
//! - `Cluster`: several running tablets wired through `LocalRouter`

#![allow(dead_code)]

use parking_lot::Mutex;
use pq_tablet::partition::{
    CalcPredicate, CalcPredicateResult, CommitTx, ProposePartitionConfig,
    ProposePartitionConfigResult, RollbackTx, TxDone,
};
use pq_tablet::{
    ChannelClient, ClientEvent, ClientLink, Decision, DropTabletReply, InMemoryTxStore,
    LocalPartitions, LocalRouter, PartitionId, PartitionLink, PeerLink, PlanStepAccepted,
    PlanStepAck, ProposeRequest, ProposeResult, ProposeStatus, ReadSet, ReadSetAck, Step, Tablet,
    TabletConfig, TabletHandle, TabletId, TabletLinks, TopicConfig, TxId, TxManager, TxStore,
    WriteId,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Tablet under test
pub const TABLET: TabletId = 1;

/// Topic path used by every fixture
pub const TOPIC: &str = "/Root/topic";

// ============================================================================
// Recording links
// ============================================================================

/// Everything a tablet sent since the last drain
#[derive(Debug, Default)]
pub struct Recorded {
    pub read_sets: Vec<ReadSet>,
    pub acks: Vec<ReadSetAck>,
    pub calc: Vec<CalcPredicate>,
    pub configs: Vec<ProposePartitionConfig>,
    pub commits: Vec<CommitTx>,
    pub rollbacks: Vec<RollbackTx>,
    pub created: Vec<(PartitionId, PartitionId, WriteId)>,
    pub deleted: Vec<(PartitionId, WriteId)>,
    pub results: Vec<ProposeResult>,
    pub plan_acks: Vec<PlanStepAck>,
    pub plan_accepted: Vec<PlanStepAccepted>,
    pub drops: Vec<DropTabletReply>,
    /// `(tx_id, partition_id, commit)` in the order partitions were told
    pub executions: Vec<(TxId, PartitionId, bool)>,
}

/// Peer, partition and client link that records every call
#[derive(Debug, Clone, Default)]
pub struct Recorder {
    inner: Arc<Mutex<Recorded>>,
}

impl Recorder {
    pub fn links(&self) -> TabletLinks {
        TabletLinks {
            peers: Arc::new(self.clone()),
            partitions: Arc::new(self.clone()),
            client: Arc::new(self.clone()),
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut Recorded) -> R) -> R {
        f(&mut self.inner.lock())
    }

    /// Every status answered for `tx_id`, oldest first
    pub fn statuses(&self, tx_id: TxId) -> Vec<ProposeStatus> {
        self.with(|r| {
            r.results
                .iter()
                .filter(|res| res.tx_id == tx_id)
                .map(|res| res.status)
                .collect()
        })
    }

    pub fn last_status(&self, tx_id: TxId) -> Option<ProposeStatus> {
        self.statuses(tx_id).last().copied()
    }

    pub fn count_status(&self, status: ProposeStatus) -> usize {
        self.with(|r| r.results.iter().filter(|res| res.status == status).count())
    }

    pub fn read_sets_to(&self, target: TabletId, tx_id: TxId) -> Vec<ReadSet> {
        self.with(|r| {
            r.read_sets
                .iter()
                .filter(|rs| rs.target == target && rs.tx_id == tx_id)
                .cloned()
                .collect()
        })
    }

    pub fn acks_to(&self, source: TabletId, tx_id: TxId) -> Vec<ReadSetAck> {
        self.with(|r| {
            r.acks
                .iter()
                .filter(|ack| ack.source == source && ack.tx_id == tx_id)
                .copied()
                .collect()
        })
    }

    pub fn executions(&self) -> Vec<(TxId, PartitionId, bool)> {
        self.with(|r| r.executions.clone())
    }

    pub fn drops(&self) -> Vec<DropTabletReply> {
        self.with(|r| r.drops.clone())
    }

    pub fn pending_calc(&self) -> usize {
        self.with(|r| r.calc.len() + r.configs.len())
    }

    pub fn clear_messages(&self) {
        self.with(|r| {
            r.read_sets.clear();
            r.acks.clear();
            r.results.clear();
        });
    }
}

impl PeerLink for Recorder {
    fn send_read_set(&self, read_set: ReadSet) {
        self.inner.lock().read_sets.push(read_set);
    }

    fn send_read_set_ack(&self, ack: ReadSetAck) {
        self.inner.lock().acks.push(ack);
    }
}

impl PartitionLink for Recorder {
    fn calc_predicate(&self, request: CalcPredicate) {
        self.inner.lock().calc.push(request);
    }

    fn propose_config(&self, request: ProposePartitionConfig) {
        self.inner.lock().configs.push(request);
    }

    fn commit_tx(&self, request: CommitTx) {
        let mut inner = self.inner.lock();
        inner
            .executions
            .push((request.tx_id, request.partition_id, true));
        inner.commits.push(request);
    }

    fn rollback_tx(&self, request: RollbackTx) {
        let mut inner = self.inner.lock();
        inner
            .executions
            .push((request.tx_id, request.partition_id, false));
        inner.rollbacks.push(request);
    }

    fn create_supportive_partition(
        &self,
        parent: PartitionId,
        supportive: PartitionId,
        write_id: WriteId,
    ) {
        self.inner
            .lock()
            .created
            .push((parent, supportive, write_id));
    }

    fn delete_supportive_partition(&self, supportive: PartitionId, write_id: WriteId) {
        self.inner.lock().deleted.push((supportive, write_id));
    }
}

impl ClientLink for Recorder {
    fn propose_result(&self, result: ProposeResult) {
        self.inner.lock().results.push(result);
    }

    fn plan_step_ack(&self, ack: PlanStepAck) {
        self.inner.lock().plan_acks.push(ack);
    }

    fn plan_step_accepted(&self, accepted: PlanStepAccepted) {
        self.inner.lock().plan_accepted.push(accepted);
    }

    fn drop_tablet_reply(&self, reply: DropTabletReply) {
        self.inner.lock().drops.push(reply);
    }
}

// ============================================================================
// Single tablet harness
// ============================================================================

/// Topic whose partitions `0..4` live on [`TABLET`]
pub fn topic() -> TopicConfig {
    TopicConfig::single_tablet(TOPIC, TABLET, 4)
}

/// One tablet driven directly through its manager
pub struct Harness {
    pub config: TabletConfig,
    pub topic: TopicConfig,
    pub store: Arc<InMemoryTxStore>,
    pub links: Recorder,
    pub manager: TxManager,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(TabletConfig::in_memory(TABLET)).await
    }

    pub async fn with_config(config: TabletConfig) -> Self {
        let store = Arc::new(InMemoryTxStore::new());
        Self::with_store(config, topic(), store).await
    }

    pub async fn with_store(
        config: TabletConfig,
        topic: TopicConfig,
        store: Arc<InMemoryTxStore>,
    ) -> Self {
        let links = Recorder::default();
        let manager = TxManager::boot(
            &config,
            store.clone() as Arc<dyn TxStore>,
            links.links(),
            topic.clone(),
        )
        .await
        .expect("boot tablet");
        Self {
            config,
            topic,
            store,
            links,
            manager,
        }
    }

    /// Throw away every in-memory structure and boot again from the store
    pub async fn restart(&mut self) {
        let links = Recorder::default();
        self.manager = TxManager::boot(
            &self.config,
            self.store.clone() as Arc<dyn TxStore>,
            links.links(),
            self.topic.clone(),
        )
        .await
        .expect("reboot tablet");
        self.links = links;
    }

    pub async fn propose(&mut self, request: ProposeRequest) {
        self.manager.propose(request).await.expect("propose");
    }

    /// Propose a plain write to partition 0 with the given peers
    pub async fn propose_write(&mut self, tx_id: TxId, peers: &[TabletId]) {
        self.propose(
            ProposeRequest::data(tx_id, vec![pq_tablet::TxOperation::write(0)])
                .with_peers(peers.iter().copied()),
        )
        .await;
    }

    pub async fn plan(&mut self, step: Step, tx_ids: &[TxId]) {
        self.manager
            .plan_step(step, tx_ids.to_vec())
            .await
            .expect("plan step");
    }

    /// Answer every outstanding predicate and config request
    pub async fn answer(&mut self, predicate: impl Fn(TxId, PartitionId) -> bool) {
        loop {
            let (calc, configs) =
                self.links
                    .with(|r| (std::mem::take(&mut r.calc), std::mem::take(&mut r.configs)));
            if calc.is_empty() && configs.is_empty() {
                break;
            }
            for request in calc {
                self.manager
                    .calc_predicate_result(CalcPredicateResult {
                        step: request.step,
                        tx_id: request.tx_id,
                        partition_id: request.partition_id,
                        predicate: predicate(request.tx_id, request.partition_id),
                    })
                    .await
                    .expect("predicate result");
            }
            for request in configs {
                self.manager
                    .propose_config_result(ProposePartitionConfigResult {
                        step: request.step,
                        tx_id: request.tx_id,
                        partition_id: request.partition_id,
                        applied: predicate(request.tx_id, request.partition_id),
                    })
                    .await
                    .expect("config result");
            }
        }
    }

    /// Confirm every outstanding commit and rollback
    pub async fn complete(&mut self) {
        loop {
            let done: Vec<TxDone> = self.links.with(|r| {
                let commits = std::mem::take(&mut r.commits).into_iter().map(|c| TxDone {
                    step: c.step,
                    tx_id: c.tx_id,
                    partition_id: c.partition_id,
                });
                let rollbacks = std::mem::take(&mut r.rollbacks).into_iter().map(|c| TxDone {
                    step: c.step,
                    tx_id: c.tx_id,
                    partition_id: c.partition_id,
                });
                commits.chain(rollbacks).collect()
            });
            if done.is_empty() {
                break;
            }
            for done in done {
                self.manager.tx_done(done).await.expect("tx done");
            }
        }
    }

    /// Answer and complete until nothing is outstanding
    pub async fn settle(&mut self, predicate: impl Fn(TxId, PartitionId) -> bool + Copy) {
        loop {
            self.answer(predicate).await;
            self.complete().await;
            let idle = self
                .links
                .with(|r| r.calc.is_empty() && r.configs.is_empty() && r.commits.is_empty() && r.rollbacks.is_empty());
            if idle {
                break;
            }
        }
    }

    pub async fn settle_commit(&mut self) {
        self.settle(|_, _| true).await;
    }

    pub async fn read_set(&mut self, source: TabletId, step: Step, tx_id: TxId, decision: Decision) {
        let read_set = ReadSet::new(step, tx_id, source, TABLET, decision).expect("encode read set");
        self.manager.read_set(read_set).await.expect("read set");
    }

    /// Acknowledge our read set on behalf of `consumer`
    pub async fn ack(&mut self, consumer: TabletId, step: Step, tx_id: TxId) {
        self.manager
            .read_set_ack(ReadSetAck {
                step,
                tx_id,
                source: TABLET,
                target: consumer,
                consumer,
            })
            .await
            .expect("read set ack");
    }

    pub fn state(&self, tx_id: TxId) -> Option<pq_tablet::TransactionState> {
        self.manager.tx_state(tx_id)
    }
}

// ============================================================================
// Multi-tablet cluster
// ============================================================================

/// A running tablet of a [`Cluster`]
pub struct Node {
    pub handle: TabletHandle,
    pub partitions: Arc<LocalPartitions>,
    pub replies: mpsc::UnboundedReceiver<ClientEvent>,
    pub task: JoinHandle<pq_tablet::Result<()>>,
    pub store: Arc<InMemoryTxStore>,
}

/// Tablets sharing one topic, connected through a [`LocalRouter`]
pub struct Cluster {
    pub router: LocalRouter,
    pub topic: TopicConfig,
    pub nodes: Vec<(TabletId, Node)>,
}

impl Cluster {
    /// `tablets[i]` owns partition `i`
    pub async fn start(tablets: &[TabletId]) -> Self {
        let mut topic = TopicConfig::new(TOPIC, 1).with_consumer("reader");
        for (partition_id, tablet_id) in tablets.iter().enumerate() {
            topic = topic.with_partition(partition_id as PartitionId, *tablet_id);
        }

        let mut cluster = Self {
            router: LocalRouter::new(),
            topic,
            nodes: Vec::new(),
        };
        for &tablet_id in tablets {
            let node = cluster
                .boot(tablet_id, Arc::new(InMemoryTxStore::new()))
                .await;
            cluster.nodes.push((tablet_id, node));
        }
        cluster
    }

    async fn boot(&self, tablet_id: TabletId, store: Arc<InMemoryTxStore>) -> Node {
        let mut config = TabletConfig::in_memory(tablet_id);
        config.wakeup_interval_ms = 60_000;

        let (handle, inbox) = TabletHandle::channel(tablet_id);
        let partitions = Arc::new(LocalPartitions::new(handle.clone(), &self.topic));
        let (client, replies) = ChannelClient::new();
        let links = TabletLinks {
            peers: self.router.as_peer_link(),
            partitions: partitions.clone(),
            client: Arc::new(client),
        };
        let tablet = Tablet::boot(
            &config,
            store.clone() as Arc<dyn TxStore>,
            links,
            self.topic.clone(),
            inbox,
        )
        .await
        .expect("boot tablet");
        self.router.register(handle.clone());
        Node {
            handle,
            partitions,
            replies,
            task: tablet.spawn(),
            store,
        }
    }

    pub fn node(&mut self, tablet_id: TabletId) -> &mut Node {
        self.nodes
            .iter_mut()
            .find(|(id, _)| *id == tablet_id)
            .map(|(_, node)| node)
            .expect("unknown tablet")
    }

    pub fn tablet_ids(&self) -> Vec<TabletId> {
        self.nodes.iter().map(|(id, _)| *id).collect()
    }

    /// Stop a tablet and boot it again from its store
    pub async fn restart(&mut self, tablet_id: TabletId) {
        let store = {
            let node = self.node(tablet_id);
            node.handle.shutdown().expect("shutdown");
            node.store.clone()
        };
        let index = self
            .nodes
            .iter()
            .position(|(id, _)| *id == tablet_id)
            .expect("unknown tablet");
        let (_, old) = self.nodes.remove(index);
        old.task.await.expect("join").expect("clean stop");

        let node = self.boot(tablet_id, store).await;
        self.nodes.insert(index, (tablet_id, node));
    }

    /// Stop a tablet for good; peers are told it is dead
    pub async fn stop(&mut self, tablet_id: TabletId) {
        let index = self
            .nodes
            .iter()
            .position(|(id, _)| *id == tablet_id)
            .expect("unknown tablet");
        let (_, node) = self.nodes.remove(index);
        node.handle.shutdown().expect("shutdown");
        node.task.await.expect("join").expect("clean stop");
        self.router.unregister(tablet_id);
    }

    pub async fn shutdown(self) {
        for (_, node) in self.nodes {
            let _ = node.handle.shutdown();
            let _ = node.task.await;
        }
    }
}

impl Node {
    /// Wait for the next final propose status of `tx_id`
    pub async fn final_status(&mut self, tx_id: TxId) -> ProposeStatus {
        loop {
            let event = tokio::time::timeout(Duration::from_secs(5), self.replies.recv())
                .await
                .expect("timed out waiting for a reply")
                .expect("reply channel closed");
            if let ClientEvent::ProposeResult(result) = event {
                if result.tx_id == tx_id && result.status.is_final() {
                    return result.status;
                }
            }
        }
    }

    /// Wait until `tx_id` is forgotten by the tablet
    pub async fn wait_deleted(&self, tx_id: TxId) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if self.handle.tx_state(tx_id).await.expect("tablet running").is_none() {
                return;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "transaction {} was never deleted",
                tx_id
            );
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}
