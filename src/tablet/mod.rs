//! Tablet event loop
//!
//! A [`Tablet`] owns one [`TxManager`] and feeds it events from an unbounded
//! inbox, one at a time, plus a periodic wake-up for the supportive
//! partition reaper. Everything outside the tablet talks to it through a
//! cloneable [`TabletHandle`].
//!
//! A handler error (in practice a failed store write) stops the tablet.
//! The in-memory state is then discarded and a new tablet recovers from
//! the store.

mod router;

pub use router::LocalRouter;

use crate::config::TabletConfig;
use crate::error::{Result, TabletError};
use crate::partition::{CalcPredicateResult, ProposePartitionConfigResult, TopicConfig, TxDone};
use crate::peer::{ReadSet, ReadSetAck};
use crate::storage::TxStore;
use crate::supportive::{OwnershipRequest, OwnershipResponse};
use crate::transaction::{
    ManagerStatsSnapshot, ProposeRequest, TabletLinks, TransactionState, TxManager,
};
use crate::types::{Decision, Step, TabletId, TxId};

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, info};

/// Receiving end of a tablet's inbox
pub type TabletInbox = mpsc::UnboundedReceiver<TabletEvent>;

/// Current wall-clock time in milliseconds
pub fn now_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Everything a tablet reacts to
#[derive(Debug)]
pub enum TabletEvent {
    Propose(ProposeRequest),
    PlanStep {
        step: Step,
        tx_ids: Vec<TxId>,
    },
    ReadSet(ReadSet),
    ReadSetAck(ReadSetAck),
    CalcPredicateResult(CalcPredicateResult),
    ProposeConfigResult(ProposePartitionConfigResult),
    TxDone(TxDone),
    CancelProposal {
        tx_id: TxId,
    },
    DropTablet {
        tx_id: TxId,
    },
    PeerDisconnected {
        peer: TabletId,
        dead: bool,
    },
    ForceSendReadSet {
        step: Step,
        tx_id: TxId,
        target: Option<TabletId>,
        reply: oneshot::Sender<bool>,
    },
    InjectReadSet {
        step: Step,
        tx_id: TxId,
        sender: Option<TabletId>,
        decision: Decision,
        reply: oneshot::Sender<bool>,
    },
    GetOwnership {
        request: OwnershipRequest,
        reply: oneshot::Sender<OwnershipResponse>,
    },
    GetTxState {
        tx_id: TxId,
        reply: oneshot::Sender<Option<TransactionState>>,
    },
    GetStats {
        reply: oneshot::Sender<ManagerStatsSnapshot>,
    },
    /// Run the reaper as if the clock read `now_ms`
    Wakeup {
        now_ms: i64,
    },
    Shutdown,
}

/// Cloneable sender side of a tablet
#[derive(Debug, Clone)]
pub struct TabletHandle {
    tablet_id: TabletId,
    sender: mpsc::UnboundedSender<TabletEvent>,
}

impl TabletHandle {
    /// Create a handle and the inbox it feeds
    pub fn channel(tablet_id: TabletId) -> (Self, TabletInbox) {
        let (sender, inbox) = mpsc::unbounded_channel();
        (Self { tablet_id, sender }, inbox)
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    /// Whether the tablet behind this handle has stopped
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    pub fn send(&self, event: TabletEvent) -> Result<()> {
        self.sender
            .send(event)
            .map_err(|_| TabletError::TabletStopped(self.tablet_id))
    }

    pub fn propose(&self, request: ProposeRequest) -> Result<()> {
        self.send(TabletEvent::Propose(request))
    }

    pub fn plan_step(&self, step: Step, tx_ids: Vec<TxId>) -> Result<()> {
        self.send(TabletEvent::PlanStep { step, tx_ids })
    }

    pub fn cancel_proposal(&self, tx_id: TxId) -> Result<()> {
        self.send(TabletEvent::CancelProposal { tx_id })
    }

    pub fn drop_tablet(&self, tx_id: TxId) -> Result<()> {
        self.send(TabletEvent::DropTablet { tx_id })
    }

    pub fn wakeup_at(&self, now_ms: i64) -> Result<()> {
        self.send(TabletEvent::Wakeup { now_ms })
    }

    pub fn shutdown(&self) -> Result<()> {
        self.send(TabletEvent::Shutdown)
    }

    async fn request<T>(
        &self,
        make: impl FnOnce(oneshot::Sender<T>) -> TabletEvent,
    ) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.send(make(reply))?;
        response
            .await
            .map_err(|_| TabletError::TabletStopped(self.tablet_id))
    }

    pub async fn force_send_read_set(
        &self,
        step: Step,
        tx_id: TxId,
        target: Option<TabletId>,
    ) -> Result<bool> {
        self.request(|reply| TabletEvent::ForceSendReadSet {
            step,
            tx_id,
            target,
            reply,
        })
        .await
    }

    pub async fn inject_read_set(
        &self,
        step: Step,
        tx_id: TxId,
        sender: Option<TabletId>,
        decision: Decision,
    ) -> Result<bool> {
        self.request(|reply| TabletEvent::InjectReadSet {
            step,
            tx_id,
            sender,
            decision,
            reply,
        })
        .await
    }

    pub async fn get_ownership(&self, request: OwnershipRequest) -> Result<OwnershipResponse> {
        self.request(|reply| TabletEvent::GetOwnership { request, reply })
            .await
    }

    pub async fn tx_state(&self, tx_id: TxId) -> Result<Option<TransactionState>> {
        self.request(|reply| TabletEvent::GetTxState { tx_id, reply })
            .await
    }

    pub async fn stats(&self) -> Result<ManagerStatsSnapshot> {
        self.request(|reply| TabletEvent::GetStats { reply }).await
    }
}

/// One running tablet
pub struct Tablet {
    manager: TxManager,
    inbox: TabletInbox,
    wakeup_interval: Duration,
}

impl Tablet {
    pub fn new(manager: TxManager, inbox: TabletInbox, wakeup_interval: Duration) -> Self {
        Self {
            manager,
            inbox,
            wakeup_interval,
        }
    }

    /// Recover a tablet from `store`
    pub async fn boot(
        config: &TabletConfig,
        store: Arc<dyn TxStore>,
        links: TabletLinks,
        bootstrap: TopicConfig,
        inbox: TabletInbox,
    ) -> Result<Self> {
        let manager = TxManager::boot(config, store, links, bootstrap).await?;
        Ok(Self::new(manager, inbox, config.wakeup_interval()))
    }

    pub fn manager(&self) -> &TxManager {
        &self.manager
    }

    /// Run the event loop on a new task
    pub fn spawn(self) -> JoinHandle<Result<()>> {
        tokio::spawn(self.run())
    }

    /// Process events until shutdown, inbox closure or a handler error
    pub async fn run(mut self) -> Result<()> {
        let tablet_id = self.manager.tablet_id();
        let mut wakeup = interval(self.wakeup_interval);
        wakeup.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick completes immediately
        wakeup.tick().await;

        info!(tablet_id, "Tablet started");

        loop {
            tokio::select! {
                event = self.inbox.recv() => {
                    let event = match event {
                        None | Some(TabletEvent::Shutdown) => break,
                        Some(event) => event,
                    };
                    if let Err(e) = self.handle(event).await {
                        error!(tablet_id, error = %e, "Tablet stopped on error");
                        return Err(e);
                    }
                }
                _ = wakeup.tick() => {
                    if let Err(e) = self.manager.wakeup(now_ms()).await {
                        error!(tablet_id, error = %e, "Tablet stopped on error");
                        return Err(e);
                    }
                }
            }
        }

        info!(tablet_id, "Tablet stopped");
        Ok(())
    }

    async fn handle(&mut self, event: TabletEvent) -> Result<()> {
        match event {
            TabletEvent::Propose(request) => self.manager.propose(request).await,
            TabletEvent::PlanStep { step, tx_ids } => self.manager.plan_step(step, tx_ids).await,
            TabletEvent::ReadSet(read_set) => self.manager.read_set(read_set).await,
            TabletEvent::ReadSetAck(ack) => self.manager.read_set_ack(ack).await,
            TabletEvent::CalcPredicateResult(result) => {
                self.manager.calc_predicate_result(result).await
            }
            TabletEvent::ProposeConfigResult(result) => {
                self.manager.propose_config_result(result).await
            }
            TabletEvent::TxDone(done) => self.manager.tx_done(done).await,
            TabletEvent::CancelProposal { tx_id } => self.manager.cancel_proposal(tx_id).await,
            TabletEvent::DropTablet { tx_id } => self.manager.drop_tablet(tx_id).await,
            TabletEvent::PeerDisconnected { peer, dead } => {
                self.manager.peer_disconnected(peer, dead).await
            }
            TabletEvent::ForceSendReadSet {
                step,
                tx_id,
                target,
                reply,
            } => {
                let accepted = self.manager.force_send_read_set(step, tx_id, target)?;
                let _ = reply.send(accepted);
                Ok(())
            }
            TabletEvent::InjectReadSet {
                step,
                tx_id,
                sender,
                decision,
                reply,
            } => {
                let accepted = self
                    .manager
                    .inject_read_set(step, tx_id, sender, decision)
                    .await?;
                let _ = reply.send(accepted);
                Ok(())
            }
            TabletEvent::GetOwnership { request, reply } => {
                let response = self.manager.get_ownership(request, now_ms()).await?;
                let _ = reply.send(response);
                Ok(())
            }
            TabletEvent::GetTxState { tx_id, reply } => {
                let _ = reply.send(self.manager.tx_state(tx_id));
                Ok(())
            }
            TabletEvent::GetStats { reply } => {
                let _ = reply.send(self.manager.stats().snapshot());
                Ok(())
            }
            TabletEvent::Wakeup { now_ms } => self.manager.wakeup(now_ms).await,
            TabletEvent::Shutdown => {
                debug!("Shutdown handled by the event loop");
                Ok(())
            }
        }
    }
}
