//! Replies to proposers, the sequencer and administrators

use crate::types::{Step, TabletId, TxId};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Status carried by a [`ProposeResult`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProposeStatus {
    /// Accepted and durable, waiting for a plan step
    Prepared,
    /// Rejected, or agreement reached an abort
    Aborted,
    /// Rejected because the tablet is at its in-flight cap; retry later
    Overloaded,
    /// Agreement reached a commit and it has been applied
    Complete,
}

impl ProposeStatus {
    /// Whether no further result follows this one
    pub fn is_final(&self) -> bool {
        !matches!(self, ProposeStatus::Prepared)
    }
}

/// Answer to a proposal
///
/// An accepted transaction gets two of these: PREPARED, then COMPLETE or
/// ABORTED once agreement finishes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProposeResult {
    pub tx_id: TxId,
    pub tablet_id: TabletId,
    pub status: ProposeStatus,
    /// Why a proposal was rejected
    pub reason: Option<String>,
}

/// Acknowledgment of a plan step to the sequencer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanStepAck {
    pub step: Step,
    pub tablet_id: TabletId,
    pub tx_ids: Vec<TxId>,
}

/// The tablet durably accepted a plan step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PlanStepAccepted {
    pub step: Step,
    pub tablet_id: TabletId,
}

/// Lifecycle state of a tablet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TabletState {
    #[default]
    Normal,
    Dropped,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropStatus {
    Ok,
}

/// Answer to a drop-tablet request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DropTabletReply {
    pub status: DropStatus,
    /// Administrative transaction id of the request
    pub tx_id: TxId,
    pub tablet_id: TabletId,
    pub state: TabletState,
}

/// Outbound replies from the transaction manager
pub trait ClientLink: Send + Sync {
    fn propose_result(&self, result: ProposeResult);

    fn plan_step_ack(&self, ack: PlanStepAck);

    fn plan_step_accepted(&self, accepted: PlanStepAccepted);

    fn drop_tablet_reply(&self, reply: DropTabletReply);
}

/// Any reply a tablet sends to its clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    ProposeResult(ProposeResult),
    PlanStepAck(PlanStepAck),
    PlanStepAccepted(PlanStepAccepted),
    DropTabletReply(DropTabletReply),
}

/// [`ClientLink`] that forwards every reply into a channel
#[derive(Debug, Clone)]
pub struct ChannelClient {
    sender: mpsc::UnboundedSender<ClientEvent>,
}

impl ChannelClient {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ClientEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    fn forward(&self, event: ClientEvent) {
        if self.sender.send(event).is_err() {
            debug!("Client receiver closed, dropping reply");
        }
    }
}

impl ClientLink for ChannelClient {
    fn propose_result(&self, result: ProposeResult) {
        self.forward(ClientEvent::ProposeResult(result));
    }

    fn plan_step_ack(&self, ack: PlanStepAck) {
        self.forward(ClientEvent::PlanStepAck(ack));
    }

    fn plan_step_accepted(&self, accepted: PlanStepAccepted) {
        self.forward(ClientEvent::PlanStepAccepted(accepted));
    }

    fn drop_tablet_reply(&self, reply: DropTabletReply) {
        self.forward(ClientEvent::DropTabletReply(reply));
    }
}
