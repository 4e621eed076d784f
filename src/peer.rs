//! Peer decision exchange
//!
//! Every tablet taking part in a distributed transaction sends its local
//! decision to each receiver named in the proposal (a [`ReadSet`]) and
//! acknowledges every decision it receives with a [`ReadSetAck`] once its
//! own outcome is durable. Delivery is at-least-once; both messages are
//! idempotent on the receiving side.

use crate::error::Result;
use crate::types::{Decision, Step, TabletId, TxId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Opaque payload carried by a [`ReadSet`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadSetData {
    pub decision: Decision,
}

/// Decision record sent from `source` to `target`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadSet {
    pub step: Step,
    pub tx_id: TxId,
    /// Tablet that sends the decision
    pub source: TabletId,
    /// Tablet that must receive it
    pub target: TabletId,
    /// Tablet whose decision this is
    pub producer: TabletId,
    /// Serialized [`ReadSetData`]
    pub payload: Bytes,
}

impl ReadSet {
    /// Build a decision record produced by `source`
    pub fn new(
        step: Step,
        tx_id: TxId,
        source: TabletId,
        target: TabletId,
        decision: Decision,
    ) -> Result<Self> {
        let payload = serde_json::to_vec(&ReadSetData { decision })?;
        Ok(Self {
            step,
            tx_id,
            source,
            target,
            producer: source,
            payload: Bytes::from(payload),
        })
    }

    /// Decode the carried decision
    ///
    /// A payload that cannot be decoded counts as an abort.
    pub fn decision(&self) -> Decision {
        match serde_json::from_slice::<ReadSetData>(&self.payload) {
            Ok(data) => data.decision,
            Err(e) => {
                warn!(
                    tx_id = self.tx_id,
                    source = self.source,
                    error = %e,
                    "Undecodable read set payload, treating as abort"
                );
                Decision::Abort
            }
        }
    }

    /// Acknowledgment for this record, sent back by `consumer`
    pub fn ack(&self, consumer: TabletId) -> ReadSetAck {
        ReadSetAck {
            step: self.step,
            tx_id: self.tx_id,
            source: self.source,
            target: self.target,
            consumer,
        }
    }
}

/// Acknowledgment of a [`ReadSet`]
///
/// `source` and `target` repeat the acknowledged record; the ack travels
/// back to `source`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSetAck {
    pub step: Step,
    pub tx_id: TxId,
    pub source: TabletId,
    pub target: TabletId,
    /// Tablet that consumed the decision
    pub consumer: TabletId,
}

/// Outbound messages to other tablets
///
/// Sends never block and never fail from the caller's point of view. A
/// transport that loses the peer reports it back to the sender as a
/// disconnect (see `TxManager::peer_disconnected`).
pub trait PeerLink: Send + Sync {
    fn send_read_set(&self, read_set: ReadSet);

    fn send_read_set_ack(&self, ack: ReadSetAck);
}
