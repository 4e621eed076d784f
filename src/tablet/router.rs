//! In-process transport between tablets

use super::{TabletEvent, TabletHandle};
use crate::peer::{PeerLink, ReadSet, ReadSetAck};
use crate::types::TabletId;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::{debug, info};

/// Routes read sets and acks between tablets of one process
///
/// Registering a tablet tells every other tablet it (re)connected, which
/// makes them re-send what they owe it. A read set for a tablet that is not
/// registered is reported back to its sender as a dead peer, so register
/// every tablet before starting traffic.
#[derive(Debug, Clone, Default)]
pub struct LocalRouter {
    tablets: Arc<DashMap<TabletId, TabletHandle>>,
}

impl LocalRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle of a registered tablet
    pub fn get(&self, tablet_id: TabletId) -> Option<TabletHandle> {
        self.tablets.get(&tablet_id).map(|h| h.value().clone())
    }

    /// Register (or replace after a restart) a tablet
    pub fn register(&self, handle: TabletHandle) {
        let tablet_id = handle.tablet_id();
        let restarted = self.tablets.insert(tablet_id, handle).is_some();
        if restarted {
            info!(tablet_id, "Tablet reconnected");
            self.notify_others(tablet_id, false);
        }
    }

    /// Remove a tablet for good; peers stop waiting for it
    pub fn unregister(&self, tablet_id: TabletId) {
        if self.tablets.remove(&tablet_id).is_some() {
            info!(tablet_id, "Tablet is gone");
            self.notify_others(tablet_id, true);
        }
    }

    fn notify_others(&self, peer: TabletId, dead: bool) {
        let others: Vec<TabletHandle> = self
            .tablets
            .iter()
            .filter(|entry| *entry.key() != peer)
            .map(|entry| entry.value().clone())
            .collect();
        for handle in others {
            let _ = handle.send(TabletEvent::PeerDisconnected { peer, dead });
        }
    }

    fn deliver(&self, target: TabletId, event: TabletEvent) -> bool {
        match self.get(target) {
            Some(handle) => {
                if handle.send(event).is_err() {
                    debug!(target, "Peer not running, dropping message");
                }
                true
            }
            None => false,
        }
    }

    pub fn as_peer_link(&self) -> Arc<dyn PeerLink> {
        Arc::new(self.clone())
    }
}

impl PeerLink for LocalRouter {
    fn send_read_set(&self, read_set: ReadSet) {
        let (source, target) = (read_set.source, read_set.target);
        if !self.deliver(target, TabletEvent::ReadSet(read_set)) {
            debug!(source, target, "Read set for unknown tablet");
            self.deliver(
                source,
                TabletEvent::PeerDisconnected {
                    peer: target,
                    dead: true,
                },
            );
        }
    }

    fn send_read_set_ack(&self, ack: ReadSetAck) {
        if !self.deliver(ack.source, TabletEvent::ReadSetAck(ack)) {
            debug!(target = ack.source, tx_id = ack.tx_id, "Ack for unknown tablet dropped");
        }
    }
}
