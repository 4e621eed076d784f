//! Durable records of the transaction manager

use crate::client::TabletState;
use crate::supportive::TxWriteInfo;
use crate::transaction::state::TransactionState;
use crate::transaction::tx::TxBody;
use crate::types::{Decision, PartitionId, Step, TabletId, TxId, WriteId};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

/// Persisted form of one transaction, stored under `tx_{id}`
///
/// Only `Prepared`, `Planned`, `WaitRs` and `Executed` are ever written.
/// Peer decisions are stored only with `Executed`: before that, senders
/// keep retransmitting until we acknowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxRecord {
    pub tx_id: TxId,
    pub step: Option<Step>,
    pub state: TransactionState,
    pub body: TxBody,
    pub senders: BTreeSet<TabletId>,
    pub receivers: BTreeSet<TabletId>,
    #[serde(default)]
    pub write_id: Option<WriteId>,
    /// Local predicate, once computed
    #[serde(default)]
    pub predicate: Option<bool>,
    /// Final outcome, once executed
    #[serde(default)]
    pub outcome: Option<Decision>,
    /// Decision of every sender, once executed
    #[serde(default)]
    pub decisions: BTreeMap<TabletId, Decision>,
    /// Senders whose read set arrived, once executed
    #[serde(default)]
    pub supplied: BTreeSet<TabletId>,
    /// Receivers that acknowledged our decision
    #[serde(default)]
    pub acks: BTreeSet<TabletId>,
}

/// Tablet transaction index, stored under `_txinfo`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TabletTxInfo {
    /// Step of the last executed transaction, never decreases
    pub exec_step: Step,
    pub exec_tx_id: TxId,
    /// Highest plan step accepted
    pub plan_step: Step,
    pub tablet_state: TabletState,
    /// Outstanding transaction-write records
    #[serde(default)]
    pub tx_writes: Vec<TxWriteInfo>,
    /// Id of the next supportive partition
    pub next_supportive_partition: PartitionId,
}

impl TabletTxInfo {
    pub fn new(next_supportive_partition: PartitionId) -> Self {
        Self {
            exec_step: 0,
            exec_tx_id: 0,
            plan_step: 0,
            tablet_state: TabletState::Normal,
            tx_writes: Vec::new(),
            next_supportive_partition,
        }
    }

    /// Record the execution of `(step, tx_id)`
    pub fn advance_exec(&mut self, step: Step, tx_id: TxId) {
        if (step, tx_id) > (self.exec_step, self.exec_tx_id) {
            self.exec_step = step;
            self.exec_tx_id = tx_id;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::TxOperation;

    #[test]
    fn test_exec_step_is_monotonic() {
        let mut info = TabletTxInfo::new(100_000);
        info.advance_exec(10, 5);
        info.advance_exec(9, 99);
        assert_eq!((info.exec_step, info.exec_tx_id), (10, 5));
        info.advance_exec(10, 6);
        assert_eq!((info.exec_step, info.exec_tx_id), (10, 6));
    }

    #[test]
    fn test_record_json_keeps_decisions() {
        let record = TxRecord {
            tx_id: 7,
            step: Some(100),
            state: TransactionState::Executed,
            body: TxBody::Data {
                operations: vec![TxOperation::write(0)],
            },
            senders: [2, 3].into_iter().collect(),
            receivers: [2].into_iter().collect(),
            write_id: None,
            predicate: Some(true),
            outcome: Some(Decision::Abort),
            decisions: [(2, Decision::Commit), (3, Decision::Abort)]
                .into_iter()
                .collect(),
            supplied: [2].into_iter().collect(),
            acks: BTreeSet::new(),
        };

        let json = serde_json::to_vec(&record).unwrap();
        let decoded: TxRecord = serde_json::from_slice(&json).unwrap();
        assert_eq!(decoded.decisions.get(&3), Some(&Decision::Abort));
        assert_eq!(decoded, record);
    }
}
