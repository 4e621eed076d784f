//! Identifiers and small value types shared by every tablet component

use serde::{Deserialize, Serialize};
use std::fmt;

/// Caller-assigned, globally unique transaction id
pub type TxId = u64;

/// Global sequence number assigned by the sequencer
pub type Step = u64;

/// Identity of a tablet
pub type TabletId = u64;

/// Queue partition id, local to a topic
pub type PartitionId = u32;

/// Producer id of a transactional producer
pub type ProducerId = i64;

/// Producer epoch of a transactional producer
pub type ProducerEpoch = i16;

/// Identity that binds writes to a writer session or a producer transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WriteId {
    /// Generic writer identity, supportive partitions live until the owning
    /// transaction completes
    Writer { node_id: u64, key_id: u64 },
    /// Kafka-style producer transaction, supportive partitions expire after
    /// the producer transaction timeout
    Producer {
        producer_id: ProducerId,
        epoch: ProducerEpoch,
    },
}

impl WriteId {
    pub fn writer(node_id: u64, key_id: u64) -> Self {
        WriteId::Writer { node_id, key_id }
    }

    pub fn producer(producer_id: ProducerId, epoch: ProducerEpoch) -> Self {
        WriteId::Producer { producer_id, epoch }
    }

    /// Whether records under this id are subject to timeout-based expiry
    pub fn is_producer_txn(&self) -> bool {
        matches!(self, WriteId::Producer { .. })
    }
}

impl fmt::Display for WriteId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WriteId::Writer { node_id, key_id } => write!(f, "writer:{}:{}", node_id, key_id),
            WriteId::Producer { producer_id, epoch } => {
                write!(f, "producer:{}:{}", producer_id, epoch)
            }
        }
    }
}

/// A tablet's vote for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Decision {
    Commit,
    Abort,
    Unknown,
}

impl Decision {
    pub fn from_predicate(predicate: bool) -> Self {
        if predicate {
            Decision::Commit
        } else {
            Decision::Abort
        }
    }

    pub fn is_commit(&self) -> bool {
        matches!(self, Decision::Commit)
    }

    /// Logical AND. Anything other than two commits is an abort.
    pub fn and(self, other: Decision) -> Decision {
        if self.is_commit() && other.is_commit() {
            Decision::Commit
        } else {
            Decision::Abort
        }
    }

    /// Fold a local predicate with every decision received from peers
    pub fn fold<I>(predicate: bool, peers: I) -> Decision
    where
        I: IntoIterator<Item = Decision>,
    {
        peers
            .into_iter()
            .fold(Decision::from_predicate(predicate), Decision::and)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Commit => write!(f, "COMMIT"),
            Decision::Abort => write!(f, "ABORT"),
            Decision::Unknown => write!(f, "UNKNOWN"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decision_and() {
        assert_eq!(Decision::Commit.and(Decision::Commit), Decision::Commit);
        assert_eq!(Decision::Commit.and(Decision::Abort), Decision::Abort);
        assert_eq!(Decision::Commit.and(Decision::Unknown), Decision::Abort);
        assert_eq!(Decision::Unknown.and(Decision::Unknown), Decision::Abort);
    }

    #[test]
    fn test_decision_fold() {
        assert_eq!(Decision::fold(true, []), Decision::Commit);
        assert_eq!(Decision::fold(false, []), Decision::Abort);
        assert_eq!(
            Decision::fold(false, [Decision::Commit, Decision::Commit, Decision::Commit]),
            Decision::Abort
        );
        assert_eq!(
            Decision::fold(true, [Decision::Commit, Decision::Abort, Decision::Commit]),
            Decision::Abort
        );
        assert_eq!(
            Decision::fold(true, [Decision::Commit, Decision::Commit, Decision::Commit]),
            Decision::Commit
        );
    }

    #[test]
    fn test_write_id_kind() {
        assert!(WriteId::producer(7, 0).is_producer_txn());
        assert!(!WriteId::writer(1, 2).is_producer_txn());
        assert_eq!(WriteId::producer(7, 3).to_string(), "producer:7:3");
    }
}
