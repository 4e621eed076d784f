//! Transaction lifecycle states

use serde::{Deserialize, Serialize};

/// Transaction state machine states
///
/// ```text
/// Preparing -> Prepared -> Planned -> Calculating -> WaitRs -> Executing
///     -> Executed -> WaitRsAcks -> Deleting -> (removed)
/// ```
///
/// `Preparing` may also end in removal when the proposal is rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum TransactionState {
    /// Proposal received, being validated
    Preparing,
    /// Accepted and durable, waiting for a plan step
    Prepared,
    /// Bound to a plan step, waiting for its turn
    Planned,
    /// Local partitions are computing the predicate or checking the config
    Calculating,
    /// Local decision sent, waiting for decisions of every sender
    WaitRs,
    /// Outcome known, local partitions are applying it
    Executing,
    /// Outcome durable
    Executed,
    /// Waiting for every receiver to acknowledge our decision
    WaitRsAcks,
    /// Record being removed
    Deleting,
}

impl TransactionState {
    /// Whether a plan step has been assigned
    pub fn is_planned(&self) -> bool {
        *self >= TransactionState::Planned
    }

    /// Whether the outcome is durable
    pub fn is_executed(&self) -> bool {
        *self >= TransactionState::Executed
    }

    /// Whether the local decision is known and has been sent to receivers
    pub fn has_local_decision(&self) -> bool {
        *self >= TransactionState::WaitRs
    }

    /// Whether the transaction may still be cancelled
    pub fn can_cancel(&self) -> bool {
        matches!(
            self,
            TransactionState::Preparing | TransactionState::Prepared
        )
    }

    /// Whether a peer decision may still change the outcome
    pub fn accepts_decisions(&self) -> bool {
        matches!(
            self,
            TransactionState::Prepared
                | TransactionState::Planned
                | TransactionState::Calculating
                | TransactionState::WaitRs
        )
    }
}

impl std::fmt::Display for TransactionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransactionState::Preparing => write!(f, "PREPARING"),
            TransactionState::Prepared => write!(f, "PREPARED"),
            TransactionState::Planned => write!(f, "PLANNED"),
            TransactionState::Calculating => write!(f, "CALCULATING"),
            TransactionState::WaitRs => write!(f, "WAIT_RS"),
            TransactionState::Executing => write!(f, "EXECUTING"),
            TransactionState::Executed => write!(f, "EXECUTED"),
            TransactionState::WaitRsAcks => write!(f, "WAIT_RS_ACKS"),
            TransactionState::Deleting => write!(f, "DELETING"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order() {
        assert!(TransactionState::Planned.is_planned());
        assert!(!TransactionState::Prepared.is_planned());
        assert!(TransactionState::WaitRsAcks.is_executed());
        assert!(!TransactionState::Executing.is_executed());
        assert!(TransactionState::Executing.has_local_decision());
        assert!(!TransactionState::Calculating.has_local_decision());
    }

    #[test]
    fn test_cancel_and_decisions() {
        assert!(TransactionState::Prepared.can_cancel());
        assert!(!TransactionState::Planned.can_cancel());
        assert!(TransactionState::WaitRs.accepts_decisions());
        assert!(!TransactionState::Executing.accepts_decisions());
        assert!(!TransactionState::Executed.accepts_decisions());
    }

    #[test]
    fn test_display() {
        assert_eq!(TransactionState::WaitRsAcks.to_string(), "WAIT_RS_ACKS");
    }
}
