//! Distributed transactions of a PQ tablet
//!
//! This module drives transactions that span partitions owned by
//! different tablets through agreement and durable execution:
//!
//! - Proposal validation and admission control
//! - Step-ordered execution bound to sequencer plan steps
//! - Decision exchange (read sets) with every peer tablet
//! - Restart recovery from the durable records

mod manager;
pub mod record;
mod state;
mod tx;

pub use manager::{ManagerStats, ManagerStatsSnapshot, TabletLinks, TxManager};
pub use record::{TabletTxInfo, TxRecord};
pub use state::TransactionState;
pub use tx::{DistributedTx, ProposeRequest, TxBody};
