#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

//! # pq-tablet
//!
//! Transaction coordination core of a persistent-queue tablet. A tablet owns
//! a set of partitions of one topic and takes part in distributed
//! transactions that span partitions owned by other tablets.
//!
//! ## What a tablet does
//!
//! - **Agreement**: every participant computes a local predicate and sends
//!   its decision (a read set) to every other participant; a transaction
//!   commits only when every decision is commit
//! - **Ordering**: transactions execute in `(step, tx_id)` order, where the
//!   step comes from an external sequencer
//! - **Admission control**: at most `max_in_flight_txs` transactions at a time
//! - **Recovery**: state is persisted before anything observable is sent,
//!   so a restarted tablet re-sends what it owes and finishes what it started
//! - **Supportive partitions**: private staging partitions for writers, with
//!   expiry for abandoned producer transactions
//!
//! ## Library usage
//!
//! ```no_run
//! use pq_tablet::{
//!     ChannelClient, LocalPartitions, LocalRouter, ProposeRequest, Tablet, TabletConfig,
//!     TabletHandle, TabletLinks, TopicConfig, TxOperation,
//! };
//! use std::sync::Arc;
//!
//! # async fn run() -> pq_tablet::Result<()> {
//! let config = TabletConfig::in_memory(1);
//! let topic = TopicConfig::single_tablet("/topic", 1, 2);
//! let router = LocalRouter::new();
//! let (client, _replies) = ChannelClient::new();
//!
//! let (handle, inbox) = TabletHandle::channel(config.tablet_id);
//! let links = TabletLinks {
//!     peers: router.as_peer_link(),
//!     partitions: Arc::new(LocalPartitions::new(handle.clone(), &topic)),
//!     client: Arc::new(client),
//! };
//! let tablet = Tablet::boot(&config, config.open_store()?, links, topic, inbox).await?;
//! router.register(handle.clone());
//! let task = tablet.spawn();
//!
//! handle.propose(ProposeRequest::data(1, vec![TxOperation::write(0)]))?;
//! handle.plan_step(10, vec![1])?;
//! handle.shutdown()?;
//! # let _ = task.await;
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - [`transaction`]: the transaction manager and state machine
//! - [`storage`]: the transactional key-value store it persists to
//! - [`peer`], [`partition`], [`client`]: messages exchanged with the outside
//! - [`supportive`]: supportive partition reservations
//! - [`tablet`]: the event loop and in-process transport

pub mod client;
pub mod config;
pub mod error;
pub mod partition;
pub mod peer;
pub mod storage;
pub mod supportive;
pub mod tablet;
pub mod transaction;
pub mod types;

pub use client::{
    ChannelClient, ClientEvent, ClientLink, DropStatus, DropTabletReply, PlanStepAccepted,
    PlanStepAck, ProposeResult, ProposeStatus, TabletState,
};
pub use config::{ProducerTxnConfig, StorageBackend, TabletConfig};
pub use error::{Result, TabletError};
pub use partition::{
    LocalPartitions, OffsetCommit, PartitionLink, PartitionPlacement, TopicConfig, TxOperation,
};
pub use peer::{PeerLink, ReadSet, ReadSetAck};
pub use storage::{FileTxStore, InMemoryTxStore, TxStore, WriteBatch};
pub use supportive::{OwnershipRequest, OwnershipResponse, OwnershipStatus, TxWriteInfo};
pub use tablet::{LocalRouter, Tablet, TabletEvent, TabletHandle, TabletInbox};
pub use transaction::{
    DistributedTx, ManagerStats, ManagerStatsSnapshot, ProposeRequest, TabletLinks,
    TransactionState, TxManager,
};
pub use types::{Decision, PartitionId, Step, TabletId, TxId, WriteId};
