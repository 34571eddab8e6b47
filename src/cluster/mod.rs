//! Replicated broker cluster.
//!
//! # Architecture
//!
//! ```text
//!        producers / consumers
//!                 │
//!   ┌─────────────┼─────────────┐
//!   ▼             ▼             ▼
//! ┌─────────┐ ┌─────────┐ ┌─────────┐
//! │Broker 1 │ │Broker 2 │ │Broker 3 │  ◄── SWIM gossip (UDP)
//! │ logs    │ │ logs    │ │ logs    │  ◄── replication RPC (TCP)
//! └────┬────┘ └────┬────┘ └────┬────┘
//!      └───────────┼───────────┘
//!                  ▼
//!           ┌────────────┐
//!           │ Raft group │  brokers, topics, leaders, epochs
//!           └────────────┘
//! ```
//!
//! - **Metadata** lives in an embedded Raft group ([`raft`]). It is the only
//!   authority on which broker leads a partition, and at which epoch.
//! - **Membership** is gossiped with SWIM ([`membership`]). It finds peers
//!   and hurries the controller along, but never decides leadership.
//! - **Partition logs** ([`partition_log`]) sit on top of the segment store.
//!   Leaders assign offsets and push records to followers; followers check
//!   their log against the leader's epoch history and then fetch.
//! - The **controller** ([`controller`]) fences silent brokers and moves
//!   leadership; the **reconciler** ([`reconciler`]) makes each broker host
//!   what committed metadata says.
//!
//! # Usage
//!
//! ```rust,no_run
//! use ledgerline::cluster::{Broker, BrokerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = BrokerConfig::from_env()?;
//!     let broker = Broker::start(config).await?;
//!     tokio::signal::ctrl_c().await?;
//!     broker.shutdown().await?;
//!     Ok(())
//! }
//! ```

pub mod assignment;
pub mod background_tasks;
mod broker;
mod config;
pub mod controller;
mod error;
pub mod failure_detector;
pub mod membership;
pub mod metrics;
pub mod partition_log;
pub mod raft;
pub mod reconciler;
pub mod replication;
pub mod retry;
pub mod rpc;

pub use broker::Broker;
pub use config::{BrokerConfig, BrokerProfile};
pub use controller::{Controller, ControllerReport};
pub use error::{BrokerError, BrokerResult, LeaderHint};
pub use failure_detector::{BrokerHealthState, FailureDetector};
pub use membership::{GossipConfig, Membership, MembershipEvent, NodeMeta};
pub use partition_log::{AckPolicy, PartitionLog, PartitionMap, PartitionOptions, Role};
pub use raft::{MetadataSnapshot, RaftConfig, RaftNode};
pub use reconciler::{ReconcileReport, Reconciler};
