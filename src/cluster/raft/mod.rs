//! Raft consensus for cluster metadata.
//!
//! Every broker runs a member of one Raft group (voter or learner). The group
//! replicates [`MetadataCommand`]s covering:
//!
//! - Broker registration, heartbeats, fencing and resignation
//! - The topic table: partitions, replica sets, leaders and leader epochs
//!
//! # Architecture
//!
//! ```text
//!   ┌────────────┐   append/vote    ┌────────────┐
//!   │  RaftNode  │◄────────────────►│  RaftNode  │  ...
//!   └─────┬──────┘   (TCP, bincode) └────────────┘
//!         │ apply (commit order)
//!   ┌─────▼────────────────┐  Arc<MetadataSnapshot>   ┌────────────┐
//!   │ MetadataStateMachine │─────────────────────────►│ Reconciler │
//!   └──────────────────────┘                          └────────────┘
//! ```
//!
//! Vote, log entries and snapshots are persisted through `object_store`, so
//! a restarted broker rejoins with its consensus state intact.

mod commands;
mod config;
pub mod domains;
mod network;
mod node;
mod state_machine;
mod storage;
mod types;

pub use commands::{MetadataCommand, MetadataResponse};
pub use config::RaftConfig;
pub use domains::{
    BrokerCommand, BrokerDomainState, BrokerEndpoints, BrokerInfo, BrokerResponse, BrokerStatus,
    PartitionAssignment, TopicCommand, TopicDomainState, TopicInfo, TopicResponse,
};
pub use network::{
    RaftNetworkFactoryImpl, RaftRpcMessage, RaftRpcResponse, RpcErrorInfo, RpcErrorKind,
    request_cluster_join,
};
pub use node::RaftNode;
pub use state_machine::{MetadataSnapshot, MetadataStateMachine};
pub use storage::RaftStore;
pub use types::{RaftNodeId, TypeConfig, broker_id_for, node_id_for};
