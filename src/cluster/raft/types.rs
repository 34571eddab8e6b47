//! Type definitions for the Raft consensus layer.

use openraft::BasicNode;
use std::io::Cursor;

use super::commands::{MetadataCommand, MetadataResponse};
use crate::types::BrokerId;

/// Node ID type for Raft nodes. Always the broker id widened to `u64`.
pub type RaftNodeId = u64;

openraft::declare_raft_types!(
    pub TypeConfig:
        D = MetadataCommand,
        R = MetadataResponse,
        NodeId = RaftNodeId,
        Node = BasicNode,
        SnapshotData = Cursor<Vec<u8>>,
);

/// Broker ids are validated non-negative, so the mapping is lossless.
pub fn node_id_for(broker_id: BrokerId) -> RaftNodeId {
    broker_id as RaftNodeId
}

pub fn broker_id_for(node_id: RaftNodeId) -> BrokerId {
    node_id as BrokerId
}
