//! Network transport for the metadata Raft group.
//!
//! Raft RPCs, forwarded client writes and join requests all travel over the
//! shared framed TCP transport in [`crate::cluster::rpc`].

use std::collections::BTreeMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use openraft::BasicNode;
use openraft::Raft;
use openraft::error::{InstallSnapshotError, NetworkError, RPCError, RaftError};
use openraft::network::{RPCOption, RaftNetwork, RaftNetworkFactory};
use openraft::raft::{
    AppendEntriesRequest, AppendEntriesResponse, InstallSnapshotRequest, InstallSnapshotResponse,
    VoteRequest, VoteResponse,
};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::commands::{MetadataCommand, MetadataResponse};
use super::types::{RaftNodeId, TypeConfig};
use crate::cluster::rpc::{ChannelOptions, RpcChannel, RpcService};
use crate::constants::MAX_FORWARD_HOPS;

/// Requests carried on the Raft port.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum RaftRpcMessage {
    AppendEntries(AppendEntriesRequest<TypeConfig>),
    Vote(VoteRequest<RaftNodeId>),
    InstallSnapshot(InstallSnapshotRequest<TypeConfig>),
    /// A write forwarded from a follower to the node it believes leads.
    ///
    /// The receiver rejects it if its own term has moved past
    /// `expected_term` or if it is not the leader, rather than forwarding
    /// again, so writes never bounce between stale views.
    ClientWriteWithTerm {
        command: MetadataCommand,
        expected_term: u64,
        forward_hops: u8,
    },
    /// Ask the leader to add a node as a learner and, if `voter`, promote it.
    JoinCluster {
        node_id: RaftNodeId,
        raft_addr: String,
        voter: bool,
    },
}

/// Error kinds that keep their retry semantics across the wire.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum RpcErrorKind {
    /// The forwarding node's view of the term is stale.
    LeadershipChanged,
    /// This node is not the leader.
    NotLeader {
        leader_id: Option<RaftNodeId>,
        leader_addr: Option<String>,
    },
    ForwardLoopDetected,
    InvalidRequest,
    Internal,
}

impl RpcErrorKind {
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            RpcErrorKind::ForwardLoopDetected | RpcErrorKind::InvalidRequest
        )
    }

    pub fn should_refresh_leader(&self) -> bool {
        matches!(
            self,
            RpcErrorKind::LeadershipChanged | RpcErrorKind::NotLeader { .. }
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcErrorInfo {
    pub kind: RpcErrorKind,
    pub message: String,
}

impl RpcErrorInfo {
    pub fn new(kind: RpcErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn internal(e: impl std::fmt::Display) -> Self {
        Self::new(RpcErrorKind::Internal, e.to_string())
    }

    fn into_io(self) -> io::Error {
        let kind = match self.kind {
            RpcErrorKind::LeadershipChanged | RpcErrorKind::NotLeader { .. } => {
                io::ErrorKind::NotConnected
            }
            RpcErrorKind::ForwardLoopDetected => io::ErrorKind::ConnectionRefused,
            RpcErrorKind::InvalidRequest => io::ErrorKind::InvalidInput,
            RpcErrorKind::Internal => io::ErrorKind::Other,
        };
        io::Error::new(kind, self.message)
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub enum RaftRpcResponse {
    AppendEntries(AppendEntriesResponse<RaftNodeId>),
    Vote(VoteResponse<RaftNodeId>),
    InstallSnapshot(InstallSnapshotResponse<RaftNodeId>),
    ClientWriteOk(MetadataResponse),
    JoinClusterOk,
    Error(RpcErrorInfo),
}

fn channel_options() -> ChannelOptions {
    ChannelOptions::default()
}

/// Creates connections to other Raft nodes and remembers their addresses.
///
/// Channels are cached per node so every `new_client` for the same peer shares
/// one TCP connection and one circuit breaker.
#[derive(Clone, Default)]
pub struct RaftNetworkFactoryImpl {
    channels: Arc<RwLock<BTreeMap<RaftNodeId, Arc<RpcChannel>>>>,
}

impl RaftNetworkFactoryImpl {
    pub fn new() -> Self {
        Self::default()
    }

    /// Channel to `node_id`, replaced if its address changed.
    pub fn channel(&self, node_id: RaftNodeId, addr: &str) -> Arc<RpcChannel> {
        if let Some(channel) = self.channels.read().get(&node_id)
            && channel.target_addr() == addr
        {
            return Arc::clone(channel);
        }
        let channel = Arc::new(RpcChannel::new("raft", addr, channel_options()));
        self.channels.write().insert(node_id, Arc::clone(&channel));
        channel
    }

    pub fn node_addr(&self, node_id: RaftNodeId) -> Option<String> {
        self.channels
            .read()
            .get(&node_id)
            .map(|c| c.target_addr().to_string())
    }
}

impl RaftNetworkFactory<TypeConfig> for RaftNetworkFactoryImpl {
    type Network = RaftNetworkConnection;

    async fn new_client(&mut self, target: RaftNodeId, node: &BasicNode) -> Self::Network {
        RaftNetworkConnection {
            channel: self.channel(target, &node.addr),
        }
    }
}

/// A connection to one remote Raft node.
pub struct RaftNetworkConnection {
    channel: Arc<RpcChannel>,
}

impl RaftNetworkConnection {
    async fn send<E: std::error::Error>(
        &self,
        message: RaftRpcMessage,
    ) -> Result<RaftRpcResponse, RPCError<RaftNodeId, BasicNode, E>> {
        let response: RaftRpcResponse = self
            .channel
            .call(&message)
            .await
            .map_err(|e| RPCError::Network(NetworkError::new(&e)))?;
        match response {
            RaftRpcResponse::Error(info) => Err(RPCError::Network(NetworkError::new(&info.into_io()))),
            other => Ok(other),
        }
    }
}

fn unexpected<E: std::error::Error>() -> RPCError<RaftNodeId, BasicNode, E> {
    RPCError::Network(NetworkError::new(&io::Error::new(
        io::ErrorKind::InvalidData,
        "unexpected response type",
    )))
}

impl RaftNetwork<TypeConfig> for RaftNetworkConnection {
    async fn append_entries(
        &mut self,
        req: AppendEntriesRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<AppendEntriesResponse<RaftNodeId>, RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>>
    {
        match self.send(RaftRpcMessage::AppendEntries(req)).await? {
            RaftRpcResponse::AppendEntries(resp) => Ok(resp),
            _ => Err(unexpected()),
        }
    }

    async fn vote(
        &mut self,
        req: VoteRequest<RaftNodeId>,
        _option: RPCOption,
    ) -> Result<VoteResponse<RaftNodeId>, RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId>>> {
        match self.send(RaftRpcMessage::Vote(req)).await? {
            RaftRpcResponse::Vote(resp) => Ok(resp),
            _ => Err(unexpected()),
        }
    }

    async fn install_snapshot(
        &mut self,
        req: InstallSnapshotRequest<TypeConfig>,
        _option: RPCOption,
    ) -> Result<
        InstallSnapshotResponse<RaftNodeId>,
        RPCError<RaftNodeId, BasicNode, RaftError<RaftNodeId, InstallSnapshotError>>,
    > {
        match self.send(RaftRpcMessage::InstallSnapshot(req)).await? {
            RaftRpcResponse::InstallSnapshot(resp) => Ok(resp),
            _ => Err(unexpected()),
        }
    }
}

/// Forward a write to the node believed to lead at `expected_term`.
pub async fn forward_client_write_with_term(
    channel: &RpcChannel,
    command: MetadataCommand,
    expected_term: u64,
    forward_hops: u8,
) -> io::Result<MetadataResponse> {
    if forward_hops >= MAX_FORWARD_HOPS {
        return Err(io::Error::new(
            io::ErrorKind::ConnectionRefused,
            format!(
                "forward loop detected: request exceeded {} hops",
                MAX_FORWARD_HOPS
            ),
        ));
    }

    let message = RaftRpcMessage::ClientWriteWithTerm {
        command,
        expected_term,
        forward_hops: forward_hops + 1,
    };
    match channel.call(&message).await? {
        RaftRpcResponse::ClientWriteOk(resp) => Ok(resp),
        RaftRpcResponse::Error(info) => Err(info.into_io()),
        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unexpected response type",
        )),
    }
}

/// Ask the node at `peer_addr` to add `node_id` to the group, as a voter
/// or a learner.
///
/// Follows not-leader redirects up to [`MAX_FORWARD_HOPS`] times.
pub async fn request_cluster_join(
    peer_addr: &str,
    node_id: RaftNodeId,
    raft_addr: &str,
    voter: bool,
) -> io::Result<()> {
    let mut target = peer_addr.to_string();
    for _ in 0..=MAX_FORWARD_HOPS {
        let channel = RpcChannel::new(
            "raft-join",
            target.clone(),
            ChannelOptions {
                max_retries: 0,
                ..channel_options()
            },
        );
        let message = RaftRpcMessage::JoinCluster {
            node_id,
            raft_addr: raft_addr.to_string(),
            voter,
        };
        match channel.call(&message).await? {
            RaftRpcResponse::JoinClusterOk => return Ok(()),
            RaftRpcResponse::Error(RpcErrorInfo {
                kind:
                    RpcErrorKind::NotLeader {
                        leader_addr: Some(addr),
                        ..
                    },
                ..
            }) if addr != target => {
                debug!(from = %target, to = %addr, "Join redirected to metadata leader");
                target = addr;
            }
            RaftRpcResponse::Error(info) => return Err(info.into_io()),
            _ => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unexpected response type",
                ));
            }
        }
    }
    Err(io::Error::new(
        io::ErrorKind::ConnectionRefused,
        "join redirected too many times",
    ))
}

/// Serves the Raft port for one node.
pub struct RaftRpcService {
    raft: Raft<TypeConfig>,
}

impl RaftRpcService {
    pub fn new(raft: Raft<TypeConfig>) -> Self {
        Self { raft }
    }

    fn not_leader(&self, leader_id: Option<RaftNodeId>) -> RpcErrorInfo {
        let leader_addr = leader_id.and_then(|id| {
            self.raft
                .metrics()
                .borrow()
                .membership_config
                .membership()
                .nodes()
                .find(|(nid, _)| **nid == id)
                .map(|(_, node)| node.addr.clone())
        });
        let message = match leader_id {
            Some(id) => format!("not the metadata leader, leader is node {}", id),
            None => "not the metadata leader, no leader elected".to_string(),
        };
        RpcErrorInfo::new(
            RpcErrorKind::NotLeader {
                leader_id,
                leader_addr,
            },
            message,
        )
    }

    async fn handle_forwarded_write(
        &self,
        command: MetadataCommand,
        expected_term: u64,
        forward_hops: u8,
    ) -> RaftRpcResponse {
        if forward_hops > MAX_FORWARD_HOPS {
            return RaftRpcResponse::Error(RpcErrorInfo::new(
                RpcErrorKind::ForwardLoopDetected,
                format!(
                    "forward loop detected: {} hops exceeds limit of {}",
                    forward_hops, MAX_FORWARD_HOPS
                ),
            ));
        }

        let (current_term, leader, id) = {
            let metrics = self.raft.metrics();
            let m = metrics.borrow();
            (m.current_term, m.current_leader, m.id)
        };

        if expected_term > 0 && current_term > expected_term {
            warn!(
                expected_term,
                current_term, forward_hops, "Rejecting forwarded write: leadership changed"
            );
            return RaftRpcResponse::Error(RpcErrorInfo::new(
                RpcErrorKind::LeadershipChanged,
                format!(
                    "stale leader: expected term {} but current term is {}",
                    expected_term, current_term
                ),
            ));
        }
        if leader != Some(id) {
            return RaftRpcResponse::Error(self.not_leader(leader));
        }

        match self.raft.client_write(command).await {
            Ok(resp) => {
                crate::cluster::metrics::RAFT_FORWARDED_WRITES
                    .with_label_values(&["accepted"])
                    .inc();
                RaftRpcResponse::ClientWriteOk(resp.data)
            }
            Err(e) => match e.forward_to_leader::<BasicNode>() {
                Some(fwd) => RaftRpcResponse::Error(self.not_leader(fwd.leader_id)),
                None => RaftRpcResponse::Error(RpcErrorInfo::internal(e)),
            },
        }
    }

    /// Add the node as a learner (waiting for it to catch up), then promote
    /// it if it asked to vote.
    async fn handle_join_cluster(
        &self,
        node_id: RaftNodeId,
        raft_addr: String,
        voter: bool,
    ) -> RaftRpcResponse {
        let (leader, id) = {
            let metrics = self.raft.metrics();
            let m = metrics.borrow();
            (m.current_leader, m.id)
        };
        if leader != Some(id) {
            return RaftRpcResponse::Error(self.not_leader(leader));
        }

        info!(node_id, raft_addr = %raft_addr, "Received join cluster request");

        if let Err(e) = self
            .raft
            .add_learner(node_id, BasicNode { addr: raft_addr }, true)
            .await
        {
            if e.to_string().contains("already") {
                info!(node_id, "Node already in cluster");
            } else {
                warn!(node_id, error = %e, "Failed to add learner");
                return RaftRpcResponse::Error(RpcErrorInfo::internal(format!(
                    "failed to add learner: {}",
                    e
                )));
            }
        }

        if !voter {
            info!(node_id, "Node joined as learner");
            return RaftRpcResponse::JoinClusterOk;
        }

        let mut voters: std::collections::BTreeSet<RaftNodeId> = self
            .raft
            .metrics()
            .borrow()
            .membership_config
            .membership()
            .voter_ids()
            .collect();
        if !voters.insert(node_id) {
            info!(node_id, "Node already a voter");
            return RaftRpcResponse::JoinClusterOk;
        }

        match self.raft.change_membership(voters, false).await {
            Ok(_) => {
                info!(node_id, "Promoted node to voter");
                RaftRpcResponse::JoinClusterOk
            }
            Err(e) if e.to_string().contains("already") => RaftRpcResponse::JoinClusterOk,
            Err(e) => {
                warn!(node_id, error = %e, "Failed to promote to voter");
                RaftRpcResponse::Error(RpcErrorInfo::internal(format!(
                    "failed to promote to voter: {}",
                    e
                )))
            }
        }
    }
}

#[async_trait]
impl RpcService for RaftRpcService {
    type Request = RaftRpcMessage;
    type Response = RaftRpcResponse;

    async fn handle(&self, request: RaftRpcMessage) -> RaftRpcResponse {
        match request {
            RaftRpcMessage::AppendEntries(req) => match self.raft.append_entries(req).await {
                Ok(resp) => RaftRpcResponse::AppendEntries(resp),
                Err(e) => RaftRpcResponse::Error(RpcErrorInfo::internal(e)),
            },
            RaftRpcMessage::Vote(req) => match self.raft.vote(req).await {
                Ok(resp) => RaftRpcResponse::Vote(resp),
                Err(e) => RaftRpcResponse::Error(RpcErrorInfo::internal(e)),
            },
            RaftRpcMessage::InstallSnapshot(req) => match self.raft.install_snapshot(req).await {
                Ok(resp) => RaftRpcResponse::InstallSnapshot(resp),
                Err(e) => RaftRpcResponse::Error(RpcErrorInfo::internal(e)),
            },
            RaftRpcMessage::ClientWriteWithTerm {
                command,
                expected_term,
                forward_hops,
            } => {
                self.handle_forwarded_write(command, expected_term, forward_hops)
                    .await
            }
            RaftRpcMessage::JoinCluster {
                node_id,
                raft_addr,
                voter,
            } => {
                self.handle_join_cluster(node_id, raft_addr, voter).await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_factory_reuses_channel_for_same_address() {
        let factory = RaftNetworkFactoryImpl::new();
        let a = factory.channel(1, "127.0.0.1:9093");
        let b = factory.channel(1, "127.0.0.1:9093");
        assert!(Arc::ptr_eq(&a, &b));

        let c = factory.channel(1, "10.0.0.1:9093");
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(factory.node_addr(1).as_deref(), Some("10.0.0.1:9093"));
        assert!(factory.node_addr(2).is_none());
    }

    #[test]
    fn test_factory_clone_shares_channels() {
        let factory = RaftNetworkFactoryImpl::new();
        let cloned = factory.clone();
        factory.channel(3, "127.0.0.1:1");
        assert_eq!(cloned.node_addr(3).as_deref(), Some("127.0.0.1:1"));
    }

    #[test]
    fn test_message_serialization() {
        let msg = RaftRpcMessage::Vote(openraft::raft::VoteRequest {
            vote: openraft::Vote::new(1, 42),
            last_log_id: None,
        });
        let bytes = bincode::serialize(&msg).unwrap();
        match bincode::deserialize::<RaftRpcMessage>(&bytes).unwrap() {
            RaftRpcMessage::Vote(req) => assert_eq!(req.vote, openraft::Vote::new(1, 42)),
            other => panic!("unexpected message: {:?}", other),
        }
    }

    #[test]
    fn test_error_kind_semantics() {
        assert!(RpcErrorKind::LeadershipChanged.should_refresh_leader());
        assert!(
            RpcErrorKind::NotLeader {
                leader_id: None,
                leader_addr: None
            }
            .is_retryable()
        );
        assert!(!RpcErrorKind::ForwardLoopDetected.is_retryable());
        assert!(!RpcErrorKind::InvalidRequest.should_refresh_leader());
    }

    #[tokio::test]
    async fn test_forward_refuses_after_hop_limit() {
        let channel = RpcChannel::new("raft", "127.0.0.1:1", channel_options());
        let err = forward_client_write_with_term(&channel, MetadataCommand::Noop, 1, MAX_FORWARD_HOPS)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
