//! Error types for the cluster layer.
//!
//! # Classification
//!
//! - **Redirect**: `NotLeaderForPartition`, `StaleLeader`. The caller refreshes
//!   metadata and retries against the hinted leader.
//! - **Transient**: `NoQuorum`, `ElectionTimeout`, `PartitionUnavailable`,
//!   `ReplicationTimeout`, network-level `Rpc` failures. Retried by the caller
//!   or resolved by the protocol itself.
//! - **Recoverable by resync**: `ReplicaTooFarBehind`, `OutOfSequence`. Handled
//!   inside the broker by follower catch-up and never surfaced to clients.
//! - **Fatal to a partition**: `Log` errors for which
//!   [`LogError::is_fatal`](crate::error::LogError::is_fatal) holds. The
//!   partition is marked unavailable, the process keeps running.
//! - **Fatal to the node**: `MetadataStorage`. The node cannot continue without
//!   its own consensus state.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::LogError;
use crate::types::{BrokerId, LeaderEpoch, Offset, TopicPartition};

/// Result type for broker operations.
pub type BrokerResult<T> = Result<T, BrokerError>;

/// Where a client should send requests for a partition instead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeaderHint {
    pub broker_id: BrokerId,
    /// The leader's advertised client address.
    pub addr: String,
}

impl std::fmt::Display for LeaderHint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "broker {} at {}", self.broker_id, self.addr)
    }
}

/// Errors returned by brokers and partition logs.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// Storage error from a partition's segment store.
    #[error("log error: {0}")]
    Log(#[from] LogError),

    /// The sender's epoch is older than the receiver's, or this leader was
    /// deposed and fenced itself.
    #[error("stale leader for {partition}: epoch {epoch} is behind {current_epoch}")]
    StaleLeader {
        partition: TopicPartition,
        epoch: LeaderEpoch,
        current_epoch: LeaderEpoch,
    },

    /// This broker does not lead the partition.
    #[error("not leader for {partition}{}", .leader.as_ref().map(|l| format!(", leader is {}", l)).unwrap_or_default())]
    NotLeaderForPartition {
        partition: TopicPartition,
        leader: Option<LeaderHint>,
    },

    /// The requested offset fell out of the leader's retention.
    #[error("replica of {partition} too far behind: wants {offset}, leader starts at {leader_oldest}")]
    ReplicaTooFarBehind {
        partition: TopicPartition,
        offset: Offset,
        leader_oldest: Offset,
    },

    /// A replicated append skipped ahead of the local log.
    #[error("out of sequence append to {partition}: got offset {offset}, local log ends at {newest}")]
    OutOfSequence {
        partition: TopicPartition,
        offset: Offset,
        newest: Offset,
    },

    /// The partition has no usable leader or its storage has failed.
    #[error("partition {partition} unavailable: {reason}")]
    PartitionUnavailable {
        partition: TopicPartition,
        reason: String,
    },

    #[error("unknown topic or partition {topic}/{partition}")]
    UnknownTopicOrPartition { topic: String, partition: i32 },

    #[error("topic {0} already exists")]
    TopicAlreadyExists(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A replica-quorum append did not collect enough acknowledgements in time.
    #[error("replication of {partition} offset {offset} timed out with {acked}/{required} acks")]
    ReplicationTimeout {
        partition: TopicPartition,
        offset: Offset,
        acked: usize,
        required: usize,
    },

    /// The metadata group has no leader able to commit.
    #[error("no quorum: {0}")]
    NoQuorum(String),

    /// A metadata leader was not elected in time.
    #[error("election timed out after {0:?}")]
    ElectionTimeout(std::time::Duration),

    /// Error from Raft operations.
    #[error("raft error: {0}")]
    Raft(String),

    /// Failure of this node's own metadata storage.
    #[error("metadata storage failure: {0}")]
    MetadataStorage(String),

    /// Network or protocol error talking to another broker.
    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("object store error: {0}")]
    ObjectStore(#[from] object_store::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    /// The broker is shutting down.
    #[error("broker is shutting down")]
    Shutdown,
}

impl BrokerError {
    pub fn not_leader(partition: TopicPartition, leader: Option<LeaderHint>) -> Self {
        BrokerError::NotLeaderForPartition { partition, leader }
    }

    pub fn unavailable(partition: TopicPartition, reason: impl Into<String>) -> Self {
        BrokerError::PartitionUnavailable {
            partition,
            reason: reason.into(),
        }
    }

    /// True if retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            BrokerError::NoQuorum(_)
            | BrokerError::ElectionTimeout(_)
            | BrokerError::PartitionUnavailable { .. }
            | BrokerError::ReplicationTimeout { .. }
            | BrokerError::Raft(_)
            | BrokerError::Rpc(_)
            | BrokerError::NotLeaderForPartition { .. }
            | BrokerError::StaleLeader { .. }
            | BrokerError::OutOfSequence { .. }
            | BrokerError::ReplicaTooFarBehind { .. } => true,

            BrokerError::Log(e) => e.is_out_of_range(),
            BrokerError::Io(e) => is_io_error_retryable(e),
            BrokerError::ObjectStore(e) => !matches!(
                e,
                object_store::Error::NotFound { .. }
                    | object_store::Error::AlreadyExists { .. }
                    | object_store::Error::InvalidPath { .. }
                    | object_store::Error::PermissionDenied { .. }
                    | object_store::Error::Unauthenticated { .. }
                    | object_store::Error::NotSupported { .. }
                    | object_store::Error::NotImplemented
            ),

            BrokerError::UnknownTopicOrPartition { .. }
            | BrokerError::TopicAlreadyExists(_)
            | BrokerError::InvalidRequest(_)
            | BrokerError::MetadataStorage(_)
            | BrokerError::Config(_)
            | BrokerError::Serialization(_)
            | BrokerError::Shutdown => false,
        }
    }

    /// True if the caller's view of partition leadership is out of date.
    pub fn should_refresh_metadata(&self) -> bool {
        matches!(
            self,
            BrokerError::NotLeaderForPartition { .. }
                | BrokerError::StaleLeader { .. }
                | BrokerError::UnknownTopicOrPartition { .. }
                | BrokerError::PartitionUnavailable { .. }
        )
    }

    /// The redirect target carried by a `NotLeaderForPartition`.
    pub fn leader_hint(&self) -> Option<&LeaderHint> {
        match self {
            BrokerError::NotLeaderForPartition { leader, .. } => leader.as_ref(),
            _ => None,
        }
    }

    /// True if the error leaves the partition unusable until reassigned.
    pub fn is_partition_fatal(&self) -> bool {
        matches!(self, BrokerError::Log(e) if e.is_fatal())
    }

    /// True if the node cannot safely continue.
    pub fn is_node_fatal(&self) -> bool {
        matches!(self, BrokerError::MetadataStorage(_))
    }

    /// Short label for metrics.
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            BrokerError::Log(_) => "log",
            BrokerError::StaleLeader { .. } => "stale_leader",
            BrokerError::NotLeaderForPartition { .. } => "not_leader",
            BrokerError::ReplicaTooFarBehind { .. } => "too_far_behind",
            BrokerError::OutOfSequence { .. } => "out_of_sequence",
            BrokerError::PartitionUnavailable { .. } => "unavailable",
            BrokerError::UnknownTopicOrPartition { .. } => "unknown_partition",
            BrokerError::TopicAlreadyExists(_) => "topic_exists",
            BrokerError::InvalidRequest(_) => "invalid_request",
            BrokerError::ReplicationTimeout { .. } => "replication_timeout",
            BrokerError::NoQuorum(_) => "no_quorum",
            BrokerError::ElectionTimeout(_) => "election_timeout",
            BrokerError::Raft(_) => "raft",
            BrokerError::MetadataStorage(_) => "metadata_storage",
            BrokerError::Rpc(_) => "rpc",
            BrokerError::Config(_) => "config",
            BrokerError::ObjectStore(_) => "object_store",
            BrokerError::Io(_) => "io",
            BrokerError::Serialization(_) => "serialization",
            BrokerError::Shutdown => "shutdown",
        }
    }
}

fn is_io_error_retryable(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;

    matches!(
        e.kind(),
        ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::BrokenPipe
            | ErrorKind::TimedOut
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::UnexpectedEof
    )
}
