//! Broker-to-broker replication protocol.
//!
//! Leaders push every append to each replica (`Append`). Followers pull
//! whatever they are missing (`Fetch`), after agreeing with the leader where
//! their logs diverge (`EpochEnd`). Both directions share one request/response
//! pair carried over the length-prefixed RPC framing in [`rpc`](super::rpc).

mod client;
mod handler;

pub use client::{LocalReplicaClient, LocalReplicaNetwork, ReplicaClient, TcpReplicaClient};
pub use handler::ReplicationHandler;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::error::BrokerError;
use crate::types::{BrokerId, LeaderEpoch, Offset, Record, TopicPartition};

/// Epoch boundary: `epoch` started at `start_offset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct EpochEntry {
    pub epoch: LeaderEpoch,
    pub start_offset: Offset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationRequest {
    /// Leader push of one record at `offset`.
    Append {
        partition: TopicPartition,
        leader_id: BrokerId,
        epoch: LeaderEpoch,
        offset: Offset,
        value: Bytes,
    },
    /// Follower pull starting at `offset`. Implies the follower holds
    /// everything below `offset`.
    Fetch {
        partition: TopicPartition,
        follower_id: BrokerId,
        epoch: LeaderEpoch,
        offset: Offset,
        max_bytes: usize,
    },
    /// Where does `epoch` end in the leader's log?
    EpochEnd {
        partition: TopicPartition,
        epoch: LeaderEpoch,
    },
}

impl ReplicationRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ReplicationRequest::Append { .. } => "append",
            ReplicationRequest::Fetch { .. } => "fetch",
            ReplicationRequest::EpochEnd { .. } => "epoch_end",
        }
    }

    pub fn partition(&self) -> &TopicPartition {
        match self {
            ReplicationRequest::Append { partition, .. }
            | ReplicationRequest::Fetch { partition, .. }
            | ReplicationRequest::EpochEnd { partition, .. } => partition,
        }
    }
}

/// Records served to a follower.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedRecords {
    pub records: Vec<Record>,
    pub oldest: Offset,
    pub newest: Offset,
    /// Leader epoch boundaries covering the returned records.
    pub epochs: Vec<EpochEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ReplicationResponse {
    Appended { newest: Offset },
    Records(FetchedRecords),
    EpochEnd { epoch: LeaderEpoch, end_offset: Offset },
    Error(ReplicationError),
}

/// Errors carried on the wire. Converted to and from [`BrokerError`] at
/// each end with the partition filled back in.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ReplicationError {
    #[error("stale leader, current epoch is {current_epoch}")]
    StaleLeader { current_epoch: LeaderEpoch },

    #[error("not leader")]
    NotLeader { leader_id: Option<BrokerId> },

    #[error("unknown partition")]
    UnknownPartition,

    #[error("out of sequence, log ends at {newest}")]
    OutOfSequence { newest: Offset },

    #[error("too far behind, leader starts at {oldest}")]
    TooFarBehind { oldest: Offset },

    #[error("unavailable: {reason}")]
    Unavailable { reason: String },

    #[error("storage error: {reason}")]
    Storage { reason: String },
}

impl ReplicationError {
    pub fn as_metric_label(&self) -> &'static str {
        match self {
            ReplicationError::StaleLeader { .. } => "stale_leader",
            ReplicationError::NotLeader { .. } => "not_leader",
            ReplicationError::UnknownPartition => "unknown_partition",
            ReplicationError::OutOfSequence { .. } => "out_of_sequence",
            ReplicationError::TooFarBehind { .. } => "too_far_behind",
            ReplicationError::Unavailable { .. } => "unavailable",
            ReplicationError::Storage { .. } => "storage",
        }
    }

    /// Rebuild the broker error on the requesting side.
    ///
    /// `epoch` and `offset` describe the request that failed.
    pub fn into_broker_error(
        self,
        partition: TopicPartition,
        epoch: LeaderEpoch,
        offset: Offset,
    ) -> BrokerError {
        match self {
            ReplicationError::StaleLeader { current_epoch } => BrokerError::StaleLeader {
                partition,
                epoch,
                current_epoch,
            },
            ReplicationError::NotLeader { .. } => BrokerError::not_leader(partition, None),
            ReplicationError::UnknownPartition => BrokerError::UnknownTopicOrPartition {
                topic: partition.topic.to_string(),
                partition: partition.partition,
            },
            ReplicationError::OutOfSequence { newest } => BrokerError::OutOfSequence {
                partition,
                offset,
                newest,
            },
            ReplicationError::TooFarBehind { oldest } => BrokerError::ReplicaTooFarBehind {
                partition,
                offset,
                leader_oldest: oldest,
            },
            ReplicationError::Unavailable { reason } => BrokerError::unavailable(partition, reason),
            ReplicationError::Storage { reason } => {
                BrokerError::unavailable(partition, format!("storage error on peer: {}", reason))
            }
        }
    }
}

impl From<&BrokerError> for ReplicationError {
    fn from(err: &BrokerError) -> Self {
        match err {
            BrokerError::StaleLeader { current_epoch, .. } => ReplicationError::StaleLeader {
                current_epoch: *current_epoch,
            },
            BrokerError::NotLeaderForPartition { leader, .. } => ReplicationError::NotLeader {
                leader_id: leader.as_ref().map(|l| l.broker_id),
            },
            BrokerError::UnknownTopicOrPartition { .. } => ReplicationError::UnknownPartition,
            BrokerError::OutOfSequence { newest, .. } => {
                ReplicationError::OutOfSequence { newest: *newest }
            }
            BrokerError::ReplicaTooFarBehind { leader_oldest, .. } => {
                ReplicationError::TooFarBehind {
                    oldest: *leader_oldest,
                }
            }
            BrokerError::PartitionUnavailable { reason, .. } => ReplicationError::Unavailable {
                reason: reason.clone(),
            },
            BrokerError::Log(e) => ReplicationError::Storage {
                reason: e.to_string(),
            },
            other => ReplicationError::Unavailable {
                reason: other.to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tp() -> TopicPartition {
        TopicPartition::new("orders", 1)
    }

    #[test]
    fn test_stale_leader_survives_the_wire() {
        let err = BrokerError::StaleLeader {
            partition: tp(),
            epoch: 3,
            current_epoch: 5,
        };
        let wire = ReplicationError::from(&err);
        let bytes = bincode::serialize(&ReplicationResponse::Error(wire)).unwrap();
        let ReplicationResponse::Error(back) = bincode::deserialize(&bytes).unwrap() else {
            panic!("expected error response");
        };
        match back.into_broker_error(tp(), 3, 10) {
            BrokerError::StaleLeader { current_epoch, .. } => assert_eq!(current_epoch, 5),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_too_far_behind_keeps_leader_oldest() {
        let err = ReplicationError::TooFarBehind { oldest: 400 }.into_broker_error(tp(), 1, 12);
        match err {
            BrokerError::ReplicaTooFarBehind {
                offset,
                leader_oldest,
                ..
            } => {
                assert_eq!(offset, 12);
                assert_eq!(leader_oldest, 400);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_log_errors_become_storage() {
        let err = BrokerError::Log(crate::error::LogError::Closed);
        let wire = ReplicationError::from(&err);
        assert_eq!(wire.as_metric_label(), "storage");
    }

    #[test]
    fn test_request_accessors() {
        let req = ReplicationRequest::EpochEnd {
            partition: tp(),
            epoch: 2,
        };
        assert_eq!(req.kind(), "epoch_end");
        assert_eq!(req.partition(), &tp());
    }
}
