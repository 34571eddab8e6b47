//! Broker domain for the metadata state machine.
//!
//! Handles broker lifecycle: registration, heartbeat, fencing, resignation.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::types::BrokerId;

/// Broker status in the cluster.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum BrokerStatus {
    /// Heartbeating and eligible to lead partitions.
    Active,
    /// Missed its session timeout. A later heartbeat reactivates it.
    Fenced,
    /// Left the cluster on purpose. Its replicas are handed to other brokers.
    Resigned,
}

/// Addresses a broker advertises to the rest of the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
pub struct BrokerEndpoints {
    /// Address clients connect to.
    pub client_addr: String,
    /// Address of the replication RPC server.
    pub replication_addr: String,
    /// Address of the Raft RPC server.
    pub raft_addr: String,
    /// Address of the gossip socket.
    pub gossip_addr: String,
}

/// Information about a broker in the cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct BrokerInfo {
    pub broker_id: BrokerId,
    pub endpoints: BrokerEndpoints,
    pub voter: bool,
    pub status: BrokerStatus,
    pub registered_at_ms: u64,
    pub last_heartbeat_ms: u64,
    /// Incremented on every heartbeat. Lets observers detect liveness
    /// without comparing wall clocks across brokers.
    pub heartbeat_seq: u64,
}

/// Commands for the broker domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BrokerCommand {
    /// Register (or re-register) a broker.
    Register {
        broker_id: BrokerId,
        endpoints: BrokerEndpoints,
        voter: bool,
        timestamp_ms: u64,
    },

    /// Record a heartbeat.
    Heartbeat {
        broker_id: BrokerId,
        timestamp_ms: u64,
    },

    /// Mark a broker unavailable after it missed its session timeout.
    Fence { broker_id: BrokerId, reason: String },

    /// The broker is leaving the cluster.
    Remove { broker_id: BrokerId },
}

/// Responses from broker domain operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum BrokerResponse {
    Registered { broker_id: BrokerId },
    HeartbeatAck,
    Fenced { broker_id: BrokerId },
    Removed { broker_id: BrokerId },
    NotFound { broker_id: BrokerId },
}

/// State for the broker domain.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct BrokerDomainState {
    /// Registered brokers by ID.
    pub brokers: BTreeMap<BrokerId, BrokerInfo>,
}

impl BrokerDomainState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a broker command and return the response.
    pub fn apply(&mut self, cmd: BrokerCommand) -> BrokerResponse {
        match cmd {
            BrokerCommand::Register {
                broker_id,
                endpoints,
                voter,
                timestamp_ms,
            } => {
                let heartbeat_seq = self
                    .brokers
                    .get(&broker_id)
                    .map(|b| b.heartbeat_seq + 1)
                    .unwrap_or(0);
                self.brokers.insert(
                    broker_id,
                    BrokerInfo {
                        broker_id,
                        endpoints,
                        voter,
                        status: BrokerStatus::Active,
                        registered_at_ms: timestamp_ms,
                        last_heartbeat_ms: timestamp_ms,
                        heartbeat_seq,
                    },
                );
                BrokerResponse::Registered { broker_id }
            }

            BrokerCommand::Heartbeat {
                broker_id,
                timestamp_ms,
            } => match self.brokers.get_mut(&broker_id) {
                // A resigned broker has to register again.
                Some(broker) if broker.status != BrokerStatus::Resigned => {
                    broker.last_heartbeat_ms = timestamp_ms;
                    broker.heartbeat_seq += 1;
                    broker.status = BrokerStatus::Active;
                    BrokerResponse::HeartbeatAck
                }
                _ => BrokerResponse::NotFound { broker_id },
            },

            BrokerCommand::Fence { broker_id, reason } => {
                match self.brokers.get_mut(&broker_id) {
                    Some(broker) if broker.status == BrokerStatus::Active => {
                        tracing::info!(broker_id, %reason, "Broker fenced");
                        broker.status = BrokerStatus::Fenced;
                        BrokerResponse::Fenced { broker_id }
                    }
                    Some(_) => BrokerResponse::Fenced { broker_id },
                    None => BrokerResponse::NotFound { broker_id },
                }
            }

            BrokerCommand::Remove { broker_id } => match self.brokers.get_mut(&broker_id) {
                Some(broker) => {
                    broker.status = BrokerStatus::Resigned;
                    BrokerResponse::Removed { broker_id }
                }
                None => BrokerResponse::NotFound { broker_id },
            },
        }
    }

    /// Check if a broker is active.
    pub fn is_active(&self, broker_id: BrokerId) -> bool {
        self.brokers
            .get(&broker_id)
            .is_some_and(|b| b.status == BrokerStatus::Active)
    }

    pub fn get(&self, broker_id: BrokerId) -> Option<&BrokerInfo> {
        self.brokers.get(&broker_id)
    }

    /// IDs of all active brokers, ascending.
    pub fn active_broker_ids(&self) -> BTreeSet<BrokerId> {
        self.brokers
            .values()
            .filter(|b| b.status == BrokerStatus::Active)
            .map(|b| b.broker_id)
            .collect()
    }

    /// IDs of brokers that resigned.
    pub fn resigned_broker_ids(&self) -> BTreeSet<BrokerId> {
        self.brokers
            .values()
            .filter(|b| b.status == BrokerStatus::Resigned)
            .map(|b| b.broker_id)
            .collect()
    }
}
