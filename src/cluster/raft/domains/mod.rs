//! Domain-specific state machine components.
//!
//! - **Broker**: registration, heartbeat, fencing, resignation
//! - **Topic**: topics, replica sets, partition leaders and epochs
//!
//! Each domain provides a command enum, a response enum, and a state struct
//! with a deterministic `apply`. [`MetadataSnapshot`](super::MetadataSnapshot)
//! composes them.

pub mod broker;
pub mod topic;

pub use broker::{BrokerCommand, BrokerDomainState, BrokerEndpoints, BrokerInfo, BrokerResponse, BrokerStatus};
pub use topic::{PartitionAssignment, TopicCommand, TopicDomainState, TopicInfo, TopicResponse};
