//! Metadata commands and responses.
//!
//! Commands are the inputs to the metadata state machine. They are
//! replicated through Raft and applied in log order on every node.

use serde::{Deserialize, Serialize};

use super::domains::{BrokerCommand, BrokerResponse, TopicCommand, TopicResponse};

/// Commands that can be applied to the metadata state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetadataCommand {
    /// No-op command (used for linearizable reads).
    Noop,

    /// Broker registration, heartbeat, fencing, resignation.
    Broker(BrokerCommand),

    /// Topic table changes.
    Topic(TopicCommand),
}

/// Responses from applying commands to the state machine.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum MetadataResponse {
    Ok,
    Broker(BrokerResponse),
    Topic(TopicResponse),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_json_shape() {
        let cmd = MetadataCommand::Topic(TopicCommand::SetPartitionLeader {
            topic: "orders".to_string(),
            partition: 2,
            leader: Some(1),
            expected_epoch: 7,
        });
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["Topic"]["SetPartitionLeader"]["expected_epoch"], 7);

        let back: MetadataCommand = serde_json::from_value(json).unwrap();
        assert_eq!(cmd, back);
    }

    #[test]
    fn test_command_bincode() {
        let cmd = MetadataCommand::Broker(BrokerCommand::Heartbeat {
            broker_id: 3,
            timestamp_ms: 42,
        });
        let bytes = bincode::serialize(&cmd).unwrap();
        let back: MetadataCommand = bincode::deserialize(&bytes).unwrap();
        assert_eq!(cmd, back);
    }
}
