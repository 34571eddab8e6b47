//! Core identifier and record types shared by the log and cluster layers.

use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Broker identifier, unique across the cluster.
pub type BrokerId = i32;

/// Logical position of a record within a partition.
pub type Offset = u64;

/// Leadership term of a single partition.
pub type LeaderEpoch = u64;

/// Partition index within a topic.
pub type PartitionIndex = i32;

/// A record read back from a log: the payload plus the offset assigned at append.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    pub offset: Offset,
    pub value: Bytes,
}

impl Record {
    pub fn new(offset: Offset, value: impl Into<Bytes>) -> Self {
        Self {
            offset,
            value: value.into(),
        }
    }
}

/// Topic and partition pair identifying one partition log.
///
/// Uses `Arc<str>` for the topic so clones in hot maps are cheap.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TopicPartition {
    pub topic: Arc<str>,
    pub partition: PartitionIndex,
}

impl TopicPartition {
    pub fn new(topic: impl Into<Arc<str>>, partition: PartitionIndex) -> Self {
        Self {
            topic: topic.into(),
            partition,
        }
    }

    /// Directory name used for this partition under the data directory.
    pub fn dir_name(&self) -> String {
        format!("{}-{}", self.topic, self.partition)
    }
}

impl fmt::Display for TopicPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.topic, self.partition)
    }
}

/// Get current time in milliseconds since UNIX epoch.
pub(crate) fn current_time_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_partition_display() {
        let tp = TopicPartition::new("orders", 3);
        assert_eq!(tp.to_string(), "orders/3");
        assert_eq!(tp.dir_name(), "orders-3");
    }

    #[test]
    fn test_topic_partition_ordering() {
        let a = TopicPartition::new("a", 1);
        let b = TopicPartition::new("a", 2);
        let c = TopicPartition::new("b", 0);
        let mut v = vec![c.clone(), b.clone(), a.clone()];
        v.sort();
        assert_eq!(v, vec![a, b, c]);
    }
}
