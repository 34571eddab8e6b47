//! Metadata state machine.
//!
//! The committed metadata is held as an immutable [`MetadataSnapshot`] behind an
//! `Arc`. Applying a command produces a new snapshot (copy-on-write through
//! `Arc::make_mut`) tagged with the Raft log index that produced it, and
//! publishes it to subscribers in commit order. Readers never hold a lock
//! across their use of the metadata.

use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};

use super::commands::{MetadataCommand, MetadataResponse};
use super::domains::{BrokerDomainState, PartitionAssignment, TopicDomainState};
use crate::cluster::error::LeaderHint;
use crate::types::{BrokerId, PartitionIndex, TopicPartition};

/// The complete cluster metadata at one point of the Raft log.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct MetadataSnapshot {
    /// Raft log index of the last command applied to this snapshot.
    pub version: u64,

    #[serde(default)]
    pub brokers: BrokerDomainState,

    #[serde(default)]
    pub topics: TopicDomainState,
}

impl MetadataSnapshot {
    /// Apply a command. Does not touch `version`.
    pub fn apply(&mut self, command: MetadataCommand) -> MetadataResponse {
        match command {
            MetadataCommand::Noop => MetadataResponse::Ok,
            MetadataCommand::Broker(cmd) => MetadataResponse::Broker(self.brokers.apply(cmd)),
            MetadataCommand::Topic(cmd) => MetadataResponse::Topic(self.topics.apply(cmd)),
        }
    }

    pub fn partition(&self, tp: &TopicPartition) -> Option<&PartitionAssignment> {
        self.topics.partition(&tp.topic, tp.partition)
    }

    pub fn leader_for(&self, tp: &TopicPartition) -> Option<BrokerId> {
        self.partition(tp).and_then(|p| p.leader)
    }

    /// Client address of the partition's current leader, if known.
    pub fn leader_hint(&self, tp: &TopicPartition) -> Option<LeaderHint> {
        let leader = self.leader_for(tp)?;
        let info = self.brokers.get(leader)?;
        Some(LeaderHint {
            broker_id: leader,
            addr: info.endpoints.client_addr.clone(),
        })
    }

    /// Every partition of every topic, in topic then index order.
    pub fn partitions(&self) -> impl Iterator<Item = (TopicPartition, &PartitionAssignment)> + '_ {
        self.topics.topics.values().flat_map(|topic| {
            topic.partitions.iter().enumerate().map(move |(i, p)| {
                (
                    TopicPartition::new(Arc::clone(&topic.name), i as PartitionIndex),
                    p,
                )
            })
        })
    }

    /// Partitions whose replica set contains `broker_id`.
    pub fn assigned_to(
        &self,
        broker_id: BrokerId,
    ) -> impl Iterator<Item = (TopicPartition, &PartitionAssignment)> + '_ {
        self.partitions()
            .filter(move |(_, p)| p.is_replica(broker_id))
    }

    pub fn has_topic(&self, topic: &str) -> bool {
        self.topics.get(topic).is_some()
    }
}

/// Owner of the committed metadata. Applies commands handed to it by the
/// Raft storage layer and fans the results out to subscribers.
pub struct MetadataStateMachine {
    state: RwLock<Arc<MetadataSnapshot>>,
    latest: watch::Sender<Arc<MetadataSnapshot>>,
    subscribers: Mutex<Vec<mpsc::UnboundedSender<Arc<MetadataSnapshot>>>>,
}

impl MetadataStateMachine {
    pub fn new() -> Self {
        let initial = Arc::new(MetadataSnapshot::default());
        let (latest, _) = watch::channel(Arc::clone(&initial));
        Self {
            state: RwLock::new(initial),
            latest,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// The latest committed snapshot.
    pub fn current(&self) -> Arc<MetadataSnapshot> {
        Arc::clone(&self.state.read())
    }

    /// Apply a committed command at `index` and publish the result.
    pub fn apply(&self, index: u64, command: MetadataCommand) -> MetadataResponse {
        let (response, snapshot) = {
            let mut state = self.state.write();
            let next = Arc::make_mut(&mut state);
            let response = next.apply(command);
            next.version = index;
            (response, Arc::clone(&state))
        };
        self.publish(snapshot);
        response
    }

    /// Advance the version for entries that carry no command (blank and
    /// membership entries) so snapshots track the applied index.
    pub fn advance(&self, index: u64) {
        let snapshot = {
            let mut state = self.state.write();
            if state.version >= index {
                return;
            }
            Arc::make_mut(&mut state).version = index;
            Arc::clone(&state)
        };
        self.publish(snapshot);
    }

    pub fn snapshot_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        let state = self.current();
        bincode::serialize(&*state)
    }

    /// Replace the state with a serialized snapshot and publish it.
    pub fn restore(&self, bytes: &[u8]) -> Result<(), bincode::Error> {
        let restored: MetadataSnapshot = bincode::deserialize(bytes)?;
        let snapshot = Arc::new(restored);
        *self.state.write() = Arc::clone(&snapshot);
        self.publish(snapshot);
        Ok(())
    }

    /// Receive every snapshot published from now on, starting with the current one.
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Arc<MetadataSnapshot>> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut subscribers = self.subscribers.lock();
        // Seeded under the subscriber lock so no publish slips in between.
        let _ = tx.send(self.current());
        subscribers.push(tx);
        rx
    }

    /// Watch the latest snapshot, skipping intermediate versions.
    pub fn watch(&self) -> watch::Receiver<Arc<MetadataSnapshot>> {
        self.latest.subscribe()
    }

    fn publish(&self, snapshot: Arc<MetadataSnapshot>) {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| tx.send(Arc::clone(&snapshot)).is_ok());
        self.latest.send_replace(snapshot);
    }
}

impl Default for MetadataStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::raft::domains::{BrokerCommand, BrokerEndpoints, TopicCommand};

    fn register(broker_id: BrokerId) -> MetadataCommand {
        MetadataCommand::Broker(BrokerCommand::Register {
            broker_id,
            endpoints: BrokerEndpoints {
                client_addr: format!("127.0.0.1:{}", 9000 + broker_id),
                ..Default::default()
            },
            voter: true,
            timestamp_ms: 0,
        })
    }

    fn create(name: &str, assignments: Vec<Vec<BrokerId>>) -> MetadataCommand {
        MetadataCommand::Topic(TopicCommand::CreateTopic {
            name: name.to_string(),
            assignments,
            timestamp_ms: 0,
        })
    }

    #[test]
    fn test_apply_tags_version() {
        let sm = MetadataStateMachine::new();
        sm.apply(3, register(1));
        assert_eq!(sm.current().version, 3);
        sm.advance(4);
        assert_eq!(sm.current().version, 4);
        sm.advance(2);
        assert_eq!(sm.current().version, 4);
    }

    #[test]
    fn test_old_snapshots_are_immutable() {
        let sm = MetadataStateMachine::new();
        sm.apply(1, register(1));
        let before = sm.current();
        sm.apply(2, create("orders", vec![vec![1]]));
        assert!(!before.has_topic("orders"));
        assert!(sm.current().has_topic("orders"));
    }

    #[test]
    fn test_subscribers_see_every_commit_in_order() {
        let sm = MetadataStateMachine::new();
        let mut rx = sm.subscribe();
        for i in 1..=5 {
            sm.apply(i, MetadataCommand::Noop);
        }
        let versions: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|s| s.version)
            .collect();
        assert_eq!(versions, vec![0, 1, 2, 3, 4, 5]);
    }

    #[test]
    fn test_dropped_subscriber_is_pruned() {
        let sm = MetadataStateMachine::new();
        drop(sm.subscribe());
        sm.apply(1, MetadataCommand::Noop);
        assert!(sm.subscribers.lock().is_empty());
    }

    #[test]
    fn test_snapshot_restore() {
        let sm = MetadataStateMachine::new();
        sm.apply(1, register(1));
        sm.apply(2, create("orders", vec![vec![1], vec![1]]));
        let bytes = sm.snapshot_bytes().unwrap();

        let other = MetadataStateMachine::new();
        let mut watch = other.watch();
        other.restore(&bytes).unwrap();
        assert_eq!(*other.current(), *sm.current());
        assert!(watch.has_changed().unwrap());
        assert_eq!(watch.borrow_and_update().version, 2);
    }

    #[test]
    fn test_leader_hint_and_assignment_queries() {
        let sm = MetadataStateMachine::new();
        sm.apply(1, register(1));
        sm.apply(2, register(2));
        sm.apply(3, create("orders", vec![vec![1, 2], vec![2]]));
        let snap = sm.current();

        let tp0 = TopicPartition::new("orders", 0);
        let hint = snap.leader_hint(&tp0).unwrap();
        assert_eq!(hint.broker_id, 1);
        assert_eq!(hint.addr, "127.0.0.1:9001");

        assert_eq!(snap.partitions().count(), 2);
        assert_eq!(snap.assigned_to(1).count(), 1);
        assert_eq!(snap.assigned_to(2).count(), 2);
        assert!(snap.leader_for(&TopicPartition::new("orders", 7)).is_none());
    }
}
