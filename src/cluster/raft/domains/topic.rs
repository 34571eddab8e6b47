//! Topic domain for the metadata state machine.
//!
//! Holds the topic/partition table: replica sets, current leaders and leader
//! epochs. Every leader or replica-set change bumps the partition's epoch.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::types::{BrokerId, LeaderEpoch, PartitionIndex};

/// Replica set and leadership of one partition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PartitionAssignment {
    /// Ordered replica set. The first entry is the preferred leader.
    pub replicas: Vec<BrokerId>,
    /// Current leader, `None` while the partition is unavailable.
    pub leader: Option<BrokerId>,
    pub leader_epoch: LeaderEpoch,
}

impl PartitionAssignment {
    pub fn is_replica(&self, broker_id: BrokerId) -> bool {
        self.replicas.contains(&broker_id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TopicInfo {
    pub name: Arc<str>,
    pub created_at_ms: u64,
    pub partitions: Vec<PartitionAssignment>,
}

impl TopicInfo {
    pub fn partition_count(&self) -> usize {
        self.partitions.len()
    }
}

/// Commands for the topic domain.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TopicCommand {
    /// Create a topic. `assignments[p]` is the replica set of partition `p`.
    CreateTopic {
        name: String,
        assignments: Vec<Vec<BrokerId>>,
        timestamp_ms: u64,
    },

    DeleteTopic { name: String },

    /// Compare-and-set the leader of a partition.
    SetPartitionLeader {
        topic: String,
        partition: PartitionIndex,
        leader: Option<BrokerId>,
        expected_epoch: LeaderEpoch,
    },

    /// Compare-and-set the replica set of a partition. A leader that is not
    /// in the new set is replaced by the first replica of the new set.
    SetReplicaSet {
        topic: String,
        partition: PartitionIndex,
        replicas: Vec<BrokerId>,
        expected_epoch: LeaderEpoch,
    },
}

/// Responses from topic domain operations.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TopicResponse {
    TopicCreated {
        name: String,
        partitions: usize,
    },
    TopicAlreadyExists {
        name: String,
    },
    TopicDeleted {
        name: String,
    },
    TopicNotFound {
        name: String,
    },
    PartitionNotFound {
        topic: String,
        partition: PartitionIndex,
    },
    LeaderChanged {
        leader: Option<BrokerId>,
        leader_epoch: LeaderEpoch,
    },
    ReplicasChanged {
        replicas: Vec<BrokerId>,
        leader_epoch: LeaderEpoch,
    },
    /// The command was based on a stale view of the partition.
    EpochMismatch {
        expected: LeaderEpoch,
        current: LeaderEpoch,
    },
    InvalidAssignment {
        reason: String,
    },
}

/// State for the topic domain.
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq, Eq)]
pub struct TopicDomainState {
    pub topics: BTreeMap<Arc<str>, TopicInfo>,
}

impl TopicDomainState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply a topic command and return the response.
    pub fn apply(&mut self, cmd: TopicCommand) -> TopicResponse {
        match cmd {
            TopicCommand::CreateTopic {
                name,
                assignments,
                timestamp_ms,
            } => {
                if self.topics.contains_key(name.as_str()) {
                    return TopicResponse::TopicAlreadyExists { name };
                }
                if let Err(reason) = validate_topic(&name, &assignments) {
                    return TopicResponse::InvalidAssignment { reason };
                }

                let name: Arc<str> = Arc::from(name);
                let partitions: Vec<PartitionAssignment> = assignments
                    .into_iter()
                    .map(|replicas| PartitionAssignment {
                        leader: replicas.first().copied(),
                        replicas,
                        leader_epoch: 1,
                    })
                    .collect();
                let count = partitions.len();

                self.topics.insert(
                    Arc::clone(&name),
                    TopicInfo {
                        name: Arc::clone(&name),
                        created_at_ms: timestamp_ms,
                        partitions,
                    },
                );
                TopicResponse::TopicCreated {
                    name: name.to_string(),
                    partitions: count,
                }
            }

            TopicCommand::DeleteTopic { name } => {
                if self.topics.remove(name.as_str()).is_none() {
                    return TopicResponse::TopicNotFound { name };
                }
                TopicResponse::TopicDeleted { name }
            }

            TopicCommand::SetPartitionLeader {
                topic,
                partition,
                leader,
                expected_epoch,
            } => {
                let assignment = match self.partition_mut(&topic, partition) {
                    Ok(a) => a,
                    Err(resp) => return resp,
                };
                if assignment.leader_epoch != expected_epoch {
                    return TopicResponse::EpochMismatch {
                        expected: expected_epoch,
                        current: assignment.leader_epoch,
                    };
                }
                if let Some(leader) = leader
                    && !assignment.is_replica(leader)
                {
                    return TopicResponse::InvalidAssignment {
                        reason: format!("broker {} is not a replica of {}/{}", leader, topic, partition),
                    };
                }

                assignment.leader = leader;
                assignment.leader_epoch += 1;
                TopicResponse::LeaderChanged {
                    leader,
                    leader_epoch: assignment.leader_epoch,
                }
            }

            TopicCommand::SetReplicaSet {
                topic,
                partition,
                replicas,
                expected_epoch,
            } => {
                if let Err(reason) = validate_replicas(&replicas) {
                    return TopicResponse::InvalidAssignment { reason };
                }
                let assignment = match self.partition_mut(&topic, partition) {
                    Ok(a) => a,
                    Err(resp) => return resp,
                };
                if assignment.leader_epoch != expected_epoch {
                    return TopicResponse::EpochMismatch {
                        expected: expected_epoch,
                        current: assignment.leader_epoch,
                    };
                }

                // A displaced leader hands over to a replica that already
                // holds the log. Newly added replicas start empty.
                if let Some(leader) = assignment.leader
                    && !replicas.contains(&leader)
                {
                    assignment.leader = replicas
                        .iter()
                        .copied()
                        .find(|r| assignment.replicas.contains(r))
                        .or_else(|| replicas.first().copied());
                }
                assignment.replicas = replicas.clone();
                assignment.leader_epoch += 1;
                TopicResponse::ReplicasChanged {
                    replicas,
                    leader_epoch: assignment.leader_epoch,
                }
            }
        }
    }

    fn partition_mut(
        &mut self,
        topic: &str,
        partition: PartitionIndex,
    ) -> Result<&mut PartitionAssignment, TopicResponse> {
        let info = self
            .topics
            .get_mut(topic)
            .ok_or_else(|| TopicResponse::TopicNotFound {
                name: topic.to_string(),
            })?;
        usize::try_from(partition)
            .ok()
            .and_then(|p| info.partitions.get_mut(p))
            .ok_or_else(|| TopicResponse::PartitionNotFound {
                topic: topic.to_string(),
                partition,
            })
    }

    pub fn get(&self, topic: &str) -> Option<&TopicInfo> {
        self.topics.get(topic)
    }

    pub fn partition(&self, topic: &str, partition: PartitionIndex) -> Option<&PartitionAssignment> {
        let index = usize::try_from(partition).ok()?;
        self.topics.get(topic)?.partitions.get(index)
    }
}

fn validate_topic(name: &str, assignments: &[Vec<BrokerId>]) -> Result<(), String> {
    if name.is_empty() {
        return Err("topic name must not be empty".to_string());
    }
    if name.len() > 249 {
        return Err(format!("topic name longer than 249 characters: {}", name.len()));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err(format!("topic name '{}' contains invalid characters", name));
    }
    if assignments.is_empty() {
        return Err("topic must have at least one partition".to_string());
    }
    assignments.iter().try_for_each(|r| validate_replicas(r))
}

fn validate_replicas(replicas: &[BrokerId]) -> Result<(), String> {
    if replicas.is_empty() {
        return Err("replica set must not be empty".to_string());
    }
    let mut seen = replicas.to_vec();
    seen.sort_unstable();
    seen.dedup();
    if seen.len() != replicas.len() {
        return Err(format!("replica set {:?} contains duplicates", replicas));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create(state: &mut TopicDomainState, name: &str, assignments: Vec<Vec<BrokerId>>) -> TopicResponse {
        state.apply(TopicCommand::CreateTopic {
            name: name.to_string(),
            assignments,
            timestamp_ms: 1000,
        })
    }

    #[test]
    fn test_create_topic_sets_preferred_leader() {
        let mut state = TopicDomainState::new();
        let resp = create(&mut state, "orders", vec![vec![1, 2, 3], vec![2, 3, 1]]);
        assert_eq!(
            resp,
            TopicResponse::TopicCreated {
                name: "orders".to_string(),
                partitions: 2
            }
        );

        let p1 = state.partition("orders", 1).unwrap();
        assert_eq!(p1.leader, Some(2));
        assert_eq!(p1.leader_epoch, 1);
        assert!(state.partition("orders", 2).is_none());
        assert!(state.partition("orders", -1).is_none());
    }

    #[test]
    fn test_create_duplicate_topic() {
        let mut state = TopicDomainState::new();
        create(&mut state, "t", vec![vec![1]]);
        assert!(matches!(
            create(&mut state, "t", vec![vec![1]]),
            TopicResponse::TopicAlreadyExists { .. }
        ));
    }

    #[test]
    fn test_create_rejects_bad_input() {
        let mut state = TopicDomainState::new();
        assert!(matches!(
            create(&mut state, "bad/name", vec![vec![1]]),
            TopicResponse::InvalidAssignment { .. }
        ));
        assert!(matches!(
            create(&mut state, "t", vec![vec![1, 1]]),
            TopicResponse::InvalidAssignment { .. }
        ));
        assert!(matches!(
            create(&mut state, "t", vec![]),
            TopicResponse::InvalidAssignment { .. }
        ));
        assert!(state.topics.is_empty());
    }

    #[test]
    fn test_set_leader_is_compare_and_set() {
        let mut state = TopicDomainState::new();
        create(&mut state, "t", vec![vec![1, 2, 3]]);

        let resp = state.apply(TopicCommand::SetPartitionLeader {
            topic: "t".to_string(),
            partition: 0,
            leader: Some(2),
            expected_epoch: 1,
        });
        assert_eq!(
            resp,
            TopicResponse::LeaderChanged {
                leader: Some(2),
                leader_epoch: 2
            }
        );

        // A plan computed against epoch 1 is now stale.
        let resp = state.apply(TopicCommand::SetPartitionLeader {
            topic: "t".to_string(),
            partition: 0,
            leader: Some(3),
            expected_epoch: 1,
        });
        assert_eq!(
            resp,
            TopicResponse::EpochMismatch {
                expected: 1,
                current: 2
            }
        );
        assert_eq!(state.partition("t", 0).unwrap().leader, Some(2));
    }

    #[test]
    fn test_set_leader_must_be_replica() {
        let mut state = TopicDomainState::new();
        create(&mut state, "t", vec![vec![1, 2]]);
        let resp = state.apply(TopicCommand::SetPartitionLeader {
            topic: "t".to_string(),
            partition: 0,
            leader: Some(7),
            expected_epoch: 1,
        });
        assert!(matches!(resp, TopicResponse::InvalidAssignment { .. }));
    }

    #[test]
    fn test_set_leader_none_marks_unavailable() {
        let mut state = TopicDomainState::new();
        create(&mut state, "t", vec![vec![1]]);
        state.apply(TopicCommand::SetPartitionLeader {
            topic: "t".to_string(),
            partition: 0,
            leader: None,
            expected_epoch: 1,
        });
        let p = state.partition("t", 0).unwrap();
        assert_eq!(p.leader, None);
        assert_eq!(p.leader_epoch, 2);
    }

    #[test]
    fn test_set_replica_set_replaces_missing_leader() {
        let mut state = TopicDomainState::new();
        create(&mut state, "t", vec![vec![1, 2, 3]]);

        let resp = state.apply(TopicCommand::SetReplicaSet {
            topic: "t".to_string(),
            partition: 0,
            replicas: vec![2, 3, 4],
            expected_epoch: 1,
        });
        assert!(matches!(resp, TopicResponse::ReplicasChanged { leader_epoch: 2, .. }));
        let p = state.partition("t", 0).unwrap();
        assert_eq!(p.leader, Some(2));
        assert_eq!(p.replicas, vec![2, 3, 4]);
    }

    #[test]
    fn test_set_replica_set_prefers_surviving_replica_as_leader() {
        let mut state = TopicDomainState::new();
        create(&mut state, "t", vec![vec![1, 2, 3]]);

        state.apply(TopicCommand::SetReplicaSet {
            topic: "t".to_string(),
            partition: 0,
            replicas: vec![4, 3, 2],
            expected_epoch: 1,
        });
        let p = state.partition("t", 0).unwrap();
        assert_eq!(p.leader, Some(3));

        // Nothing survives: the first new replica is all there is.
        create(&mut state, "solo", vec![vec![1]]);
        state.apply(TopicCommand::SetReplicaSet {
            topic: "solo".to_string(),
            partition: 0,
            replicas: vec![5],
            expected_epoch: 1,
        });
        assert_eq!(state.partition("solo", 0).unwrap().leader, Some(5));
    }

    #[test]
    fn test_delete_topic() {
        let mut state = TopicDomainState::new();
        create(&mut state, "t", vec![vec![1]]);
        assert!(matches!(
            state.apply(TopicCommand::DeleteTopic { name: "t".to_string() }),
            TopicResponse::TopicDeleted { .. }
        ));
        assert!(matches!(
            state.apply(TopicCommand::DeleteTopic { name: "t".to_string() }),
            TopicResponse::TopicNotFound { .. }
        ));
    }
}
