//! Replica placement and leadership planning.
//!
//! Every function here is a pure function of a metadata snapshot and a set
//! of brokers, so the controller's decisions can be tested without a
//! cluster and repeated without side effects. The controller turns the
//! plans into compare-and-set metadata commands; a plan computed from a
//! stale snapshot is rejected by the epoch check.

use std::collections::{BTreeMap, BTreeSet};

use super::raft::MetadataSnapshot;
use crate::types::{BrokerId, LeaderEpoch, TopicPartition};

/// Replica sets for a new topic, round-robin over `brokers` in ID order.
///
/// `start` rotates the first replica so topics created one after another
/// do not all lead on the lowest broker ID.
pub fn assign_replicas(
    partitions: usize,
    replication_factor: usize,
    brokers: &BTreeSet<BrokerId>,
    start: usize,
) -> Result<Vec<Vec<BrokerId>>, String> {
    if partitions == 0 {
        return Err("topic needs at least one partition".to_string());
    }
    if replication_factor == 0 {
        return Err("replication factor must be at least 1".to_string());
    }
    if replication_factor > brokers.len() {
        return Err(format!(
            "replication factor {} exceeds {} available brokers",
            replication_factor,
            brokers.len()
        ));
    }

    let brokers: Vec<BrokerId> = brokers.iter().copied().collect();
    let n = brokers.len();
    Ok((0..partitions)
        .map(|p| {
            (0..replication_factor)
                .map(|i| brokers[(start + p + i) % n])
                .collect()
        })
        .collect())
}

/// A leader change for one partition, valid only at `expected_epoch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderChange {
    pub partition: TopicPartition,
    pub leader: Option<BrokerId>,
    pub expected_epoch: LeaderEpoch,
}

/// Leaders for partitions whose current leader is not live.
///
/// A live leader is kept. Otherwise the first live replica in replica-set
/// order takes over, or the leader becomes `None` when no replica is live.
/// Partitions that need no change are left out.
pub fn plan_leadership(snapshot: &MetadataSnapshot, live: &BTreeSet<BrokerId>) -> Vec<LeaderChange> {
    snapshot
        .partitions()
        .filter_map(|(partition, assignment)| {
            if assignment.leader.is_some_and(|l| live.contains(&l)) {
                return None;
            }
            let leader = assignment
                .replicas
                .iter()
                .copied()
                .find(|r| live.contains(r));
            (leader != assignment.leader).then(|| LeaderChange {
                partition,
                leader,
                expected_epoch: assignment.leader_epoch,
            })
        })
        .collect()
}

/// A new replica set for one partition, valid only at `expected_epoch`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaReplacement {
    pub partition: TopicPartition,
    pub replicas: Vec<BrokerId>,
    pub expected_epoch: LeaderEpoch,
}

/// Replace `departed` brokers in replica sets with the least-loaded live
/// broker that is not already a replica. Ties go to the lower broker ID.
///
/// Replacements are appended after the surviving replicas. When no
/// candidate is left the departed replica is dropped instead, as long as
/// the set keeps at least one member.
pub fn plan_replica_replacements(
    snapshot: &MetadataSnapshot,
    live: &BTreeSet<BrokerId>,
    departed: &BTreeSet<BrokerId>,
) -> Vec<ReplicaReplacement> {
    if departed.is_empty() {
        return Vec::new();
    }

    let mut load: BTreeMap<BrokerId, usize> = live.iter().map(|b| (*b, 0)).collect();
    for (_, assignment) in snapshot.partitions() {
        for replica in &assignment.replicas {
            if let Some(count) = load.get_mut(replica) {
                *count += 1;
            }
        }
    }

    let mut plans = Vec::new();
    for (partition, assignment) in snapshot.partitions() {
        if !assignment.replicas.iter().any(|r| departed.contains(r)) {
            continue;
        }

        // Survivors keep their order so the current leader, or the replica
        // next in line, stays ahead of brokers that have yet to catch up.
        let mut replicas: Vec<BrokerId> = assignment
            .replicas
            .iter()
            .copied()
            .filter(|r| !departed.contains(r))
            .collect();
        for _ in assignment.replicas.iter().filter(|r| departed.contains(r)) {
            let candidate = load
                .iter()
                .filter(|(b, _)| !replicas.contains(b) && !departed.contains(b))
                .min_by_key(|(b, count)| (**count, **b))
                .map(|(b, _)| *b);
            if let Some(b) = candidate {
                replicas.push(b);
                if let Some(count) = load.get_mut(&b) {
                    *count += 1;
                }
            }
        }
        if replicas.is_empty() {
            continue;
        }

        if replicas != assignment.replicas {
            plans.push(ReplicaReplacement {
                partition,
                replicas,
                expected_epoch: assignment.leader_epoch,
            });
        }
    }
    plans
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::raft::{MetadataCommand, TopicCommand};

    fn snapshot_with(assignments: Vec<Vec<BrokerId>>) -> MetadataSnapshot {
        let mut snapshot = MetadataSnapshot::default();
        snapshot.apply(MetadataCommand::Topic(TopicCommand::CreateTopic {
            name: "orders".to_string(),
            assignments,
            timestamp_ms: 0,
        }));
        snapshot
    }

    fn ids(ids: &[BrokerId]) -> BTreeSet<BrokerId> {
        ids.iter().copied().collect()
    }

    #[test]
    fn test_assign_replicas_round_robin() {
        let plan = assign_replicas(3, 2, &ids(&[1, 2, 3]), 0).unwrap();
        assert_eq!(plan, vec![vec![1, 2], vec![2, 3], vec![3, 1]]);

        let rotated = assign_replicas(1, 3, &ids(&[1, 2, 3]), 1).unwrap();
        assert_eq!(rotated, vec![vec![2, 3, 1]]);
    }

    #[test]
    fn test_assign_replicas_rejects_bad_input() {
        assert!(assign_replicas(0, 1, &ids(&[1]), 0).is_err());
        assert!(assign_replicas(1, 0, &ids(&[1]), 0).is_err());
        assert!(assign_replicas(1, 3, &ids(&[1, 2]), 0).is_err());
    }

    #[test]
    fn test_plan_keeps_live_leaders() {
        let snapshot = snapshot_with(vec![vec![1, 2, 3], vec![2, 3, 1]]);
        assert!(plan_leadership(&snapshot, &ids(&[1, 2, 3])).is_empty());
    }

    #[test]
    fn test_plan_moves_to_first_live_replica() {
        let snapshot = snapshot_with(vec![vec![1, 2, 3], vec![2, 3, 1]]);
        let plan = plan_leadership(&snapshot, &ids(&[3, 1]));
        assert_eq!(
            plan,
            vec![LeaderChange {
                partition: TopicPartition::new("orders", 1),
                leader: Some(3),
                expected_epoch: 1,
            }]
        );
    }

    #[test]
    fn test_plan_marks_unavailable_when_no_replica_live() {
        let snapshot = snapshot_with(vec![vec![1, 2]]);
        let plan = plan_leadership(&snapshot, &ids(&[3]));
        assert_eq!(plan.len(), 1);
        assert_eq!(plan[0].leader, None);

        let mut unavailable = snapshot.clone();
        unavailable.apply(MetadataCommand::Topic(TopicCommand::SetPartitionLeader {
            topic: "orders".to_string(),
            partition: 0,
            leader: None,
            expected_epoch: 1,
        }));
        assert!(plan_leadership(&unavailable, &ids(&[3])).is_empty());
    }

    #[test]
    fn test_plan_is_deterministic() {
        let snapshot = snapshot_with(vec![vec![1, 2, 3], vec![1, 3, 2], vec![2, 1, 3]]);
        let live = ids(&[2, 3]);
        assert_eq!(plan_leadership(&snapshot, &live), plan_leadership(&snapshot, &live));
    }

    #[test]
    fn test_replacements_pick_least_loaded() {
        let mut snapshot = snapshot_with(vec![vec![1, 2], vec![2, 3]]);
        snapshot.apply(MetadataCommand::Topic(TopicCommand::CreateTopic {
            name: "audit".to_string(),
            assignments: vec![vec![3, 4]],
            timestamp_ms: 0,
        }));

        // Loads: 2 -> 2, 3 -> 2, 4 -> 1.
        let plans = plan_replica_replacements(&snapshot, &ids(&[2, 3, 4]), &ids(&[1]));
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].partition, TopicPartition::new("orders", 0));
        assert_eq!(plans[0].replicas, vec![2, 4]);
    }

    #[test]
    fn test_replacement_drops_replica_without_candidate() {
        let snapshot = snapshot_with(vec![vec![1, 2]]);
        let plans = plan_replica_replacements(&snapshot, &ids(&[2]), &ids(&[1]));
        assert_eq!(plans[0].replicas, vec![2]);

        let single = snapshot_with(vec![vec![1]]);
        assert!(plan_replica_replacements(&single, &ids(&[]), &ids(&[1])).is_empty());
    }

    #[test]
    fn test_replacement_never_takes_the_leader_slot() {
        let snapshot = snapshot_with(vec![vec![1, 2, 3]]);
        let plans = plan_replica_replacements(&snapshot, &ids(&[2, 3, 4]), &ids(&[1]));
        assert_eq!(plans[0].replicas, vec![2, 3, 4]);

        let mut after = snapshot.clone();
        after.apply(MetadataCommand::Topic(TopicCommand::SetReplicaSet {
            topic: "orders".to_string(),
            partition: 0,
            replicas: plans[0].replicas.clone(),
            expected_epoch: plans[0].expected_epoch,
        }));
        let assignment = after.partition(&TopicPartition::new("orders", 0)).unwrap();
        assert_eq!(assignment.leader, Some(2));
    }
}
