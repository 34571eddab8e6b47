//! Tests for the metadata state machine and the Raft group that replicates it.
//!
//! **Note:** The Raft tests bind TCP listeners on 127.0.0.1 with ephemeral
//! ports and keep their state in an in-memory object store.

use std::sync::Arc;
use std::time::Duration;

use object_store::ObjectStore;
use object_store::memory::InMemory;
use tokio::net::TcpListener;
use tokio::time::sleep;

use ledgerline::cluster::raft::{
    BrokerCommand, BrokerEndpoints, BrokerResponse, BrokerStatus, MetadataCommand,
    MetadataResponse, MetadataSnapshot, MetadataStateMachine, RaftConfig, RaftNode, TopicCommand,
    TopicResponse, node_id_for, request_cluster_join,
};
use ledgerline::types::{BrokerId, TopicPartition};

// ============================================================================
// Test Utilities
// ============================================================================

fn register(broker_id: BrokerId) -> MetadataCommand {
    MetadataCommand::Broker(BrokerCommand::Register {
        broker_id,
        endpoints: BrokerEndpoints {
            client_addr: format!("127.0.0.1:{}", 9100 + broker_id),
            ..Default::default()
        },
        voter: true,
        timestamp_ms: 1_000,
    })
}

fn create_topic(name: &str, assignments: Vec<Vec<BrokerId>>) -> MetadataCommand {
    MetadataCommand::Topic(TopicCommand::CreateTopic {
        name: name.to_string(),
        assignments,
        timestamp_ms: 1_000,
    })
}

fn set_leader(topic: &str, partition: i32, leader: Option<BrokerId>, expected_epoch: u64) -> MetadataCommand {
    MetadataCommand::Topic(TopicCommand::SetPartitionLeader {
        topic: topic.to_string(),
        partition,
        leader,
        expected_epoch,
    })
}

async fn start_node(broker_id: BrokerId, store: Arc<dyn ObjectStore>) -> RaftNode {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    RaftNode::start(
        RaftConfig::for_testing(),
        broker_id,
        listener,
        addr,
        store,
        &format!("broker-{}", broker_id),
    )
    .await
    .unwrap()
}

async fn wait_until<F: FnMut() -> bool>(timeout: Duration, mut condition: F) -> bool {
    let start = std::time::Instant::now();
    while start.elapsed() < timeout {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

// ============================================================================
// State machine
// ============================================================================

#[test]
fn test_snapshot_leadership_lifecycle() {
    let mut snapshot = MetadataSnapshot::default();
    snapshot.apply(register(1));
    snapshot.apply(register(2));
    snapshot.apply(create_topic("orders", vec![vec![1, 2], vec![2, 1]]));

    let p0 = TopicPartition::new("orders", 0);
    let assignment = snapshot.partition(&p0).unwrap();
    assert_eq!(assignment.leader, Some(1));
    assert_eq!(assignment.leader_epoch, 1);

    let hint = snapshot.leader_hint(&p0).unwrap();
    assert_eq!(hint.broker_id, 1);
    assert_eq!(hint.addr, "127.0.0.1:9101");

    // A stale epoch is rejected and changes nothing.
    assert_eq!(
        snapshot.apply(set_leader("orders", 0, Some(2), 0)),
        MetadataResponse::Topic(TopicResponse::EpochMismatch {
            expected: 0,
            current: 1
        })
    );
    assert_eq!(snapshot.leader_for(&p0), Some(1));

    assert_eq!(
        snapshot.apply(set_leader("orders", 0, Some(2), 1)),
        MetadataResponse::Topic(TopicResponse::LeaderChanged {
            leader: Some(2),
            leader_epoch: 2
        })
    );

    // Only replicas can lead.
    assert!(matches!(
        snapshot.apply(set_leader("orders", 0, Some(7), 2)),
        MetadataResponse::Topic(TopicResponse::InvalidAssignment { .. })
    ));

    // No live replica: unavailable, but the epoch still moves.
    snapshot.apply(set_leader("orders", 0, None, 2));
    assert_eq!(snapshot.leader_for(&p0), None);
    assert_eq!(snapshot.partition(&p0).unwrap().leader_epoch, 3);
    assert!(snapshot.leader_hint(&p0).is_none());
}

#[test]
fn test_replica_set_change_moves_departed_leader() {
    let mut snapshot = MetadataSnapshot::default();
    snapshot.apply(create_topic("orders", vec![vec![1, 2, 3]]));
    let response = snapshot.apply(MetadataCommand::Topic(TopicCommand::SetReplicaSet {
        topic: "orders".to_string(),
        partition: 0,
        replicas: vec![4, 2, 3],
        expected_epoch: 1,
    }));
    assert_eq!(
        response,
        MetadataResponse::Topic(TopicResponse::ReplicasChanged {
            replicas: vec![4, 2, 3],
            leader_epoch: 2
        })
    );
    let assignment = snapshot.partition(&TopicPartition::new("orders", 0)).unwrap();
    // The new broker has no data yet, so a surviving replica leads.
    assert_eq!(assignment.leader, Some(2));
    assert_eq!(snapshot.assigned_to(1).count(), 0);
    assert_eq!(snapshot.assigned_to(4).count(), 1);
}

#[test]
fn test_broker_lifecycle() {
    let mut snapshot = MetadataSnapshot::default();
    snapshot.apply(register(1));
    assert!(snapshot.brokers.is_active(1));

    snapshot.apply(MetadataCommand::Broker(BrokerCommand::Fence {
        broker_id: 1,
        reason: "session timeout".to_string(),
    }));
    assert_eq!(snapshot.brokers.get(1).unwrap().status, BrokerStatus::Fenced);

    // A heartbeat from a fenced broker brings it back.
    let seq = snapshot.brokers.get(1).unwrap().heartbeat_seq;
    assert_eq!(
        snapshot.apply(MetadataCommand::Broker(BrokerCommand::Heartbeat {
            broker_id: 1,
            timestamp_ms: 2_000
        })),
        MetadataResponse::Broker(BrokerResponse::HeartbeatAck)
    );
    assert!(snapshot.brokers.is_active(1));
    assert_eq!(snapshot.brokers.get(1).unwrap().heartbeat_seq, seq + 1);

    // A resigned broker must register again.
    snapshot.apply(MetadataCommand::Broker(BrokerCommand::Remove { broker_id: 1 }));
    assert!(snapshot.brokers.resigned_broker_ids().contains(&1));
    assert_eq!(
        snapshot.apply(MetadataCommand::Broker(BrokerCommand::Heartbeat {
            broker_id: 1,
            timestamp_ms: 3_000
        })),
        MetadataResponse::Broker(BrokerResponse::NotFound { broker_id: 1 })
    );
    snapshot.apply(register(1));
    assert!(snapshot.brokers.is_active(1));
}

#[tokio::test]
async fn test_subscribers_see_every_version_in_order() {
    let state_machine = MetadataStateMachine::new();
    let mut rx = state_machine.subscribe();
    assert_eq!(rx.recv().await.unwrap().version, 0);

    state_machine.apply(1, register(1));
    state_machine.apply(2, create_topic("orders", vec![vec![1]]));
    state_machine.advance(3);
    state_machine.apply(4, MetadataCommand::Topic(TopicCommand::DeleteTopic {
        name: "orders".to_string(),
    }));

    let versions: Vec<u64> = [
        rx.recv().await.unwrap(),
        rx.recv().await.unwrap(),
        rx.recv().await.unwrap(),
        rx.recv().await.unwrap(),
    ]
    .iter()
    .map(|s| s.version)
    .collect();
    assert_eq!(versions, vec![1, 2, 3, 4]);
    assert!(!state_machine.current().has_topic("orders"));

    // The watch channel only holds the latest.
    let watch = state_machine.watch();
    assert_eq!(watch.borrow().version, 4);
}

#[test]
fn test_snapshot_restore_round_trip() {
    let source = MetadataStateMachine::new();
    source.apply(1, register(1));
    source.apply(2, register(2));
    source.apply(3, create_topic("orders", vec![vec![1, 2], vec![2, 1]]));
    let bytes = source.snapshot_bytes().unwrap();

    let target = MetadataStateMachine::new();
    target.restore(&bytes).unwrap();
    assert_eq!(*target.current(), *source.current());
    assert_eq!(target.current().version, 3);
}

// ============================================================================
// Raft group
// ============================================================================

#[tokio::test]
async fn test_single_node_commits_commands() {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let node = start_node(0, store).await;
    assert!(!node.is_initialized());
    node.initialize_cluster().await.unwrap();
    node.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    assert!(node.is_leader());

    assert_eq!(
        node.write(register(0)).await.unwrap(),
        MetadataResponse::Broker(BrokerResponse::Registered { broker_id: 0 })
    );
    node.write(create_topic("orders", vec![vec![0]])).await.unwrap();
    assert_eq!(
        node.write(create_topic("orders", vec![vec![0]])).await.unwrap(),
        MetadataResponse::Topic(TopicResponse::TopicAlreadyExists {
            name: "orders".to_string()
        })
    );

    let snapshot = node.state_machine().current();
    assert!(snapshot.has_topic("orders"));
    assert!(snapshot.version > 0);
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_node_restores_state_after_restart() {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    {
        let node = start_node(0, Arc::clone(&store)).await;
        node.initialize_cluster().await.unwrap();
        node.wait_for_leader(Duration::from_secs(5)).await.unwrap();
        node.write(register(0)).await.unwrap();
        node.write(create_topic("orders", vec![vec![0]])).await.unwrap();
        node.shutdown().await.unwrap();
    }

    let node = start_node(0, store).await;
    assert!(node.is_initialized());
    node.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    let state_machine = node.state_machine();
    assert!(
        wait_until(Duration::from_secs(5), || state_machine
            .current()
            .has_topic("orders"))
        .await
    );
    assert!(state_machine.current().brokers.is_active(0));
    node.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_three_voters_replicate_and_forward_writes() {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let first = start_node(0, Arc::clone(&store)).await;
    first.initialize_cluster().await.unwrap();
    first.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    let second = start_node(1, Arc::clone(&store)).await;
    let third = start_node(2, Arc::clone(&store)).await;
    for node in [&second, &third] {
        request_cluster_join(first.raft_addr(), node.node_id(), node.raft_addr(), true)
            .await
            .unwrap();
    }
    assert!(
        wait_until(Duration::from_secs(10), || first.is_voter(node_id_for(1))
            && first.is_voter(node_id_for(2)))
        .await
    );

    // A write submitted on a follower is forwarded to the leader.
    let follower = if second.is_leader() { &third } else { &second };
    follower.wait_for_leader(Duration::from_secs(5)).await.unwrap();
    follower.write(register(1)).await.unwrap();
    follower
        .write(create_topic("orders", vec![vec![0, 1, 2]]))
        .await
        .unwrap();

    for node in [&first, &second, &third] {
        let state_machine = node.state_machine();
        assert!(
            wait_until(Duration::from_secs(5), || {
                let snapshot = state_machine.current();
                snapshot.has_topic("orders") && snapshot.brokers.is_active(1)
            })
            .await
        );
    }

    for node in [third, second, first] {
        node.shutdown().await.unwrap();
    }
}

#[tokio::test]
async fn test_learner_receives_metadata_without_voting() {
    let store: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
    let voter = start_node(0, Arc::clone(&store)).await;
    voter.initialize_cluster().await.unwrap();
    voter.wait_for_leader(Duration::from_secs(5)).await.unwrap();

    let learner = start_node(5, Arc::clone(&store)).await;
    request_cluster_join(voter.raft_addr(), learner.node_id(), learner.raft_addr(), false)
        .await
        .unwrap();
    voter.write(create_topic("audit", vec![vec![0]])).await.unwrap();

    let state_machine = learner.state_machine();
    assert!(
        wait_until(Duration::from_secs(5), || state_machine
            .current()
            .has_topic("audit"))
        .await
    );
    assert!(!voter.is_voter(learner.node_id()));

    learner.shutdown().await.unwrap();
    voter.shutdown().await.unwrap();
}
