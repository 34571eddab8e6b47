//! Gossip membership over real UDP sockets on localhost.

use std::sync::Arc;
use std::time::Duration;

use ledgerline::cluster::membership::{MemberState, MembershipEvent, PROTOCOL_VERSION};
use ledgerline::cluster::{GossipConfig, Membership, NodeMeta};
use tokio::net::UdpSocket;
use tokio::sync::broadcast;

async fn start_node(broker_id: i32) -> Arc<Membership> {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap().to_string();
    let meta = NodeMeta {
        broker_id,
        client_addr: format!("127.0.0.1:{}", 19000 + broker_id),
        replication_addr: format!("127.0.0.1:{}", 19100 + broker_id),
        raft_addr: format!("127.0.0.1:{}", 19200 + broker_id),
        gossip_addr: addr,
        voter: true,
        protocol_version: PROTOCOL_VERSION,
    };
    Membership::start(GossipConfig::for_testing(), meta, socket)
}

async fn start_cluster(size: i32) -> Vec<Arc<Membership>> {
    let seed = start_node(0).await;
    let seed_addr = seed.local_addr().unwrap().to_string();
    let mut nodes = vec![seed];
    for id in 1..size {
        let node = start_node(id).await;
        assert_eq!(node.join(&[seed_addr.clone()]).await.unwrap(), 1);
        nodes.push(node);
    }
    nodes
}

async fn eventually<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<MembershipEvent>,
    timeout: Duration,
    mut matches: F,
) -> bool
where
    F: FnMut(&MembershipEvent) -> bool,
{
    let found = tokio::time::timeout(timeout, async {
        loop {
            match rx.recv().await {
                Ok(event) if matches(&event) => return true,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return false,
            }
        }
    })
    .await;
    matches!(found, Ok(true))
}

async fn shutdown_all(nodes: &[Arc<Membership>]) {
    for node in nodes {
        node.shutdown(Duration::from_secs(1)).await;
    }
}

#[tokio::test]
async fn test_three_nodes_converge() {
    let nodes = start_cluster(3).await;

    for node in &nodes {
        assert!(
            eventually(Duration::from_secs(5), || node.alive_members().len() == 3).await,
            "node {} sees {:?}",
            node.local_id(),
            node.alive_members()
        );
    }

    // Node 2 only ever talked to the seed, but learns node 1's endpoints.
    let node_one = nodes[2]
        .alive_members()
        .into_iter()
        .find(|m| m.broker_id == 1)
        .unwrap();
    assert_eq!(node_one.raft_addr, "127.0.0.1:19201");
    assert_eq!(node_one.gossip_addr, nodes[1].local_addr().unwrap().to_string());

    shutdown_all(&nodes).await;
}

#[tokio::test]
async fn test_join_without_reachable_seed_fails() {
    let node = start_node(7).await;

    // A bound socket that never answers.
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let silent_addr = silent.local_addr().unwrap().to_string();
    assert!(node.join(&[silent_addr]).await.is_err());

    // Seeding with only our own address is a no-op, not a failure.
    let own = node.local_addr().unwrap().to_string();
    assert_eq!(node.join(&[own]).await.unwrap(), 0);

    node.shutdown(Duration::from_secs(1)).await;
}

#[tokio::test]
async fn test_stopped_node_is_declared_failed() {
    let nodes = start_cluster(3).await;
    for node in &nodes {
        assert!(eventually(Duration::from_secs(5), || node.alive_members().len() == 3).await);
    }

    let mut events = nodes[0].subscribe();
    // Stopping without leaving looks like a crash to the others.
    nodes[2].shutdown(Duration::from_secs(1)).await;

    assert!(
        wait_for_event(&mut events, Duration::from_secs(10), |e| {
            *e == MembershipEvent::Failed(2)
        })
        .await
    );
    for node in &nodes[..2] {
        assert!(
            eventually(Duration::from_secs(5), || {
                node.member_state(2) == Some(MemberState::Dead)
            })
            .await
        );
        assert_eq!(node.alive_members().len(), 2);
    }

    shutdown_all(&nodes[..2]).await;
}

#[tokio::test]
async fn test_leave_is_not_a_failure() {
    let nodes = start_cluster(3).await;
    for node in &nodes {
        assert!(eventually(Duration::from_secs(5), || node.alive_members().len() == 3).await);
    }

    let mut events = nodes[1].subscribe();
    nodes[2].leave().await;
    nodes[2].shutdown(Duration::from_secs(1)).await;

    assert!(
        wait_for_event(&mut events, Duration::from_secs(5), |e| {
            *e == MembershipEvent::Left(2)
        })
        .await
    );
    for node in &nodes[..2] {
        assert!(
            eventually(Duration::from_secs(5), || {
                node.member_state(2) == Some(MemberState::Left)
            })
            .await
        );
    }

    shutdown_all(&nodes[..2]).await;
}

#[tokio::test]
async fn test_restarted_node_rejoins() {
    let nodes = start_cluster(2).await;
    let seed_addr = nodes[0].local_addr().unwrap().to_string();
    assert!(eventually(Duration::from_secs(5), || nodes[0].alive_members().len() == 2).await);

    nodes[1].leave().await;
    nodes[1].shutdown(Duration::from_secs(1)).await;
    assert!(
        eventually(Duration::from_secs(5), || {
            nodes[0].member_state(1) == Some(MemberState::Left)
        })
        .await
    );

    let mut events = nodes[0].subscribe();
    let restarted = start_node(1).await;
    restarted.join(&[seed_addr]).await.unwrap();

    assert!(
        wait_for_event(&mut events, Duration::from_secs(5), |e| {
            matches!(e, MembershipEvent::Joined(meta) if meta.broker_id == 1)
        })
        .await
    );
    assert_eq!(nodes[0].member_state(1), Some(MemberState::Alive));

    restarted.shutdown(Duration::from_secs(1)).await;
    nodes[0].shutdown(Duration::from_secs(1)).await;
}
