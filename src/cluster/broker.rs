//! Broker lifecycle and the client-facing produce/fetch surface.
//!
//! # Startup
//!
//! 1. Bind the replication, Raft and gossip sockets.
//! 2. Start gossip and join the seeds.
//! 3. Start the Raft node on `<data_dir>/raft`. A bootstrap broker
//!    initializes a new group; others ask a voter found through gossip to
//!    add them.
//! 4. Register in the metadata, then reconcile hosted partitions.
//! 5. Spawn heartbeat, controller, reconciler, retention and metrics tasks.
//!
//! # Shutdown
//!
//! Resign through `RemoveBroker`, leave gossip, stop background tasks, drain
//! in-flight appends, close partition stores, then stop Raft.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;
use object_store::ObjectStore;
use object_store::local::LocalFileSystem;
use parking_lot::Mutex;
use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::assignment::assign_replicas;
use super::background_tasks::BackgroundTaskRegistry;
use super::config::BrokerConfig;
use super::controller::Controller;
use super::error::{BrokerError, BrokerResult, LeaderHint};
use super::membership::{Membership, MembershipEvent, NodeMeta, PROTOCOL_VERSION};
use super::metrics::{self, record_fetch, record_produce};
use super::partition_log::{AckPolicy, PartitionLog, PartitionMap, PartitionOptions};
use super::raft::{
    BrokerCommand, BrokerEndpoints, BrokerResponse, MetadataCommand, MetadataResponse,
    MetadataSnapshot, RaftNode, TopicCommand, TopicResponse, request_cluster_join,
};
use super::reconciler::Reconciler;
use super::replication::{ReplicationHandler, TcpReplicaClient};
use super::retry::{join_policy, metadata_policy, with_policy};
use super::rpc::{self, ChannelOptions};
use crate::types::{BrokerId, Offset, Record, TopicPartition, current_time_ms};

const RAFT_METRICS_INTERVAL: Duration = Duration::from_secs(5);
const RAFT_PREFIX: &str = "metadata";
const BOOTSTRAP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Decrements the in-flight append count when dropped.
struct InflightGuard<'a>(&'a AtomicUsize);

impl Drop for InflightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

pub struct Broker {
    config: BrokerConfig,
    endpoints: BrokerEndpoints,
    raft: Arc<RaftNode>,
    membership: Arc<Membership>,
    partitions: Arc<PartitionMap>,
    replica_client: Arc<TcpReplicaClient>,
    reconciler: Arc<Reconciler>,
    controller: Arc<Controller>,
    tasks: BackgroundTaskRegistry,
    replication_shutdown: watch::Sender<bool>,
    replication_server: Mutex<Option<JoinHandle<()>>>,
    inflight: AtomicUsize,
    shutting_down: AtomicBool,
    metadata_failure: Mutex<Option<String>>,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("broker_id", &self.config.broker_id)
            .field("endpoints", &self.endpoints)
            .field("partitions", &self.partitions.len())
            .finish()
    }
}

impl Broker {
    pub async fn start(config: BrokerConfig) -> BrokerResult<Arc<Self>> {
        tokio::fs::create_dir_all(config.raft_dir()).await?;
        let object_store: Arc<dyn ObjectStore> =
            Arc::new(LocalFileSystem::new_with_prefix(config.raft_dir())?);
        Self::start_with_store(config, object_store).await
    }

    /// Start with an explicit object store for metadata persistence.
    pub async fn start_with_store(
        config: BrokerConfig,
        object_store: Arc<dyn ObjectStore>,
    ) -> BrokerResult<Arc<Self>> {
        if let Err(errors) = config.validate() {
            return Err(BrokerError::Config(errors.join("; ")));
        }
        let broker_id = config.broker_id;
        tokio::fs::create_dir_all(config.partitions_dir()).await?;

        let replication_listener = TcpListener::bind(&config.replication_addr).await?;
        let raft_listener = TcpListener::bind(&config.raft_addr).await?;
        let gossip_socket = UdpSocket::bind(&config.gossip_addr).await?;
        let endpoints = BrokerEndpoints {
            client_addr: config.client_addr.clone(),
            replication_addr: config.advertise(replication_listener.local_addr()?.port()),
            raft_addr: config.advertise(raft_listener.local_addr()?.port()),
            gossip_addr: config.advertise(gossip_socket.local_addr()?.port()),
        };
        info!(broker_id, ?endpoints, "Starting broker");

        let membership = Membership::start(
            config.gossip.clone(),
            NodeMeta {
                broker_id,
                client_addr: endpoints.client_addr.clone(),
                replication_addr: endpoints.replication_addr.clone(),
                raft_addr: endpoints.raft_addr.clone(),
                gossip_addr: endpoints.gossip_addr.clone(),
                voter: config.voter,
                protocol_version: PROTOCOL_VERSION,
            },
            gossip_socket,
        );
        if !config.seeds.is_empty() {
            let joined = with_policy(
                "gossip_join",
                join_policy(),
                || membership.join(&config.seeds),
                |_| true,
            )
            .await;
            match joined {
                Ok(answered) => debug!(broker_id, answered, "Gossip seeds answered"),
                Err(e) if config.bootstrap => {
                    warn!(broker_id, error = %e, "No gossip seed answered, continuing as bootstrap broker");
                }
                Err(e) => return Err(e),
            }
        }

        let raft = Arc::new(
            RaftNode::start(
                config.raft.clone(),
                broker_id,
                raft_listener,
                endpoints.raft_addr.clone(),
                object_store,
                RAFT_PREFIX,
            )
            .await?,
        );

        if raft.is_initialized() {
            info!(broker_id, "Metadata group restored from disk");
        } else if config.bootstrap {
            wait_for_bootstrap_peers(&membership, config.bootstrap_expect, config.join_timeout)
                .await?;
            raft.initialize_cluster().await?;
        } else {
            join_metadata_group(&membership, &raft, config.voter).await?;
        }
        raft.wait_for_leader(config.join_timeout).await?;
        register(&raft, broker_id, &endpoints, config.voter).await?;

        let partitions: Arc<PartitionMap> = Arc::new(DashMap::new());
        let handler = Arc::new(ReplicationHandler::new(Arc::clone(&partitions)));
        let (replication_shutdown, shutdown_rx) = watch::channel(false);
        let replication_server = tokio::spawn(rpc::serve(
            "replication",
            replication_listener,
            handler,
            shutdown_rx,
        ));

        let replica_client = Arc::new(TcpReplicaClient::new(ChannelOptions::default()));
        let initial = raft.state_machine().current();
        replica_client.set_addresses(replication_addresses(&initial));

        let reconciler = Arc::new(Reconciler::new(
            broker_id,
            config.partitions_dir(),
            config.segment.clone(),
            PartitionOptions::from(&config),
            config.delete_unassigned,
            Arc::clone(&partitions),
            replica_client.clone(),
        ));
        reconciler.reconcile(&initial).await;

        let controller = Arc::new(Controller::new(
            Arc::clone(&raft),
            config.broker_session_timeout,
        ));

        let broker = Arc::new(Self {
            config,
            endpoints,
            raft,
            membership,
            partitions,
            replica_client,
            reconciler,
            controller,
            tasks: BackgroundTaskRegistry::new(),
            replication_shutdown,
            replication_server: Mutex::new(Some(replication_server)),
            inflight: AtomicUsize::new(0),
            shutting_down: AtomicBool::new(false),
            metadata_failure: Mutex::new(None),
        });
        broker.spawn_tasks();
        info!(broker_id, "Broker started");
        Ok(broker)
    }

    fn spawn_tasks(self: &Arc<Self>) {
        let raft = Arc::clone(&self.raft);
        let broker = Arc::downgrade(self);
        self.tasks.spawn("metadata-guard", async move {
            if let Some(reason) = raft.storage_failure().await
                && let Some(broker) = broker.upgrade()
            {
                broker.fail_metadata(reason).await;
            }
        });

        let mut snapshots = self.raft.state_machine().subscribe();
        let reconciler = Arc::clone(&self.reconciler);
        let replica_client = Arc::clone(&self.replica_client);
        self.tasks.spawn("metadata-apply", async move {
            while let Some(snapshot) = snapshots.recv().await {
                replica_client.set_addresses(replication_addresses(&snapshot));
                reconciler.on_snapshot(&snapshot).await;
            }
        });

        let reconciler = Arc::clone(&self.reconciler);
        let raft = Arc::clone(&self.raft);
        self.tasks
            .spawn_periodic("reconcile", self.config.reconcile_interval, move || {
                let reconciler = Arc::clone(&reconciler);
                let snapshot = raft.state_machine().current();
                async move {
                    reconciler.reconcile(&snapshot).await;
                }
            });

        let broker = Arc::downgrade(self);
        self.tasks.spawn_periodic(
            "heartbeat",
            self.config.broker_heartbeat_interval,
            move || {
                let broker = broker.upgrade();
                async move {
                    if let Some(broker) = broker {
                        broker.heartbeat().await;
                    }
                }
            },
        );

        self.tasks.spawn(
            "controller",
            Arc::clone(&self.controller).run(
                self.config.controller_interval,
                self.tasks.shutdown_signal(),
            ),
        );

        let mut events = self.membership.subscribe();
        let controller = Arc::clone(&self.controller);
        self.tasks.spawn("membership-events", async move {
            loop {
                match events.recv().await {
                    Ok(MembershipEvent::Failed(broker_id) | MembershipEvent::Left(broker_id)) => {
                        debug!(broker_id, "Gossip reports broker gone, waking controller");
                        controller.wake();
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Membership event receiver lagged");
                        controller.wake();
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });

        let partitions = Arc::clone(&self.partitions);
        self.tasks.spawn_periodic(
            "retention",
            self.config.retention_check_interval,
            move || {
                let logs: Vec<Arc<PartitionLog>> =
                    partitions.iter().map(|e| Arc::clone(e.value())).collect();
                async move {
                    for log in logs {
                        match log.apply_retention().await {
                            Ok(0) => {}
                            Ok(removed) => {
                                info!(partition = %log.partition(), removed, "Retention removed segments")
                            }
                            Err(e) => {
                                warn!(partition = %log.partition(), error = %e, "Retention failed")
                            }
                        }
                    }
                }
            },
        );

        let raft = Arc::clone(&self.raft);
        self.tasks
            .spawn_periodic("raft-metrics", RAFT_METRICS_INTERVAL, move || {
                raft.refresh_metrics();
                async {}
            });
    }

    async fn heartbeat(&self) {
        if self.shutting_down.load(Ordering::Acquire) {
            return;
        }
        let broker_id = self.config.broker_id;
        let command = MetadataCommand::Broker(BrokerCommand::Heartbeat {
            broker_id,
            timestamp_ms: current_time_ms(),
        });
        match self.raft.write(command).await {
            Ok(MetadataResponse::Broker(BrokerResponse::NotFound { .. })) => {
                warn!(broker_id, "Metadata no longer knows this broker, registering again");
                if let Err(e) = register(&self.raft, broker_id, &self.endpoints, self.config.voter).await
                {
                    warn!(broker_id, error = %e, "Re-registration failed");
                }
            }
            Ok(_) => {}
            Err(e) if e.is_node_fatal() => self.fail_metadata(e.to_string()).await,
            Err(e) => debug!(broker_id, error = %e, "Heartbeat not committed"),
        }
    }

    /// Stop serving partitions after the metadata store failed. Followers
    /// keep no stale leadership and clients see `MetadataStorage` errors.
    async fn fail_metadata(&self, reason: String) {
        {
            let mut failure = self.metadata_failure.lock();
            if failure.is_some() {
                return;
            }
            *failure = Some(reason.clone());
        }
        error!(broker_id = self.config.broker_id, error = %reason, "Metadata storage failed, closing partitions");
        self.reconciler.halt().await;
    }

    /// Whether metadata storage failed and the broker stopped serving.
    pub fn is_metadata_failed(&self) -> bool {
        self.metadata_failure.lock().is_some()
    }

    fn check_metadata(&self) -> BrokerResult<()> {
        match &*self.metadata_failure.lock() {
            Some(reason) => Err(BrokerError::MetadataStorage(reason.clone())),
            None => Ok(()),
        }
    }

    pub fn broker_id(&self) -> BrokerId {
        self.config.broker_id
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// Addresses this broker advertises, with bound ports filled in.
    pub fn endpoints(&self) -> &BrokerEndpoints {
        &self.endpoints
    }

    pub fn raft(&self) -> &Arc<RaftNode> {
        &self.raft
    }

    pub fn membership(&self) -> &Arc<Membership> {
        &self.membership
    }

    /// The latest committed metadata.
    pub fn metadata(&self) -> Arc<MetadataSnapshot> {
        self.raft.state_machine().current()
    }

    /// Wait until committed metadata satisfies `condition`.
    pub async fn wait_for_metadata<F>(&self, timeout: Duration, mut condition: F) -> bool
    where
        F: FnMut(&MetadataSnapshot) -> bool,
    {
        let mut rx = self.raft.state_machine().watch();
        tokio::time::timeout(timeout, async {
            rx.wait_for(|snapshot| condition(snapshot.as_ref())).await.is_ok()
        })
        .await
        .unwrap_or(false)
    }

    pub fn leader_for(&self, topic: &str, partition: i32) -> Option<LeaderHint> {
        self.metadata()
            .leader_hint(&TopicPartition::new(topic, partition))
    }

    /// The local replica of a partition, if hosted here.
    pub fn partition(&self, topic: &str, partition: i32) -> Option<Arc<PartitionLog>> {
        self.partitions
            .get(&TopicPartition::new(topic, partition))
            .map(|e| Arc::clone(e.value()))
    }

    pub fn hosted_partitions(&self) -> Vec<TopicPartition> {
        let mut hosted: Vec<_> = self.partitions.iter().map(|e| e.key().clone()).collect();
        hosted.sort();
        hosted
    }

    /// Create a topic with replicas spread round-robin over active brokers.
    pub async fn create_topic(
        &self,
        name: &str,
        partitions: usize,
        replication_factor: usize,
    ) -> BrokerResult<()> {
        let snapshot = self.metadata();
        let brokers = snapshot.brokers.active_broker_ids();
        let start = snapshot.partitions().count();
        let assignments = assign_replicas(partitions, replication_factor, &brokers, start)
            .map_err(BrokerError::InvalidRequest)?;

        let command = TopicCommand::CreateTopic {
            name: name.to_string(),
            assignments,
            timestamp_ms: current_time_ms(),
        };
        match self.write_metadata("create_topic", MetadataCommand::Topic(command)).await? {
            MetadataResponse::Topic(TopicResponse::TopicCreated { partitions, .. }) => {
                info!(topic = name, partitions, replication_factor, "Created topic");
                Ok(())
            }
            MetadataResponse::Topic(TopicResponse::TopicAlreadyExists { name }) => {
                Err(BrokerError::TopicAlreadyExists(name))
            }
            MetadataResponse::Topic(TopicResponse::InvalidAssignment { reason }) => {
                Err(BrokerError::InvalidRequest(reason))
            }
            other => Err(BrokerError::Raft(format!(
                "unexpected create topic response: {:?}",
                other
            ))),
        }
    }

    pub async fn delete_topic(&self, name: &str) -> BrokerResult<()> {
        let command = TopicCommand::DeleteTopic {
            name: name.to_string(),
        };
        match self.write_metadata("delete_topic", MetadataCommand::Topic(command)).await? {
            MetadataResponse::Topic(TopicResponse::TopicDeleted { .. }) => {
                info!(topic = name, "Deleted topic");
                Ok(())
            }
            MetadataResponse::Topic(TopicResponse::TopicNotFound { name }) => {
                Err(BrokerError::UnknownTopicOrPartition {
                    topic: name,
                    partition: -1,
                })
            }
            other => Err(BrokerError::Raft(format!(
                "unexpected delete topic response: {:?}",
                other
            ))),
        }
    }

    async fn write_metadata(
        &self,
        operation: &'static str,
        command: MetadataCommand,
    ) -> BrokerResult<MetadataResponse> {
        with_policy(
            operation,
            metadata_policy(),
            || self.raft.write(command.clone()),
            |e: &BrokerError| e.is_retryable(),
        )
        .await
    }

    /// Append `value` with the configured ack policy.
    pub async fn produce(
        &self,
        topic: &str,
        partition: i32,
        value: impl Into<Bytes>,
    ) -> BrokerResult<Offset> {
        self.produce_with(topic, partition, value, self.config.ack_policy)
            .await
    }

    pub async fn produce_with(
        &self,
        topic: &str,
        partition: i32,
        value: impl Into<Bytes>,
        ack: AckPolicy,
    ) -> BrokerResult<Offset> {
        let start = Instant::now();
        let value = value.into();
        let bytes = value.len();
        let result = self.produce_inner(topic, partition, value, ack).await;
        let status = match &result {
            Ok(_) => "ok",
            Err(e) => e.as_metric_label(),
        };
        record_produce(status, ack.as_str(), start.elapsed().as_secs_f64(), bytes);
        result
    }

    async fn produce_inner(
        &self,
        topic: &str,
        partition: i32,
        value: Bytes,
        ack: AckPolicy,
    ) -> BrokerResult<Offset> {
        if self.shutting_down.load(Ordering::Acquire) {
            return Err(BrokerError::Shutdown);
        }
        self.inflight.fetch_add(1, Ordering::AcqRel);
        let _inflight = InflightGuard(&self.inflight);

        let log = self.leader_log(topic, partition)?;
        match log.append_with(value, ack).await {
            // Metadata names us but the reconciler has not applied the role yet.
            Err(BrokerError::NotLeaderForPartition { partition, .. }) => Err(
                BrokerError::unavailable(partition, "leadership not yet applied locally"),
            ),
            other => other,
        }
    }

    /// Read from the partition leader.
    pub async fn fetch(
        &self,
        topic: &str,
        partition: i32,
        offset: Offset,
        max_bytes: usize,
    ) -> BrokerResult<Vec<Record>> {
        let result = match self.leader_log(topic, partition) {
            Ok(log) => {
                log.read(offset, max_bytes.min(self.config.max_fetch_bytes))
                    .await
            }
            Err(e) => Err(e),
        };
        match &result {
            Ok(records) => record_fetch("ok", records.iter().map(|r| r.value.len()).sum()),
            Err(e) => record_fetch(e.as_metric_label(), 0),
        }
        result
    }

    /// The local log of a partition this broker leads according to metadata.
    fn leader_log(&self, topic: &str, partition: i32) -> BrokerResult<Arc<PartitionLog>> {
        self.check_metadata()?;
        let tp = TopicPartition::new(topic, partition);
        let snapshot = self.metadata();
        let assignment =
            snapshot
                .partition(&tp)
                .ok_or_else(|| BrokerError::UnknownTopicOrPartition {
                    topic: topic.to_string(),
                    partition,
                })?;
        match assignment.leader {
            None => return Err(BrokerError::unavailable(tp, "no live replica")),
            Some(leader) if leader != self.config.broker_id => {
                let hint = snapshot.leader_hint(&tp);
                return Err(BrokerError::not_leader(tp, hint));
            }
            Some(_) => {}
        }
        self.partitions
            .get(&tp)
            .map(|e| Arc::clone(e.value()))
            .ok_or_else(|| BrokerError::unavailable(tp, "partition not yet open locally"))
    }

    /// Leave the cluster and release every resource. Safe to call twice.
    pub async fn shutdown(&self) -> BrokerResult<()> {
        if self.shutting_down.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let broker_id = self.config.broker_id;
        info!(broker_id, "Shutting down broker");

        let resign = MetadataCommand::Broker(BrokerCommand::Remove { broker_id });
        if let Err(e) = self.raft.write(resign).await {
            warn!(broker_id, error = %e, "Could not resign from metadata");
        }
        self.membership.leave().await;

        let drain_timeout = self.config.leave_drain_timeout;
        self.tasks.shutdown(drain_timeout).await;
        self.drain_appends(drain_timeout).await;

        self.reconciler.close_all().await;
        self.replication_shutdown.send_replace(true);
        let server = self.replication_server.lock().take();
        if let Some(server) = server
            && let Err(e) = server.await
        {
            warn!(broker_id, error = %e, "Replication server task failed");
        }

        self.membership.shutdown(drain_timeout).await;
        self.raft.shutdown().await?;
        info!(broker_id, "Broker stopped");
        Ok(())
    }

    async fn drain_appends(&self, timeout: Duration) {
        let deadline = Instant::now() + timeout;
        loop {
            let pending = self.inflight.load(Ordering::Acquire);
            if pending == 0 {
                return;
            }
            if Instant::now() >= deadline {
                warn!(pending, "Appends still in flight at shutdown");
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

/// Ask voters known through gossip to add this node to the metadata group.
/// Wait until gossip sees `expect` alive brokers, the local one included.
async fn wait_for_bootstrap_peers(
    membership: &Membership,
    expect: usize,
    wait: Duration,
) -> BrokerResult<()> {
    let start = Instant::now();
    loop {
        let alive = membership.alive_members().len();
        if alive >= expect {
            if expect > 1 {
                info!(alive, expect, "Expected brokers present, bootstrapping metadata group");
            }
            return Ok(());
        }
        if start.elapsed() >= wait {
            return Err(BrokerError::NoQuorum(format!(
                "only {} of {} expected brokers joined before bootstrap",
                alive, expect
            )));
        }
        debug!(alive, expect, "Waiting for brokers before bootstrap");
        tokio::time::sleep(BOOTSTRAP_POLL_INTERVAL).await;
    }
}

async fn join_metadata_group(
    membership: &Membership,
    raft: &RaftNode,
    voter: bool,
) -> BrokerResult<()> {
    let node_id = raft.node_id();
    let raft_addr = raft.raft_addr().to_string();
    let local_id = membership.local_id();

    with_policy(
        "raft_join",
        join_policy(),
        || {
            let peers: Vec<String> = membership
                .alive_members()
                .into_iter()
                .filter(|m| m.broker_id != local_id && m.voter)
                .map(|m| m.raft_addr)
                .collect();
            let raft_addr = raft_addr.clone();
            async move {
                if peers.is_empty() {
                    return Err(BrokerError::NoQuorum(
                        "no metadata voter known through gossip".to_string(),
                    ));
                }
                let mut last_error = None;
                for peer in &peers {
                    match request_cluster_join(peer, node_id, &raft_addr, voter).await {
                        Ok(()) => {
                            info!(node_id, peer = %peer, voter, "Joined metadata group");
                            return Ok(());
                        }
                        Err(e) => {
                            debug!(node_id, peer = %peer, error = %e, "Join via peer failed");
                            last_error = Some(e);
                        }
                    }
                }
                Err(BrokerError::Rpc(format!(
                    "metadata join failed: {}",
                    last_error.map(|e| e.to_string()).unwrap_or_default()
                )))
            }
        },
        |_| true,
    )
    .await
}

async fn register(
    raft: &RaftNode,
    broker_id: BrokerId,
    endpoints: &BrokerEndpoints,
    voter: bool,
) -> BrokerResult<()> {
    let command = MetadataCommand::Broker(BrokerCommand::Register {
        broker_id,
        endpoints: endpoints.clone(),
        voter,
        timestamp_ms: current_time_ms(),
    });
    with_policy(
        "register",
        metadata_policy(),
        || raft.write(command.clone()),
        |e: &BrokerError| e.is_retryable(),
    )
    .await?;
    metrics::record_controller_decision("register", "applied");
    info!(broker_id, "Registered broker");
    Ok(())
}

fn replication_addresses(snapshot: &MetadataSnapshot) -> HashMap<BrokerId, String> {
    snapshot
        .brokers
        .brokers
        .values()
        .map(|b| (b.broker_id, b.endpoints.replication_addr.clone()))
        .collect()
}
