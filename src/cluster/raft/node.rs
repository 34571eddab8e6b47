//! Raft node wrapper providing a simpler interface.
//!
//! Wraps the openraft node, its RPC server and the proposal backpressure
//! semaphore. Writes submitted on a follower are forwarded to the leader.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use object_store::ObjectStore;
use openraft::error::{Fatal, RaftError};
use openraft::storage::Adaptor;
use openraft::{BasicNode, Raft};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use super::commands::{MetadataCommand, MetadataResponse};
use super::config::RaftConfig;
use super::network::{RaftNetworkFactoryImpl, RaftRpcService, forward_client_write_with_term};
use super::state_machine::MetadataStateMachine;
use super::storage::RaftStore;
use super::types::{RaftNodeId, TypeConfig, node_id_for};
use crate::cluster::error::{BrokerError, BrokerResult};
use crate::cluster::metrics;
use crate::cluster::rpc;
use crate::types::BrokerId;

/// Map an openraft API error. Storage failures are fatal to the node.
fn map_raft_error<E: std::error::Error>(
    context: &str,
    e: RaftError<RaftNodeId, E>,
) -> BrokerError {
    match e {
        RaftError::Fatal(Fatal::StorageError(e)) => {
            BrokerError::MetadataStorage(format!("{}: {}", context, e))
        }
        RaftError::Fatal(Fatal::Stopped) => BrokerError::Shutdown,
        other => BrokerError::Raft(format!("{}: {}", context, other)),
    }
}

/// A member of the metadata Raft group.
pub struct RaftNode {
    raft: Raft<TypeConfig>,
    state_machine: Arc<MetadataStateMachine>,
    network: RaftNetworkFactoryImpl,
    node_id: RaftNodeId,
    raft_addr: String,
    config: RaftConfig,
    shutdown_tx: watch::Sender<bool>,
    server_task: Mutex<Option<JoinHandle<()>>>,
    /// Limits concurrent proposals from this node.
    proposal_semaphore: Arc<Semaphore>,
}

impl RaftNode {
    /// Restore persisted state from `object_store`, start openraft and serve
    /// the Raft port on `listener`.
    ///
    /// `raft_addr` is the address other nodes use to reach `listener`.
    pub async fn start(
        config: RaftConfig,
        broker_id: BrokerId,
        listener: TcpListener,
        raft_addr: String,
        object_store: Arc<dyn ObjectStore>,
        prefix: &str,
    ) -> BrokerResult<Self> {
        if let Err(errors) = config.validate() {
            return Err(BrokerError::Config(format!(
                "invalid raft config: {}",
                errors.join(", ")
            )));
        }

        let node_id = node_id_for(broker_id);
        let state_machine = Arc::new(MetadataStateMachine::new());
        let store = RaftStore::new(object_store, prefix, Arc::clone(&state_machine));
        match store.load().await {
            Ok(true) => info!(node_id, "Restored metadata state from storage"),
            Ok(false) => info!(node_id, "No persisted metadata state, starting fresh"),
            Err(e) => return Err(BrokerError::MetadataStorage(e.to_string())),
        }

        let openraft_config = Arc::new(
            config
                .to_openraft_config()
                .validate()
                .map_err(|e| BrokerError::Config(format!("invalid raft config: {}", e)))?,
        );
        let network = RaftNetworkFactoryImpl::new();
        let (log_store, sm_store) = Adaptor::new(store);

        let raft = Raft::new(node_id, openraft_config, network.clone(), log_store, sm_store)
            .await
            .map_err(|e| match e {
                Fatal::StorageError(e) => BrokerError::MetadataStorage(e.to_string()),
                other => BrokerError::Raft(format!("failed to create raft node: {}", other)),
            })?;

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let service = Arc::new(RaftRpcService::new(raft.clone()));
        let server_task = tokio::spawn(rpc::serve("raft", listener, service, shutdown_rx));

        info!(node_id, raft_addr = %raft_addr, "Raft node started");

        Ok(Self {
            raft,
            state_machine,
            network,
            node_id,
            raft_addr,
            proposal_semaphore: Arc::new(Semaphore::new(config.max_pending_proposals)),
            config,
            shutdown_tx,
            server_task: Mutex::new(Some(server_task)),
        })
    }

    /// Initialize a single-voter cluster containing only this node. Other
    /// nodes join through the JoinCluster RPC.
    pub async fn initialize_cluster(&self) -> BrokerResult<()> {
        let mut members = BTreeMap::new();
        members.insert(
            self.node_id,
            BasicNode {
                addr: self.raft_addr.clone(),
            },
        );
        self.raft
            .initialize(members)
            .await
            .map_err(|e| map_raft_error("failed to initialize cluster", e))?;
        info!(node_id = self.node_id, "Metadata cluster initialized as single node");
        Ok(())
    }

    pub async fn add_learner(&self, node_id: RaftNodeId, addr: String) -> BrokerResult<()> {
        self.network.channel(node_id, &addr);
        self.raft
            .add_learner(node_id, BasicNode { addr }, true)
            .await
            .map_err(|e| map_raft_error("failed to add learner", e))?;
        info!(node_id, "Added learner to metadata cluster");
        Ok(())
    }

    pub async fn change_membership(
        &self,
        members: impl IntoIterator<Item = RaftNodeId>,
    ) -> BrokerResult<()> {
        let members: BTreeSet<_> = members.into_iter().collect();
        self.raft
            .change_membership(members, false)
            .await
            .map_err(|e| map_raft_error("failed to change membership", e))?;
        info!("Metadata membership changed");
        Ok(())
    }

    /// Commit a command and return its response once applied.
    ///
    /// Waits up to `proposal_timeout` for a proposal slot when
    /// `max_pending_proposals` are already in flight. On a follower the
    /// command is forwarded to the leader with the current term, so a
    /// leader that has since been deposed rejects it.
    pub async fn write(&self, command: MetadataCommand) -> BrokerResult<MetadataResponse> {
        let _permit = match timeout(
            self.config.proposal_timeout,
            self.proposal_semaphore.acquire(),
        )
        .await
        {
            Ok(Ok(permit)) => {
                metrics::record_raft_backpressure("acquired");
                permit
            }
            Ok(Err(_)) => return Err(BrokerError::Shutdown),
            Err(_) => {
                metrics::record_raft_backpressure("timeout");
                return Err(BrokerError::Raft(format!(
                    "proposal backpressure timeout: too many pending proposals (max {})",
                    self.config.max_pending_proposals
                )));
            }
        };
        metrics::set_raft_pending_proposals(self.pending_proposals());

        let start = Instant::now();
        let result = self.raft.client_write(command.clone()).await;
        let status = if result.is_ok() { "success" } else { "error" };
        metrics::record_raft_proposal(status, start.elapsed().as_secs_f64());

        let err = match result {
            Ok(response) => return Ok(response.data),
            Err(e) => e,
        };

        let Some(fwd) = err.forward_to_leader::<BasicNode>() else {
            return Err(map_raft_error("raft write failed", err));
        };
        let (Some(leader_id), Some(leader_node)) = (fwd.leader_id, fwd.leader_node.as_ref()) else {
            return Err(BrokerError::NoQuorum(
                "no metadata leader elected".to_string(),
            ));
        };

        let current_term = self.raft.metrics().borrow().current_term;
        debug!(
            node_id = self.node_id,
            leader_id,
            leader_addr = %leader_node.addr,
            current_term,
            "Forwarding metadata write to leader"
        );
        let channel = self.network.channel(leader_id, &leader_node.addr);
        match forward_client_write_with_term(&channel, command, current_term, 0).await {
            Ok(response) => {
                metrics::RAFT_FORWARDED_WRITES
                    .with_label_values(&["success"])
                    .inc();
                Ok(response)
            }
            Err(e) => {
                metrics::RAFT_FORWARDED_WRITES
                    .with_label_values(&["error"])
                    .inc();
                if e.kind() == std::io::ErrorKind::NotConnected {
                    Err(BrokerError::NoQuorum(e.to_string()))
                } else {
                    Err(BrokerError::Rpc(format!("failed to forward to leader: {}", e)))
                }
            }
        }
    }

    /// Confirm leadership with a quorum so the local state is current.
    pub async fn ensure_linearizable(&self) -> BrokerResult<()> {
        self.raft
            .ensure_linearizable()
            .await
            .map_err(|e| map_raft_error("failed to ensure linearizable", e))?;
        Ok(())
    }

    pub fn current_leader(&self) -> Option<RaftNodeId> {
        self.raft.metrics().borrow().current_leader
    }

    pub fn is_leader(&self) -> bool {
        self.current_leader() == Some(self.node_id)
    }

    /// Wait until some node is leader, or fail with `ElectionTimeout`.
    pub async fn wait_for_leader(&self, wait: Duration) -> BrokerResult<RaftNodeId> {
        let mut rx = self.raft.metrics();
        let leader = timeout(wait, async {
            rx.wait_for(|m| m.current_leader.is_some())
                .await
                .ok()
                .and_then(|m| m.current_leader)
        })
        .await
        .map_err(|_| BrokerError::ElectionTimeout(wait))?;
        leader.ok_or(BrokerError::Shutdown)
    }

    /// Wait until the Raft core stops on a storage error and return it.
    /// Returns `None` if the core went away for any other reason.
    pub async fn storage_failure(&self) -> Option<String> {
        let mut rx = self.raft.metrics();
        loop {
            let failure = match &rx.borrow().running_state {
                Err(Fatal::StorageError(e)) => Some(e.to_string()),
                _ => None,
            };
            if failure.is_some() {
                return failure;
            }
            if rx.changed().await.is_err() {
                return match &rx.borrow().running_state {
                    Err(Fatal::StorageError(e)) => Some(e.to_string()),
                    _ => None,
                };
            }
        }
    }

    /// Whether a membership exists, either restored or from initialization.
    pub fn is_initialized(&self) -> bool {
        let metrics = self.raft.metrics();
        let m = metrics.borrow();
        m.membership_config.membership().voter_ids().next().is_some()
    }

    pub fn is_voter(&self, node_id: RaftNodeId) -> bool {
        let metrics = self.raft.metrics();
        let m = metrics.borrow();
        m.membership_config
            .membership()
            .voter_ids()
            .any(|id| id == node_id)
    }

    pub fn state_machine(&self) -> Arc<MetadataStateMachine> {
        Arc::clone(&self.state_machine)
    }

    pub fn node_id(&self) -> RaftNodeId {
        self.node_id
    }

    pub fn raft_addr(&self) -> &str {
        &self.raft_addr
    }

    pub fn metrics(&self) -> openraft::RaftMetrics<RaftNodeId, BasicNode> {
        self.raft.metrics().borrow().clone()
    }

    /// Push the current Raft metrics into the prometheus registry.
    pub fn refresh_metrics(&self) {
        metrics::update_raft_metrics(&self.metrics());
    }

    pub fn pending_proposals(&self) -> usize {
        self.config.max_pending_proposals - self.proposal_semaphore.available_permits()
    }

    /// Stop the RPC server and the openraft core.
    pub async fn shutdown(&self) -> BrokerResult<()> {
        self.shutdown_tx.send_replace(true);
        self.proposal_semaphore.close();
        let task = self.server_task.lock().take();
        if let Some(task) = task
            && let Err(e) = task.await
        {
            warn!(error = %e, "Raft RPC server task failed");
        }
        self.raft
            .shutdown()
            .await
            .map_err(|e| BrokerError::Raft(format!("failed to shut down raft: {}", e)))?;
        info!(node_id = self.node_id, "Raft node shut down");
        Ok(())
    }
}
