//! Partition leadership controller.
//!
//! Runs on every broker but only acts while its node leads the metadata
//! Raft group. Each tick:
//!
//! 1. Feeds committed heartbeat sequence numbers into a [`FailureDetector`]
//!    and fences brokers that made no progress for a session timeout.
//! 2. Replaces resigned brokers in replica sets.
//! 3. Moves leadership off brokers that are no longer live.
//!
//! Liveness comes only from committed metadata. Gossip failure events call
//! [`Controller::wake`] so a tick runs early, nothing more.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::assignment::{plan_leadership, plan_replica_replacements};
use super::error::BrokerResult;
use super::failure_detector::{BrokerHealthState, FailureDetector};
use super::metrics::record_controller_decision;
use super::raft::{
    BrokerCommand, BrokerStatus, MetadataCommand, MetadataResponse, MetadataSnapshot, RaftNode,
    TopicCommand, TopicResponse,
};
use crate::types::BrokerId;

/// What one tick changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ControllerReport {
    pub acted: bool,
    pub fenced: Vec<BrokerId>,
    pub leaders_changed: usize,
    pub replica_sets_changed: usize,
    pub stale_plans: usize,
}

pub struct Controller {
    raft: Arc<RaftNode>,
    detector: FailureDetector,
    wake: Notify,
    was_leader: AtomicBool,
}

impl Controller {
    pub fn new(raft: Arc<RaftNode>, session_timeout: Duration) -> Self {
        Self {
            raft,
            detector: FailureDetector::new(session_timeout),
            wake: Notify::new(),
            was_leader: AtomicBool::new(false),
        }
    }

    /// Run a tick as soon as possible.
    pub fn wake(&self) {
        self.wake.notify_one();
    }

    /// Tick every `interval` or when woken, until `shutdown` flips.
    pub async fn run(self: Arc<Self>, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {}
                _ = self.wake.notified() => debug!("Controller woken early"),
                _ = shutdown.wait_for(|stop| *stop) => return,
            }
            if let Err(e) = self.tick().await {
                warn!(error = %e, "Controller tick failed");
            }
        }
    }

    pub async fn tick(&self) -> BrokerResult<ControllerReport> {
        if !self.raft.is_leader() {
            if self.was_leader.swap(false, Ordering::AcqRel) {
                info!("Lost metadata leadership, controller idle");
            }
            return Ok(ControllerReport::default());
        }
        if !self.was_leader.swap(true, Ordering::AcqRel) {
            // Every broker gets a full session timeout from the moment we took over.
            self.detector.reset();
            info!("Gained metadata leadership, controller active");
        }

        let mut report = ControllerReport {
            acted: true,
            ..Default::default()
        };
        let state_machine = self.raft.state_machine();

        let snapshot = state_machine.current();
        self.observe(&snapshot);
        for change in self.detector.check(Instant::now()) {
            debug!(
                broker_id = change.broker_id,
                from = %change.previous_state,
                to = %change.new_state,
                since_progress_ms = change.time_since_progress.as_millis() as u64,
                "Broker health changed"
            );
        }
        for broker_id in snapshot.brokers.active_broker_ids() {
            if self.detector.state(broker_id) == Some(BrokerHealthState::Failed)
                && self.fence(broker_id).await?
            {
                report.fenced.push(broker_id);
            }
        }

        let snapshot = state_machine.current();
        let live = self.live_brokers(&snapshot);
        let departed = snapshot.brokers.resigned_broker_ids();
        for plan in plan_replica_replacements(&snapshot, &live, &departed) {
            let command = TopicCommand::SetReplicaSet {
                topic: plan.partition.topic.to_string(),
                partition: plan.partition.partition,
                replicas: plan.replicas.clone(),
                expected_epoch: plan.expected_epoch,
            };
            match self.propose("replica_set", command).await? {
                true => {
                    info!(partition = %plan.partition, replicas = ?plan.replicas, "Replaced departed replicas");
                    report.replica_sets_changed += 1;
                }
                false => report.stale_plans += 1,
            }
        }

        let snapshot = state_machine.current();
        let live = self.live_brokers(&snapshot);
        for plan in plan_leadership(&snapshot, &live) {
            let command = TopicCommand::SetPartitionLeader {
                topic: plan.partition.topic.to_string(),
                partition: plan.partition.partition,
                leader: plan.leader,
                expected_epoch: plan.expected_epoch,
            };
            match self.propose("leader", command).await? {
                true => {
                    match plan.leader {
                        Some(leader) => info!(partition = %plan.partition, leader, "Moved partition leadership"),
                        None => warn!(partition = %plan.partition, "No live replica, partition unavailable"),
                    }
                    report.leaders_changed += 1;
                }
                false => report.stale_plans += 1,
            }
        }

        Ok(report)
    }

    fn observe(&self, snapshot: &MetadataSnapshot) {
        let now = Instant::now();
        for info in snapshot.brokers.brokers.values() {
            if info.status == BrokerStatus::Resigned {
                self.detector.forget(info.broker_id);
            } else {
                self.detector.observe(info.broker_id, info.heartbeat_seq, now);
            }
        }
    }

    /// Active brokers the detector has not declared failed.
    fn live_brokers(&self, snapshot: &MetadataSnapshot) -> BTreeSet<BrokerId> {
        snapshot
            .brokers
            .active_broker_ids()
            .into_iter()
            .filter(|id| self.detector.state(*id) != Some(BrokerHealthState::Failed))
            .collect()
    }

    async fn fence(&self, broker_id: BrokerId) -> BrokerResult<bool> {
        let command = MetadataCommand::Broker(BrokerCommand::Fence {
            broker_id,
            reason: "session timeout".to_string(),
        });
        match self.raft.write(command).await {
            Ok(_) => {
                warn!(broker_id, "Fenced broker after missed heartbeats");
                record_controller_decision("fence", "applied");
                Ok(true)
            }
            Err(e) => {
                record_controller_decision("fence", "error");
                Err(e)
            }
        }
    }

    /// Commit a compare-and-set topic command. Returns false if the plan was stale.
    async fn propose(&self, kind: &'static str, command: TopicCommand) -> BrokerResult<bool> {
        let response = match self.raft.write(MetadataCommand::Topic(command)).await {
            Ok(response) => response,
            Err(e) => {
                record_controller_decision(kind, "error");
                return Err(e);
            }
        };
        match response {
            MetadataResponse::Topic(
                TopicResponse::LeaderChanged { .. } | TopicResponse::ReplicasChanged { .. },
            ) => {
                record_controller_decision(kind, "applied");
                Ok(true)
            }
            other => {
                debug!(kind, response = ?other, "Controller plan not applied");
                record_controller_decision(kind, "stale");
                Ok(false)
            }
        }
    }
}
