//! Converges the partitions hosted on this broker with committed metadata.
//!
//! Each run diffs a [`MetadataSnapshot`] against the open partition logs:
//!
//! - partitions newly assigned here are opened (or created) and given their role
//! - partitions whose leader or epoch changed get the new role
//! - partitions no longer assigned here are closed, and their files removed
//!   when the topic was deleted or `delete_unassigned` is set
//!
//! Runs are serialized and idempotent, so the same snapshot can be applied
//! any number of times.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::error::{BrokerError, BrokerResult};
use super::metrics::{HOSTED_PARTITIONS, METADATA_VERSION, RECONCILE_RUNS};
use super::partition_log::{PartitionLog, PartitionMap, PartitionOptions, Role};
use super::raft::{MetadataSnapshot, PartitionAssignment, TopicDomainState};
use super::replication::ReplicaClient;
use crate::log::SegmentConfig;
use crate::types::{BrokerId, TopicPartition};

/// Counts of what one run changed.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub opened: usize,
    pub roles_changed: usize,
    pub closed: usize,
    pub deleted: usize,
    pub failed: usize,
}

impl ReconcileReport {
    pub fn is_noop(&self) -> bool {
        *self == Self::default()
    }
}

/// The role `broker_id` plays for a partition under `assignment`.
pub fn role_for(broker_id: BrokerId, assignment: &PartitionAssignment) -> Role {
    if assignment.leader == Some(broker_id) {
        Role::Leading {
            epoch: assignment.leader_epoch,
        }
    } else {
        Role::Following {
            leader_id: assignment.leader,
            epoch: assignment.leader_epoch,
        }
    }
}

pub struct Reconciler {
    local_id: BrokerId,
    partitions_dir: PathBuf,
    segment_config: SegmentConfig,
    options: PartitionOptions,
    delete_unassigned: bool,
    partitions: Arc<PartitionMap>,
    client: Arc<dyn ReplicaClient>,
    run_lock: tokio::sync::Mutex<()>,
    /// Topic table of the last clean run. Snapshots that only touch broker
    /// state (heartbeats) are skipped.
    last_topics: Mutex<Option<TopicDomainState>>,
    halted: AtomicBool,
}

impl Reconciler {
    pub fn new(
        local_id: BrokerId,
        partitions_dir: PathBuf,
        segment_config: SegmentConfig,
        options: PartitionOptions,
        delete_unassigned: bool,
        partitions: Arc<PartitionMap>,
        client: Arc<dyn ReplicaClient>,
    ) -> Self {
        Self {
            local_id,
            partitions_dir,
            segment_config,
            options,
            delete_unassigned,
            partitions,
            client,
            run_lock: tokio::sync::Mutex::new(()),
            last_topics: Mutex::new(None),
            halted: AtomicBool::new(false),
        }
    }

    pub fn partitions(&self) -> &Arc<PartitionMap> {
        &self.partitions
    }

    /// Reconcile unless the topic table is unchanged since the last clean run.
    pub async fn on_snapshot(&self, snapshot: &MetadataSnapshot) -> ReconcileReport {
        METADATA_VERSION.set(snapshot.version as i64);
        if self.last_topics.lock().as_ref() == Some(&snapshot.topics) {
            return ReconcileReport::default();
        }
        self.reconcile(snapshot).await
    }

    /// Bring the hosted partitions in line with `snapshot`.
    pub async fn reconcile(&self, snapshot: &MetadataSnapshot) -> ReconcileReport {
        let _run = self.run_lock.lock().await;
        let mut report = ReconcileReport::default();
        if self.is_halted() {
            return report;
        }

        let desired: BTreeMap<TopicPartition, &PartitionAssignment> =
            snapshot.assigned_to(self.local_id).collect();

        let unassigned: Vec<TopicPartition> = self
            .partitions
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|tp| !desired.contains_key(tp))
            .collect();
        for tp in unassigned {
            let Some((_, log)) = self.partitions.remove(&tp) else {
                continue;
            };
            let delete = self.delete_unassigned || !snapshot.has_topic(&tp.topic);
            let result = if delete {
                log.delete().await
            } else {
                log.close().await
            };
            match result {
                Ok(()) if delete => {
                    info!(partition = %tp, "Deleted unassigned partition");
                    report.deleted += 1;
                }
                Ok(()) => {
                    info!(partition = %tp, "Closed unassigned partition, files retained");
                    report.closed += 1;
                }
                Err(e) => {
                    warn!(partition = %tp, error = %e, "Failed to release unassigned partition");
                    report.failed += 1;
                }
            }
        }

        for (tp, assignment) in desired {
            let existing = self.partitions.get(&tp).map(|e| Arc::clone(e.value()));
            let log = match existing {
                Some(log) => log,
                None => match self.open(&tp).await {
                    Ok(log) => {
                        self.partitions.insert(tp.clone(), Arc::clone(&log));
                        report.opened += 1;
                        log
                    }
                    Err(e) => {
                        warn!(partition = %tp, error = %e, "Failed to open assigned partition");
                        report.failed += 1;
                        continue;
                    }
                },
            };
            if log.is_failed() {
                report.failed += 1;
                continue;
            }

            let role = role_for(self.local_id, assignment);
            let replicas = assignment.replicas.clone();
            if log.role() == role && log.replicas() == replicas {
                continue;
            }
            match log.set_role(role, replicas).await {
                Ok(()) => report.roles_changed += 1,
                Err(e) => {
                    warn!(partition = %tp, error = %e, "Failed to apply partition role");
                    report.failed += 1;
                }
            }
        }

        self.update_gauges();
        let status = if report.failed > 0 { "partial" } else { "ok" };
        RECONCILE_RUNS.with_label_values(&[status]).inc();
        *self.last_topics.lock() = (report.failed == 0).then(|| snapshot.topics.clone());

        if report.is_noop() {
            debug!(version = snapshot.version, "Reconcile found nothing to change");
        } else {
            info!(version = snapshot.version, ?report, "Reconciled partitions");
        }
        report
    }

    async fn open(&self, tp: &TopicPartition) -> BrokerResult<Arc<PartitionLog>> {
        let partition = tp.clone();
        let local_id = self.local_id;
        let dir = self.partitions_dir.join(tp.dir_name());
        let segment_config = self.segment_config.clone();
        let options = self.options.clone();
        let client = Arc::clone(&self.client);
        tokio::task::spawn_blocking(move || {
            PartitionLog::open(partition, local_id, dir, segment_config, options, client)
        })
        .await
        .map_err(|e| BrokerError::Io(std::io::Error::other(e)))?
    }

    fn update_gauges(&self) {
        let (mut leaders, mut followers) = (0i64, 0i64);
        for entry in self.partitions.iter() {
            if entry.value().role().is_leader() {
                leaders += 1;
            } else {
                followers += 1;
            }
        }
        HOSTED_PARTITIONS.with_label_values(&["leader"]).set(leaders);
        HOSTED_PARTITIONS.with_label_values(&["follower"]).set(followers);
    }

    /// Close every hosted partition and ignore all later snapshots.
    pub async fn halt(&self) {
        self.halted.store(true, Ordering::Release);
        self.close_all().await;
    }

    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::Acquire)
    }

    /// Close every hosted partition, leaving files on disk.
    pub async fn close_all(&self) {
        let _run = self.run_lock.lock().await;
        let keys: Vec<TopicPartition> = self.partitions.iter().map(|e| e.key().clone()).collect();
        for tp in keys {
            if let Some((_, log)) = self.partitions.remove(&tp)
                && let Err(e) = log.close().await
            {
                warn!(partition = %tp, error = %e, "Failed to close partition");
            }
        }
        *self.last_topics.lock() = None;
        self.update_gauges();
    }
}
