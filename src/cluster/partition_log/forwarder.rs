//! Leader-side push of appended records to each replica.
//!
//! One bounded queue and one task per replica keep pushes to a replica in
//! offset order. A full queue drops the record; the replica's catch-up fetch
//! fills the hole.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::cluster::metrics::{FORWARD_QUEUE_DROPS, LEADERS_FENCED};
use crate::cluster::replication::{
    ReplicaClient, ReplicationError, ReplicationRequest, ReplicationResponse,
};
use crate::types::{BrokerId, LeaderEpoch, Offset, TopicPartition};

/// Per-replica acknowledged log end for one leadership term.
///
/// A replica's entry is the offset up to which it is known to hold the
/// leader's log, so offset `o` is on that replica once its entry exceeds `o`.
#[derive(Debug)]
pub struct ProgressTracker {
    replicas: Vec<BrokerId>,
    acked: watch::Sender<BTreeMap<BrokerId, Offset>>,
    fenced: AtomicBool,
    observed_epoch: AtomicU64,
}

impl ProgressTracker {
    pub fn new(replicas: Vec<BrokerId>) -> Self {
        let (acked, _) = watch::channel(BTreeMap::new());
        Self {
            replicas,
            acked,
            fenced: AtomicBool::new(false),
            observed_epoch: AtomicU64::new(0),
        }
    }

    pub fn replicas(&self) -> &[BrokerId] {
        &self.replicas
    }

    /// Strict majority of the replica set, leader included.
    pub fn required(&self) -> usize {
        self.replicas.len() / 2 + 1
    }

    pub fn record(&self, replica: BrokerId, newest: Offset) {
        self.acked.send_if_modified(|acked| {
            let entry = acked.entry(replica).or_insert(0);
            if newest > *entry {
                *entry = newest;
                true
            } else {
                false
            }
        });
    }

    pub fn acked_count(&self, offset: Offset) -> usize {
        count_holding(&self.acked.borrow(), offset)
    }

    /// Mark the leader deposed. Wakes every quorum waiter.
    pub fn fence(&self, current_epoch: LeaderEpoch) {
        self.observed_epoch.fetch_max(current_epoch, Ordering::AcqRel);
        if !self.fenced.swap(true, Ordering::AcqRel) {
            LEADERS_FENCED.inc();
        }
        self.acked.send_modify(|_| {});
    }

    pub fn is_fenced(&self) -> bool {
        self.fenced.load(Ordering::Acquire)
    }

    /// The newer epoch reported by the replica that fenced this leader.
    pub fn observed_epoch(&self) -> LeaderEpoch {
        self.observed_epoch.load(Ordering::Acquire)
    }

    /// Wait until `offset` is held by a quorum, the leader is fenced, or
    /// `timeout` passes. Returns whether the quorum was reached.
    pub async fn wait_for_quorum(&self, offset: Offset, timeout: std::time::Duration) -> bool {
        let required = self.required();
        let mut rx = self.acked.subscribe();
        let waited = tokio::time::timeout(timeout, async {
            rx.wait_for(|acked| self.is_fenced() || count_holding(acked, offset) >= required)
                .await
                .is_ok()
        })
        .await;
        matches!(waited, Ok(true)) && !self.is_fenced()
    }
}

fn count_holding(acked: &BTreeMap<BrokerId, Offset>, offset: Offset) -> usize {
    acked.values().filter(|newest| **newest > offset).count()
}

#[derive(Debug, Clone)]
pub(super) struct ForwardItem {
    pub epoch: LeaderEpoch,
    pub offset: Offset,
    pub value: Bytes,
}

/// Ordered pusher to one replica.
pub(super) struct Forwarder {
    replica: BrokerId,
    tx: mpsc::Sender<ForwardItem>,
    task: JoinHandle<()>,
}

impl Forwarder {
    pub fn spawn(
        partition: TopicPartition,
        leader_id: BrokerId,
        replica: BrokerId,
        depth: usize,
        client: Arc<dyn ReplicaClient>,
        progress: Arc<ProgressTracker>,
    ) -> Self {
        let (tx, mut rx) = mpsc::channel::<ForwardItem>(depth);
        let task = tokio::spawn(async move {
            while let Some(item) = rx.recv().await {
                if progress.is_fenced() {
                    break;
                }
                let request = ReplicationRequest::Append {
                    partition: partition.clone(),
                    leader_id,
                    epoch: item.epoch,
                    offset: item.offset,
                    value: item.value,
                };
                match client.call(replica, request).await {
                    Ok(ReplicationResponse::Appended { newest }) => progress.record(replica, newest),
                    Ok(ReplicationResponse::Error(ReplicationError::StaleLeader {
                        current_epoch,
                    })) => {
                        warn!(
                            %partition,
                            replica,
                            epoch = item.epoch,
                            current_epoch,
                            "Replica reports a newer leader epoch, fencing"
                        );
                        progress.fence(current_epoch);
                        break;
                    }
                    Ok(ReplicationResponse::Error(e)) => {
                        // Gaps and transient states are repaired by the replica's catch-up.
                        debug!(%partition, replica, offset = item.offset, error = %e, "Push rejected");
                    }
                    Ok(other) => {
                        warn!(%partition, replica, response = ?other, "Unexpected push response");
                    }
                    Err(e) => {
                        debug!(%partition, replica, offset = item.offset, error = %e, "Push failed");
                    }
                }
            }
        });
        Self { replica, tx, task }
    }

    pub fn replica(&self) -> BrokerId {
        self.replica
    }

    /// Queue an item without waiting. Returns false if it was dropped.
    pub fn enqueue(&self, item: ForwardItem) -> bool {
        match self.tx.try_send(item) {
            Ok(()) => true,
            Err(_) => {
                FORWARD_QUEUE_DROPS.inc();
                false
            }
        }
    }

    pub fn stop(self) {
        self.task.abort();
    }
}
