//! Leader/follower log of one partition replica.
//!
//! Wraps a [`SegmentStore`] with the replication rules:
//!
//! - **Leading**: `append` writes locally and hands the record to one ordered
//!   forwarder per replica. With [`AckPolicy::ReplicaQuorum`] it then waits
//!   until a strict majority of the replica set holds the record.
//! - **Following**: accepts pushes only from the leader and epoch the local
//!   metadata names, and runs a catch-up task that first truncates any suffix
//!   the leader does not have and then keeps fetching.
//!
//! A leader that hears of a newer epoch from a replica fences itself until
//! the reconciler hands it a new role.
//!
//! Store I/O runs on the blocking pool. `append_gate` serializes appends,
//! truncation and store swaps so offsets reach the forwarders in order.

mod catch_up;
mod epoch_cache;
mod forwarder;

pub use epoch_cache::EpochCache;
pub use forwarder::ProgressTracker;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::{error, info};

use super::config::BrokerConfig;
use super::error::{BrokerError, BrokerResult};
use super::metrics::{PARTITION_STORAGE_FAILURES, RETENTION_DELETED_SEGMENTS};
use super::replication::{FetchedRecords, ReplicaClient};
use crate::constants::{
    DEFAULT_CATCH_UP_POLL_MS, DEFAULT_FORWARD_QUEUE_DEPTH, DEFAULT_MAX_FETCH_BYTES,
    DEFAULT_REPLICATION_TIMEOUT_MS,
};
use crate::error::{LogError, LogResult};
use crate::log::{AppendAt, CommitLog, SegmentConfig, SegmentStore};
use crate::types::{BrokerId, LeaderEpoch, Offset, Record, TopicPartition};
use catch_up::CatchUpHandle;
use forwarder::{ForwardItem, Forwarder};

/// Partitions hosted by one broker, shared with the replication handler.
pub type PartitionMap = DashMap<TopicPartition, Arc<PartitionLog>>;

/// When a produce is acknowledged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckPolicy {
    /// After the leader's local write.
    #[default]
    LeaderOnly,
    /// After a strict majority of the replica set, leader included, holds the record.
    ReplicaQuorum,
}

impl AckPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            AckPolicy::LeaderOnly => "leader",
            AckPolicy::ReplicaQuorum => "quorum",
        }
    }
}

impl std::fmt::Display for AckPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for AckPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "leader" | "leader-only" | "1" => Ok(AckPolicy::LeaderOnly),
            "quorum" | "replica-quorum" | "all" => Ok(AckPolicy::ReplicaQuorum),
            _ => Err(format!(
                "Unknown ack policy '{}'. Valid policies: leader, quorum",
                s
            )),
        }
    }
}

/// This replica's part in the partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Leading {
        epoch: LeaderEpoch,
    },
    Following {
        leader_id: Option<BrokerId>,
        epoch: LeaderEpoch,
    },
}

impl Role {
    pub fn epoch(&self) -> LeaderEpoch {
        match self {
            Role::Leading { epoch } | Role::Following { epoch, .. } => *epoch,
        }
    }

    pub fn is_leader(&self) -> bool {
        matches!(self, Role::Leading { .. })
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Leading { .. } => "leader",
            Role::Following { .. } => "follower",
        }
    }
}

/// Replication knobs shared by every partition on a broker.
#[derive(Debug, Clone)]
pub struct PartitionOptions {
    pub ack_policy: AckPolicy,
    pub replication_timeout: Duration,
    pub forward_queue_depth: usize,
    pub catch_up_poll_interval: Duration,
    pub max_fetch_bytes: usize,
}

impl Default for PartitionOptions {
    fn default() -> Self {
        Self {
            ack_policy: AckPolicy::default(),
            replication_timeout: Duration::from_millis(DEFAULT_REPLICATION_TIMEOUT_MS),
            forward_queue_depth: DEFAULT_FORWARD_QUEUE_DEPTH,
            catch_up_poll_interval: Duration::from_millis(DEFAULT_CATCH_UP_POLL_MS),
            max_fetch_bytes: DEFAULT_MAX_FETCH_BYTES,
        }
    }
}

impl From<&BrokerConfig> for PartitionOptions {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            ack_policy: config.ack_policy,
            replication_timeout: config.replication_timeout,
            forward_queue_depth: config.forward_queue_depth,
            catch_up_poll_interval: config.catch_up_poll_interval,
            max_fetch_bytes: config.max_fetch_bytes,
        }
    }
}

struct LeaderState {
    progress: Arc<ProgressTracker>,
    forwarders: Vec<Forwarder>,
}

struct RoleState {
    role: Role,
    replicas: Vec<BrokerId>,
    leader: Option<LeaderState>,
    catch_up: Option<CatchUpHandle>,
    /// Epoch whose divergence check has completed. Pushes are refused until
    /// it matches the following epoch.
    synced_epoch: Option<LeaderEpoch>,
}

pub struct PartitionLog {
    partition: TopicPartition,
    local_id: BrokerId,
    dir: PathBuf,
    segment_config: SegmentConfig,
    options: PartitionOptions,
    client: Arc<dyn ReplicaClient>,
    store: RwLock<Arc<SegmentStore>>,
    epochs: Mutex<EpochCache>,
    role: Mutex<RoleState>,
    append_gate: tokio::sync::Mutex<()>,
    failed: AtomicBool,
}

impl std::fmt::Debug for PartitionLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PartitionLog")
            .field("partition", &self.partition)
            .field("role", &self.role())
            .field("oldest", &self.oldest_offset())
            .field("newest", &self.newest_offset())
            .finish()
    }
}

impl PartitionLog {
    /// Open or create the replica in `dir`. It starts as a follower with no
    /// known leader; the reconciler assigns the real role.
    pub fn open(
        partition: TopicPartition,
        local_id: BrokerId,
        dir: PathBuf,
        segment_config: SegmentConfig,
        options: PartitionOptions,
        client: Arc<dyn ReplicaClient>,
    ) -> BrokerResult<Arc<Self>> {
        catch_up::recover_resync_leftovers(&dir)?;
        let store = SegmentStore::open(&dir, segment_config.clone())?;
        let epochs = EpochCache::open(&dir)?;

        Ok(Arc::new(Self {
            partition,
            local_id,
            dir,
            segment_config,
            options,
            client,
            store: RwLock::new(Arc::new(store)),
            epochs: Mutex::new(epochs),
            role: Mutex::new(RoleState {
                role: Role::Following {
                    leader_id: None,
                    epoch: 0,
                },
                replicas: Vec::new(),
                leader: None,
                catch_up: None,
                synced_epoch: None,
            }),
            append_gate: tokio::sync::Mutex::new(()),
            failed: AtomicBool::new(false),
        }))
    }

    pub fn partition(&self) -> &TopicPartition {
        &self.partition
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn role(&self) -> Role {
        self.role.lock().role
    }

    pub fn replicas(&self) -> Vec<BrokerId> {
        self.role.lock().replicas.clone()
    }

    /// True after a fatal storage error. The partition stays unavailable
    /// until it is reassigned or the process restarts.
    pub fn is_failed(&self) -> bool {
        self.failed.load(Ordering::Acquire)
    }

    /// True if this replica leads but has learned of a newer epoch.
    pub fn is_fenced(&self) -> bool {
        self.role
            .lock()
            .leader
            .as_ref()
            .is_some_and(|l| l.progress.is_fenced())
    }

    pub fn oldest_offset(&self) -> Offset {
        self.store().oldest_offset()
    }

    pub fn newest_offset(&self) -> Offset {
        self.store().newest_offset()
    }

    pub fn latest_epoch(&self) -> Option<LeaderEpoch> {
        self.epochs.lock().latest_epoch()
    }

    fn store(&self) -> Arc<SegmentStore> {
        Arc::clone(&self.store.read())
    }

    fn check_usable(&self) -> BrokerResult<()> {
        if self.is_failed() {
            return Err(BrokerError::unavailable(
                self.partition.clone(),
                "local storage failed",
            ));
        }
        Ok(())
    }

    fn on_log_error(&self, err: LogError) -> BrokerError {
        if err.is_fatal() && !self.failed.swap(true, Ordering::AcqRel) {
            error!(partition = %self.partition, error = %err, "Partition storage failed, marking unavailable");
            PARTITION_STORAGE_FAILURES.inc();
        }
        BrokerError::Log(err)
    }

    async fn run_blocking<T, F>(&self, op: F) -> BrokerResult<T>
    where
        F: FnOnce() -> LogResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let result = tokio::task::spawn_blocking(op)
            .await
            .map_err(|e| BrokerError::Io(std::io::Error::other(e)))?;
        result.map_err(|e| self.on_log_error(e))
    }

    fn note_epoch(&self, epoch: LeaderEpoch, start_offset: Offset) -> BrokerResult<()> {
        self.epochs
            .lock()
            .assign(epoch, start_offset)
            .map(|_| ())
            .map_err(|e| self.on_log_error(e))
    }

    fn leader_context(&self) -> BrokerResult<(LeaderEpoch, Arc<ProgressTracker>)> {
        let state = self.role.lock();
        match (state.role, &state.leader) {
            (Role::Leading { epoch }, Some(leader)) => {
                if leader.progress.is_fenced() {
                    return Err(BrokerError::StaleLeader {
                        partition: self.partition.clone(),
                        epoch,
                        current_epoch: leader.progress.observed_epoch(),
                    });
                }
                Ok((epoch, Arc::clone(&leader.progress)))
            }
            _ => Err(BrokerError::not_leader(self.partition.clone(), None)),
        }
    }

    /// Append as leader using the configured ack policy.
    pub async fn append(&self, value: Bytes) -> BrokerResult<Offset> {
        self.append_with(value, self.options.ack_policy).await
    }

    /// Append as leader and acknowledge according to `ack`.
    pub async fn append_with(&self, value: Bytes, ack: AckPolicy) -> BrokerResult<Offset> {
        let gate = self.append_gate.lock().await;
        self.check_usable()?;
        let (epoch, progress) = self.leader_context()?;

        let store = self.store();
        let payload = value.clone();
        let offset = self.run_blocking(move || store.append(&payload)).await?;

        {
            let state = self.role.lock();
            if let Some(leader) = &state.leader {
                for forwarder in &leader.forwarders {
                    forwarder.enqueue(ForwardItem {
                        epoch,
                        offset,
                        value: value.clone(),
                    });
                }
            }
        }
        drop(gate);
        progress.record(self.local_id, offset + 1);

        match ack {
            AckPolicy::LeaderOnly => Ok(offset),
            AckPolicy::ReplicaQuorum => {
                if progress
                    .wait_for_quorum(offset, self.options.replication_timeout)
                    .await
                {
                    return Ok(offset);
                }
                if progress.is_fenced() {
                    return Err(BrokerError::StaleLeader {
                        partition: self.partition.clone(),
                        epoch,
                        current_epoch: progress.observed_epoch(),
                    });
                }
                Err(BrokerError::ReplicationTimeout {
                    partition: self.partition.clone(),
                    offset,
                    acked: progress.acked_count(offset),
                    required: progress.required(),
                })
            }
        }
    }

    fn check_replicated_append(&self, leader_id: BrokerId, epoch: LeaderEpoch) -> BrokerResult<()> {
        let state = self.role.lock();
        let stale = |current_epoch| BrokerError::StaleLeader {
            partition: self.partition.clone(),
            epoch,
            current_epoch,
        };
        match state.role {
            Role::Leading { epoch: local } => {
                if epoch <= local {
                    Err(stale(local))
                } else {
                    Err(BrokerError::unavailable(
                        self.partition.clone(),
                        format!("leader epoch {} not yet applied locally", epoch),
                    ))
                }
            }
            Role::Following {
                leader_id: expected,
                epoch: local,
            } => {
                if epoch < local {
                    Err(stale(local))
                } else if epoch > local {
                    Err(BrokerError::unavailable(
                        self.partition.clone(),
                        format!("leader epoch {} not yet applied locally", epoch),
                    ))
                } else if expected != Some(leader_id) {
                    Err(stale(local))
                } else if state.synced_epoch != Some(local) {
                    Err(BrokerError::unavailable(
                        self.partition.clone(),
                        "replica is still catching up",
                    ))
                } else {
                    Ok(())
                }
            }
        }
    }

    /// Follower side of a leader push. Returns the local log end afterwards.
    ///
    /// An offset the log already holds is acknowledged again without a
    /// write; an offset past the end is `OutOfSequence`.
    pub async fn append_replicated(
        &self,
        leader_id: BrokerId,
        epoch: LeaderEpoch,
        offset: Offset,
        value: Bytes,
    ) -> BrokerResult<Offset> {
        self.check_usable()?;
        self.check_replicated_append(leader_id, epoch)?;

        let _gate = self.append_gate.lock().await;
        let store = self.store();
        match self
            .run_blocking(move || store.append_at(offset, &value))
            .await?
        {
            AppendAt::Appended => {
                self.note_epoch(epoch, offset)?;
                Ok(offset + 1)
            }
            AppendAt::AlreadyPresent => Ok(self.newest_offset()),
            AppendAt::Gap { newest } => Err(BrokerError::OutOfSequence {
                partition: self.partition.clone(),
                offset,
                newest,
            }),
        }
    }

    /// Leader side of a follower fetch. Fetching from `offset` also tells the
    /// leader the follower holds everything below it.
    pub async fn serve_fetch(
        &self,
        follower_id: BrokerId,
        epoch: LeaderEpoch,
        offset: Offset,
        max_bytes: usize,
    ) -> BrokerResult<FetchedRecords> {
        self.check_usable()?;
        let (leader_epoch, progress) = self.leader_context()?;
        if epoch != leader_epoch {
            return Err(BrokerError::unavailable(
                self.partition.clone(),
                format!(
                    "follower epoch {} does not match leader epoch {}",
                    epoch, leader_epoch
                ),
            ));
        }

        let store = self.store();
        let oldest = store.oldest_offset();
        let newest = store.newest_offset();
        if offset < oldest {
            return Err(BrokerError::ReplicaTooFarBehind {
                partition: self.partition.clone(),
                offset,
                leader_oldest: oldest,
            });
        }
        if offset > newest {
            return Err(BrokerError::OutOfSequence {
                partition: self.partition.clone(),
                offset,
                newest,
            });
        }
        progress.record(follower_id, offset);

        let records = if offset == newest {
            Vec::new()
        } else {
            match self
                .run_blocking(move || store.read(offset, max_bytes))
                .await
            {
                Ok(records) => records,
                // Retention moved past the follower between the check and the read.
                Err(BrokerError::Log(LogError::OffsetOutOfRange { oldest, .. }))
                    if offset < oldest =>
                {
                    return Err(BrokerError::ReplicaTooFarBehind {
                        partition: self.partition.clone(),
                        offset,
                        leader_oldest: oldest,
                    });
                }
                Err(e) => return Err(e),
            }
        };
        let end = records.last().map(|r| r.offset + 1).unwrap_or(offset);
        let epochs = self.epochs.lock().covering(offset, end);

        Ok(FetchedRecords {
            records,
            oldest,
            newest,
            epochs,
        })
    }

    /// Leader side of the divergence check: where `epoch` ends locally.
    pub fn epoch_end(&self, epoch: LeaderEpoch) -> BrokerResult<(LeaderEpoch, Offset)> {
        self.check_usable()?;
        self.leader_context()?;
        let newest = self.newest_offset();
        Ok(self.epochs.lock().end_offset_for(epoch, newest))
    }

    /// Read from any role. Routing client reads to the leader is the
    /// broker's job.
    pub async fn read(&self, offset: Offset, max_bytes: usize) -> BrokerResult<Vec<Record>> {
        self.check_usable()?;
        let store = self.store();
        self.run_blocking(move || store.read(offset, max_bytes)).await
    }

    /// Drop every record at or after `offset`.
    pub async fn truncate(&self, offset: Offset) -> BrokerResult<()> {
        let _gate = self.append_gate.lock().await;
        self.truncate_locked(offset).await
    }

    async fn truncate_locked(&self, offset: Offset) -> BrokerResult<()> {
        let store = self.store();
        self.run_blocking(move || store.truncate(offset)).await?;
        self.epochs
            .lock()
            .truncate_from(offset)
            .map_err(|e| self.on_log_error(e))
    }

    pub async fn apply_retention(&self) -> BrokerResult<usize> {
        if self.is_failed() {
            return Ok(0);
        }
        let store = self.store();
        let removed = self.run_blocking(move || store.apply_retention()).await?;
        RETENTION_DELETED_SEGMENTS.inc_by(removed as u64);
        Ok(removed)
    }

    pub async fn flush(&self) -> BrokerResult<()> {
        let store = self.store();
        self.run_blocking(move || store.flush()).await
    }

    /// Switch role. Idempotent for an unchanged role and replica set.
    pub async fn set_role(self: &Arc<Self>, role: Role, replicas: Vec<BrokerId>) -> BrokerResult<()> {
        let (old_leader, old_catch_up) = {
            let mut state = self.role.lock();
            if state.role == role && state.replicas == replicas {
                return Ok(());
            }
            state.role = role;
            state.replicas = replicas.clone();
            state.synced_epoch = None;
            (state.leader.take(), state.catch_up.take())
        };
        stop_tasks(old_leader, old_catch_up).await;

        info!(
            partition = %self.partition,
            role = role.as_str(),
            epoch = role.epoch(),
            ?replicas,
            "Partition role changed"
        );

        match role {
            Role::Leading { epoch } => {
                let _gate = self.append_gate.lock().await;
                let newest = self.newest_offset();
                self.note_epoch(epoch, newest)?;

                let progress = Arc::new(ProgressTracker::new(replicas.clone()));
                progress.record(self.local_id, newest);
                let forwarders: Vec<Forwarder> = replicas
                    .iter()
                    .filter(|r| **r != self.local_id)
                    .map(|r| {
                        Forwarder::spawn(
                            self.partition.clone(),
                            self.local_id,
                            *r,
                            self.options.forward_queue_depth,
                            Arc::clone(&self.client),
                            Arc::clone(&progress),
                        )
                    })
                    .collect();

                let mut state = self.role.lock();
                if state.role == role {
                    state.leader = Some(LeaderState {
                        progress,
                        forwarders,
                    });
                } else {
                    forwarders.into_iter().for_each(Forwarder::stop);
                }
            }
            Role::Following {
                leader_id: Some(leader_id),
                epoch,
            } if leader_id != self.local_id => {
                let handle = catch_up::spawn(Arc::clone(self), leader_id, epoch);
                let superseded = {
                    let mut state = self.role.lock();
                    if state.role == role {
                        state.catch_up = Some(handle);
                        None
                    } else {
                        Some(handle)
                    }
                };
                if let Some(handle) = superseded {
                    handle.stop().await;
                }
            }
            Role::Following { .. } => {}
        }
        Ok(())
    }

    fn mark_synced(&self, epoch: LeaderEpoch) -> bool {
        let mut state = self.role.lock();
        if state.role.epoch() == epoch && !state.role.is_leader() {
            state.synced_epoch = Some(epoch);
            true
        } else {
            false
        }
    }

    /// Whether a follower has finished its divergence check for the
    /// current epoch.
    pub fn is_synced(&self) -> bool {
        let state = self.role.lock();
        state.synced_epoch == Some(state.role.epoch())
    }

    async fn stop_background(&self) {
        let (leader, catch_up) = {
            let mut state = self.role.lock();
            (state.leader.take(), state.catch_up.take())
        };
        stop_tasks(leader, catch_up).await;
    }

    /// Stop replication tasks and close the store. Files stay on disk.
    pub async fn close(&self) -> BrokerResult<()> {
        self.stop_background().await;
        let _gate = self.append_gate.lock().await;
        let store = self.store();
        self.run_blocking(move || store.close()).await
    }

    /// Stop replication tasks and remove all on-disk state, including any
    /// resync staging left beside the log.
    pub async fn delete(&self) -> BrokerResult<()> {
        self.stop_background().await;
        let _gate = self.append_gate.lock().await;
        let store = self.store();
        let dir = self.dir.clone();
        self.run_blocking(move || {
            store.delete()?;
            catch_up::remove_resync_dirs(&dir)?;
            Ok(())
        })
        .await
    }

    /// Replace the store with a fully resynced copy from `staging_dir`.
    /// Runs on the blocking pool with the append gate held.
    fn install_resync(&self, staging: SegmentStore, staging_dir: &Path) -> LogResult<()> {
        let _gate = self.append_gate.blocking_lock();
        staging.close()?;
        drop(staging);
        catch_up::swap_in_staging(&self.dir, staging_dir, &self.store())?;

        let store = SegmentStore::open(&self.dir, self.segment_config.clone())?;
        let epochs = EpochCache::open(&self.dir)?;
        info!(
            partition = %self.partition,
            oldest = store.oldest_offset(),
            newest = store.newest_offset(),
            "Installed resynced log"
        );
        *self.store.write() = Arc::new(store);
        *self.epochs.lock() = epochs;
        Ok(())
    }
}

async fn stop_tasks(leader: Option<LeaderState>, catch_up: Option<CatchUpHandle>) {
    if let Some(leader) = leader {
        leader.forwarders.into_iter().for_each(Forwarder::stop);
    }
    if let Some(catch_up) = catch_up {
        catch_up.stop().await;
    }
}
