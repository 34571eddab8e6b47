//! Follower catch-up.
//!
//! After every role change to follower the task
//!
//! 1. asks the leader where the follower's latest epoch ends and truncates
//!    anything past it,
//! 2. marks the replica synced so leader pushes are accepted,
//! 3. fetches from its log end until cancelled, sleeping when there is
//!    nothing new.
//!
//! If the leader's retention has already removed the follower's next offset,
//! the whole log is rebuilt in a `<dir>.resync` staging directory and swapped
//! in once it has caught up. A marker file makes the swap recoverable after a
//! crash.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::epoch_cache::EpochCache;
use super::PartitionLog;
use crate::cluster::error::{BrokerError, BrokerResult};
use crate::cluster::metrics::{FOLLOWER_RESYNCS, FOLLOWER_TRUNCATIONS};
use crate::cluster::replication::{FetchedRecords, ReplicationRequest, ReplicationResponse};
use crate::constants::RESYNC_DIR_SUFFIX;
use crate::error::{LogError, LogResult};
use crate::log::{AppendAt, CommitLog, SegmentStore};
use crate::types::{BrokerId, LeaderEpoch, Offset, Record};

const RETIRED_DIR_SUFFIX: &str = ".old";
const RESYNC_MARKER: &str = "resync-complete";

pub(super) struct CatchUpHandle {
    cancel: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl CatchUpHandle {
    /// Cancel and wait for the task. Blocking store work already started
    /// runs to completion first.
    pub async fn stop(self) {
        let _ = self.cancel.send(true);
        let _ = self.task.await;
    }
}

pub(super) fn spawn(log: Arc<PartitionLog>, leader_id: BrokerId, epoch: LeaderEpoch) -> CatchUpHandle {
    let (cancel, cancelled) = watch::channel(false);
    let task = tokio::spawn(async move {
        let mut follower = Follower {
            log,
            leader_id,
            epoch,
            cancelled,
        };
        follower.run().await;
    });
    CatchUpHandle { cancel, task }
}

struct Follower {
    log: Arc<PartitionLog>,
    leader_id: BrokerId,
    epoch: LeaderEpoch,
    cancelled: watch::Receiver<bool>,
}

impl Follower {
    /// Await `fut` unless cancelled first.
    async fn or_cancel<F: Future>(&mut self, fut: F) -> Option<F::Output> {
        tokio::select! {
            out = fut => Some(out),
            _ = self.cancelled.wait_for(|c| *c) => None,
        }
    }

    async fn pause(&mut self, duration: Duration) -> bool {
        self.or_cancel(tokio::time::sleep(duration)).await.is_some()
    }

    fn retry_delay(&self) -> Duration {
        self.log.options.catch_up_poll_interval * 5
    }

    async fn request(&mut self, request: ReplicationRequest) -> Option<BrokerResult<ReplicationResponse>> {
        let client = Arc::clone(&self.log.client);
        let leader_id = self.leader_id;
        self.or_cancel(async move { client.call(leader_id, request).await })
            .await
    }

    async fn run(&mut self) {
        let partition = self.log.partition.clone();
        debug!(%partition, leader = self.leader_id, epoch = self.epoch, "Starting catch-up");

        loop {
            match self.truncate_divergence().await {
                Some(Ok(())) => break,
                Some(Err(e)) => {
                    debug!(%partition, leader = self.leader_id, error = %e, "Divergence check failed, retrying");
                    if !self.pause(self.retry_delay()).await {
                        return;
                    }
                }
                None => return,
            }
        }
        if !self.log.mark_synced(self.epoch) {
            return;
        }

        let poll = self.log.options.catch_up_poll_interval;
        loop {
            let delay = match self.fetch_once().await {
                None => return,
                Some(Ok(0)) => poll,
                Some(Ok(_)) => Duration::ZERO,
                Some(Err(BrokerError::ReplicaTooFarBehind { leader_oldest, .. })) => {
                    match self.resync(leader_oldest).await {
                        None => return,
                        Some(Ok(())) => Duration::ZERO,
                        Some(Err(e)) => {
                            warn!(%partition, error = %e, "Resync failed, retrying");
                            self.retry_delay()
                        }
                    }
                }
                Some(Err(e)) if e.is_partition_fatal() => {
                    warn!(%partition, error = %e, "Stopping catch-up");
                    return;
                }
                Some(Err(e)) => {
                    debug!(%partition, leader = self.leader_id, error = %e, "Fetch failed, retrying");
                    self.retry_delay()
                }
            };
            if !delay.is_zero() && !self.pause(delay).await {
                return;
            }
        }
    }

    /// Truncate the suffix the leader never had. The truncation point is the
    /// smaller of where the leader and this replica end the last epoch they
    /// share.
    async fn truncate_divergence(&mut self) -> Option<BrokerResult<()>> {
        let Some(latest) = self.log.epochs.lock().latest() else {
            return Some(Ok(()));
        };
        let request = ReplicationRequest::EpochEnd {
            partition: self.log.partition.clone(),
            epoch: latest.epoch,
        };
        let (leader_epoch, leader_end) = match self.request(request).await? {
            Ok(ReplicationResponse::EpochEnd { epoch, end_offset }) => (epoch, end_offset),
            Ok(ReplicationResponse::Error(e)) => {
                return Some(Err(e.into_broker_error(
                    self.log.partition.clone(),
                    latest.epoch,
                    0,
                )));
            }
            Ok(other) => return Some(Err(unexpected(&other))),
            Err(e) => return Some(Err(e)),
        };

        let newest = self.log.newest_offset();
        let (_, local_end) = self.log.epochs.lock().end_offset_for(leader_epoch, newest);
        let target = leader_end.min(local_end).min(newest);
        if target == newest {
            return Some(Ok(()));
        }

        info!(
            partition = %self.log.partition,
            leader = self.leader_id,
            leader_epoch,
            from = newest,
            to = target,
            "Truncating divergent suffix"
        );
        FOLLOWER_TRUNCATIONS.inc();
        match self.log.truncate(target).await {
            Ok(()) => Some(Ok(())),
            Err(BrokerError::Log(LogError::InvalidTruncation { .. })) => {
                // The divergence point is below what retention kept.
                Some(self.resync(target).await?)
            }
            Err(e) => Some(Err(e)),
        }
    }

    async fn fetch(&mut self, offset: Offset) -> Option<BrokerResult<FetchedRecords>> {
        let request = ReplicationRequest::Fetch {
            partition: self.log.partition.clone(),
            follower_id: self.log.local_id,
            epoch: self.epoch,
            offset,
            max_bytes: self.log.options.max_fetch_bytes,
        };
        let response = self.request(request).await?;
        Some(match response {
            Ok(ReplicationResponse::Records(fetched)) => Ok(fetched),
            Ok(ReplicationResponse::Error(e)) => Err(e.into_broker_error(
                self.log.partition.clone(),
                self.epoch,
                offset,
            )),
            Ok(other) => Err(unexpected(&other)),
            Err(e) => Err(e),
        })
    }

    /// One fetch into the live log. Returns how many records were applied.
    async fn fetch_once(&mut self) -> Option<BrokerResult<usize>> {
        let offset = self.log.newest_offset();
        let fetched = match self.fetch(offset).await? {
            Ok(fetched) => fetched,
            Err(e) => return Some(Err(e)),
        };
        if fetched.records.is_empty() {
            return Some(Ok(0));
        }

        let log = Arc::clone(&self.log);
        let _gate = log.append_gate.lock().await;
        let store = log.store();
        let count = fetched.records.len();
        let records = fetched.records;
        let newest = match log.run_blocking(move || apply_records(&store, records)).await {
            Ok(newest) => newest,
            Err(e) => return Some(Err(e)),
        };
        let mut epochs = log.epochs.lock();
        for entry in &fetched.epochs {
            let start = entry.start_offset.max(offset);
            if start <= newest
                && let Err(e) = epochs.assign(entry.epoch, start)
            {
                drop(epochs);
                return Some(Err(log.on_log_error(e)));
            }
        }
        Some(Ok(count))
    }

    /// Rebuild the log from the leader starting at `base`, then swap it in.
    ///
    /// A resync that is cancelled or fails leaves no staging directory.
    async fn resync(&mut self, base: Offset) -> Option<BrokerResult<()>> {
        FOLLOWER_RESYNCS.inc();
        let staging_dir = sibling(&self.log.dir, RESYNC_DIR_SUFFIX);
        let outcome = self.rebuild(base, staging_dir.clone()).await;
        if !matches!(outcome, Some(Ok(()))) {
            let dir = staging_dir.clone();
            match tokio::task::spawn_blocking(move || discard_staging(&dir)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(dir = %staging_dir.display(), error = %e, "Failed to discard resync staging"),
                Err(e) => warn!(dir = %staging_dir.display(), error = %e, "Resync cleanup task failed"),
            }
        }
        outcome
    }

    async fn rebuild(&mut self, base: Offset, staging_dir: PathBuf) -> Option<BrokerResult<()>> {
        let partition = self.log.partition.clone();
        let mut base = base;

        'restart: loop {
            info!(%partition, leader = self.leader_id, base, "Resyncing log from leader");
            let config = self.log.segment_config.clone();
            let dir = staging_dir.clone();
            let opened = tokio::task::spawn_blocking(move || -> LogResult<(SegmentStore, EpochCache)> {
                if dir.exists() {
                    std::fs::remove_dir_all(&dir)?;
                }
                let store = SegmentStore::open_at(&dir, config, base)?;
                let epochs = EpochCache::open(&dir)?;
                Ok((store, epochs))
            })
            .await;
            let (store, mut epochs) = match opened {
                Ok(Ok(opened)) => opened,
                Ok(Err(e)) => return Some(Err(e.into())),
                Err(e) => return Some(Err(BrokerError::Io(std::io::Error::other(e)))),
            };
            let store = Arc::new(store);

            loop {
                let offset = store.newest_offset();
                let fetched = match self.fetch(offset).await? {
                    Ok(fetched) => fetched,
                    Err(BrokerError::ReplicaTooFarBehind { leader_oldest, .. }) => {
                        base = leader_oldest;
                        continue 'restart;
                    }
                    Err(e) => return Some(Err(e)),
                };
                if fetched.records.is_empty() {
                    break;
                }

                let target = Arc::clone(&store);
                let records = fetched.records;
                let applied = tokio::task::spawn_blocking(move || apply_records(&target, records)).await;
                let newest = match applied {
                    Ok(Ok(newest)) => newest,
                    Ok(Err(e)) => return Some(Err(e.into())),
                    Err(e) => return Some(Err(BrokerError::Io(std::io::Error::other(e)))),
                };
                for entry in &fetched.epochs {
                    let start = entry.start_offset.max(offset);
                    if start <= newest
                        && let Err(e) = epochs.assign(entry.epoch, start)
                    {
                        return Some(Err(e.into()));
                    }
                }
            }
            drop(epochs);

            let Ok(store) = Arc::try_unwrap(store) else {
                return Some(Err(BrokerError::Io(std::io::Error::other(
                    "staging store still shared",
                ))));
            };
            let log = Arc::clone(&self.log);
            let installed =
                tokio::task::spawn_blocking(move || log.install_resync(store, &staging_dir)).await;
            return Some(match installed {
                Ok(Ok(())) => Ok(()),
                Ok(Err(e)) => Err(self.log.on_log_error(e)),
                Err(e) => Err(BrokerError::Io(std::io::Error::other(e))),
            });
        }
    }
}

fn unexpected(response: &ReplicationResponse) -> BrokerError {
    BrokerError::Rpc(format!("unexpected replication response: {:?}", response))
}

/// Write fetched records at their offsets. Returns the log end afterwards.
fn apply_records(store: &SegmentStore, records: Vec<Record>) -> LogResult<Offset> {
    for record in records {
        match store.append_at(record.offset, &record.value)? {
            AppendAt::Appended | AppendAt::AlreadyPresent => {}
            AppendAt::Gap { newest } => {
                return Err(LogError::OffsetOutOfRange {
                    offset: record.offset,
                    oldest: store.oldest_offset(),
                    newest,
                });
            }
        }
    }
    Ok(store.newest_offset())
}

fn sibling(dir: &Path, suffix: &str) -> PathBuf {
    let mut name = dir.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(suffix);
    dir.with_file_name(name)
}

/// Move a completed staging directory into place. The caller holds the
/// append gate; `current` is closed before the rename.
pub(super) fn swap_in_staging(dir: &Path, staging_dir: &Path, current: &SegmentStore) -> LogResult<()> {
    std::fs::write(staging_dir.join(RESYNC_MARKER), b"")?;
    current.close()?;
    finish_swap(dir, staging_dir)
}

fn finish_swap(dir: &Path, staging_dir: &Path) -> LogResult<()> {
    let retired = sibling(dir, RETIRED_DIR_SUFFIX);
    if retired.exists() {
        std::fs::remove_dir_all(&retired)?;
    }
    if dir.exists() {
        std::fs::rename(dir, &retired)?;
    }
    std::fs::rename(staging_dir, dir)?;
    std::fs::remove_file(dir.join(RESYNC_MARKER))?;
    if retired.exists() {
        std::fs::remove_dir_all(&retired)?;
    }
    Ok(())
}

/// Remove an unfinished staging directory. One that carries the marker is
/// left for [`recover_resync_leftovers`] to complete.
fn discard_staging(staging_dir: &Path) -> std::io::Result<()> {
    if staging_dir.exists() && !staging_dir.join(RESYNC_MARKER).exists() {
        std::fs::remove_dir_all(staging_dir)?;
    }
    Ok(())
}

/// Remove the staging and retired directories that sit beside `dir`.
pub(super) fn remove_resync_dirs(dir: &Path) -> std::io::Result<()> {
    for suffix in [RESYNC_DIR_SUFFIX, RETIRED_DIR_SUFFIX] {
        let path = sibling(dir, suffix);
        if path.exists() {
            std::fs::remove_dir_all(path)?;
        }
    }
    Ok(())
}

/// Finish or discard a resync interrupted by a crash.
///
/// A staging directory with the marker is complete and replaces `dir`; one
/// without it is dropped.
pub(super) fn recover_resync_leftovers(dir: &Path) -> LogResult<()> {
    let staging = sibling(dir, RESYNC_DIR_SUFFIX);
    if staging.exists() {
        if staging.join(RESYNC_MARKER).exists() {
            info!(dir = %dir.display(), "Completing interrupted resync");
            finish_swap(dir, &staging)?;
        } else {
            debug!(dir = %dir.display(), "Discarding incomplete resync");
            std::fs::remove_dir_all(&staging)?;
        }
    }
    let marker = dir.join(RESYNC_MARKER);
    if marker.exists() {
        std::fs::remove_file(marker)?;
    }
    let retired = sibling(dir, RETIRED_DIR_SUFFIX);
    if retired.exists() {
        std::fs::remove_dir_all(retired)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::cluster::partition_log::{PartitionOptions, Role};
    use crate::cluster::replication::{EpochEntry, ReplicaClient, ReplicationError};
    use crate::log::SegmentConfig;
    use crate::types::TopicPartition;

    const LEADER_OLDEST: Offset = 100;

    /// A leader whose log starts at `LEADER_OLDEST`. It serves one batch,
    /// then either fails once (`fail_after_batch`) or never answers again.
    struct TruncatedLeader {
        fail_after_batch: bool,
        failed: AtomicBool,
    }

    impl TruncatedLeader {
        fn new(fail_after_batch: bool) -> Arc<Self> {
            Arc::new(Self {
                fail_after_batch,
                failed: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl ReplicaClient for TruncatedLeader {
        async fn call(
            &self,
            _target: BrokerId,
            request: ReplicationRequest,
        ) -> BrokerResult<ReplicationResponse> {
            let ReplicationRequest::Fetch { offset, .. } = request else {
                return Ok(ReplicationResponse::EpochEnd {
                    epoch: 1,
                    end_offset: LEADER_OLDEST + 3,
                });
            };
            if self.failed.load(Ordering::Acquire) {
                futures::future::pending::<()>().await;
            }
            if offset < LEADER_OLDEST {
                return Ok(ReplicationResponse::Error(ReplicationError::TooFarBehind {
                    oldest: LEADER_OLDEST,
                }));
            }
            if offset == LEADER_OLDEST {
                return Ok(ReplicationResponse::Records(FetchedRecords {
                    records: (0..3)
                        .map(|i| Record::new(LEADER_OLDEST + i, b"resynced".to_vec()))
                        .collect(),
                    oldest: LEADER_OLDEST,
                    newest: LEADER_OLDEST + 3,
                    epochs: vec![EpochEntry {
                        epoch: 1,
                        start_offset: LEADER_OLDEST,
                    }],
                }));
            }
            if self.fail_after_batch {
                self.failed.store(true, Ordering::Release);
                return Err(BrokerError::Rpc("leader went away".to_string()));
            }
            futures::future::pending::<()>().await;
            unreachable!()
        }
    }

    fn open_follower(dir: &Path, client: Arc<TruncatedLeader>) -> Arc<PartitionLog> {
        PartitionLog::open(
            TopicPartition::new("orders", 0),
            2,
            dir.to_path_buf(),
            SegmentConfig::default(),
            PartitionOptions {
                catch_up_poll_interval: Duration::from_millis(10),
                ..Default::default()
            },
            client,
        )
        .unwrap()
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        for _ in 0..500 {
            if condition() {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        condition()
    }

    #[tokio::test]
    async fn test_delete_during_resync_leaves_nothing_behind() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("orders-0");
        let staging = sibling(&dir, RESYNC_DIR_SUFFIX);
        let log = open_follower(&dir, TruncatedLeader::new(false));
        log.set_role(
            Role::Following {
                leader_id: Some(1),
                epoch: 1,
            },
            vec![1, 2],
        )
        .await
        .unwrap();

        assert!(wait_until(|| staging.exists()).await);
        log.delete().await.unwrap();
        assert!(!dir.exists());
        assert!(!staging.exists());
        assert!(!sibling(&dir, RETIRED_DIR_SUFFIX).exists());
    }

    #[tokio::test]
    async fn test_failed_resync_discards_staging() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("orders-0");
        let staging = sibling(&dir, RESYNC_DIR_SUFFIX);
        let leader = TruncatedLeader::new(true);
        let log = open_follower(&dir, Arc::clone(&leader));
        log.set_role(
            Role::Following {
                leader_id: Some(1),
                epoch: 1,
            },
            vec![1, 2],
        )
        .await
        .unwrap();

        assert!(wait_until(|| leader.failed.load(Ordering::Acquire)).await);
        assert!(wait_until(|| !staging.exists()).await);
        // The live log was never touched.
        assert_eq!(log.newest_offset(), 0);
        assert!(dir.exists());
        log.close().await.unwrap();
    }

    #[test]
    fn test_remove_resync_dirs() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("orders-0");
        for suffix in [RESYNC_DIR_SUFFIX, RETIRED_DIR_SUFFIX] {
            std::fs::create_dir_all(sibling(&dir, suffix)).unwrap();
        }
        remove_resync_dirs(&dir).unwrap();
        assert!(!sibling(&dir, RESYNC_DIR_SUFFIX).exists());
        assert!(!sibling(&dir, RETIRED_DIR_SUFFIX).exists());
        // Nothing to remove is fine.
        remove_resync_dirs(&dir).unwrap();
    }

    #[test]
    fn test_sibling_dir() {
        assert_eq!(
            sibling(Path::new("/data/orders-0"), ".resync"),
            PathBuf::from("/data/orders-0.resync")
        );
    }

    #[test]
    fn test_incomplete_staging_is_discarded() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("orders-0");
        let staging = sibling(&dir, RESYNC_DIR_SUFFIX);
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::create_dir_all(&staging).unwrap();

        recover_resync_leftovers(&dir).unwrap();
        assert!(dir.exists());
        assert!(!staging.exists());
    }

    #[test]
    fn test_marked_staging_replaces_log() {
        let root = tempfile::tempdir().unwrap();
        let dir = root.path().join("orders-0");
        let staging = sibling(&dir, RESYNC_DIR_SUFFIX);

        let old = SegmentStore::open(&dir, SegmentConfig::default()).unwrap();
        old.append(b"old").unwrap();
        old.close().unwrap();
        drop(old);

        let fresh = SegmentStore::open_at(&staging, SegmentConfig::default(), 40).unwrap();
        fresh.append_at(40, b"new").unwrap();
        fresh.close().unwrap();
        drop(fresh);
        std::fs::write(staging.join(RESYNC_MARKER), b"").unwrap();

        recover_resync_leftovers(&dir).unwrap();
        assert!(!staging.exists());
        assert!(!sibling(&dir, RETIRED_DIR_SUFFIX).exists());
        let store = SegmentStore::open(&dir, SegmentConfig::default()).unwrap();
        assert_eq!(store.oldest_offset(), 40);
        assert_eq!(store.newest_offset(), 41);
    }
}
