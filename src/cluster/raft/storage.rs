//! Raft storage implementation using openraft's RaftStorage trait (v1 API).
//!
//! Log entries, the vote and snapshots are all persisted through an
//! [`ObjectStore`] (a local filesystem store under `<data_dir>/raft` in
//! production) so a restarted node comes back with its term, vote and log
//! intact. The metadata state machine itself lives in memory and is rebuilt
//! from the latest snapshot plus log replay.
//!
//! Layout under the store prefix:
//!
//! ```text
//! vote                      bincode Vote
//! purged                    bincode LogId of the last purged entry
//! log/<index:020>           bincode Entry
//! snapshot/current.meta     bincode SnapshotMetadata (commit marker)
//! snapshot/current.snapshot serialized MetadataSnapshot
//! ```
//!
//! Any storage error is returned to openraft as a `StorageError`, which stops
//! the Raft node. A node that cannot trust its own consensus state must not
//! keep participating.

use std::collections::BTreeMap;
use std::fmt::{Debug, Display};
use std::io::Cursor;
use std::ops::RangeBounds;
use std::sync::Arc;

use bytes::Bytes;
use futures::StreamExt;
use object_store::ObjectStore;
use object_store::path::Path as ObjectPath;
use openraft::{
    BasicNode, Entry, EntryPayload, ErrorSubject, ErrorVerb, LogId, OptionalSend, RaftStorage,
    Snapshot, SnapshotMeta, StorageError, StoredMembership, Vote,
};
use serde::{Serialize, de::DeserializeOwned};
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use super::commands::MetadataResponse;
use super::state_machine::MetadataStateMachine;
use super::types::{RaftNodeId, TypeConfig};

/// Snapshot metadata stored alongside the snapshot data.
#[derive(Clone, serde::Serialize, serde::Deserialize)]
struct SnapshotMetadata {
    last_log_id: Option<LogId<RaftNodeId>>,
    last_membership: StoredMembership<RaftNodeId, BasicNode>,
    snapshot_id: String,
}

/// Persisted snapshot data (cached in memory).
#[derive(Clone)]
struct CachedSnapshot {
    meta: SnapshotMeta<RaftNodeId, BasicNode>,
    data: Vec<u8>,
}

fn storage_error(
    subject: ErrorSubject<RaftNodeId>,
    verb: ErrorVerb,
    e: impl Display,
) -> StorageError<RaftNodeId> {
    StorageError::from_io_error(subject, verb, std::io::Error::other(e.to_string()))
}

/// Combined log and state machine storage for Raft.
#[derive(Clone)]
pub struct RaftStore {
    vote: Arc<RwLock<Option<Vote<RaftNodeId>>>>,
    log: Arc<RwLock<BTreeMap<u64, Entry<TypeConfig>>>>,
    last_purged_log_id: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    sm: Arc<MetadataStateMachine>,
    last_applied_log: Arc<RwLock<Option<LogId<RaftNodeId>>>>,
    last_membership: Arc<RwLock<StoredMembership<RaftNodeId, BasicNode>>>,
    cached_snapshot: Arc<RwLock<Option<CachedSnapshot>>>,
    object_store: Arc<dyn ObjectStore>,
    prefix: ObjectPath,
}

impl RaftStore {
    /// Create a store persisting under `prefix` in `object_store`.
    ///
    /// Call [`load`](Self::load) before handing the store to openraft.
    pub fn new(
        object_store: Arc<dyn ObjectStore>,
        prefix: &str,
        sm: Arc<MetadataStateMachine>,
    ) -> Self {
        Self {
            vote: Arc::new(RwLock::new(None)),
            log: Arc::new(RwLock::new(BTreeMap::new())),
            last_purged_log_id: Arc::new(RwLock::new(None)),
            sm,
            last_applied_log: Arc::new(RwLock::new(None)),
            last_membership: Arc::new(RwLock::new(StoredMembership::default())),
            cached_snapshot: Arc::new(RwLock::new(None)),
            object_store,
            prefix: ObjectPath::from(prefix),
        }
    }

    pub fn state_machine(&self) -> Arc<MetadataStateMachine> {
        Arc::clone(&self.sm)
    }

    fn path(&self, name: &str) -> ObjectPath {
        if self.prefix.as_ref().is_empty() {
            ObjectPath::from(name)
        } else {
            ObjectPath::from(format!("{}/{}", self.prefix, name))
        }
    }

    fn log_path(&self, index: u64) -> ObjectPath {
        self.path(&format!("log/{:020}", index))
    }

    async fn get_optional(&self, path: &ObjectPath) -> Result<Option<Bytes>, object_store::Error> {
        match self.object_store.get(path).await {
            Ok(result) => Ok(Some(result.bytes().await?)),
            Err(object_store::Error::NotFound { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn read_value<T: DeserializeOwned>(
        &self,
        path: &ObjectPath,
        subject: ErrorSubject<RaftNodeId>,
    ) -> Result<Option<T>, StorageError<RaftNodeId>> {
        let Some(bytes) = self
            .get_optional(path)
            .await
            .map_err(|e| storage_error(subject.clone(), ErrorVerb::Read, e))?
        else {
            return Ok(None);
        };
        bincode::deserialize(&bytes)
            .map(Some)
            .map_err(|e| {
                error!(error = %e, path = %path, "CORRUPTION: failed to decode persisted raft state");
                storage_error(subject, ErrorVerb::Read, e)
            })
    }

    async fn write_value<T: Serialize>(
        &self,
        path: &ObjectPath,
        value: &T,
        subject: ErrorSubject<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let bytes = bincode::serialize(value)
            .map_err(|e| storage_error(subject.clone(), ErrorVerb::Write, e))?;
        self.object_store
            .put(path, Bytes::from(bytes).into())
            .await
            .map_err(|e| {
                error!(error = %e, path = %path, "Failed to persist raft state");
                storage_error(subject, ErrorVerb::Write, e)
            })?;
        Ok(())
    }

    async fn delete_log_entry(&self, index: u64) -> Result<(), StorageError<RaftNodeId>> {
        match self.object_store.delete(&self.log_path(index)).await {
            Ok(()) | Err(object_store::Error::NotFound { .. }) => Ok(()),
            Err(e) => Err(storage_error(ErrorSubject::Logs, ErrorVerb::Delete, e)),
        }
    }

    /// Load persisted vote, log and snapshot. Returns true if any state was found.
    ///
    /// A snapshot whose metadata exists but whose data is missing or
    /// undecodable is treated as corruption and fails startup.
    pub async fn load(&self) -> Result<bool, StorageError<RaftNodeId>> {
        self.cleanup_temp_files().await;

        let vote: Option<Vote<RaftNodeId>> =
            self.read_value(&self.path("vote"), ErrorSubject::Vote).await?;
        let purged: Option<LogId<RaftNodeId>> =
            self.read_value(&self.path("purged"), ErrorSubject::Logs).await?;
        let had_snapshot = self.load_snapshot().await?;

        let mut indexes = Vec::new();
        let log_prefix = self.path("log");
        let mut listing = self.object_store.list(Some(&log_prefix));
        while let Some(item) = listing.next().await {
            let meta = item.map_err(|e| storage_error(ErrorSubject::Logs, ErrorVerb::Read, e))?;
            match meta.location.filename().and_then(|f| f.parse::<u64>().ok()) {
                Some(index) => indexes.push(index),
                None => warn!(path = %meta.location, "Ignoring unrecognized file in raft log"),
            }
        }
        indexes.sort_unstable();

        let purged_index = purged.map(|l| l.index);
        let mut log = BTreeMap::new();
        for index in indexes {
            if purged_index.is_some_and(|p| index <= p) {
                self.delete_log_entry(index).await?;
                continue;
            }
            let entry: Option<Entry<TypeConfig>> = self
                .read_value(&self.log_path(index), ErrorSubject::Logs)
                .await?;
            if let Some(entry) = entry {
                log.insert(index, entry);
            }
        }

        let found = vote.is_some() || !log.is_empty() || had_snapshot;
        info!(
            vote = ?vote,
            log_entries = log.len(),
            last_purged = ?purged_index,
            snapshot = had_snapshot,
            "Loaded raft state"
        );

        *self.vote.write().await = vote;
        *self.last_purged_log_id.write().await = purged;
        *self.log.write().await = log;
        Ok(found)
    }

    async fn load_snapshot(&self) -> Result<bool, StorageError<RaftNodeId>> {
        let meta_path = self.path("snapshot/current.meta");
        let data_path = self.path("snapshot/current.snapshot");

        let Some(metadata) = self
            .read_value::<SnapshotMetadata>(&meta_path, ErrorSubject::Snapshot(None))
            .await?
        else {
            debug!("No existing snapshot found (clean start)");
            return Ok(false);
        };

        let data = self
            .get_optional(&data_path)
            .await
            .map_err(|e| storage_error(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?
            .ok_or_else(|| {
                error!(
                    snapshot_id = %metadata.snapshot_id,
                    "CORRUPTION: Snapshot metadata exists but data file is missing"
                );
                storage_error(
                    ErrorSubject::Snapshot(None),
                    ErrorVerb::Read,
                    "snapshot data missing",
                )
            })?
            .to_vec();

        self.sm
            .restore(&data)
            .map_err(|e| storage_error(ErrorSubject::Snapshot(None), ErrorVerb::Read, e))?;
        *self.last_applied_log.write().await = metadata.last_log_id;
        *self.last_membership.write().await = metadata.last_membership.clone();

        let meta = SnapshotMeta {
            last_log_id: metadata.last_log_id,
            last_membership: metadata.last_membership,
            snapshot_id: metadata.snapshot_id,
        };
        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            "Restored snapshot"
        );
        *self.cached_snapshot.write().await = Some(CachedSnapshot { meta, data });
        Ok(true)
    }

    /// Delete temp files left by a crash during a snapshot write.
    async fn cleanup_temp_files(&self) {
        let prefix = self.path("snapshot");
        let mut listing = self.object_store.list(Some(&prefix));
        let mut temp_files = Vec::new();
        while let Some(result) = listing.next().await {
            match result {
                Ok(meta) => {
                    if meta
                        .location
                        .filename()
                        .is_some_and(|f| f.starts_with("temp-"))
                    {
                        temp_files.push(meta.location);
                    }
                }
                Err(e) => debug!(error = %e, "Error listing files during temp cleanup"),
            }
        }

        for path in temp_files {
            match self.object_store.delete(&path).await {
                Ok(()) => info!(path = %path, "Cleaned up orphaned temp snapshot file"),
                Err(e) => debug!(error = %e, path = %path, "Failed to delete temp file"),
            }
        }
    }

    async fn rename_or_copy(
        &self,
        from: &ObjectPath,
        to: &ObjectPath,
    ) -> Result<(), object_store::Error> {
        if let Err(e) = self.object_store.rename(from, to).await {
            debug!(error = %e, "Rename not supported, falling back to copy+delete");
            self.object_store.copy(from, to).await?;
            let _ = self.object_store.delete(from).await;
        }
        Ok(())
    }

    /// Persist a snapshot: data and metadata go to temp paths first, then the
    /// data is renamed into place, then the metadata. The metadata file is
    /// the commit marker.
    async fn persist_snapshot(
        &self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        data: &[u8],
    ) -> Result<(), StorageError<RaftNodeId>> {
        let subject = || ErrorSubject::Snapshot(Some(meta.signature()));
        let temp_data = self.path(&format!("snapshot/temp-{}.snapshot", meta.snapshot_id));
        let temp_meta = self.path(&format!("snapshot/temp-{}.meta", meta.snapshot_id));
        let final_data = self.path("snapshot/current.snapshot");
        let final_meta = self.path("snapshot/current.meta");

        let metadata = SnapshotMetadata {
            last_log_id: meta.last_log_id,
            last_membership: meta.last_membership.clone(),
            snapshot_id: meta.snapshot_id.clone(),
        };

        self.object_store
            .put(&temp_data, Bytes::copy_from_slice(data).into())
            .await
            .map_err(|e| storage_error(subject(), ErrorVerb::Write, e))?;

        if let Err(e) = self.write_value(&temp_meta, &metadata, subject()).await {
            let _ = self.object_store.delete(&temp_data).await;
            return Err(e);
        }

        if let Err(e) = self.rename_or_copy(&temp_data, &final_data).await {
            error!(error = %e, "Failed to move snapshot data into place");
            let _ = self.object_store.delete(&temp_data).await;
            let _ = self.object_store.delete(&temp_meta).await;
            return Err(storage_error(subject(), ErrorVerb::Write, e));
        }

        if let Err(e) = self.rename_or_copy(&temp_meta, &final_meta).await {
            error!(error = %e, "Failed to move snapshot metadata into place");
            let _ = self.object_store.delete(&temp_meta).await;
            return Err(storage_error(subject(), ErrorVerb::Write, e));
        }

        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            size_bytes = data.len(),
            "Persisted snapshot"
        );
        Ok(())
    }
}

impl RaftStorage<TypeConfig> for RaftStore {
    type LogReader = Self;
    type SnapshotBuilder = Self;

    async fn get_log_reader(&mut self) -> Self::LogReader {
        self.clone()
    }

    async fn save_vote(&mut self, vote: &Vote<RaftNodeId>) -> Result<(), StorageError<RaftNodeId>> {
        self.write_value(&self.path("vote"), vote, ErrorSubject::Vote)
            .await?;
        *self.vote.write().await = Some(*vote);
        Ok(())
    }

    async fn read_vote(&mut self) -> Result<Option<Vote<RaftNodeId>>, StorageError<RaftNodeId>> {
        Ok(*self.vote.read().await)
    }

    async fn get_log_state(
        &mut self,
    ) -> Result<openraft::storage::LogState<TypeConfig>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        let last_purged = *self.last_purged_log_id.read().await;
        let last_log_id = log.values().next_back().map(|e| e.log_id).or(last_purged);

        Ok(openraft::storage::LogState {
            last_purged_log_id: last_purged,
            last_log_id,
        })
    }

    async fn append_to_log<I>(&mut self, entries: I) -> Result<(), StorageError<RaftNodeId>>
    where
        I: IntoIterator<Item = Entry<TypeConfig>> + OptionalSend,
    {
        let entries: Vec<Entry<TypeConfig>> = entries.into_iter().collect();
        for entry in entries {
            let subject = ErrorSubject::Log(entry.log_id);
            self.write_value(&self.log_path(entry.log_id.index), &entry, subject)
                .await?;
            self.log.write().await.insert(entry.log_id.index, entry);
        }
        Ok(())
    }

    async fn delete_conflict_logs_since(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let keys: Vec<u64> = self
            .log
            .read()
            .await
            .range(log_id.index..)
            .map(|(k, _)| *k)
            .collect();
        // Newest first, so a crash part way leaves a contiguous prefix.
        for key in keys.into_iter().rev() {
            self.delete_log_entry(key).await?;
            self.log.write().await.remove(&key);
        }
        Ok(())
    }

    async fn purge_logs_upto(
        &mut self,
        log_id: LogId<RaftNodeId>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        self.write_value(&self.path("purged"), &log_id, ErrorSubject::Logs)
            .await?;
        *self.last_purged_log_id.write().await = Some(log_id);

        let keys: Vec<u64> = self
            .log
            .read()
            .await
            .range(..=log_id.index)
            .map(|(k, _)| *k)
            .collect();
        for key in keys {
            self.delete_log_entry(key).await?;
            self.log.write().await.remove(&key);
        }
        Ok(())
    }

    async fn last_applied_state(
        &mut self,
    ) -> Result<
        (
            Option<LogId<RaftNodeId>>,
            StoredMembership<RaftNodeId, BasicNode>,
        ),
        StorageError<RaftNodeId>,
    > {
        let last_applied = *self.last_applied_log.read().await;
        let membership = self.last_membership.read().await.clone();
        Ok((last_applied, membership))
    }

    async fn apply_to_state_machine(
        &mut self,
        entries: &[Entry<TypeConfig>],
    ) -> Result<Vec<MetadataResponse>, StorageError<RaftNodeId>> {
        let mut responses = Vec::with_capacity(entries.len());

        for entry in entries {
            let index = entry.log_id.index;
            match &entry.payload {
                EntryPayload::Blank => {
                    self.sm.advance(index);
                    responses.push(MetadataResponse::Ok);
                }
                EntryPayload::Normal(command) => {
                    responses.push(self.sm.apply(index, command.clone()));
                }
                EntryPayload::Membership(membership) => {
                    *self.last_membership.write().await =
                        StoredMembership::new(Some(entry.log_id), membership.clone());
                    self.sm.advance(index);
                    responses.push(MetadataResponse::Ok);
                }
            }
            *self.last_applied_log.write().await = Some(entry.log_id);
        }

        Ok(responses)
    }

    async fn get_snapshot_builder(&mut self) -> Self::SnapshotBuilder {
        self.clone()
    }

    async fn begin_receiving_snapshot(
        &mut self,
    ) -> Result<Box<Cursor<Vec<u8>>>, StorageError<RaftNodeId>> {
        Ok(Box::new(Cursor::new(Vec::new())))
    }

    async fn install_snapshot(
        &mut self,
        meta: &SnapshotMeta<RaftNodeId, BasicNode>,
        snapshot: Box<Cursor<Vec<u8>>>,
    ) -> Result<(), StorageError<RaftNodeId>> {
        let data = snapshot.into_inner();

        self.persist_snapshot(meta, &data).await?;

        self.sm.restore(&data).map_err(|e| {
            storage_error(
                ErrorSubject::Snapshot(Some(meta.signature())),
                ErrorVerb::Read,
                e,
            )
        })?;
        *self.last_applied_log.write().await = meta.last_log_id;
        *self.last_membership.write().await =
            StoredMembership::new(meta.last_log_id, meta.last_membership.membership().clone());

        info!(
            snapshot_id = %meta.snapshot_id,
            last_log_index = ?meta.last_log_id.map(|l| l.index),
            "Installed snapshot from leader"
        );
        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data,
        });
        Ok(())
    }

    async fn get_current_snapshot(
        &mut self,
    ) -> Result<Option<Snapshot<TypeConfig>>, StorageError<RaftNodeId>> {
        Ok(self
            .cached_snapshot
            .read()
            .await
            .as_ref()
            .map(|cached| Snapshot {
                meta: cached.meta.clone(),
                snapshot: Box::new(Cursor::new(cached.data.clone())),
            }))
    }
}

impl openraft::RaftSnapshotBuilder<TypeConfig> for RaftStore {
    async fn build_snapshot(&mut self) -> Result<Snapshot<TypeConfig>, StorageError<RaftNodeId>> {
        // Read the applied position before serializing so the snapshot never
        // claims more than it contains.
        let last_applied = *self.last_applied_log.read().await;
        let membership = self.last_membership.read().await.clone();
        let data = self
            .sm
            .snapshot_bytes()
            .map_err(|e| storage_error(ErrorSubject::StateMachine, ErrorVerb::Read, e))?;

        let snapshot_id = format!("snapshot-{}", last_applied.map(|l| l.index).unwrap_or(0));
        let meta = SnapshotMeta {
            last_log_id: last_applied,
            last_membership: membership,
            snapshot_id,
        };

        self.persist_snapshot(&meta, &data).await?;

        *self.cached_snapshot.write().await = Some(CachedSnapshot {
            meta: meta.clone(),
            data: data.clone(),
        });

        Ok(Snapshot {
            meta,
            snapshot: Box::new(Cursor::new(data)),
        })
    }
}

impl openraft::RaftLogReader<TypeConfig> for RaftStore {
    async fn try_get_log_entries<RB: RangeBounds<u64> + Clone + Debug + OptionalSend>(
        &mut self,
        range: RB,
    ) -> Result<Vec<Entry<TypeConfig>>, StorageError<RaftNodeId>> {
        let log = self.log.read().await;
        Ok(log.range(range).map(|(_, e)| e.clone()).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::super::commands::MetadataCommand;
    use super::super::domains::{BrokerCommand, BrokerEndpoints};
    use super::*;
    use object_store::memory::InMemory;
    use openraft::{RaftLogReader, RaftSnapshotBuilder};

    fn create_test_store(os: Arc<dyn ObjectStore>) -> RaftStore {
        RaftStore::new(os, "raft", Arc::new(MetadataStateMachine::new()))
    }

    fn make_log_id(term: u64, node: u64, index: u64) -> LogId<RaftNodeId> {
        LogId::new(openraft::CommittedLeaderId::new(term, node), index)
    }

    fn make_entry(index: u64, payload: EntryPayload<TypeConfig>) -> Entry<TypeConfig> {
        Entry {
            log_id: make_log_id(1, 1, index),
            payload,
        }
    }

    fn register(broker_id: i32) -> EntryPayload<TypeConfig> {
        EntryPayload::Normal(MetadataCommand::Broker(BrokerCommand::Register {
            broker_id,
            endpoints: BrokerEndpoints::default(),
            voter: true,
            timestamp_ms: 0,
        }))
    }

    #[tokio::test]
    async fn test_vote_and_log_survive_restart() {
        let os: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut store = create_test_store(Arc::clone(&os));
        assert!(!store.load().await.unwrap());

        let vote = Vote::new(3, 1);
        store.save_vote(&vote).await.unwrap();
        store
            .append_to_log(vec![
                make_entry(1, EntryPayload::Blank),
                make_entry(2, register(1)),
            ])
            .await
            .unwrap();

        let mut restarted = create_test_store(os);
        assert!(restarted.load().await.unwrap());
        assert_eq!(restarted.read_vote().await.unwrap(), Some(vote));
        let entries = restarted.try_get_log_entries(0..10).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].log_id.index, 2);
    }

    #[tokio::test]
    async fn test_delete_conflicts_and_purge_are_persisted() {
        let os: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut store = create_test_store(Arc::clone(&os));
        store
            .append_to_log((1..=5).map(|i| make_entry(i, EntryPayload::Blank)))
            .await
            .unwrap();

        store
            .delete_conflict_logs_since(make_log_id(1, 1, 4))
            .await
            .unwrap();
        store.purge_logs_upto(make_log_id(1, 1, 1)).await.unwrap();

        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_purged_log_id.map(|l| l.index), Some(1));
        assert_eq!(state.last_log_id.map(|l| l.index), Some(3));

        let mut restarted = create_test_store(os);
        restarted.load().await.unwrap();
        let indexes: Vec<u64> = restarted
            .try_get_log_entries(..)
            .await
            .unwrap()
            .iter()
            .map(|e| e.log_id.index)
            .collect();
        assert_eq!(indexes, vec![2, 3]);
    }

    #[tokio::test]
    async fn test_last_log_id_falls_back_to_purged() {
        let mut store = create_test_store(Arc::new(InMemory::new()));
        store
            .append_to_log(vec![make_entry(1, EntryPayload::Blank)])
            .await
            .unwrap();
        store.purge_logs_upto(make_log_id(1, 1, 1)).await.unwrap();
        let state = store.get_log_state().await.unwrap();
        assert_eq!(state.last_log_id.map(|l| l.index), Some(1));
    }

    #[tokio::test]
    async fn test_apply_publishes_versioned_snapshots() {
        let mut store = create_test_store(Arc::new(InMemory::new()));
        let sm = store.state_machine();
        let mut rx = sm.subscribe();

        let responses = store
            .apply_to_state_machine(&[make_entry(1, EntryPayload::Blank), make_entry(2, register(7))])
            .await
            .unwrap();
        assert_eq!(responses.len(), 2);
        assert!(sm.current().brokers.is_active(7));
        assert_eq!(sm.current().version, 2);

        let versions: Vec<u64> = std::iter::from_fn(|| rx.try_recv().ok())
            .map(|s| s.version)
            .collect();
        assert_eq!(versions, vec![0, 1, 2]);

        let (applied, _) = store.last_applied_state().await.unwrap();
        assert_eq!(applied.map(|l| l.index), Some(2));
    }

    #[tokio::test]
    async fn test_snapshot_restored_on_restart() {
        let os: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut store = create_test_store(Arc::clone(&os));
        store
            .apply_to_state_machine(&[make_entry(1, register(1)), make_entry(2, register(2))])
            .await
            .unwrap();
        let snapshot = store.build_snapshot().await.unwrap();
        assert_eq!(snapshot.meta.last_log_id.map(|l| l.index), Some(2));

        let mut restarted = create_test_store(os);
        assert!(restarted.load().await.unwrap());
        let sm = restarted.state_machine();
        assert_eq!(sm.current().version, 2);
        assert!(sm.current().brokers.is_active(2));
        assert!(restarted.get_current_snapshot().await.unwrap().is_some());
        let (applied, _) = restarted.last_applied_state().await.unwrap();
        assert_eq!(applied.map(|l| l.index), Some(2));
    }

    #[tokio::test]
    async fn test_snapshot_meta_without_data_fails_load() {
        let os: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let mut store = create_test_store(Arc::clone(&os));
        store
            .apply_to_state_machine(&[make_entry(1, register(1))])
            .await
            .unwrap();
        store.build_snapshot().await.unwrap();
        os.delete(&ObjectPath::from("raft/snapshot/current.snapshot"))
            .await
            .unwrap();

        let restarted = create_test_store(os);
        assert!(restarted.load().await.is_err());
    }

    #[tokio::test]
    async fn test_orphaned_temp_files_removed() {
        let os: Arc<dyn ObjectStore> = Arc::new(InMemory::new());
        let temp = ObjectPath::from("raft/snapshot/temp-snapshot-9.snapshot");
        os.put(&temp, Bytes::from_static(b"junk").into()).await.unwrap();

        let store = create_test_store(Arc::clone(&os));
        store.load().await.unwrap();
        assert!(matches!(
            os.get(&temp).await,
            Err(object_store::Error::NotFound { .. })
        ));
    }
}
