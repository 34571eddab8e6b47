//! Segmented, offset-addressed store for one partition.
//!
//! # Locking
//!
//! - `append_lock` serializes appends, rolls, retention and truncation. The
//!   order in which appends take it defines offset assignment.
//! - `fence` is held shared by appends and reads and exclusively by
//!   `truncate` and `delete`, so neither ever runs against in-flight I/O.
//! - `segments` is a short-lived lock around the segment list. Readers clone
//!   the list of `Arc<Segment>` and do their I/O without holding it.
//! - `oldest` / `newest` are published with release ordering after the
//!   segment data they describe, so a reader that loads `newest` sees every
//!   frame below it.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU8, AtomicU64, Ordering};

use parking_lot::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use super::CommitLog;
use super::config::{FlushPolicy, SegmentConfig};
use super::segment::{Segment, parse_log_file_name};
use crate::error::{LogError, LogResult};
use crate::types::{Offset, Record, current_time_ms};

const STATE_OPEN: u8 = 0;
const STATE_FAILED: u8 = 1;
const STATE_CLOSED: u8 = 2;

/// Outcome of a positioned append used by replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppendAt {
    /// The record was written at the requested offset.
    Appended,
    /// The log already holds a record at that offset.
    AlreadyPresent,
    /// The requested offset is past the end of the log.
    Gap { newest: Offset },
}

#[derive(Debug, Default)]
struct AppendState {
    appends_since_flush: u64,
}

/// The on-disk log of a single partition.
pub struct SegmentStore {
    dir: PathBuf,
    config: SegmentConfig,
    segments: RwLock<Vec<Arc<Segment>>>,
    append_lock: Mutex<AppendState>,
    fence: RwLock<()>,
    oldest: AtomicU64,
    newest: AtomicU64,
    state: AtomicU8,
}

impl std::fmt::Debug for SegmentStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SegmentStore")
            .field("dir", &self.dir)
            .field("oldest", &self.oldest_offset())
            .field("newest", &self.newest_offset())
            .field("segments", &self.segment_count())
            .finish()
    }
}

impl SegmentStore {
    /// Open the store in `dir`, creating it if needed. A new store starts at
    /// offset 0.
    pub fn open(dir: impl AsRef<Path>, config: SegmentConfig) -> LogResult<Self> {
        Self::open_at(dir, config, 0)
    }

    /// Open the store in `dir`. If the directory holds no segments, the first
    /// segment starts at `base_offset`.
    pub fn open_at(
        dir: impl AsRef<Path>,
        config: SegmentConfig,
        base_offset: Offset,
    ) -> LogResult<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)?;

        let mut bases = Vec::new();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str()
                && let Some(base) = parse_log_file_name(name)
            {
                bases.push(base);
            }
        }
        bases.sort_unstable();

        let mut segments = Vec::with_capacity(bases.len().max(1));
        for (i, base) in bases.iter().enumerate() {
            let next_base = bases.get(i + 1).copied();
            segments.push(Arc::new(Segment::open(&dir, *base, next_base, &config)?));
        }
        if segments.is_empty() {
            segments.push(Arc::new(Segment::create(&dir, base_offset)?));
        }

        let oldest = segments[0].base_offset();
        let newest = segments
            .last()
            .map(|s| s.next_offset())
            .unwrap_or(base_offset);

        info!(
            dir = %dir.display(),
            segments = segments.len(),
            oldest,
            newest,
            "Opened segment store"
        );

        Ok(Self {
            dir,
            config,
            segments: RwLock::new(segments),
            append_lock: Mutex::new(AppendState::default()),
            fence: RwLock::new(()),
            oldest: AtomicU64::new(oldest),
            newest: AtomicU64::new(newest),
            state: AtomicU8::new(STATE_OPEN),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn config(&self) -> &SegmentConfig {
        &self.config
    }

    pub fn segment_count(&self) -> usize {
        self.segments.read().len()
    }

    /// Base offsets of all segments, oldest first.
    pub fn segment_bases(&self) -> Vec<Offset> {
        self.segments.read().iter().map(|s| s.base_offset()).collect()
    }

    /// Total bytes across all segments.
    pub fn size_bytes(&self) -> u64 {
        self.segments.read().iter().map(|s| s.size()).sum()
    }

    pub fn is_failed(&self) -> bool {
        self.state.load(Ordering::Acquire) == STATE_FAILED
    }

    fn check_open(&self) -> LogResult<()> {
        match self.state.load(Ordering::Acquire) {
            STATE_OPEN => Ok(()),
            STATE_FAILED => Err(LogError::Failed),
            _ => Err(LogError::Closed),
        }
    }

    fn fail(&self, err: LogError) -> LogError {
        if err.is_fatal() {
            error!(dir = %self.dir.display(), error = %err, "Segment store failed");
            let _ = self.state.compare_exchange(
                STATE_OPEN,
                STATE_FAILED,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
        }
        err
    }

    /// Append at an explicit offset. Used by replicas so the check against
    /// `newest` and the write happen under the same lock.
    pub fn append_at(&self, offset: Offset, payload: &[u8]) -> LogResult<AppendAt> {
        let mut state = self.append_lock.lock();
        let _fence = self.fence.read();
        self.check_open()?;

        let newest = self.newest.load(Ordering::Acquire);
        if offset < newest {
            return Ok(AppendAt::AlreadyPresent);
        }
        if offset > newest {
            return Ok(AppendAt::Gap { newest });
        }
        self.append_locked(&mut state, payload)?;
        Ok(AppendAt::Appended)
    }

    fn append_locked(&self, state: &mut AppendState, payload: &[u8]) -> LogResult<Offset> {
        if payload.len() > self.config.max_record_bytes as usize {
            return Err(LogError::RecordTooLarge {
                size: payload.len(),
                max: self.config.max_record_bytes,
            });
        }

        let offset = self.newest.load(Ordering::Acquire);
        let active = self.active_for_append(offset).map_err(|e| self.fail(e))?;

        active
            .append(offset, payload, &self.config)
            .map_err(|e| self.fail(e.into()))?;

        state.appends_since_flush += 1;
        let flush = match self.config.flush_policy {
            FlushPolicy::OsDefault => false,
            FlushPolicy::EveryAppend => true,
            FlushPolicy::EveryN(n) => state.appends_since_flush >= n,
        };
        if flush {
            active.sync().map_err(|e| self.fail(e.into()))?;
            state.appends_since_flush = 0;
        }

        self.newest.store(offset + 1, Ordering::Release);
        Ok(offset)
    }

    /// Return the segment the next append goes to, rolling first if the
    /// active segment is full or too old.
    fn active_for_append(&self, offset: Offset) -> LogResult<Arc<Segment>> {
        let active = {
            let segments = self.segments.read();
            segments.last().cloned().ok_or(LogError::Closed)?
        };

        let too_old = !active.is_empty() && active.age() >= self.config.max_segment_age;
        if !active.is_full(&self.config) && !too_old {
            return Ok(active);
        }

        active.seal()?;
        let next = Arc::new(Segment::create(&self.dir, offset)?);
        self.segments.write().push(next.clone());

        debug!(
            dir = %self.dir.display(),
            sealed_base = active.base_offset(),
            new_base = offset,
            too_old,
            "Rolled segment"
        );
        crate::cluster::metrics::SEGMENT_ROLLS.inc();
        Ok(next)
    }

    /// Delete whole closed segments from the front of the log according to
    /// the retention settings. Returns how many segments were removed.
    pub fn apply_retention(&self) -> LogResult<usize> {
        if self.config.retention_bytes.is_none() && self.config.retention_age.is_none() {
            return Ok(0);
        }

        let _state = self.append_lock.lock();
        self.check_open()?;

        let now_ms = current_time_ms();
        let removed: Vec<Arc<Segment>> = {
            let mut segments = self.segments.write();
            let mut total: u64 = segments.iter().map(|s| s.size()).sum();
            let mut drop_count = 0;

            for segment in segments.iter().take(segments.len().saturating_sub(1)) {
                let over_size = self
                    .config
                    .retention_bytes
                    .is_some_and(|limit| total > limit);
                let expired = self.config.retention_age.is_some_and(|age| {
                    now_ms.saturating_sub(segment.last_write_ms()) > age.as_millis() as u64
                });
                if !over_size && !expired {
                    break;
                }
                total -= segment.size();
                drop_count += 1;
            }

            if drop_count == 0 {
                return Ok(0);
            }
            self.oldest
                .store(segments[drop_count].base_offset(), Ordering::Release);
            segments.drain(..drop_count).collect()
        };

        for segment in &removed {
            if let Err(e) = segment.remove_files() {
                warn!(
                    base_offset = segment.base_offset(),
                    error = %e,
                    "Failed to remove expired segment files"
                );
            }
        }

        info!(
            dir = %self.dir.display(),
            removed = removed.len(),
            oldest = self.oldest_offset(),
            "Applied retention"
        );
        Ok(removed.len())
    }

    /// Sync the active segment to disk.
    pub fn flush(&self) -> LogResult<()> {
        let _state = self.append_lock.lock();
        self.check_open()?;
        if let Some(active) = self.segments.read().last() {
            active.sync().map_err(|e| self.fail(e.into()))?;
        }
        Ok(())
    }

    /// Flush and stop accepting operations. Files stay on disk.
    pub fn close(&self) -> LogResult<()> {
        let _state = self.append_lock.lock();
        let _fence = self.fence.write();
        if self.state.swap(STATE_CLOSED, Ordering::AcqRel) == STATE_CLOSED {
            return Ok(());
        }
        if let Some(active) = self.segments.read().last() {
            active.sync()?;
        }
        debug!(dir = %self.dir.display(), "Closed segment store");
        Ok(())
    }
}

impl CommitLog for SegmentStore {
    fn append(&self, value: &[u8]) -> LogResult<Offset> {
        let mut state = self.append_lock.lock();
        let _fence = self.fence.read();
        self.check_open()?;
        self.append_locked(&mut state, value)
    }

    fn read(&self, offset: Offset, max_bytes: usize) -> LogResult<Vec<Record>> {
        let _fence = self.fence.read();
        if self.state.load(Ordering::Acquire) == STATE_CLOSED {
            return Err(LogError::Closed);
        }

        // Retention moves `oldest` under the segment write lock, so reading it
        // under the read lock keeps it consistent with the snapshot. Removed
        // files stay readable through the snapshot's open handles.
        let newest = self.newest.load(Ordering::Acquire);
        let (segments, oldest) = {
            let segments = self.segments.read();
            (segments.clone(), self.oldest.load(Ordering::Acquire))
        };
        let out_of_range = LogError::OffsetOutOfRange {
            offset,
            oldest,
            newest,
        };
        if offset < oldest || offset >= newest {
            return Err(out_of_range);
        }

        let start = segments
            .partition_point(|s| s.base_offset() <= offset)
            .saturating_sub(1);
        if segments.get(start).is_none_or(|s| s.base_offset() > offset) {
            return Err(out_of_range);
        }

        let mut out = Vec::new();
        let mut budget = max_bytes;
        let mut cursor = offset;
        for segment in &segments[start..] {
            if cursor >= newest {
                break;
            }
            let exhausted = segment.read_into(cursor, newest, &mut budget, &mut out)?;
            if exhausted {
                break;
            }
            if let Some(last) = out.last() {
                cursor = last.offset + 1;
            }
        }
        Ok(out)
    }

    fn truncate(&self, offset: Offset) -> LogResult<()> {
        let _state = self.append_lock.lock();
        let _fence = self.fence.write();
        self.check_open()?;

        let oldest = self.oldest.load(Ordering::Acquire);
        let newest = self.newest.load(Ordering::Acquire);
        if offset > newest || offset < oldest {
            return Err(LogError::InvalidTruncation {
                offset,
                oldest,
                newest,
            });
        }
        if offset == newest {
            return Ok(());
        }

        let mut segments = self.segments.write();
        while segments.len() > 1
            && segments
                .last()
                .is_some_and(|s| s.base_offset() > offset)
        {
            if let Some(segment) = segments.pop() {
                segment.remove_files().map_err(|e| self.fail(e.into()))?;
            }
        }
        if let Some(last) = segments.last() {
            last.truncate_to(offset).map_err(|e| self.fail(e))?;
        }
        self.newest.store(offset, Ordering::Release);

        info!(
            dir = %self.dir.display(),
            from = newest,
            to = offset,
            "Truncated log"
        );
        Ok(())
    }

    fn delete(&self) -> LogResult<()> {
        let _state = self.append_lock.lock();
        let _fence = self.fence.write();
        self.state.store(STATE_CLOSED, Ordering::Release);
        self.segments.write().clear();

        match std::fs::remove_dir_all(&self.dir) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        info!(dir = %self.dir.display(), "Deleted segment store");
        Ok(())
    }

    fn oldest_offset(&self) -> Offset {
        self.oldest.load(Ordering::Acquire)
    }

    fn newest_offset(&self) -> Offset {
        self.newest.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn small_config() -> SegmentConfig {
        SegmentConfig {
            max_segment_bytes: 1024,
            index_interval_bytes: 128,
            ..Default::default()
        }
    }

    #[test]
    fn test_append_assigns_sequential_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(dir.path(), small_config()).unwrap();

        for expected in 0..50u64 {
            assert_eq!(store.newest_offset(), expected);
            assert_eq!(store.append(b"value").unwrap(), expected);
        }
        assert_eq!(store.oldest_offset(), 0);
        assert_eq!(store.newest_offset(), 50);
    }

    #[test]
    fn test_rolls_by_size() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(dir.path(), small_config()).unwrap();
        for _ in 0..100 {
            store.append(&[1u8; 100]).unwrap();
        }
        assert!(store.segment_count() > 1);

        let records = store.read(0, usize::MAX).unwrap();
        assert_eq!(records.len(), 100);
        for (i, r) in records.iter().enumerate() {
            assert_eq!(r.offset, i as u64);
        }
    }

    #[test]
    fn test_rolls_by_age() {
        let dir = tempfile::tempdir().unwrap();
        let config = SegmentConfig {
            max_segment_age: Duration::from_millis(20),
            ..small_config()
        };
        let store = SegmentStore::open(dir.path(), config).unwrap();
        store.append(b"a").unwrap();
        std::thread::sleep(Duration::from_millis(40));
        store.append(b"b").unwrap();
        assert_eq!(store.segment_bases(), vec![0, 1]);
    }

    #[test]
    fn test_read_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(dir.path(), small_config()).unwrap();
        store.append(b"a").unwrap();

        assert!(matches!(
            store.read(1, 100),
            Err(LogError::OffsetOutOfRange { offset: 1, .. })
        ));
        assert_eq!(store.read(0, 100).unwrap().len(), 1);
    }

    #[test]
    fn test_append_at() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(dir.path(), small_config()).unwrap();
        assert_eq!(store.append_at(0, b"a").unwrap(), AppendAt::Appended);
        assert_eq!(store.append_at(0, b"a").unwrap(), AppendAt::AlreadyPresent);
        assert_eq!(
            store.append_at(5, b"f").unwrap(),
            AppendAt::Gap { newest: 1 }
        );
        assert_eq!(store.newest_offset(), 1);
    }

    #[test]
    fn test_record_too_large() {
        let dir = tempfile::tempdir().unwrap();
        let config = SegmentConfig {
            max_record_bytes: 8,
            ..small_config()
        };
        let store = SegmentStore::open(dir.path(), config).unwrap();
        assert!(matches!(
            store.append(&[0u8; 9]),
            Err(LogError::RecordTooLarge { size: 9, max: 8 })
        ));
        assert_eq!(store.newest_offset(), 0);
    }

    #[test]
    fn test_truncate_across_segments() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(dir.path(), small_config()).unwrap();
        for _ in 0..60 {
            store.append(&[2u8; 100]).unwrap();
        }
        let before = store.segment_count();
        assert!(before > 2);

        store.truncate(5).unwrap();
        assert_eq!(store.newest_offset(), 5);
        assert_eq!(store.segment_count(), 1);

        assert_eq!(store.append(b"after").unwrap(), 5);
        let records = store.read(4, usize::MAX).unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(&records[1].value[..], b"after");
    }

    #[test]
    fn test_retention_by_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let config = SegmentConfig {
            retention_bytes: Some(2048),
            ..small_config()
        };
        let store = SegmentStore::open(dir.path(), config).unwrap();
        for _ in 0..100 {
            store.append(&[3u8; 100]).unwrap();
        }

        let removed = store.apply_retention().unwrap();
        assert!(removed > 0);
        assert!(store.oldest_offset() > 0);
        assert!(store.size_bytes() <= 2048 + 1024);
        assert_eq!(store.oldest_offset(), store.segment_bases()[0]);
        assert!(matches!(
            store.read(0, 10),
            Err(LogError::OffsetOutOfRange { .. })
        ));
    }

    #[test]
    fn test_delete_closes_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("p");
        let store = SegmentStore::open(&path, small_config()).unwrap();
        store.append(b"x").unwrap();
        store.delete().unwrap();

        assert!(!path.exists());
        assert!(matches!(store.append(b"y"), Err(LogError::Closed)));
        assert!(matches!(store.read(0, 10), Err(LogError::Closed)));
    }

    #[test]
    fn test_open_at_base_offset() {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open_at(dir.path(), small_config(), 500).unwrap();
        assert_eq!(store.oldest_offset(), 500);
        assert_eq!(store.newest_offset(), 500);
        assert_eq!(store.append(b"x").unwrap(), 500);
    }
}
