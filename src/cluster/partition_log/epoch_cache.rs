//! Leader epoch history of one partition.
//!
//! Records the first offset written under each leader epoch. A follower that
//! reconnects asks the leader where its latest epoch ends and truncates
//! everything past that point, which removes records a deposed leader wrote
//! but never got replicated.
//!
//! Stored next to the segments as `leader-epoch-checkpoint` and rewritten
//! through a temp file and rename on every change.

use std::path::{Path, PathBuf};

use tracing::warn;

use crate::cluster::replication::EpochEntry;
use crate::error::{LogError, LogResult};
use crate::types::{LeaderEpoch, Offset};

pub(crate) const CHECKPOINT_FILE: &str = "leader-epoch-checkpoint";

#[derive(Debug)]
pub struct EpochCache {
    path: PathBuf,
    entries: Vec<EpochEntry>,
}

impl EpochCache {
    /// Load the checkpoint in `dir`, or start empty if there is none.
    pub fn open(dir: &Path) -> LogResult<Self> {
        let path = dir.join(CHECKPOINT_FILE);
        let entries = match std::fs::read(&path) {
            Ok(bytes) => bincode::deserialize(&bytes).map_err(|e| LogError::Corrupt {
                segment: path.display().to_string(),
                reason: e.to_string(),
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e.into()),
        };
        Ok(Self { path, entries })
    }

    pub fn entries(&self) -> &[EpochEntry] {
        &self.entries
    }

    pub fn latest(&self) -> Option<EpochEntry> {
        self.entries.last().copied()
    }

    pub fn latest_epoch(&self) -> Option<LeaderEpoch> {
        self.latest().map(|e| e.epoch)
    }

    /// Note that `epoch` starts at `start_offset`. Epochs at or below the
    /// latest known one are ignored.
    pub fn assign(&mut self, epoch: LeaderEpoch, start_offset: Offset) -> LogResult<bool> {
        if let Some(latest) = self.latest() {
            if epoch <= latest.epoch {
                return Ok(false);
            }
            if start_offset < latest.start_offset {
                warn!(
                    epoch,
                    start_offset,
                    previous_start = latest.start_offset,
                    "Epoch starts before its predecessor, ignoring"
                );
                return Ok(false);
            }
        }
        self.entries.push(EpochEntry {
            epoch,
            start_offset,
        });
        self.persist()?;
        Ok(true)
    }

    /// Where `epoch` ends: the largest known epoch not above `epoch` and the
    /// first offset after it. `log_end` is returned for the latest epoch.
    ///
    /// An epoch older than everything known ends where the history starts.
    pub fn end_offset_for(&self, epoch: LeaderEpoch, log_end: Offset) -> (LeaderEpoch, Offset) {
        let idx = self.entries.partition_point(|e| e.epoch <= epoch);
        if idx == 0 {
            let start = self.entries.first().map(|e| e.start_offset).unwrap_or(log_end);
            return (epoch, start);
        }
        let found = self.entries[idx - 1];
        let end = self
            .entries
            .get(idx)
            .map(|next| next.start_offset)
            .unwrap_or(log_end);
        (found.epoch, end)
    }

    /// Forget epochs that start at or after `offset` (after log truncation).
    pub fn truncate_from(&mut self, offset: Offset) -> LogResult<()> {
        let before = self.entries.len();
        self.entries.retain(|e| e.start_offset < offset);
        if self.entries.len() != before {
            self.persist()?;
        }
        Ok(())
    }

    /// Entries relevant to a fetch of `[from, to)`: the epoch covering `from`
    /// and every epoch starting inside the range.
    pub fn covering(&self, from: Offset, to: Offset) -> Vec<EpochEntry> {
        let first = self
            .entries
            .partition_point(|e| e.start_offset <= from)
            .saturating_sub(1);
        self.entries[first.min(self.entries.len())..]
            .iter()
            .filter(|e| e.start_offset < to.max(from + 1))
            .copied()
            .collect()
    }

    fn persist(&self) -> LogResult<()> {
        let bytes = bincode::serialize(&self.entries).map_err(|e| LogError::Corrupt {
            segment: self.path.display().to_string(),
            reason: e.to_string(),
        })?;
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, bytes)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = EpochCache::open(dir.path()).unwrap();
        assert!(cache.latest().is_none());

        assert!(cache.assign(1, 0).unwrap());
        assert!(cache.assign(3, 10).unwrap());
        assert!(!cache.assign(2, 12).unwrap());
        assert!(!cache.assign(3, 15).unwrap());

        let reloaded = EpochCache::open(dir.path()).unwrap();
        assert_eq!(reloaded.entries(), cache.entries());
        assert_eq!(reloaded.latest_epoch(), Some(3));
    }

    #[test]
    fn test_end_offset_for() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = EpochCache::open(dir.path()).unwrap();
        cache.assign(1, 0).unwrap();
        cache.assign(3, 10).unwrap();
        cache.assign(4, 25).unwrap();

        assert_eq!(cache.end_offset_for(1, 30), (1, 10));
        // Epoch 2 never had a leader here: falls back to epoch 1.
        assert_eq!(cache.end_offset_for(2, 30), (1, 10));
        assert_eq!(cache.end_offset_for(3, 30), (3, 25));
        assert_eq!(cache.end_offset_for(4, 30), (4, 30));
        assert_eq!(cache.end_offset_for(9, 30), (4, 30));
        assert_eq!(cache.end_offset_for(0, 30), (0, 0));
    }

    #[test]
    fn test_truncate_from() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = EpochCache::open(dir.path()).unwrap();
        cache.assign(1, 0).unwrap();
        cache.assign(2, 10).unwrap();
        cache.assign(3, 20).unwrap();

        cache.truncate_from(10).unwrap();
        assert_eq!(cache.latest_epoch(), Some(1));
        assert_eq!(EpochCache::open(dir.path()).unwrap().latest_epoch(), Some(1));
    }

    #[test]
    fn test_covering() {
        let dir = tempfile::tempdir().unwrap();
        let mut cache = EpochCache::open(dir.path()).unwrap();
        cache.assign(1, 0).unwrap();
        cache.assign(2, 10).unwrap();
        cache.assign(3, 20).unwrap();

        let epochs: Vec<_> = cache.covering(5, 15).iter().map(|e| e.epoch).collect();
        assert_eq!(epochs, vec![1, 2]);
        let epochs: Vec<_> = cache.covering(20, 20).iter().map(|e| e.epoch).collect();
        assert_eq!(epochs, vec![3]);
    }
}
