//! A single log segment: one `.log` file of frames plus its sparse `.index`.
//!
//! Appends are serialized by the owning store. Readers use positional reads
//! bounded by the published `size`, so they never observe a partial frame.

use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant, UNIX_EPOCH};

use bytes::Bytes;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::config::SegmentConfig;
use super::index::OffsetIndex;
use super::record::{FRAME_HEADER_LEN, FrameHeader, encode_frame};
use crate::error::{LogError, LogResult};
use crate::types::{Offset, Record, current_time_ms};

pub const LOG_SUFFIX: &str = "log";
pub const INDEX_SUFFIX: &str = "index";

pub fn log_file_name(base_offset: Offset) -> String {
    format!("{:020}.{}", base_offset, LOG_SUFFIX)
}

pub fn index_file_name(base_offset: Offset) -> String {
    format!("{:020}.{}", base_offset, INDEX_SUFFIX)
}

/// Parse a base offset out of a `{base:020}.log` file name.
pub fn parse_log_file_name(name: &str) -> Option<Offset> {
    let stem = name.strip_suffix(".log")?;
    if stem.len() != 20 {
        return None;
    }
    stem.parse().ok()
}

pub struct Segment {
    base_offset: Offset,
    log_path: PathBuf,
    index_path: PathBuf,
    log: File,
    index: RwLock<OffsetIndex>,
    size: AtomicU64,
    next_offset: AtomicU64,
    bytes_since_index: AtomicU64,
    created_at: Instant,
    last_write_ms: AtomicU64,
    sealed: AtomicBool,
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("base_offset", &self.base_offset)
            .field("size", &self.size())
            .field("next_offset", &self.next_offset())
            .field("sealed", &self.is_sealed())
            .finish()
    }
}

impl Segment {
    /// Create a brand new, empty segment starting at `base_offset`.
    pub fn create(dir: &Path, base_offset: Offset) -> io::Result<Self> {
        let log_path = dir.join(log_file_name(base_offset));
        let index_path = dir.join(index_file_name(base_offset));

        let log = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .truncate(false)
            .open(&log_path)?;
        log.set_len(0)?;
        let (mut index, _) = OffsetIndex::open(&index_path)?;
        index.clear()?;

        debug!(base_offset, path = %log_path.display(), "Created segment");

        Ok(Self {
            base_offset,
            log_path,
            index_path,
            log,
            index: RwLock::new(index),
            size: AtomicU64::new(0),
            next_offset: AtomicU64::new(base_offset),
            bytes_since_index: AtomicU64::new(0),
            created_at: Instant::now(),
            last_write_ms: AtomicU64::new(current_time_ms()),
            sealed: AtomicBool::new(false),
        })
    }

    /// Open an existing segment.
    ///
    /// `next_base` is the base offset of the following segment, if any. Sealed
    /// segments with an intact index are trusted as-is. The active segment (and
    /// any segment whose index is missing) is scanned from its last index entry,
    /// and a torn tail on the active segment is cut off.
    pub fn open(
        dir: &Path,
        base_offset: Offset,
        next_base: Option<Offset>,
        config: &SegmentConfig,
    ) -> LogResult<Self> {
        let log_path = dir.join(log_file_name(base_offset));
        let index_path = dir.join(index_file_name(base_offset));

        let log = OpenOptions::new().read(true).append(true).open(&log_path)?;
        let metadata = log.metadata()?;
        let file_len = metadata.len();
        let last_write_ms = metadata
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_millis() as u64)
            .unwrap_or_else(current_time_ms);

        let (index, index_existed) = OffsetIndex::open(&index_path)?;

        let segment = Self {
            base_offset,
            log_path,
            index_path,
            log,
            index: RwLock::new(index),
            size: AtomicU64::new(file_len),
            next_offset: AtomicU64::new(next_base.unwrap_or(base_offset)),
            bytes_since_index: AtomicU64::new(0),
            created_at: Instant::now(),
            last_write_ms: AtomicU64::new(last_write_ms),
            sealed: AtomicBool::new(next_base.is_some()),
        };

        if next_base.is_some() && index_existed {
            return Ok(segment);
        }

        if !index_existed {
            warn!(
                base_offset,
                path = %segment.index_path.display(),
                "Segment index missing, rebuilding from log"
            );
        }

        segment.recover(file_len, next_base, config)?;
        Ok(segment)
    }

    fn recover(
        &self,
        file_len: u64,
        next_base: Option<Offset>,
        config: &SegmentConfig,
    ) -> LogResult<()> {
        let mut index = self.index.write();
        let (mut pos, mut expected) = match index.last() {
            Some(entry) if (entry.position as u64) < file_len => (
                entry.position as u64,
                self.base_offset + entry.relative_offset as u64,
            ),
            Some(_) => {
                index.clear()?;
                (0, self.base_offset)
            }
            None => (0, self.base_offset),
        };
        let mut since_index = 0u64;
        let mut header_buf = [0u8; FRAME_HEADER_LEN];

        while pos + FRAME_HEADER_LEN as u64 <= file_len {
            read_exact_at(&self.log, &mut header_buf, pos)?;
            let header = FrameHeader::decode(&header_buf);
            if header.offset != expected
                || header.len > config.max_record_bytes
                || pos + header.frame_len() > file_len
            {
                break;
            }
            let mut payload = vec![0u8; header.len as usize];
            read_exact_at(&self.log, &mut payload, pos + FRAME_HEADER_LEN as u64)?;
            if !header.matches(&payload) {
                break;
            }

            if since_index >= config.index_interval_bytes {
                index.append(
                    (expected - self.base_offset) as u32,
                    pos as u32,
                )?;
                since_index = 0;
            }
            since_index += header.frame_len();
            pos += header.frame_len();
            expected += 1;
        }

        if let Some(next_base) = next_base {
            if pos != file_len || expected != next_base {
                return Err(LogError::Corrupt {
                    segment: self.log_path.display().to_string(),
                    reason: format!(
                        "sealed segment ends at offset {} (position {}), expected {} (position {})",
                        expected, pos, next_base, file_len
                    ),
                });
            }
        } else if pos < file_len {
            warn!(
                base_offset = self.base_offset,
                valid_bytes = pos,
                discarded_bytes = file_len - pos,
                "Truncating torn tail of active segment"
            );
            self.log.set_len(pos)?;
            self.log.sync_data()?;
            index.truncate_to_position(pos as u32)?;
        }

        self.size.store(pos, Ordering::Release);
        self.next_offset.store(expected, Ordering::Release);
        self.bytes_since_index.store(since_index, Ordering::Relaxed);
        Ok(())
    }

    /// Append one record. The caller holds the store's append lock and has
    /// already checked that `offset == self.next_offset()`.
    pub fn append(&self, offset: Offset, payload: &[u8], config: &SegmentConfig) -> io::Result<u64> {
        let pos = self.size.load(Ordering::Relaxed);
        let frame = encode_frame(offset, payload);
        let frame_len = frame.len() as u64;

        (&self.log).write_all(&frame)?;

        if self.bytes_since_index.load(Ordering::Relaxed) >= config.index_interval_bytes {
            self.index
                .write()
                .append((offset - self.base_offset) as u32, pos as u32)?;
            self.bytes_since_index.store(0, Ordering::Relaxed);
        }
        self.bytes_since_index.fetch_add(frame_len, Ordering::Relaxed);

        self.size.store(pos + frame_len, Ordering::Release);
        self.next_offset.store(offset + 1, Ordering::Release);
        self.last_write_ms
            .store(current_time_ms(), Ordering::Relaxed);
        Ok(frame_len)
    }

    /// Read records starting at `start` into `out`, stopping before `newest`
    /// or once `budget` is spent. Returns true if the budget stopped the read.
    ///
    /// The first record of the whole read (when `out` is empty) is always
    /// returned even if it exceeds the budget.
    pub fn read_into(
        &self,
        start: Offset,
        newest: Offset,
        budget: &mut usize,
        out: &mut Vec<Record>,
    ) -> LogResult<bool> {
        let limit = self.size.load(Ordering::Acquire);
        let relative = start.saturating_sub(self.base_offset) as u32;
        let mut pos = self
            .index
            .read()
            .lookup(relative)
            .map(|e| e.position as u64)
            .unwrap_or(0);
        let mut header_buf = [0u8; FRAME_HEADER_LEN];

        while pos + FRAME_HEADER_LEN as u64 <= limit {
            read_exact_at(&self.log, &mut header_buf, pos)?;
            let header = FrameHeader::decode(&header_buf);
            if header.offset >= newest {
                break;
            }
            let frame_len = header.frame_len();
            if pos + frame_len > limit {
                return Err(self.corrupt(pos, "frame extends past segment end"));
            }
            if header.offset < start {
                pos += frame_len;
                continue;
            }
            if !out.is_empty() && frame_len as usize > *budget {
                return Ok(true);
            }

            let mut payload = vec![0u8; header.len as usize];
            read_exact_at(&self.log, &mut payload, pos + FRAME_HEADER_LEN as u64)?;
            if !header.matches(&payload) {
                return Err(self.corrupt(pos, "checksum mismatch"));
            }

            *budget = budget.saturating_sub(frame_len as usize);
            out.push(Record {
                offset: header.offset,
                value: Bytes::from(payload),
            });
            pos += frame_len;
        }

        Ok(false)
    }

    /// Cut the segment so that `offset` becomes its next offset.
    pub fn truncate_to(&self, offset: Offset) -> LogResult<()> {
        let pos = self.position_of(offset)?;
        self.log.set_len(pos)?;
        self.log.sync_data()?;

        let mut index = self.index.write();
        index.truncate_to_position(pos as u32)?;
        let since_index = pos - index.last().map(|e| e.position as u64).unwrap_or(0);

        self.size.store(pos, Ordering::Release);
        self.next_offset.store(offset, Ordering::Release);
        self.bytes_since_index.store(since_index, Ordering::Relaxed);
        self.sealed.store(false, Ordering::Release);
        Ok(())
    }

    fn position_of(&self, offset: Offset) -> LogResult<u64> {
        let limit = self.size.load(Ordering::Acquire);
        if offset >= self.next_offset() {
            return Ok(limit);
        }
        let relative = offset.saturating_sub(self.base_offset) as u32;
        let mut pos = self
            .index
            .read()
            .lookup(relative)
            .map(|e| e.position as u64)
            .unwrap_or(0);
        let mut header_buf = [0u8; FRAME_HEADER_LEN];

        while pos + FRAME_HEADER_LEN as u64 <= limit {
            read_exact_at(&self.log, &mut header_buf, pos)?;
            let header = FrameHeader::decode(&header_buf);
            if header.offset >= offset {
                return Ok(pos);
            }
            pos += header.frame_len();
        }
        Err(self.corrupt(pos, "offset not found while truncating"))
    }

    /// Flush and mark the segment read-only.
    pub fn seal(&self) -> io::Result<()> {
        self.sync()?;
        self.sealed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn sync(&self) -> io::Result<()> {
        self.log.sync_data()?;
        self.index.read().sync()
    }

    /// Delete the segment's files. Open handles held by in-flight readers
    /// stay valid until dropped.
    pub fn remove_files(&self) -> io::Result<()> {
        for path in [&self.log_path, &self.index_path] {
            match std::fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    pub fn base_offset(&self) -> Offset {
        self.base_offset
    }

    pub fn next_offset(&self) -> Offset {
        self.next_offset.load(Ordering::Acquire)
    }

    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub fn is_sealed(&self) -> bool {
        self.sealed.load(Ordering::Acquire)
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn last_write_ms(&self) -> u64 {
        self.last_write_ms.load(Ordering::Relaxed)
    }

    pub fn index_entries(&self) -> usize {
        self.index.read().len()
    }

    /// True when the next append would overflow a relative offset or position.
    pub fn is_full(&self, config: &SegmentConfig) -> bool {
        self.size() >= config.max_segment_bytes
            || self.next_offset() - self.base_offset >= u32::MAX as u64
    }

    fn corrupt(&self, pos: u64, reason: &str) -> LogError {
        LogError::Corrupt {
            segment: self.log_path.display().to_string(),
            reason: format!("{} at position {}", reason, pos),
        }
    }
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], pos: u64) -> io::Result<()> {
    std::os::unix::fs::FileExt::read_exact_at(file, buf, pos)
}

#[cfg(windows)]
fn read_exact_at(file: &File, mut buf: &mut [u8], mut pos: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, pos) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                pos += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> SegmentConfig {
        SegmentConfig {
            index_interval_bytes: 64,
            ..Default::default()
        }
    }

    #[test]
    fn test_file_names() {
        assert_eq!(log_file_name(42), "00000000000000000042.log");
        assert_eq!(index_file_name(42), "00000000000000000042.index");
        assert_eq!(parse_log_file_name("00000000000000000042.log"), Some(42));
        assert_eq!(parse_log_file_name("42.log"), None);
        assert_eq!(parse_log_file_name("00000000000000000042.index"), None);
    }

    #[test]
    fn test_append_and_read() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let segment = Segment::create(dir.path(), 100).unwrap();

        for i in 0..20u64 {
            segment
                .append(100 + i, format!("record-{}", i).as_bytes(), &config)
                .unwrap();
        }
        assert_eq!(segment.next_offset(), 120);
        assert!(segment.index_entries() > 0);

        let mut out = Vec::new();
        let mut budget = usize::MAX;
        segment.read_into(110, 120, &mut budget, &mut out).unwrap();
        assert_eq!(out.len(), 10);
        assert_eq!(out[0].offset, 110);
        assert_eq!(&out[0].value[..], b"record-10");
    }

    #[test]
    fn test_budget_always_returns_first_record() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let segment = Segment::create(dir.path(), 0).unwrap();
        segment.append(0, &[7u8; 100], &config).unwrap();
        segment.append(1, &[8u8; 100], &config).unwrap();

        let mut out = Vec::new();
        let mut budget = 10;
        let exhausted = segment.read_into(0, 2, &mut budget, &mut out).unwrap();
        assert!(exhausted);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].offset, 0);
    }

    #[test]
    fn test_truncate_to_middle() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        let segment = Segment::create(dir.path(), 0).unwrap();
        for i in 0..10u64 {
            segment.append(i, b"0123456789", &config).unwrap();
        }

        segment.truncate_to(4).unwrap();
        assert_eq!(segment.next_offset(), 4);
        assert_eq!(segment.size(), 4 * (FRAME_HEADER_LEN as u64 + 10));

        segment.append(4, b"new", &config).unwrap();
        let mut out = Vec::new();
        let mut budget = usize::MAX;
        segment.read_into(3, 5, &mut budget, &mut out).unwrap();
        assert_eq!(out.len(), 2);
        assert_eq!(&out[1].value[..], b"new");
    }

    #[test]
    fn test_reopen_active_truncates_torn_tail() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        {
            let segment = Segment::create(dir.path(), 0).unwrap();
            for i in 0..5u64 {
                segment.append(i, b"payload", &config).unwrap();
            }
        }
        {
            let mut f = OpenOptions::new()
                .append(true)
                .open(dir.path().join(log_file_name(0)))
                .unwrap();
            f.write_all(&encode_frame(5, b"payload")[..10]).unwrap();
        }

        let segment = Segment::open(dir.path(), 0, None, &config).unwrap();
        assert_eq!(segment.next_offset(), 5);
        assert_eq!(segment.size(), 5 * (FRAME_HEADER_LEN as u64 + 7));
    }

    #[test]
    fn test_sealed_segment_with_missing_index_is_rebuilt() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        {
            let segment = Segment::create(dir.path(), 0).unwrap();
            for i in 0..30u64 {
                segment.append(i, b"some bytes here", &config).unwrap();
            }
            segment.seal().unwrap();
        }
        std::fs::remove_file(dir.path().join(index_file_name(0))).unwrap();

        let segment = Segment::open(dir.path(), 0, Some(30), &config).unwrap();
        assert!(segment.is_sealed());
        assert!(segment.index_entries() > 0);
        assert_eq!(segment.next_offset(), 30);
    }

    #[test]
    fn test_sealed_segment_short_of_next_base_is_corrupt() {
        let dir = tempfile::tempdir().unwrap();
        let config = config();
        {
            let segment = Segment::create(dir.path(), 0).unwrap();
            for i in 0..3u64 {
                segment.append(i, b"x", &config).unwrap();
            }
        }
        std::fs::remove_file(dir.path().join(index_file_name(0))).unwrap();

        let err = Segment::open(dir.path(), 0, Some(10), &config).unwrap_err();
        assert!(matches!(err, LogError::Corrupt { .. }));
    }
}
