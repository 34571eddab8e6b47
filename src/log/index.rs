//! Sparse offset index for a single segment.
//!
//! Each entry is 8 bytes: `relative_offset: u32 | position: u32`, both
//! big-endian. Entries are strictly increasing in both fields. A torn trailing
//! entry left by a crash is ignored on load.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::Path;

use bytes::{Buf, BufMut};

pub const INDEX_ENTRY_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexEntry {
    /// Offset relative to the segment's base offset.
    pub relative_offset: u32,
    /// Byte position of the frame within the segment's log file.
    pub position: u32,
}

#[derive(Debug)]
pub struct OffsetIndex {
    file: File,
    entries: Vec<IndexEntry>,
}

impl OffsetIndex {
    /// Open (or create) the index file. Returns the index and whether the
    /// file existed before this call.
    pub fn open(path: &Path) -> io::Result<(Self, bool)> {
        let existed = path.exists();
        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;

        let mut entries = Vec::with_capacity(raw.len() / INDEX_ENTRY_LEN);
        for mut chunk in raw.chunks_exact(INDEX_ENTRY_LEN) {
            let entry = IndexEntry {
                relative_offset: chunk.get_u32(),
                position: chunk.get_u32(),
            };
            if let Some(prev) = entries.last()
                && !is_after(prev, &entry)
            {
                break;
            }
            entries.push(entry);
        }

        let index = Self { file, entries };
        if raw.len() != index.entries.len() * INDEX_ENTRY_LEN {
            index.rewrite_len()?;
        }
        Ok((index, existed))
    }

    pub fn append(&mut self, relative_offset: u32, position: u32) -> io::Result<()> {
        let entry = IndexEntry {
            relative_offset,
            position,
        };
        if let Some(prev) = self.entries.last()
            && !is_after(prev, &entry)
        {
            return Ok(());
        }
        let mut buf = [0u8; INDEX_ENTRY_LEN];
        let mut slice = &mut buf[..];
        slice.put_u32(relative_offset);
        slice.put_u32(position);
        self.file.write_all(&buf)?;
        self.entries.push(entry);
        Ok(())
    }

    /// Greatest entry whose relative offset is `<= relative_offset`.
    pub fn lookup(&self, relative_offset: u32) -> Option<IndexEntry> {
        let idx = self
            .entries
            .partition_point(|e| e.relative_offset <= relative_offset);
        idx.checked_sub(1).map(|i| self.entries[i])
    }

    pub fn last(&self) -> Option<IndexEntry> {
        self.entries.last().copied()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every entry pointing at or beyond `position`.
    pub fn truncate_to_position(&mut self, position: u32) -> io::Result<()> {
        let keep = self.entries.partition_point(|e| e.position < position);
        if keep != self.entries.len() {
            self.entries.truncate(keep);
            self.rewrite_len()?;
        }
        Ok(())
    }

    pub fn clear(&mut self) -> io::Result<()> {
        self.entries.clear();
        self.rewrite_len()
    }

    pub fn sync(&self) -> io::Result<()> {
        self.file.sync_data()
    }

    fn rewrite_len(&self) -> io::Result<()> {
        self.file
            .set_len((self.entries.len() * INDEX_ENTRY_LEN) as u64)
    }
}

fn is_after(prev: &IndexEntry, next: &IndexEntry) -> bool {
    next.relative_offset > prev.relative_offset && next.position > prev.position
}
