//! Offset-addressed, segmented commit log.
//!
//! A partition's log lives in one directory:
//!
//! ```text
//! <dir>/00000000000000000000.log
//! <dir>/00000000000000000000.index
//! <dir>/00000000000000004096.log
//! <dir>/00000000000000004096.index
//! ```
//!
//! Each `.log` file holds CRC-checked frames (see [`record`]); each `.index`
//! holds a sparse offset to byte position mapping. Only the newest segment is
//! writable. On restart the older segments are trusted and only the active
//! segment's tail is scanned for the last valid frame.

pub mod config;
pub mod index;
pub mod record;
pub mod segment;
pub mod store;

pub use config::{FlushPolicy, SegmentConfig};
pub use store::{AppendAt, SegmentStore};

use crate::error::LogResult;
use crate::types::{Offset, Record};

/// The append/read/truncate surface shared by every log implementation.
///
/// `append` returns the offset it assigned, which always equals the value
/// `newest_offset()` had just before the call.
pub trait CommitLog: Send + Sync {
    fn append(&self, value: &[u8]) -> LogResult<Offset>;

    /// Read records starting at `offset` while their framed size fits in
    /// `max_bytes`. The first record is returned regardless of the budget.
    fn read(&self, offset: Offset, max_bytes: usize) -> LogResult<Vec<Record>>;

    /// Drop every record at or after `offset`.
    fn truncate(&self, offset: Offset) -> LogResult<()>;

    /// Remove all on-disk state. The log is closed afterwards.
    fn delete(&self) -> LogResult<()>;

    fn oldest_offset(&self) -> Offset;

    fn newest_offset(&self) -> Offset;
}
