//! Error types for the on-disk log layer.
//!
//! # Classification
//!
//! - `IoFailure` and `Corrupt` are fatal to the affected partition. The store
//!   refuses further appends once it has seen a write failure.
//! - `OffsetOutOfRange` and `InvalidTruncation` are caller errors. The caller
//!   re-reads `oldest_offset()` / `newest_offset()` and retries.
//! - `Closed` is returned after `delete()` or `close()`.

use thiserror::Error;

use crate::types::Offset;

/// Result type for log operations.
pub type LogResult<T> = Result<T, LogError>;

/// Errors returned by a segment store.
#[derive(Debug, Error)]
pub enum LogError {
    /// The underlying storage failed a read, write or sync.
    #[error("I/O failure: {0}")]
    IoFailure(#[from] std::io::Error),

    /// Requested offset is outside `[oldest, newest)`.
    #[error("offset {offset} out of range (oldest {oldest}, newest {newest})")]
    OffsetOutOfRange {
        offset: Offset,
        oldest: Offset,
        newest: Offset,
    },

    /// Truncation target is outside `[oldest, newest]`.
    #[error("invalid truncation to {offset} (oldest {oldest}, newest {newest})")]
    InvalidTruncation {
        offset: Offset,
        oldest: Offset,
        newest: Offset,
    },

    /// Payload exceeds the configured per-record limit.
    #[error("record of {size} bytes exceeds limit of {max} bytes")]
    RecordTooLarge { size: usize, max: u32 },

    /// A frame failed its checksum or framing checks outside the recoverable tail.
    #[error("corrupt segment {segment}: {reason}")]
    Corrupt { segment: String, reason: String },

    /// The store was closed or deleted.
    #[error("log is closed")]
    Closed,

    /// A previous write failed; the store no longer accepts appends.
    #[error("log failed after a previous storage error")]
    Failed,
}

impl LogError {
    /// True for errors that make the partition unusable until operator action.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            LogError::IoFailure(_) | LogError::Corrupt { .. } | LogError::Failed
        )
    }

    /// True for bounds errors where the caller should refresh offsets and retry.
    pub fn is_out_of_range(&self) -> bool {
        matches!(
            self,
            LogError::OffsetOutOfRange { .. } | LogError::InvalidTruncation { .. }
        )
    }
}
