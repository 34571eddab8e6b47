//! Segment store configuration.

use std::time::Duration;

use crate::constants::{
    DEFAULT_INDEX_INTERVAL_BYTES, DEFAULT_MAX_RECORD_BYTES, DEFAULT_MAX_SEGMENT_AGE_SECS,
    DEFAULT_MAX_SEGMENT_BYTES,
};

/// When the store calls `fsync` on the active segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlushPolicy {
    /// Leave flushing to the OS page cache. Segments are synced when rolled
    /// and on close.
    #[default]
    OsDefault,
    /// Sync after every append.
    EveryAppend,
    /// Sync after every `n` appends.
    EveryN(u64),
}

impl std::str::FromStr for FlushPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "os" | "os-default" | "none" => Ok(FlushPolicy::OsDefault),
            "always" | "every-append" => Ok(FlushPolicy::EveryAppend),
            other => other
                .strip_prefix("every-")
                .and_then(|n| n.parse::<u64>().ok())
                .filter(|n| *n > 0)
                .map(FlushPolicy::EveryN)
                .ok_or_else(|| {
                    format!(
                        "Unknown flush policy '{}'. Valid: os-default, every-append, every-<n>",
                        s
                    )
                }),
        }
    }
}

/// Tuning for a single partition's segment store.
#[derive(Debug, Clone)]
pub struct SegmentConfig {
    /// Roll the active segment once it reaches this many bytes.
    pub max_segment_bytes: u64,

    /// Roll a non-empty active segment once it is this old.
    pub max_segment_age: Duration,

    /// Write a sparse index entry roughly every this many bytes of log.
    pub index_interval_bytes: u64,

    /// Largest payload accepted by `append`. Also bounds frame lengths
    /// trusted during recovery.
    pub max_record_bytes: u32,

    /// Delete closed segments from the front once the log exceeds this size.
    pub retention_bytes: Option<u64>,

    /// Delete closed segments whose last write is older than this.
    pub retention_age: Option<Duration>,

    pub flush_policy: FlushPolicy,
}

impl Default for SegmentConfig {
    fn default() -> Self {
        Self {
            max_segment_bytes: DEFAULT_MAX_SEGMENT_BYTES,
            max_segment_age: Duration::from_secs(DEFAULT_MAX_SEGMENT_AGE_SECS),
            index_interval_bytes: DEFAULT_INDEX_INTERVAL_BYTES,
            max_record_bytes: DEFAULT_MAX_RECORD_BYTES,
            retention_bytes: None,
            retention_age: None,
            flush_policy: FlushPolicy::OsDefault,
        }
    }
}

impl SegmentConfig {
    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.max_segment_bytes < 1024 {
            errors.push(format!(
                "max_segment_bytes ({}) should be at least 1KB",
                self.max_segment_bytes
            ));
        }

        if self.max_segment_bytes > u32::MAX as u64 {
            errors.push(format!(
                "max_segment_bytes ({}) must fit in a 32-bit index position",
                self.max_segment_bytes
            ));
        }

        if self.index_interval_bytes == 0 {
            errors.push("index_interval_bytes must be at least 1".to_string());
        }

        if self.max_record_bytes == 0 {
            errors.push("max_record_bytes must be at least 1".to_string());
        }

        if self.max_segment_age.is_zero() {
            errors.push("max_segment_age must be non-zero".to_string());
        }

        if let Some(retention) = self.retention_bytes
            && retention < self.max_segment_bytes
        {
            errors.push(format!(
                "retention_bytes ({}) must be at least max_segment_bytes ({})",
                retention, self.max_segment_bytes
            ));
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
