//! Integration tests for the segment store.
//!
//! These exercise the store through the public [`CommitLog`] surface the way
//! a partition log uses it: reopen after restart, concurrent appenders and
//! readers, torn writes, retention and truncation working together.

use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use ledgerline::error::LogError;
use ledgerline::log::record::encode_frame;
use ledgerline::log::segment::log_file_name;
use ledgerline::log::{CommitLog, FlushPolicy, SegmentConfig, SegmentStore};

fn small_config() -> SegmentConfig {
    SegmentConfig {
        max_segment_bytes: 1024,
        index_interval_bytes: 64,
        ..Default::default()
    }
}

fn payload(i: u64) -> Vec<u8> {
    format!("record-{:05}", i).into_bytes()
}

// ============================================================================
// Restart
// ============================================================================

#[test]
fn test_reopen_preserves_offsets_across_segments() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = SegmentStore::open(dir.path(), small_config()).unwrap();
        for i in 0..200 {
            assert_eq!(store.append(&payload(i)).unwrap(), i);
        }
        assert!(store.segment_count() > 2);
        store.close().unwrap();
    }

    let store = SegmentStore::open(dir.path(), small_config()).unwrap();
    assert_eq!(store.oldest_offset(), 0);
    assert_eq!(store.newest_offset(), 200);

    let records = store.read(0, usize::MAX).unwrap();
    assert_eq!(records.len(), 200);
    for (i, record) in records.iter().enumerate() {
        assert_eq!(record.offset, i as u64);
        assert_eq!(&record.value[..], &payload(i as u64)[..]);
    }

    // Reads that start in the middle of a sealed segment use its index.
    let middle = store.read(137, 64).unwrap();
    assert_eq!(middle[0].offset, 137);

    assert_eq!(store.append(b"after-restart").unwrap(), 200);
}

#[test]
fn test_reopen_discards_torn_tail() {
    let dir = tempfile::tempdir().unwrap();
    {
        let store = SegmentStore::open(dir.path(), small_config()).unwrap();
        for i in 0..3 {
            store.append(&payload(i)).unwrap();
        }
        store.close().unwrap();
    }
    {
        let mut f = OpenOptions::new()
            .append(true)
            .open(dir.path().join(log_file_name(0)))
            .unwrap();
        let frame = encode_frame(3, &payload(3));
        f.write_all(&frame[..frame.len() - 4]).unwrap();
    }

    let store = SegmentStore::open(dir.path(), small_config()).unwrap();
    assert_eq!(store.newest_offset(), 3);
    assert_eq!(store.append(b"replacement").unwrap(), 3);
    let records = store.read(3, usize::MAX).unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(&records[0].value[..], b"replacement");
}

#[test]
fn test_reopen_after_truncate_and_retention() {
    let dir = tempfile::tempdir().unwrap();
    let config = SegmentConfig {
        retention_bytes: Some(4096),
        ..small_config()
    };
    let (oldest, newest) = {
        let store = SegmentStore::open(dir.path(), config.clone()).unwrap();
        for i in 0..300 {
            store.append(&payload(i)).unwrap();
        }
        assert!(store.apply_retention().unwrap() > 0);
        store.truncate(280).unwrap();
        store.close().unwrap();
        (store.oldest_offset(), store.newest_offset())
    };
    assert!(oldest > 0);
    assert_eq!(newest, 280);

    let store = SegmentStore::open(dir.path(), config).unwrap();
    assert_eq!(store.oldest_offset(), oldest);
    assert_eq!(store.newest_offset(), 280);
    assert!(matches!(
        store.read(oldest - 1, 10),
        Err(LogError::OffsetOutOfRange { .. })
    ));
    assert_eq!(store.read(oldest, 10).unwrap()[0].offset, oldest);
}

// ============================================================================
// Concurrency
// ============================================================================

#[test]
fn test_concurrent_appends_get_unique_contiguous_offsets() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SegmentStore::open(dir.path(), small_config()).unwrap());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let store = Arc::clone(&store);
            std::thread::spawn(move || {
                (0..250)
                    .map(|i| store.append(format!("{}-{}", t, i).as_bytes()).unwrap())
                    .collect::<Vec<_>>()
            })
        })
        .collect();

    let mut offsets: Vec<u64> = handles
        .into_iter()
        .flat_map(|h| h.join().unwrap())
        .collect();
    offsets.sort_unstable();
    assert_eq!(offsets, (0..1000).collect::<Vec<_>>());
    assert_eq!(store.newest_offset(), 1000);
}

#[test]
fn test_readers_never_see_partial_records() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SegmentStore::open(dir.path(), small_config()).unwrap());
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            for i in 0..500 {
                store.append(&payload(i)).unwrap();
            }
            done.store(true, Ordering::Release);
        })
    };

    while !done.load(Ordering::Acquire) {
        let newest = store.newest_offset();
        if newest == 0 {
            continue;
        }
        let records = store.read(0, usize::MAX).unwrap();
        assert!(records.len() as u64 >= newest);
        for (i, record) in records.iter().enumerate() {
            assert_eq!(record.offset, i as u64);
            assert_eq!(&record.value[..], &payload(i as u64)[..]);
        }
    }
    writer.join().unwrap();
}

#[test]
fn test_reads_racing_retention_start_at_requested_offset() {
    let dir = tempfile::tempdir().unwrap();
    let config = SegmentConfig {
        retention_bytes: Some(2048),
        ..small_config()
    };
    let store = Arc::new(SegmentStore::open(dir.path(), config).unwrap());
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let store = Arc::clone(&store);
        let done = Arc::clone(&done);
        std::thread::spawn(move || {
            for i in 0..3000 {
                store.append(&payload(i)).unwrap();
                if i % 20 == 0 {
                    store.apply_retention().unwrap();
                }
            }
            done.store(true, Ordering::Release);
        })
    };

    let mut served = 0;
    while !done.load(Ordering::Acquire) {
        // Aim at the oldest record, the one retention removes next.
        let offset = store.oldest_offset();
        match store.read(offset, 256) {
            Ok(records) => {
                assert_eq!(records[0].offset, offset);
                assert_eq!(&records[0].value[..], &payload(offset)[..]);
                served += 1;
            }
            Err(LogError::OffsetOutOfRange { .. }) => {}
            Err(e) => panic!("unexpected read error: {}", e),
        }
    }
    writer.join().unwrap();
    assert!(served > 0);
    assert!(store.oldest_offset() > 0);
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn test_flush_every_append_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let config = SegmentConfig {
        flush_policy: FlushPolicy::EveryAppend,
        ..small_config()
    };
    {
        let store = SegmentStore::open(dir.path(), config.clone()).unwrap();
        store.append(b"durable").unwrap();
        // No close: the record must already be on disk.
    }
    let store = SegmentStore::open(dir.path(), config).unwrap();
    assert_eq!(store.newest_offset(), 1);
}

#[test]
fn test_retention_by_age_keeps_active_segment() {
    let dir = tempfile::tempdir().unwrap();
    let config = SegmentConfig {
        retention_age: Some(Duration::from_millis(30)),
        ..small_config()
    };
    let store = SegmentStore::open(dir.path(), config).unwrap();
    for i in 0..100 {
        store.append(&payload(i)).unwrap();
    }
    let segments = store.segment_count();
    assert!(segments > 1);

    std::thread::sleep(Duration::from_millis(60));
    assert_eq!(store.apply_retention().unwrap(), segments - 1);
    assert_eq!(store.segment_count(), 1);
    assert_eq!(store.newest_offset(), 100);
    assert_eq!(store.oldest_offset(), store.segment_bases()[0]);
}

#[test]
fn test_truncate_bounds() {
    let dir = tempfile::tempdir().unwrap();
    let store = SegmentStore::open_at(dir.path(), small_config(), 10).unwrap();
    for i in 0..5 {
        store.append(&payload(i)).unwrap();
    }

    assert!(matches!(
        store.truncate(16),
        Err(LogError::InvalidTruncation { offset: 16, .. })
    ));
    assert!(matches!(
        store.truncate(9),
        Err(LogError::InvalidTruncation { offset: 9, .. })
    ));
    store.truncate(15).unwrap();
    assert_eq!(store.newest_offset(), 15);

    store.truncate(10).unwrap();
    assert_eq!(store.newest_offset(), 10);
    assert_eq!(store.append(b"x").unwrap(), 10);
}

#[test]
fn test_store_behind_trait_object() {
    let dir = tempfile::tempdir().unwrap();
    let log: Box<dyn CommitLog> =
        Box::new(SegmentStore::open(dir.path().join("p"), small_config()).unwrap());
    assert_eq!(log.append(b"a").unwrap(), 0);
    assert_eq!(log.append(b"b").unwrap(), 1);
    assert_eq!(log.read(1, 1).unwrap()[0].value.as_ref(), b"b");
    log.delete().unwrap();
    assert!(!dir.path().join("p").exists());
}
