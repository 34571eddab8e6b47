//! Criterion micro-benchmarks for the segment store.
//!
//! These measure the per-record cost of:
//! - Frame encoding (header + CRC)
//! - Appending under each flush policy
//! - Reading from the head and from the middle of a multi-segment log
//!
//! Run with: `cargo bench --bench segment_bench`

use criterion::{BenchmarkId, Criterion, Throughput, black_box, criterion_group, criterion_main};

use ledgerline::log::record::encode_frame;
use ledgerline::log::{FlushPolicy, SegmentConfig, SegmentStore};

fn bench_encode_frame(c: &mut Criterion) {
    let mut group = c.benchmark_group("encode_frame");

    for size in [100, 1_000, 10_000].iter() {
        let payload = vec![7u8; *size];
        group.throughput(Throughput::Bytes(*size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(size), size, |b, _| {
            b.iter(|| encode_frame(black_box(42), black_box(&payload)));
        });
    }

    group.finish();
}

fn bench_append(c: &mut Criterion) {
    let mut group = c.benchmark_group("append");
    let payload = vec![1u8; 512];
    group.throughput(Throughput::Bytes(payload.len() as u64));

    // EveryAppend is left out: it measures the disk, not the store.
    for (name, policy) in [
        ("os_default", FlushPolicy::OsDefault),
        ("every_1000", FlushPolicy::EveryN(1000)),
    ] {
        let dir = tempfile::tempdir().unwrap();
        let store = SegmentStore::open(
            dir.path(),
            SegmentConfig {
                flush_policy: policy,
                ..SegmentConfig::default()
            },
        )
        .unwrap();
        group.bench_function(name, |b| {
            b.iter(|| store.append(black_box(&payload)).unwrap());
        });
    }

    group.finish();
}

fn bench_read(c: &mut Criterion) {
    let mut group = c.benchmark_group("read");
    let dir = tempfile::tempdir().unwrap();
    let store = SegmentStore::open(
        dir.path(),
        SegmentConfig {
            max_segment_bytes: 1024 * 1024,
            ..SegmentConfig::default()
        },
    )
    .unwrap();
    let payload = vec![2u8; 256];
    for _ in 0..50_000 {
        store.append(&payload).unwrap();
    }

    for start in [0u64, 25_000, 49_000] {
        group.bench_with_input(BenchmarkId::new("64KiB_from", start), &start, |b, &start| {
            b.iter(|| store.read(black_box(start), 64 * 1024).unwrap());
        });
    }

    group.finish();
}

criterion_group!(benches, bench_encode_frame, bench_append, bench_read);
criterion_main!(benches);
