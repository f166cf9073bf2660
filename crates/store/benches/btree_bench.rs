//! Index benchmarks.
//!
//! Point lookups, misses, scans and inserts through the transaction API, so
//! the numbers include overlay and node cache costs as callers see them.

#![allow(clippy::expect_used, missing_docs)]

use std::{hint::black_box, time::Duration};

use criterion::{BenchmarkId, Criterion, Throughput, criterion_group, criterion_main};
use tarn_store::{Database, DatabaseConfig, IndexSpec, RecordBuf, RecordBuilder};

const TABLE: u32 = 10;

// =============================================================================
// Helpers
// =============================================================================

fn key(n: u64) -> RecordBuf {
    RecordBuilder::new().field(n.to_be_bytes()).build()
}

fn row(n: u64) -> RecordBuf {
    RecordBuilder::new().field(n.to_be_bytes()).field(format!("value-{n}")).build()
}

fn config() -> DatabaseConfig {
    DatabaseConfig::builder().chunk_size(16 << 20).build().expect("config")
}

/// In-memory database holding `count` rows, added in batches.
fn populated(count: u64, batch_size: u64) -> Database {
    let db = Database::open_in_memory(config()).expect("open database");
    let mut tran = db.update().expect("update");
    tran.create_table(TABLE, [IndexSpec::key(vec![0])]).expect("create table");
    tran.commit().expect("commit");
    for start in (0..count).step_by(batch_size as usize) {
        let mut tran = db.update().expect("update");
        for n in start..(start + batch_size).min(count) {
            tran.add_record(TABLE, &row(n)).expect("add");
        }
        tran.commit().expect("commit");
    }
    db
}

// =============================================================================
// Lookups
// =============================================================================

/// Point lookups as the tree grows deeper.
fn bench_point_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/point_lookup");
    group.throughput(Throughput::Elements(1));

    for count in [1_000u64, 10_000, 100_000] {
        let db = populated(count, 5_000);
        group.bench_with_input(
            BenchmarkId::new("sequential", format!("{}k", count / 1000)),
            &count,
            |b, &count| {
                let mut n = 0u64;
                b.iter(|| {
                    n = (n + 1) % count;
                    let mut tran = db.read().expect("read");
                    black_box(tran.lookup(TABLE, 0, &key(n)).expect("lookup"))
                });
            },
        );
    }
    group.finish();
}

/// Lookups for keys past the end of the table.
fn bench_missing_key_lookup(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/missing_key");
    group.throughput(Throughput::Elements(1));
    let db = populated(10_000, 5_000);

    group.bench_function("10k_rows", |b| {
        let mut n = 10_000u64;
        b.iter(|| {
            n += 1;
            let mut tran = db.read().expect("read");
            black_box(tran.lookup(TABLE, 0, &key(n)).expect("lookup"))
        });
    });
    group.finish();
}

// =============================================================================
// Scans
// =============================================================================

/// Full scans over tables of different sizes.
fn bench_full_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/full_scan");

    for count in [1_000u64, 10_000] {
        let db = populated(count, 5_000);
        group.throughput(Throughput::Elements(count));
        group.bench_with_input(BenchmarkId::from_parameter(count), &count, |b, _| {
            b.iter(|| {
                let mut tran = db.read().expect("read");
                let mut iter = tran.index_iter(TABLE, 0, None, None).expect("iter");
                let mut seen = 0u64;
                while iter.next(&tran).expect("next").is_some() {
                    seen += 1;
                }
                black_box(seen)
            });
        });
    }
    group.finish();
}

/// A bounded range covering a tenth of the table.
fn bench_range_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/range_scan");
    group.throughput(Throughput::Elements(1_000));
    let db = populated(10_000, 5_000);

    group.bench_function("10pct_of_10k", |b| {
        b.iter(|| {
            let mut tran = db.read().expect("read");
            let mut iter =
                tran.index_iter(TABLE, 0, Some(key(4_000)), Some(key(4_999))).expect("iter");
            let mut seen = 0u64;
            while iter.next(&tran).expect("next").is_some() {
                seen += 1;
            }
            black_box(seen)
        });
    });
    group.finish();
}

/// Backward iteration over the whole table.
fn bench_reverse_scan(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/reverse_scan");
    group.throughput(Throughput::Elements(10_000));
    let db = populated(10_000, 5_000);

    group.bench_function("10k_rows", |b| {
        b.iter(|| {
            let mut tran = db.read().expect("read");
            let mut iter = tran.index_iter(TABLE, 0, None, None).expect("iter");
            let mut seen = 0u64;
            while iter.prev(&tran).expect("prev").is_some() {
                seen += 1;
            }
            black_box(seen)
        });
    });
    group.finish();
}

// =============================================================================
// Inserts
// =============================================================================

/// Inserts into a transaction overlay, without committing.
fn bench_overlay_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("btree/overlay_insert");
    group.throughput(Throughput::Elements(1_000));
    let db = populated(10_000, 5_000);

    group.bench_function("1k_into_10k", |b| {
        b.iter(|| {
            let mut tran = db.update().expect("update");
            for n in 0..1_000u64 {
                tran.add_record(TABLE, &row(20_000 + n * 7)).expect("add");
            }
            tran.abort();
        });
    });
    group.finish();
}

criterion_group! {
    name = lookups;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(100);
    targets = bench_point_lookup, bench_missing_key_lookup
}

criterion_group! {
    name = scans;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(5))
        .sample_size(50);
    targets = bench_full_scan, bench_range_scan, bench_reverse_scan
}

criterion_group! {
    name = inserts;
    config = Criterion::default()
        .measurement_time(Duration::from_secs(10))
        .sample_size(20);
    targets = bench_overlay_insert
}

criterion_main!(lookups, scans, inserts);
