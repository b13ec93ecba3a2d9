//! Micro-benchmarks for ChronoDB core operations.
//!
//! Uses Criterion for statistically rigorous measurement with regression
//! detection and HTML reports.
//!
//! # Running
//!
//! ```bash
//! cargo bench --bench micro              # run all micro-benchmarks
//! cargo bench --bench micro -- insert    # filter by name
//! ```
//!
//! Reports are generated in `target/criterion/report/index.html`.

use criterion::{BatchSize, Criterion, Throughput, black_box, criterion_group, criterion_main};

use chronodb::compute::{ComputeConfig, ComputeEngine, OperatorKind};
use chronodb::record::{Record, TimeRange};
use chronodb::table::{StreamTable, TableConfig, TableManager, TableManagerConfig};
use std::sync::Arc;
use tempfile::TempDir;

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

/// A representative tagged reading.
fn reading(ts: i64) -> Record {
    Record::scalar(ts, ts as f64)
        .with_tag("sensor", format!("temp_{}", ts % 8))
        .with_field("value", ts.to_string())
}

/// A stream table with a large enough buffer to keep the benchmark in
/// the memtable path.
fn open_table(dir: &std::path::Path) -> StreamTable {
    StreamTable::open(
        dir,
        "bench",
        &TableConfig {
            memtable_max_bytes: 64 * 1024 * 1024,
            ..TableConfig::default()
        },
    )
    .expect("open")
}

/// Pre-populate a table with `count` sequential readings.
fn prepopulate(table: &StreamTable, count: i64) {
    for ts in 0..count {
        table.insert(reading(ts)).expect("insert");
    }
}

// ================================================================================================
// Ingest benchmarks
// ================================================================================================

fn bench_insert(c: &mut Criterion) {
    let mut group = c.benchmark_group("insert");
    group.throughput(Throughput::Elements(1));

    group.bench_function("single_record", |b| {
        let tmp = TempDir::new().unwrap();
        let table = open_table(tmp.path());
        let mut ts = 0i64;
        b.iter(|| {
            ts += 1;
            table.insert(black_box(reading(ts))).unwrap();
        });
    });

    group.bench_function("batch_100", |b| {
        let tmp = TempDir::new().unwrap();
        let table = open_table(tmp.path());
        let mut base = 0i64;
        b.iter_batched(
            || {
                base += 100;
                (base..base + 100).map(reading).collect::<Vec<_>>()
            },
            |batch| table.insert_batch(black_box(batch)).unwrap(),
            BatchSize::SmallInput,
        );
    });

    group.finish();
}

// ================================================================================================
// Query benchmarks
// ================================================================================================

fn bench_query(c: &mut Criterion) {
    let mut group = c.benchmark_group("query");

    group.bench_function("range_1k_of_100k", |b| {
        let tmp = TempDir::new().unwrap();
        let table = open_table(tmp.path());
        prepopulate(&table, 100_000);
        table.flush().unwrap();

        b.iter(|| {
            let records = table
                .query(black_box(TimeRange::new(50_000, 50_999)), None)
                .unwrap();
            assert_eq!(records.len(), 1000);
        });
    });

    group.bench_function("query_latest_100", |b| {
        let tmp = TempDir::new().unwrap();
        let table = open_table(tmp.path());
        prepopulate(&table, 10_000);

        b.iter(|| {
            let records = table.query_latest(black_box(100)).unwrap();
            assert_eq!(records.len(), 100);
        });
    });

    group.finish();
}

// ================================================================================================
// Window-join benchmarks
// ================================================================================================

fn bench_window_join(c: &mut Criterion) {
    let mut group = c.benchmark_group("window_join");
    group.sample_size(20);

    group.bench_function("shj_2x1000_tuples", |b| {
        let tmp = TempDir::new().unwrap();
        let tables = Arc::new(TableManager::new(TableManagerConfig::new(tmp.path())).unwrap());
        let [s, r, results] = tables.create_pecj_tables("bench_").unwrap();

        let stream_s = tables.get_stream_table(&s).unwrap();
        let stream_r = tables.get_stream_table(&r).unwrap();
        for i in 0..1000i64 {
            stream_s
                .insert(
                    Record::scalar(i, i as f64)
                        .with_tag("key", (i % 50).to_string())
                        .with_field("value", i.to_string()),
                )
                .unwrap();
            stream_r
                .insert(
                    Record::scalar(i, i as f64)
                        .with_tag("key", (i % 50).to_string())
                        .with_field("value", i.to_string()),
                )
                .unwrap();
        }

        let engine = ComputeEngine::initialize(
            ComputeConfig::new(OperatorKind::Shj, &s, &r, &results),
            Arc::clone(&tables),
            None,
        )
        .unwrap();

        let mut window_id = 0u64;
        b.iter(|| {
            window_id += 1;
            let status = engine
                .execute_window_join(window_id, black_box(TimeRange::new(0, 1000)))
                .unwrap();
            assert_eq!(status.join_count, 20_000);
        });
    });

    group.finish();
}

criterion_group!(benches, bench_insert, bench_query, bench_window_join);
criterion_main!(benches);
