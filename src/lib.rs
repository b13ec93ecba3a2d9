//! # ChronoDB
//!
//! An embeddable **time-series storage engine** with a windowed
//! **stream-join compute layer**, built on a Log-Structured Merge Tree
//! (LSM-tree).  Designed for fast out-of-order ingestion, crash-safe
//! operation, and materializing stream-to-stream window joins next to
//! the data.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │                        TableManager                           │
//! │   ┌─────────────────┐  ┌──────────────────┐                   │
//! │   │  StreamTable S  │  │  StreamTable R   │   JoinResultTable │
//! │   │  ┌───────────┐  │  │  ┌───────────┐   │   ┌────────────┐  │
//! │   │  │ LSM tree  │  │  │  │ LSM tree  │   │   │ LSM tree   │  │
//! │   │  │ WAL+mem   │  │  │  │ WAL+mem   │   │   │ WAL+mem    │  │
//! │   │  │ +SSTables │  │  │  │ +SSTables │   │   │ +SSTables  │  │
//! │   │  └───────────┘  │  │  └───────────┘   │   └────────────┘  │
//! │   └────────┬────────┘  └────────┬─────────┘         ▲         │
//! │            │ on_data_inserted   │                   │ results │
//! │            ▼                    ▼                   │         │
//! │   ┌──────────────────────────────────┐   ┌──────────┴──────┐  │
//! │   │   WindowScheduler (watermark,    │──▶│  ComputeEngine  │  │
//! │   │   triggers, window state machine)│   │  (join operator)│  │
//! │   └──────────────────────────────────┘   └────────┬────────┘  │
//! │                                                   │           │
//! │   ┌───────────────────────────────────────────────▼────────┐  │
//! │   │  ResourceManager (thread pool + memory budget handles) │  │
//! │   └────────────────────────────────────────────────────────┘  │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`record`] | The universal record (timestamp, scalar/vector value, tag and field maps) and time ranges |
//! | [`encoding`] | Deterministic little-endian wire format shared by every on-disk structure |
//! | [`bloom`] | Serializable per-SSTable bloom filter over timestamps |
//! | [`wal`] | Append-only write-ahead log protecting the active memtable |
//! | [`memtable`] | Timestamp-sorted in-memory write buffer with a byte budget |
//! | [`sstable`] | Immutable on-disk sorted runs: header, bloom, sparse index, data |
//! | [`lsm`] | Memtable rotation, L0 flush, and leveled compaction |
//! | [`table`] | Stream / join-result tables, tag index, and the table manager |
//! | [`checkpoint`] | Point-in-time table snapshots and their catalogue |
//! | [`resource`] | Process-wide thread and memory budget, handle-based |
//! | [`window`] | Watermark-driven window scheduler with pluggable trigger policies |
//! | [`compute`] | Stateless per-window join executor and the operator plug-in contract |
//!
//! ## Key Properties
//!
//! - **Durability** — every insert is WAL-appended before it is applied
//!   in memory; after a crash, recovery replays the log into the
//!   memtable.  A successful write is never silently lost.
//! - **Out-of-order ingestion** — timestamps need not arrive monotonic;
//!   the watermark (largest event time minus a lateness tolerance) is
//!   what drives time-based window eligibility.
//! - **Newest-wins reads** — point and range queries merge memtables and
//!   every overlapping SSTable, resolving duplicate timestamps by write
//!   recency.
//! - **Bounded compute** — window executions draw threads and memory
//!   from explicit [`resource`] handles; releasing a handle winds its
//!   workers down without cancelling in-flight work.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use chronodb::compute::{ComputeConfig, ComputeEngine, OperatorKind};
//! use chronodb::record::{Record, TimeRange};
//! use chronodb::table::{TableManager, TableManagerConfig};
//!
//! let tables = Arc::new(TableManager::new(TableManagerConfig::new("/tmp/chronodb")).unwrap());
//! let [s, r, results] = tables.create_pecj_tables("demo_").unwrap();
//!
//! // Ingest two streams.
//! let stream_s = tables.get_stream_table(&s).unwrap();
//! for i in 0..10i64 {
//!     let record = Record::scalar(i * 100, i as f64)
//!         .with_tag("key", (i % 5).to_string())
//!         .with_field("value", (i as f64).to_string());
//!     stream_s.insert(record).unwrap();
//! }
//!
//! // Execute one window join.
//! let engine = ComputeEngine::initialize(
//!     ComputeConfig::new(OperatorKind::Shj, &s, &r, &results),
//!     Arc::clone(&tables),
//!     None,
//! )
//! .unwrap();
//! let status = engine.execute_window_join(0, TimeRange::new(0, 2_000_000)).unwrap();
//! println!("join count: {}", status.join_count);
//! ```

#![allow(dead_code)]

pub mod bloom;
pub mod checkpoint;
pub mod compute;
pub mod encoding;
pub mod lsm;
pub mod memtable;
pub mod record;
pub mod resource;
pub mod sstable;
pub mod table;
pub mod wal;
pub mod window;
