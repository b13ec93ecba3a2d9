//! # Tables
//!
//! The table is the unit of organization callers see.  Two public kinds
//! share the same LSM substrate:
//!
//! - [`StreamTable`] — a raw ingested series with a tag index.
//! - [`JoinResultTable`] — materialized window-join outputs, indexed by
//!   window id.
//!
//! A third, internal kind backs compute-state persistence.  The
//! [`TableManager`] owns the namespace and lifecycle of all of them:
//! tables are created explicitly, never implicitly, and deleted only when
//! no live handle remains.
//!
//! Each table occupies a subdirectory of the manager's base directory,
//! named after the table; inside live the LSM directory (SSTables plus
//! `wal.log`) and checkpoint metadata.

mod join_result;
mod manager;
mod stream;

#[cfg(test)]
mod tests;

pub use join_result::{
    AggregateStats, FIELD_AQP_ESTIMATE, FIELD_COMPUTATION_TIME_MS, FIELD_JOIN_COUNT,
    FIELD_MEMORY_USED_BYTES, FIELD_SELECTIVITY, FIELD_USED_AQP, JoinResultTable, TAG_ALGORITHM,
    TAG_WINDOW_ID,
};
pub use manager::{TableManager, TableManagerConfig};
pub use stream::{StreamTable, TableStats};

use std::collections::BTreeMap;
use std::io;

use thiserror::Error;

use crate::checkpoint::CheckpointError;
use crate::lsm::LsmError;
use crate::record::Record;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by table operations.
#[derive(Debug, Error)]
pub enum TableError {
    /// Error originating from the storage substrate.
    #[error("LSM error: {0}")]
    Lsm(#[from] LsmError),

    /// Error originating from the checkpoint facility.
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Rejected input: invalid time range, missing mandatory tag, bad
    /// configuration.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The named table does not exist.
    #[error("table not found: {0}")]
    NotFound(String),

    /// The table name is already taken.
    #[error("table already exists: {0}")]
    AlreadyExists(String),

    /// The table still has live handles and cannot be dropped.
    #[error("table has live handles: {0}")]
    LiveHandles(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Table kinds
// ------------------------------------------------------------------------------------------------

/// The kind of a managed table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TableType {
    /// Raw ingested series.
    Stream,

    /// Materialized window-join outputs.
    JoinResult,

    /// Reserved substrate for compute-engine state persistence.
    ComputeState,
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Per-table storage configuration, translated into the LSM config when
/// the table's tree is opened.
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Byte budget of the active memtable.
    pub memtable_max_bytes: usize,

    /// Number of LSM levels.
    pub max_levels: u32,

    /// L0 file count that schedules a compaction.
    pub l0_compaction_trigger: usize,

    /// Base for the per-level size threshold.
    pub level_base_bytes: u64,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            memtable_max_bytes: 4 * 1024 * 1024,
            max_levels: 7,
            l0_compaction_trigger: 4,
            level_base_bytes: 8 * 1024 * 1024,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Tag filtering
// ------------------------------------------------------------------------------------------------

/// A conjunction of tag equality predicates: every `(key, value)` pair
/// must match exactly.
pub type TagFilter = BTreeMap<String, String>;

/// Whether `record` satisfies every predicate in `filter`.
pub(crate) fn matches_tags(record: &Record, filter: &TagFilter) -> bool {
    filter
        .iter()
        .all(|(key, value)| record.tag(key) == Some(value.as_str()))
}

// ------------------------------------------------------------------------------------------------
// Ingest observation
// ------------------------------------------------------------------------------------------------

/// Receives insert notifications from watched tables.
///
/// The window scheduler implements this; tables hold only weak references
/// to their observers, so observation never extends a scheduler's life.
pub trait IngestObserver: Send + Sync {
    /// Called after `count` records landed in `table_name`, the last of
    /// them at `timestamp`.
    fn on_data_inserted(&self, table_name: &str, timestamp: i64, count: usize);
}
