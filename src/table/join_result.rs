//! Join-result tables — stream tables specialized to persist window-join
//! outputs, with an in-memory window index and range aggregation.
//!
//! Every stored record carries the mandatory tags [`TAG_WINDOW_ID`] (the
//! window id as a decimal string) and [`TAG_ALGORITHM`], plus the fields
//! describing how the result was produced.  Consumers parse these fields
//! exactly as written.

use std::{
    collections::HashMap,
    path::Path,
    sync::RwLock,
};

use tracing::{info, warn};

use crate::record::{Record, TimeRange};

use super::{StreamTable, TableConfig, TableError, TableStats};

/// Mandatory tag: the producing window's id, as a decimal string.
pub const TAG_WINDOW_ID: &str = "window_id";

/// Mandatory tag: the operator that produced the result.
pub const TAG_ALGORITHM: &str = "algorithm";

/// Field: exact (or approximate, see [`FIELD_USED_AQP`]) join count.
pub const FIELD_JOIN_COUNT: &str = "join_count";

/// Field: join selectivity over the window's input cross product.
pub const FIELD_SELECTIVITY: &str = "selectivity";

/// Field: wall-clock computation time in milliseconds.
pub const FIELD_COMPUTATION_TIME_MS: &str = "computation_time_ms";

/// Field: memory used by the window execution, in bytes.
pub const FIELD_MEMORY_USED_BYTES: &str = "memory_used_bytes";

/// Field: whether the result fell back to approximate processing.
pub const FIELD_USED_AQP: &str = "used_aqp";

/// Field: the approximate join estimate, when the operator produced one.
pub const FIELD_AQP_ESTIMATE: &str = "aqp_estimate";

// ------------------------------------------------------------------------------------------------
// Aggregation
// ------------------------------------------------------------------------------------------------

/// Pure-read aggregate over a time range of join results.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AggregateStats {
    /// Distinct windows with at least one result record in the range.
    pub total_windows: u64,

    /// Sum of `join_count` over all result records.
    pub total_joins: u64,

    /// Mean `join_count` per result record.
    pub avg_join_count: f64,

    /// Mean `computation_time_ms` per result record.
    pub avg_computation_time_ms: f64,

    /// Mean `selectivity` per result record.
    pub avg_selectivity: f64,

    /// Result records that fell back to approximate processing.
    pub aqp_usage_count: u64,

    /// Result records whose mandatory fields failed to parse.
    pub error_count: u64,
}

// ------------------------------------------------------------------------------------------------
// JoinResultTable
// ------------------------------------------------------------------------------------------------

/// A stream table specialized for window-join outputs.
pub struct JoinResultTable {
    inner: StreamTable,

    /// window id → timestamps of its result records, so
    /// [`JoinResultTable::query_by_window`] is O(results-per-window), not
    /// O(table size).
    window_index: RwLock<HashMap<u64, Vec<i64>>>,
}

impl JoinResultTable {
    /// Opens (or creates) a join-result table under `dir`, rebuilding the
    /// window index from existing data.
    pub fn open(dir: impl AsRef<Path>, name: &str, config: &TableConfig) -> Result<Self, TableError> {
        let inner = StreamTable::open(dir, name, config)?;
        let table = Self {
            inner,
            window_index: RwLock::new(HashMap::new()),
        };
        table.rebuild_window_index()?;
        info!(name = table.inner.name(), "join result table opened");
        Ok(table)
    }

    /// Table name.
    pub fn name(&self) -> &str {
        self.inner.name()
    }

    /// Inserts a result record.
    ///
    /// Rejects records missing the mandatory `window_id` / `algorithm`
    /// tags, or whose `window_id` is not a decimal integer.
    pub fn insert(&self, record: Record) -> Result<u64, TableError> {
        let window_id = Self::validate(&record)?;
        let ts = record.timestamp;

        let index = self.inner.insert(record)?;
        if let Ok(mut windows) = self.window_index.write() {
            windows.entry(window_id).or_default().push(ts);
        }
        Ok(index)
    }

    /// All result records of one window, via the window index.
    pub fn query_by_window(&self, window_id: u64) -> Result<Vec<Record>, TableError> {
        let timestamps = match self.window_index.read() {
            Ok(windows) => windows.get(&window_id).cloned().unwrap_or_default(),
            Err(_) => return Err(TableError::Internal("window index lock poisoned".into())),
        };

        let wanted = window_id.to_string();
        let mut records = Vec::with_capacity(timestamps.len());
        for ts in timestamps {
            if let Some(record) = self.inner.get(ts)? {
                // Timestamp collisions across windows are possible; the tag
                // check keeps the index honest.
                if record.tag(TAG_WINDOW_ID) == Some(wanted.as_str()) {
                    records.push(record);
                }
            }
        }
        Ok(records)
    }

    /// Time-range query delegating to the underlying stream table
    /// (inclusive on both ends).
    pub fn query(&self, range: TimeRange) -> Result<Vec<Record>, TableError> {
        self.inner.query(range, None)
    }

    /// Derives aggregate statistics over a time range.  Pure read.
    pub fn aggregate(&self, range: TimeRange) -> Result<AggregateStats, TableError> {
        let records = self.inner.query(range, None)?;

        let mut stats = AggregateStats::default();
        let mut windows = std::collections::HashSet::new();
        let mut join_sum = 0u64;
        let mut time_sum = 0.0f64;
        let mut selectivity_sum = 0.0f64;
        let mut parsed = 0u64;

        for record in &records {
            let window = record.tag(TAG_WINDOW_ID).and_then(|w| w.parse::<u64>().ok());
            let join_count = record
                .field(FIELD_JOIN_COUNT)
                .and_then(|v| v.parse::<u64>().ok());

            let (Some(window), Some(join_count)) = (window, join_count) else {
                stats.error_count += 1;
                continue;
            };

            windows.insert(window);
            parsed += 1;
            join_sum += join_count;
            time_sum += record
                .field(FIELD_COMPUTATION_TIME_MS)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0);
            selectivity_sum += record
                .field(FIELD_SELECTIVITY)
                .and_then(|v| v.parse::<f64>().ok())
                .unwrap_or(0.0);
            if record.field(FIELD_USED_AQP) == Some("true") {
                stats.aqp_usage_count += 1;
            }
        }

        stats.total_windows = windows.len() as u64;
        stats.total_joins = join_sum;
        if parsed > 0 {
            stats.avg_join_count = join_sum as f64 / parsed as f64;
            stats.avg_computation_time_ms = time_sum / parsed as f64;
            stats.avg_selectivity = selectivity_sum / parsed as f64;
        }
        Ok(stats)
    }

    /// Forces pending memtable contents to L0.
    pub fn flush(&self) -> Result<(), TableError> {
        self.inner.flush()
    }

    /// Runs compaction rounds until the tree finds nothing to do.
    pub fn compact(&self) -> Result<(), TableError> {
        self.inner.compact()
    }

    /// Drops all data and both indexes.
    pub fn clear(&self) -> Result<(), TableError> {
        self.inner.clear()?;
        if let Ok(mut windows) = self.window_index.write() {
            windows.clear();
        }
        Ok(())
    }

    /// Logical record count.
    pub fn size(&self) -> u64 {
        self.inner.size()
    }

    /// Whether the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// Returns a statistics snapshot of the underlying table.
    pub fn stats(&self) -> Result<TableStats, TableError> {
        self.inner.stats()
    }

    /// Bytes currently held by the active memtable.
    pub fn memtable_bytes(&self) -> Result<usize, TableError> {
        self.inner.memtable_bytes()
    }

    /// Gracefully closes the underlying tree.
    pub fn close(&self) -> Result<(), TableError> {
        self.inner.close()
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn validate(record: &Record) -> Result<u64, TableError> {
        let Some(window_id) = record.tag(TAG_WINDOW_ID) else {
            return Err(TableError::InvalidArgument(
                "result record missing window_id tag".into(),
            ));
        };
        let window_id = window_id.parse::<u64>().map_err(|_| {
            TableError::InvalidArgument(format!("window_id tag is not an integer: {window_id}"))
        })?;
        if record.tag(TAG_ALGORITHM).is_none() {
            return Err(TableError::InvalidArgument(
                "result record missing algorithm tag".into(),
            ));
        }
        Ok(window_id)
    }

    fn rebuild_window_index(&self) -> Result<(), TableError> {
        let records = self.inner.query(TimeRange::all(), None)?;
        let mut windows: HashMap<u64, Vec<i64>> = HashMap::new();
        for record in &records {
            match record.tag(TAG_WINDOW_ID).and_then(|w| w.parse::<u64>().ok()) {
                Some(window_id) => windows.entry(window_id).or_default().push(record.timestamp),
                None => warn!(
                    table = self.inner.name(),
                    ts = record.timestamp,
                    "result record without parsable window_id; excluded from index"
                ),
            }
        }
        if let Ok(mut index) = self.window_index.write() {
            *index = windows;
        }
        Ok(())
    }
}

impl std::fmt::Debug for JoinResultTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JoinResultTable")
            .field("name", &self.inner.name())
            .field("records", &self.size())
            .finish_non_exhaustive()
    }
}
