//! The table manager — namespace, lifecycle, batch fan-out, and global
//! memory accounting for every table under one base directory.

use std::{
    collections::HashMap,
    fs,
    path::PathBuf,
    sync::{Arc, RwLock},
};

use tracing::{debug, info, warn};

use crate::record::{Record, TimeRange};

use super::{
    JoinResultTable, StreamTable, TableConfig, TableError, TableType,
};

/// Suffix of the stream-S table created by
/// [`TableManager::create_pecj_tables`].
const PECJ_STREAM_S: &str = "stream_s";

/// Suffix of the stream-R table created by
/// [`TableManager::create_pecj_tables`].
const PECJ_STREAM_R: &str = "stream_r";

/// Suffix of the result table created by
/// [`TableManager::create_pecj_tables`].
const PECJ_RESULTS: &str = "join_results";

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration of a [`TableManager`].
#[derive(Debug, Clone)]
pub struct TableManagerConfig {
    /// Directory under which every table gets its own subdirectory.
    pub base_dir: PathBuf,

    /// Optional cap on total active-memtable bytes across all tables.
    /// When an insert pushes the total past the cap, the manager flushes
    /// every table before returning — it never rejects the insert.
    pub max_total_memtable_bytes: Option<usize>,
}

impl TableManagerConfig {
    /// Creates a config rooted at `base_dir` with no global memory cap.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        Self {
            base_dir: base_dir.into(),
            max_total_memtable_bytes: None,
        }
    }
}

// ------------------------------------------------------------------------------------------------
// TableManager
// ------------------------------------------------------------------------------------------------

enum TableHandle {
    Stream(Arc<StreamTable>),
    JoinResult(Arc<JoinResultTable>),
    ComputeState(Arc<StreamTable>),
}

/// An owned table reference handed out by the batch fan-out paths.
enum BatchTarget {
    Stream(Arc<StreamTable>),
    JoinResult(Arc<JoinResultTable>),
}

impl TableHandle {
    fn table_type(&self) -> TableType {
        match self {
            Self::Stream(_) => TableType::Stream,
            Self::JoinResult(_) => TableType::JoinResult,
            Self::ComputeState(_) => TableType::ComputeState,
        }
    }

    fn live_handles(&self) -> bool {
        match self {
            Self::Stream(t) | Self::ComputeState(t) => Arc::strong_count(t) > 1,
            Self::JoinResult(t) => Arc::strong_count(t) > 1,
        }
    }

    fn memtable_bytes(&self) -> Result<usize, TableError> {
        match self {
            Self::Stream(t) | Self::ComputeState(t) => t.memtable_bytes(),
            Self::JoinResult(t) => t.memtable_bytes(),
        }
    }

    fn flush(&self) -> Result<(), TableError> {
        match self {
            Self::Stream(t) | Self::ComputeState(t) => t.flush(),
            Self::JoinResult(t) => t.flush(),
        }
    }

    fn compact(&self) -> Result<(), TableError> {
        match self {
            Self::Stream(t) | Self::ComputeState(t) => t.compact(),
            Self::JoinResult(t) => t.compact(),
        }
    }

    fn close(&self) -> Result<(), TableError> {
        match self {
            Self::Stream(t) | Self::ComputeState(t) => t.close(),
            Self::JoinResult(t) => t.close(),
        }
    }
}

/// Owns all tables of one engine instance.
///
/// The manager holds the only strong reference to each table; other
/// components look tables up by name and hold `Arc` clones only for the
/// duration of their work.
pub struct TableManager {
    config: TableManagerConfig,
    tables: RwLock<HashMap<String, TableHandle>>,
}

impl TableManager {
    /// Creates a manager rooted at the configured base directory.
    pub fn new(config: TableManagerConfig) -> Result<Self, TableError> {
        fs::create_dir_all(&config.base_dir)?;
        info!(base = %config.base_dir.display(), "table manager ready");
        Ok(Self {
            config,
            tables: RwLock::new(HashMap::new()),
        })
    }

    // --------------------------------------------------------------------------------------------
    // Creation
    // --------------------------------------------------------------------------------------------

    /// Creates a stream table.  Fails with [`TableError::AlreadyExists`]
    /// when the name is taken.  Existing on-disk data under the table's
    /// directory is attached (crash recovery).
    pub fn create_stream_table(
        &self,
        name: &str,
        config: &TableConfig,
    ) -> Result<Arc<StreamTable>, TableError> {
        self.validate_name(name)?;
        let table = Arc::new(StreamTable::open(self.table_dir(name), name, config)?);
        self.register(name, TableHandle::Stream(Arc::clone(&table)))?;
        Ok(table)
    }

    /// Creates a join-result table.  Same contract as
    /// [`TableManager::create_stream_table`].
    pub fn create_join_result_table(
        &self,
        name: &str,
        config: &TableConfig,
    ) -> Result<Arc<JoinResultTable>, TableError> {
        self.validate_name(name)?;
        let table = Arc::new(JoinResultTable::open(self.table_dir(name), name, config)?);
        self.register(name, TableHandle::JoinResult(Arc::clone(&table)))?;
        Ok(table)
    }

    /// Creates a compute-state table — the reserved substrate used by the
    /// compute state manager.
    pub fn create_compute_state_table(
        &self,
        name: &str,
        config: &TableConfig,
    ) -> Result<Arc<StreamTable>, TableError> {
        self.validate_name(name)?;
        let table = Arc::new(StreamTable::open(self.table_dir(name), name, config)?);
        self.register(name, TableHandle::ComputeState(Arc::clone(&table)))?;
        Ok(table)
    }

    /// Convenience: creates `<prefix>stream_s`, `<prefix>stream_r`, and
    /// `<prefix>join_results` in one call.
    ///
    /// Returns the three table names in that order.
    pub fn create_pecj_tables(&self, prefix: &str) -> Result<[String; 3], TableError> {
        let config = TableConfig::default();
        let s = format!("{prefix}{PECJ_STREAM_S}");
        let r = format!("{prefix}{PECJ_STREAM_R}");
        let results = format!("{prefix}{PECJ_RESULTS}");

        self.create_stream_table(&s, &config)?;
        self.create_stream_table(&r, &config)?;
        self.create_join_result_table(&results, &config)?;

        Ok([s, r, results])
    }

    // --------------------------------------------------------------------------------------------
    // Lookup
    // --------------------------------------------------------------------------------------------

    /// Looks up a stream table by name.
    pub fn get_stream_table(&self, name: &str) -> Result<Arc<StreamTable>, TableError> {
        let tables = self.read_tables()?;
        match tables.get(name) {
            Some(TableHandle::Stream(t)) => Ok(Arc::clone(t)),
            Some(_) => Err(TableError::InvalidArgument(format!(
                "table {name} is not a stream table"
            ))),
            None => Err(TableError::NotFound(name.to_string())),
        }
    }

    /// Looks up a join-result table by name.
    pub fn get_join_result_table(&self, name: &str) -> Result<Arc<JoinResultTable>, TableError> {
        let tables = self.read_tables()?;
        match tables.get(name) {
            Some(TableHandle::JoinResult(t)) => Ok(Arc::clone(t)),
            Some(_) => Err(TableError::InvalidArgument(format!(
                "table {name} is not a join result table"
            ))),
            None => Err(TableError::NotFound(name.to_string())),
        }
    }

    /// Looks up a compute-state table by name.
    pub fn get_compute_state_table(&self, name: &str) -> Result<Arc<StreamTable>, TableError> {
        let tables = self.read_tables()?;
        match tables.get(name) {
            Some(TableHandle::ComputeState(t)) => Ok(Arc::clone(t)),
            Some(_) => Err(TableError::InvalidArgument(format!(
                "table {name} is not a compute state table"
            ))),
            None => Err(TableError::NotFound(name.to_string())),
        }
    }

    /// Whether a table of any kind exists under `name`.
    pub fn has(&self, name: &str) -> bool {
        self.read_tables()
            .map(|tables| tables.contains_key(name))
            .unwrap_or(false)
    }

    /// All table names.
    pub fn list(&self) -> Vec<String> {
        self.read_tables()
            .map(|tables| tables.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Table names of one kind.
    pub fn list_by_type(&self, table_type: TableType) -> Vec<String> {
        self.read_tables()
            .map(|tables| {
                tables
                    .iter()
                    .filter(|(_, handle)| handle.table_type() == table_type)
                    .map(|(name, _)| name.clone())
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Number of managed tables.
    pub fn count(&self) -> usize {
        self.read_tables().map(|tables| tables.len()).unwrap_or(0)
    }

    // --------------------------------------------------------------------------------------------
    // Lifecycle
    // --------------------------------------------------------------------------------------------

    /// Drops a table: removes it from the namespace and deletes its data
    /// directory.
    ///
    /// Fails with [`TableError::LiveHandles`] while any component still
    /// holds a reference to the table.
    pub fn drop_table(&self, name: &str) -> Result<(), TableError> {
        let handle = {
            let mut tables = self.write_tables()?;
            match tables.get(name) {
                None => return Err(TableError::NotFound(name.to_string())),
                Some(handle) if handle.live_handles() => {
                    return Err(TableError::LiveHandles(name.to_string()));
                }
                Some(_) => {}
            }
            tables
                .remove(name)
                .ok_or_else(|| TableError::Internal("table vanished during drop".into()))?
        };

        handle.close()?;
        drop(handle);
        fs::remove_dir_all(self.table_dir(name))?;
        info!(name, "table dropped");
        Ok(())
    }

    /// Drops every table.  Fails if any table still has live handles; no
    /// table is removed in that case.
    pub fn clear(&self) -> Result<(), TableError> {
        let handles: Vec<(String, TableHandle)> = {
            let mut tables = self.write_tables()?;
            if let Some((name, _)) = tables.iter().find(|(_, h)| h.live_handles()) {
                return Err(TableError::LiveHandles(name.clone()));
            }
            tables.drain().collect()
        };

        for (name, handle) in handles {
            handle.close()?;
            drop(handle);
            fs::remove_dir_all(self.table_dir(&name))?;
        }
        info!("all tables dropped");
        Ok(())
    }

    /// Flushes every table's pending memtable contents.
    pub fn flush_all(&self) -> Result<(), TableError> {
        let tables = self.read_tables()?;
        for (name, handle) in tables.iter() {
            if let Err(e) = handle.flush() {
                warn!(name, error = %e, "flush_all: table flush failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Runs compaction on every table.
    pub fn compact_all(&self) -> Result<(), TableError> {
        let tables = self.read_tables()?;
        for (name, handle) in tables.iter() {
            if let Err(e) = handle.compact() {
                warn!(name, error = %e, "compact_all: table compaction failed");
                return Err(e);
            }
        }
        Ok(())
    }

    /// Gracefully closes every table.
    pub fn close_all(&self) -> Result<(), TableError> {
        let tables = self.read_tables()?;
        for handle in tables.values() {
            handle.close()?;
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Batch fan-out
    // --------------------------------------------------------------------------------------------

    /// Inserts batches into multiple tables, returning per-table logical
    /// indices.  Afterwards the global memory cap is enforced.
    pub fn insert_batch_to_tables(
        &self,
        batches: HashMap<String, Vec<Record>>,
    ) -> Result<HashMap<String, Vec<u64>>, TableError> {
        let mut results = HashMap::with_capacity(batches.len());
        for (name, records) in batches {
            let target = self.target(&name)?;
            let indices = match target {
                BatchTarget::Stream(t) => t.insert_batch(records)?,
                BatchTarget::JoinResult(t) => {
                    let mut indices = Vec::with_capacity(records.len());
                    for record in records {
                        indices.push(t.insert(record)?);
                    }
                    indices
                }
            };
            results.insert(name, indices);
        }

        self.enforce_memory_limit()?;
        Ok(results)
    }

    /// Queries a time range from multiple tables (inclusive on both ends).
    pub fn query_batch_from_tables(
        &self,
        ranges: HashMap<String, TimeRange>,
    ) -> Result<HashMap<String, Vec<Record>>, TableError> {
        let mut results = HashMap::with_capacity(ranges.len());
        for (name, range) in ranges {
            let records = match self.target(&name)? {
                BatchTarget::Stream(t) => t.query(range, None)?,
                BatchTarget::JoinResult(t) => t.query(range)?,
            };
            results.insert(name, records);
        }
        Ok(results)
    }

    // --------------------------------------------------------------------------------------------
    // Global memory accounting
    // --------------------------------------------------------------------------------------------

    /// Sum of active-memtable bytes across all tables.
    pub fn total_memtable_bytes(&self) -> Result<usize, TableError> {
        let tables = self.read_tables()?;
        let mut total = 0usize;
        for handle in tables.values() {
            total += handle.memtable_bytes()?;
        }
        Ok(total)
    }

    /// Flushes every table when the configured global cap is exceeded.
    /// Inserts are never rejected on memory pressure.
    pub fn enforce_memory_limit(&self) -> Result<(), TableError> {
        let Some(cap) = self.config.max_total_memtable_bytes else {
            return Ok(());
        };
        let total = self.total_memtable_bytes()?;
        if total > cap {
            debug!(total, cap, "global memtable cap exceeded; flushing all tables");
            self.flush_all()?;
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn table_dir(&self, name: &str) -> PathBuf {
        self.config.base_dir.join(name)
    }

    /// Resolves a table name to an owned handle for batch fan-out, so the
    /// namespace lock is never held across the actual work.
    fn target(&self, name: &str) -> Result<BatchTarget, TableError> {
        let tables = self.read_tables()?;
        match tables.get(name) {
            Some(TableHandle::Stream(t)) | Some(TableHandle::ComputeState(t)) => {
                Ok(BatchTarget::Stream(Arc::clone(t)))
            }
            Some(TableHandle::JoinResult(t)) => Ok(BatchTarget::JoinResult(Arc::clone(t))),
            None => Err(TableError::NotFound(name.to_string())),
        }
    }

    fn validate_name(&self, name: &str) -> Result<(), TableError> {
        if name.is_empty() {
            return Err(TableError::InvalidArgument("empty table name".into()));
        }
        if name.contains(['/', '\\']) || name == "." || name == ".." {
            return Err(TableError::InvalidArgument(format!(
                "table name is not a valid directory name: {name}"
            )));
        }
        // Early rejection so a duplicate create never opens a second tree
        // over a live table's directory.
        if self.has(name) {
            return Err(TableError::AlreadyExists(name.to_string()));
        }
        Ok(())
    }

    fn register(&self, name: &str, handle: TableHandle) -> Result<(), TableError> {
        let mut tables = self.write_tables()?;
        if tables.contains_key(name) {
            return Err(TableError::AlreadyExists(name.to_string()));
        }
        tables.insert(name.to_string(), handle);
        Ok(())
    }

    fn read_tables(
        &self,
    ) -> Result<std::sync::RwLockReadGuard<'_, HashMap<String, TableHandle>>, TableError> {
        self.tables
            .read()
            .map_err(|_| TableError::Internal("table map lock poisoned".into()))
    }

    fn write_tables(
        &self,
    ) -> Result<std::sync::RwLockWriteGuard<'_, HashMap<String, TableHandle>>, TableError> {
        self.tables
            .write()
            .map_err(|_| TableError::Internal("table map lock poisoned".into()))
    }
}

impl std::fmt::Debug for TableManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TableManager")
            .field("base_dir", &self.config.base_dir)
            .field("tables", &self.count())
            .finish()
    }
}
