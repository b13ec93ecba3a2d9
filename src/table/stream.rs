//! Stream tables — raw ingested series over an exclusive LSM instance,
//! with an in-memory tag index and a checkpoint facility.

use std::{
    collections::{BTreeSet, HashMap},
    path::{Path, PathBuf},
    sync::{
        Mutex, RwLock, Weak,
        atomic::{AtomicU64, Ordering},
    },
};

use tracing::{debug, info, trace};

use crate::checkpoint::{CheckpointMeta, CheckpointStore};
use crate::lsm::{LsmConfig, LsmStats, LsmTree};
use crate::record::{Record, TimeRange};

use super::{IngestObserver, TableConfig, TableError, TagFilter, matches_tags};

/// Subdirectory of a table holding its LSM data.
const LSM_DIR: &str = "lsm";

/// Subdirectory of a table holding its checkpoints.
const CHECKPOINT_DIR: &str = "checkpoints";

// ------------------------------------------------------------------------------------------------
// Stats
// ------------------------------------------------------------------------------------------------

/// Snapshot of table statistics returned by [`StreamTable::stats`].
#[derive(Debug, Clone)]
pub struct TableStats {
    /// Table name.
    pub name: String,

    /// Logical records inserted since creation (or reload).
    pub records: u64,

    /// Underlying tree statistics.
    pub lsm: LsmStats,

    /// Number of distinct tag keys in the index.
    pub tag_keys: usize,
}

// ------------------------------------------------------------------------------------------------
// StreamTable
// ------------------------------------------------------------------------------------------------

/// In-memory tag index: tag key → tag value → timestamps carrying it.
///
/// A pure optimization — queries verify tags against the records
/// themselves, so stale entries from replaced timestamps cost a lookup,
/// never a wrong answer.
type TagIndex = HashMap<String, HashMap<String, BTreeSet<i64>>>;

/// A raw ingested series.
///
/// Owns an independent LSM instance under its own data directory; its
/// identity is its name string.
pub struct StreamTable {
    name: String,
    lsm: LsmTree,
    tag_index: RwLock<TagIndex>,
    inserted: AtomicU64,
    checkpoints: CheckpointStore,
    observers: Mutex<Vec<Weak<dyn IngestObserver>>>,
}

impl StreamTable {
    /// Opens (or creates) a stream table under `dir`.
    ///
    /// Existing data is attached and the tag index is rebuilt from a full
    /// scan of the tree.
    pub fn open(dir: impl AsRef<Path>, name: &str, config: &TableConfig) -> Result<Self, TableError> {
        let dir: PathBuf = dir.as_ref().to_path_buf();
        let lsm = LsmTree::open(LsmConfig {
            data_dir: dir.join(LSM_DIR),
            memtable_max_bytes: config.memtable_max_bytes,
            max_levels: config.max_levels,
            l0_compaction_trigger: config.l0_compaction_trigger,
            level_base_bytes: config.level_base_bytes,
        })?;
        let checkpoints = CheckpointStore::open(dir.join(CHECKPOINT_DIR))?;

        let table = Self {
            name: name.to_string(),
            lsm,
            tag_index: RwLock::new(HashMap::new()),
            inserted: AtomicU64::new(0),
            checkpoints,
            observers: Mutex::new(Vec::new()),
        };
        table.rebuild_index()?;

        info!(name, records = table.size(), "stream table opened");
        Ok(table)
    }

    /// Table name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Registers an observer for insert notifications.
    ///
    /// Only a weak reference is kept; dropped observers are pruned on the
    /// next notification.
    pub fn register_observer(&self, observer: Weak<dyn IngestObserver>) {
        if let Ok(mut observers) = self.observers.lock() {
            observers.push(observer);
        }
    }

    /// Inserts one record, returning its logical index — the count of
    /// previously inserted records.
    pub fn insert(&self, record: Record) -> Result<u64, TableError> {
        let ts = record.timestamp;
        let tags = record.tags.clone();

        self.lsm.put(record)?;
        self.index_tags(ts, &tags);

        let index = self.inserted.fetch_add(1, Ordering::SeqCst);
        trace!(table = %self.name, ts, index, "record inserted");

        self.notify_observers(ts, 1);
        Ok(index)
    }

    /// Inserts a batch, returning the logical index of each record.
    pub fn insert_batch(&self, records: Vec<Record>) -> Result<Vec<u64>, TableError> {
        let mut indices = Vec::with_capacity(records.len());
        let last_ts = records.last().map(|r| r.timestamp);
        let count = records.len();

        for record in records {
            let ts = record.timestamp;
            let tags = record.tags.clone();
            self.lsm.put(record)?;
            self.index_tags(ts, &tags);
            indices.push(self.inserted.fetch_add(1, Ordering::SeqCst));
        }

        if let Some(ts) = last_ts {
            self.notify_observers(ts, count);
        }
        Ok(indices)
    }

    /// Exact-match lookup by timestamp.
    pub fn get(&self, ts: i64) -> Result<Option<Record>, TableError> {
        Ok(self.lsm.get(ts)?)
    }

    /// Time-range query with optional tag filtering.
    ///
    /// The range is interpreted **inclusive on both ends**.  A tag filter
    /// is an AND of exact equalities; when every predicate resolves in the
    /// tag index the candidate set narrows the scan, otherwise the query
    /// falls back to scanning the time range and checking tags directly.
    pub fn query(
        &self,
        range: TimeRange,
        filter: Option<&TagFilter>,
    ) -> Result<Vec<Record>, TableError> {
        if range.start_us > range.end_us {
            return Err(TableError::InvalidArgument(format!(
                "query range start {} exceeds end {}",
                range.start_us, range.end_us
            )));
        }

        let records = self.lsm.range(range.start_us, range.end_us)?;

        let Some(filter) = filter else {
            return Ok(records);
        };
        if filter.is_empty() {
            return Ok(records);
        }

        let candidates = self.index_candidates(filter);
        match candidates {
            Some(candidates) => Ok(records
                .into_iter()
                .filter(|r| candidates.contains(&r.timestamp) && matches_tags(r, filter))
                .collect()),
            None => {
                debug!(table = %self.name, "tag filter missed the index; scanning range");
                Ok(records
                    .into_iter()
                    .filter(|r| matches_tags(r, filter))
                    .collect())
            }
        }
    }

    /// The `n` records with the largest timestamps, descending.
    pub fn query_latest(&self, n: usize) -> Result<Vec<Record>, TableError> {
        let mut records = self.lsm.range(i64::MIN, i64::MAX)?;
        let keep = records.len().saturating_sub(n);
        let mut latest: Vec<Record> = records.drain(keep..).collect();
        latest.reverse();
        Ok(latest)
    }

    /// Number of records in the given range (inclusive on both ends).
    pub fn count(&self, range: TimeRange) -> Result<usize, TableError> {
        if range.start_us > range.end_us {
            return Err(TableError::InvalidArgument(format!(
                "count range start {} exceeds end {}",
                range.start_us, range.end_us
            )));
        }
        Ok(self.lsm.range(range.start_us, range.end_us)?.len())
    }

    /// Drops all data and resets the tag index.
    pub fn clear(&self) -> Result<(), TableError> {
        self.lsm.clear()?;
        if let Ok(mut index) = self.tag_index.write() {
            index.clear();
        }
        self.inserted.store(0, Ordering::SeqCst);
        Ok(())
    }

    /// Forces pending memtable contents to L0.
    pub fn flush(&self) -> Result<(), TableError> {
        Ok(self.lsm.flush()?)
    }

    /// Runs compaction rounds until the tree finds nothing to do.
    pub fn compact(&self) -> Result<(), TableError> {
        self.lsm.compact()?;
        Ok(())
    }

    /// Logical record count.
    pub fn size(&self) -> u64 {
        self.inserted.load(Ordering::SeqCst)
    }

    /// Whether the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Returns a statistics snapshot.
    pub fn stats(&self) -> Result<TableStats, TableError> {
        let lsm = self.lsm.stats()?;
        let tag_keys = self
            .tag_index
            .read()
            .map(|index| index.len())
            .unwrap_or(0);
        Ok(TableStats {
            name: self.name.clone(),
            records: self.size(),
            lsm,
            tag_keys,
        })
    }

    /// Bytes currently held by the active memtable; feeds the manager's
    /// global memory accounting.
    pub fn memtable_bytes(&self) -> Result<usize, TableError> {
        Ok(self.lsm.stats()?.active_memtable_bytes)
    }

    /// Gracefully closes the underlying tree.
    pub fn close(&self) -> Result<(), TableError> {
        Ok(self.lsm.close()?)
    }

    // --------------------------------------------------------------------------------------------
    // Checkpoints
    // --------------------------------------------------------------------------------------------

    /// Writes a checkpoint of the table's full contents under `id`.
    pub fn create_checkpoint(&self, id: u64) -> Result<CheckpointMeta, TableError> {
        let records = self.lsm.range(i64::MIN, i64::MAX)?;
        Ok(self.checkpoints.create(id, &records)?)
    }

    /// Enumerates live checkpoints.
    pub fn list_checkpoints(&self) -> Result<Vec<CheckpointMeta>, TableError> {
        Ok(self.checkpoints.list()?)
    }

    /// Re-inserts the records of checkpoint `id` into the table.
    pub fn restore_checkpoint(&self, id: u64) -> Result<usize, TableError> {
        let records = self.checkpoints.load(id)?;
        let count = records.len();
        self.insert_batch(records)?;
        Ok(count)
    }

    /// Removes checkpoint `id`.
    pub fn delete_checkpoint(&self, id: u64) -> Result<(), TableError> {
        Ok(self.checkpoints.delete(id)?)
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    /// Rebuilds the tag index (and the logical record count) from a full
    /// scan of the tree.  Called once at open.
    fn rebuild_index(&self) -> Result<(), TableError> {
        let records = self.lsm.range(i64::MIN, i64::MAX)?;
        self.inserted.store(records.len() as u64, Ordering::SeqCst);
        for record in &records {
            self.index_tags(record.timestamp, &record.tags);
        }
        Ok(())
    }

    fn index_tags(&self, ts: i64, tags: &std::collections::BTreeMap<String, String>) {
        if tags.is_empty() {
            return;
        }
        if let Ok(mut index) = self.tag_index.write() {
            for (key, value) in tags {
                index
                    .entry(key.clone())
                    .or_default()
                    .entry(value.clone())
                    .or_default()
                    .insert(ts);
            }
        }
    }

    /// Intersects the candidate timestamp sets of every filter predicate.
    ///
    /// Returns `None` when any predicate has no index entry — the caller
    /// must then fall back to a scan.
    fn index_candidates(&self, filter: &TagFilter) -> Option<BTreeSet<i64>> {
        let index = self.tag_index.read().ok()?;
        let mut candidates: Option<BTreeSet<i64>> = None;
        for (key, value) in filter {
            let set = index.get(key)?.get(value)?;
            candidates = Some(match candidates {
                None => set.clone(),
                Some(acc) => acc.intersection(set).copied().collect(),
            });
        }
        candidates
    }

    fn notify_observers(&self, ts: i64, count: usize) {
        let Ok(mut observers) = self.observers.lock() else {
            return;
        };
        observers.retain(|weak| match weak.upgrade() {
            Some(observer) => {
                observer.on_data_inserted(&self.name, ts, count);
                true
            }
            None => false,
        });
    }
}

impl std::fmt::Debug for StreamTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamTable")
            .field("name", &self.name)
            .field("records", &self.size())
            .finish_non_exhaustive()
    }
}
