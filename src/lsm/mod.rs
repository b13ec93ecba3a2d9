//! # LSM Tree
//!
//! The storage orchestrator of one table: an active memtable fronted by a
//! WAL, at most one sealed (immutable) memtable awaiting flush, and a map
//! of SSTable levels maintained by a background compaction worker.
//!
//! ## Write path
//!
//! 1. Encode the record once; oversized records (larger than the whole
//!    memtable budget) are rejected **before** the WAL append, so the log
//!    never carries a record that can never flush.
//! 2. Append to the WAL (failures propagate to the caller).
//! 3. Offer the record to the active memtable.  When it would overflow,
//!    the active memtable is sealed, a fresh one takes its place, the
//!    sealed one is handed to the worker for flushing, and the put retries
//!    on the empty buffer.
//!
//! ## Read path
//!
//! Lookups probe active → immutable → L0 (newest sequence first, files may
//! overlap) → L1, L2, … (disjoint within a level).  First hit wins.  Range
//! queries merge every overlapping source, deduplicating by timestamp with
//! newest-wins.
//!
//! ## Flush and the WAL
//!
//! A flush writes the sealed memtable to a new L0 SSTable, then rewrites
//! the WAL with only the records of the still-active memtable.  At every
//! instant each write exists in the WAL or in an SSTable — a crash can
//! lose nothing that was acknowledged.
//!
//! ## Compaction
//!
//! One dedicated worker per tree.  Selection policy:
//!
//! - **L0**: when the file count reaches the configured trigger, all L0
//!   files (they overlap) merge into L1.
//! - **Level N ≥ 1**: when the level's total size exceeds
//!   `2^N × level_base_bytes`, the oldest file merges into level N+1.
//!
//! Either way the files overlapping the inputs at the target level join
//! the merge, so levels ≥ 1 stay disjoint by construction.  The swap of
//! file lists happens under a brief exclusive lock: readers see the
//! pre-merge or post-merge set, never a mix.  A failed flush or compaction
//! is logged and retried on the next cycle — inputs are only deleted after
//! the replacement is registered.
//!
//! ## Concurrency model
//!
//! Two independent reader/writer regions: the memtable pair and the level
//! map.  Readers take shared locks per region; the put path and the worker
//! take brief exclusive locks.  Readers of one region never block writers
//! of the other.

#[cfg(test)]
mod tests;

use std::{
    collections::BTreeMap,
    fs,
    io,
    path::PathBuf,
    sync::{
        Arc, Condvar, Mutex, RwLock,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    thread::{self, JoinHandle},
    time::Duration,
};

use thiserror::Error;
use tracing::{debug, error, info, warn};

use crate::encoding::{self, EncodingError};
use crate::memtable::MemTable;
use crate::record::Record;
use crate::sstable::{self, SsTable, SsTableError};
use crate::wal::{WAL_FILE_NAME, Wal, WalError};

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors that can occur during LSM tree operations.
#[derive(Debug, Error)]
pub enum LsmError {
    /// Underlying filesystem I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Error originating from the write-ahead log.
    #[error("WAL error: {0}")]
    Wal(#[from] WalError),

    /// Error originating from the SSTable subsystem.
    #[error("SSTable error: {0}")]
    SsTable(#[from] SsTableError),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// A single record exceeds the whole memtable budget and can never
    /// be accepted.
    #[error("record of {size} bytes exceeds memtable budget of {budget} bytes")]
    RecordTooLarge {
        /// Encoded record size.
        size: usize,
        /// Configured memtable byte budget.
        budget: usize,
    },

    /// Rejected configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Internal invariant violation (poisoned lock, unexpected state).
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Configuration
// ------------------------------------------------------------------------------------------------

/// Configuration for one [`LsmTree`] instance.
#[derive(Debug, Clone)]
pub struct LsmConfig {
    /// Directory holding `wal.log` and the SSTable files.
    pub data_dir: PathBuf,

    /// Byte budget of the active memtable before it is sealed.
    pub memtable_max_bytes: usize,

    /// Number of levels, L0 included.  The last level is never compacted
    /// further.
    pub max_levels: u32,

    /// L0 file count that schedules a compaction.
    pub l0_compaction_trigger: usize,

    /// Base for the per-level size threshold: level N compacts when its
    /// total file size exceeds `2^N * level_base_bytes`.
    pub level_base_bytes: u64,
}

impl LsmConfig {
    /// Creates a config rooted at `data_dir` with default sizing.
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            memtable_max_bytes: 4 * 1024 * 1024,
            max_levels: 7,
            l0_compaction_trigger: 4,
            level_base_bytes: 8 * 1024 * 1024,
        }
    }

    fn validate(&self) -> Result<(), LsmError> {
        if self.memtable_max_bytes == 0 {
            return Err(LsmError::InvalidConfig("memtable_max_bytes is zero".into()));
        }
        if self.max_levels == 0 {
            return Err(LsmError::InvalidConfig("max_levels is zero".into()));
        }
        if self.l0_compaction_trigger == 0 {
            return Err(LsmError::InvalidConfig("l0_compaction_trigger is zero".into()));
        }
        if self.level_base_bytes == 0 {
            return Err(LsmError::InvalidConfig("level_base_bytes is zero".into()));
        }
        Ok(())
    }
}

// ------------------------------------------------------------------------------------------------
// Stats
// ------------------------------------------------------------------------------------------------

/// Per-level statistics snapshot.
#[derive(Debug, Clone)]
pub struct LevelStats {
    /// Level number.
    pub level: u32,
    /// Number of files in the level.
    pub files: usize,
    /// Sum of file sizes in bytes.
    pub bytes: u64,
}

/// Snapshot of tree statistics returned by [`LsmTree::stats`].
#[derive(Debug, Clone)]
pub struct LsmStats {
    /// Bytes held by the active memtable.
    pub active_memtable_bytes: usize,
    /// Records held by the active memtable.
    pub active_memtable_records: usize,
    /// Whether a sealed memtable is awaiting flush.
    pub immutable_pending: bool,
    /// Per-level file statistics.
    pub levels: Vec<LevelStats>,
    /// Next sequence number to be issued.
    pub next_seq: u64,
}

// ------------------------------------------------------------------------------------------------
// Shared state
// ------------------------------------------------------------------------------------------------

/// The memtable region: active buffer plus at most one sealed buffer.
struct MemRegion {
    active: MemTable,
    immutable: Option<MemTable>,
}

/// The level region: level number → SSTable handles, each list sorted by
/// ascending sequence number.
struct Levels {
    map: BTreeMap<u32, Vec<Arc<SsTable>>>,
}

impl Levels {
    fn level_bytes(&self, level: u32) -> u64 {
        self.map
            .get(&level)
            .map(|files| files.iter().map(|f| f.file_size()).sum())
            .unwrap_or(0)
    }
}

/// Wake-up channel for the background worker.
struct WorkerSignal {
    pending: Mutex<bool>,
    cvar: Condvar,
}

struct LsmShared {
    config: LsmConfig,
    wal: Wal,
    mem: RwLock<MemRegion>,
    levels: RwLock<Levels>,
    next_seq: AtomicU64,
    signal: WorkerSignal,
    stop: AtomicBool,
    /// Serializes compaction rounds between the worker and callers of
    /// [`LsmTree::compact`]; selection and the list swap must see each
    /// other's results.
    compaction_lock: Mutex<()>,
}

impl LsmShared {
    fn notify_worker(&self) {
        if let Ok(mut pending) = self.signal.pending.lock() {
            *pending = true;
        }
        self.signal.cvar.notify_one();
    }
}

// ------------------------------------------------------------------------------------------------
// LsmTree
// ------------------------------------------------------------------------------------------------

/// The LSM tree of one table.
///
/// Exclusively owns its memtables, WAL, and SSTable file handles.  Other
/// components reach the data only through the owning table's API.
pub struct LsmTree {
    shared: Arc<LsmShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl LsmTree {
    /// Opens (or creates) a tree rooted at the configured data directory.
    ///
    /// Startup sequence: open the WAL and replay it into the active
    /// memtable, scan the directory for files matching `L<level>_<seq>.sst`
    /// and attach them under their level, advance the sequence counter past
    /// the maximum observed, and start the compaction worker.  Files that
    /// match the naming convention but fail validation, and leftover
    /// `.tmp` files, are removed.
    pub fn open(config: LsmConfig) -> Result<Self, LsmError> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)?;

        let mut map: BTreeMap<u32, Vec<Arc<SsTable>>> = BTreeMap::new();
        let mut max_seq = 0u64;

        for entry in fs::read_dir(&config.data_dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };

            if name.ends_with(".tmp") {
                warn!(path = %path.display(), "removing leftover temporary file");
                let _ = fs::remove_file(&path);
                continue;
            }

            let Some((level, seq)) = sstable::parse_file_name(name) else {
                continue;
            };

            match SsTable::open(&path) {
                Ok(table) => {
                    max_seq = max_seq.max(seq);
                    map.entry(level).or_default().push(Arc::new(table));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "removing invalid SSTable");
                    let _ = fs::remove_file(&path);
                }
            }
        }

        for files in map.values_mut() {
            files.sort_by_key(|f| f.seq());
        }

        let wal = Wal::open(config.data_dir.join(WAL_FILE_NAME))?;
        let mut active = MemTable::new(config.memtable_max_bytes);
        let replayed = wal.recover()?;
        // Rewrite the log with exactly the replayed records: a torn tail
        // from a crash mid-append must not sit in front of future appends,
        // where a second recovery would stop at it.
        wal.rewrite(&replayed)?;
        for record in replayed {
            let len = record.encoded_len();
            active.put_unchecked(record.timestamp, record, len);
        }

        info!(
            dir = %config.data_dir.display(),
            sstables = map.values().map(Vec::len).sum::<usize>(),
            replayed = active.len(),
            next_seq = max_seq + 1,
            "LSM tree opened"
        );

        let shared = Arc::new(LsmShared {
            config,
            wal,
            mem: RwLock::new(MemRegion {
                active,
                immutable: None,
            }),
            levels: RwLock::new(Levels { map }),
            next_seq: AtomicU64::new(max_seq + 1),
            signal: WorkerSignal {
                pending: Mutex::new(false),
                cvar: Condvar::new(),
            },
            stop: AtomicBool::new(false),
            compaction_lock: Mutex::new(()),
        });

        let worker_shared = Arc::downgrade(&shared);
        let worker = thread::Builder::new()
            .name("lsm-compaction".into())
            .spawn(move || Self::worker_loop(worker_shared))
            .map_err(LsmError::Io)?;

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
        })
    }

    /// Inserts one record.
    ///
    /// WAL append failures propagate; a record larger than the entire
    /// memtable budget is rejected before it touches the log.
    pub fn put(&self, record: Record) -> Result<(), LsmError> {
        let bytes = encoding::encode_to_vec(&record)?;
        let budget = self.shared.config.memtable_max_bytes;
        if bytes.len() > budget {
            return Err(LsmError::RecordTooLarge {
                size: bytes.len(),
                budget,
            });
        }

        self.shared.wal.append_encoded(&bytes)?;

        let ts = record.timestamp;
        let mut mem = write_mem(&self.shared)?;

        if !mem.active.can_accept(ts, bytes.len()) {
            if mem.immutable.is_some() {
                // The worker has not caught up; flush inline rather than
                // stacking sealed buffers.
                Self::flush_immutable_locked(&self.shared, &mut mem)?;
                // The flush rewrote the log from the memtable contents,
                // which do not yet include this record; restore its entry
                // before it lands in the fresh buffer.
                self.shared.wal.append_encoded(&bytes)?;
            }
            let sealed = std::mem::replace(&mut mem.active, MemTable::new(budget));
            mem.immutable = Some(sealed);
            self.shared.notify_worker();
        }

        match mem.active.put(ts, record, bytes.len()) {
            crate::memtable::PutOutcome::Accepted => Ok(()),
            crate::memtable::PutOutcome::Full => Err(LsmError::Internal(
                "fresh memtable refused a budget-checked record".into(),
            )),
        }
    }

    /// Point lookup.  Probes active → immutable → L0 (newest first) →
    /// deeper levels; first hit wins.
    pub fn get(&self, ts: i64) -> Result<Option<Record>, LsmError> {
        {
            let mem = read_mem(&self.shared)?;
            if let Some(record) = mem.active.get(ts) {
                return Ok(Some(record.clone()));
            }
            if let Some(imm) = &mem.immutable {
                if let Some(record) = imm.get(ts) {
                    return Ok(Some(record.clone()));
                }
            }
        }

        let levels = read_levels(&self.shared)?;
        if let Some(l0) = levels.map.get(&0) {
            for table in l0.iter().rev() {
                if table.might_contain(ts) {
                    if let Some(record) = table.get(ts)? {
                        return Ok(Some(record));
                    }
                }
            }
        }
        for (_, files) in levels.map.range(1..) {
            // Levels >= 1 are disjoint; at most one file can hold the key.
            for table in files {
                if table.might_contain(ts) {
                    if let Some(record) = table.get(ts)? {
                        return Ok(Some(record));
                    }
                }
            }
        }
        Ok(None)
    }

    /// Range query over `[start_ts, end_ts]`, inclusive on both ends.
    ///
    /// Merges every overlapping source into one ordered stream,
    /// deduplicating by timestamp with newest-wins.
    pub fn range(&self, start_ts: i64, end_ts: i64) -> Result<Vec<Record>, LsmError> {
        if start_ts > end_ts {
            return Ok(Vec::new());
        }

        // Priority: SSTables rank by their sequence number; the sealed
        // memtable outranks every file and the active memtable outranks
        // everything.
        let mut merged: BTreeMap<i64, (u64, Record)> = BTreeMap::new();
        let offer = |ts: i64, prio: u64, record: Record, out: &mut BTreeMap<i64, (u64, Record)>| {
            match out.get(&ts) {
                Some((existing, _)) if *existing >= prio => {}
                _ => {
                    out.insert(ts, (prio, record));
                }
            }
        };

        // Memtable region first, then the level region — the same order
        // the flush path acquires them in.
        let (active_records, imm_records) = {
            let mem = read_mem(&self.shared)?;
            let imm = mem
                .immutable
                .as_ref()
                .map(|imm| imm.range(start_ts, end_ts))
                .unwrap_or_default();
            (mem.active.range(start_ts, end_ts), imm)
        };

        {
            let levels = read_levels(&self.shared)?;
            for files in levels.map.values() {
                for table in files {
                    if !table.overlaps(start_ts, end_ts) {
                        continue;
                    }
                    let prio = table.seq();
                    for record in table.range(start_ts, end_ts)? {
                        offer(record.timestamp, prio, record, &mut merged);
                    }
                }
            }
        }

        for record in imm_records {
            offer(record.timestamp, u64::MAX - 1, record, &mut merged);
        }
        for record in active_records {
            offer(record.timestamp, u64::MAX, record, &mut merged);
        }

        Ok(merged.into_values().map(|(_, r)| r).collect())
    }

    /// Seals the active memtable (if non-empty) and flushes everything
    /// pending to L0.
    pub fn flush(&self) -> Result<(), LsmError> {
        let mut mem = write_mem(&self.shared)?;
        if mem.immutable.is_some() {
            Self::flush_immutable_locked(&self.shared, &mut mem)?;
        }
        if !mem.active.is_empty() {
            let budget = self.shared.config.memtable_max_bytes;
            let sealed = std::mem::replace(&mut mem.active, MemTable::new(budget));
            mem.immutable = Some(sealed);
            Self::flush_immutable_locked(&self.shared, &mut mem)?;
        }
        Ok(())
    }

    /// Runs compaction rounds on the caller's thread until the selection
    /// policy finds nothing to do.  Returns whether any round ran.
    pub fn compact(&self) -> Result<bool, LsmError> {
        let mut ran = false;
        while Self::compact_once(&self.shared)? {
            ran = true;
        }
        Ok(ran)
    }

    /// Returns a statistics snapshot.
    pub fn stats(&self) -> Result<LsmStats, LsmError> {
        let mem = read_mem(&self.shared)?;
        let levels = read_levels(&self.shared)?;
        Ok(LsmStats {
            active_memtable_bytes: mem.active.size_bytes(),
            active_memtable_records: mem.active.len(),
            immutable_pending: mem.immutable.is_some(),
            levels: levels
                .map
                .iter()
                .map(|(level, files)| LevelStats {
                    level: *level,
                    files: files.len(),
                    bytes: files.iter().map(|f| f.file_size()).sum(),
                })
                .collect(),
            next_seq: self.shared.next_seq.load(Ordering::SeqCst),
        })
    }

    /// Drops all data: memtables, SSTables, and the WAL.
    pub fn clear(&self) -> Result<(), LsmError> {
        // Hold the compaction lock so an in-flight merge cannot register
        // a file built from the data being dropped.
        let _round = self
            .shared
            .compaction_lock
            .lock()
            .map_err(|_| LsmError::Internal("compaction lock poisoned".into()))?;
        {
            let mut mem = write_mem(&self.shared)?;
            mem.active.clear();
            mem.immutable = None;
        }
        {
            let mut levels = write_levels(&self.shared)?;
            for files in levels.map.values() {
                for table in files {
                    table.mark_for_delete();
                }
            }
            levels.map.clear();
        }
        self.shared.wal.clear()?;
        info!(dir = %self.shared.config.data_dir.display(), "LSM tree cleared");
        Ok(())
    }

    /// Gracefully shuts the tree down: flushes everything pending, stops
    /// the compaction worker, and fsyncs the data directory.
    pub fn close(&self) -> Result<(), LsmError> {
        self.flush()?;

        self.shared.stop.store(true, Ordering::Release);
        self.shared.notify_worker();
        let handle = self
            .worker
            .lock()
            .map_err(|_| LsmError::Internal("worker mutex poisoned".into()))?
            .take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }

        if let Ok(dir) = fs::File::open(&self.shared.config.data_dir) {
            dir.sync_all()?;
        }
        info!(dir = %self.shared.config.data_dir.display(), "LSM tree closed");
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Flush
    // --------------------------------------------------------------------------------------------

    /// Flushes the sealed memtable to a new L0 SSTable under the held
    /// memtable write lock.
    ///
    /// On success the new table is registered, the WAL is rewritten to
    /// carry only the active memtable's records, and the sealed buffer is
    /// released.  On failure the sealed buffer is put back so the next
    /// cycle retries; no acknowledged write is lost either way.
    fn flush_immutable_locked(shared: &LsmShared, mem: &mut MemRegion) -> Result<(), LsmError> {
        let Some(imm) = mem.immutable.take() else {
            return Ok(());
        };
        if imm.is_empty() {
            return Ok(());
        }

        let seq = shared.next_seq.fetch_add(1, Ordering::SeqCst);
        let path = shared.config.data_dir.join(sstable::file_name(0, seq));

        let built = sstable::build_from_memtable(&path, 0, seq, &imm)
            .and_then(|_| SsTable::open(&path).map(Arc::new));

        let table = match built {
            Ok(table) => table,
            Err(e) => {
                error!(seq, error = %e, "flush failed; sealed memtable retained for retry");
                mem.immutable = Some(imm);
                return Err(e.into());
            }
        };

        let l0_count = {
            let mut levels = write_levels(shared)?;
            let l0 = levels.map.entry(0).or_default();
            l0.push(table);
            l0.len()
        };

        // The flushed records leave the log; the active memtable's records
        // are written back so none of them exists only in volatile memory.
        let active_records: Vec<Record> = mem.active.iter().map(|(r, _)| r.clone()).collect();
        shared.wal.rewrite(&active_records)?;

        info!(seq, l0_count, flushed = imm.len(), "memtable flushed to L0");

        if l0_count >= shared.config.l0_compaction_trigger {
            shared.notify_worker();
        }
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Compaction
    // --------------------------------------------------------------------------------------------

    /// The background worker: flushes sealed memtables and runs compaction
    /// rounds, waking on the signal or on a bounded timeout.
    fn worker_loop(shared: std::sync::Weak<LsmShared>) {
        loop {
            let Some(shared) = shared.upgrade() else {
                break;
            };

            {
                let Ok(mut pending) = shared.signal.pending.lock() else {
                    break;
                };
                if !*pending {
                    let waited = shared
                        .signal
                        .cvar
                        .wait_timeout(pending, Duration::from_millis(200));
                    let Ok((guard, _)) = waited else { break };
                    pending = guard;
                }
                *pending = false;
            }

            // Flush a sealed memtable if one is waiting.
            let needs_flush = match shared.mem.read() {
                Ok(mem) => mem.immutable.is_some(),
                Err(_) => false,
            };
            if needs_flush {
                if let Ok(mut mem) = shared.mem.write() {
                    if let Err(e) = Self::flush_immutable_locked(&shared, &mut mem) {
                        error!(error = %e, "background flush failed; will retry");
                    }
                }
            }

            // Drain compaction work.
            loop {
                match Self::compact_once(&shared) {
                    Ok(true) => continue,
                    Ok(false) => break,
                    Err(e) => {
                        error!(error = %e, "compaction failed; will retry");
                        break;
                    }
                }
            }

            if shared.stop.load(Ordering::Acquire) {
                break;
            }
        }
        debug!("compaction worker stopped");
    }

    /// Runs one compaction round if the selection policy finds work.
    ///
    /// The merge itself runs without holding any lock; only the final list
    /// swap takes the exclusive level lock.  Inputs are marked for
    /// deletion strictly after the replacement is registered.
    fn compact_once(shared: &LsmShared) -> Result<bool, LsmError> {
        let _round = shared
            .compaction_lock
            .lock()
            .map_err(|_| LsmError::Internal("compaction lock poisoned".into()))?;

        let Some((inputs, target)) = Self::select_compaction(shared)? else {
            return Ok(false);
        };

        // The file name takes a fresh sequence number — an input at the
        // target level may already carry the largest input sequence, and
        // its file must stay intact until the swap.  The merged table's
        // header keeps the largest input sequence for newest-wins ranking.
        let file_seq = shared.next_seq.fetch_add(1, Ordering::SeqCst);
        let path = shared
            .config
            .data_dir
            .join(sstable::file_name(target, file_seq));

        sstable::build_from_sstables(&path, target, &inputs)?;
        let new_table = Arc::new(SsTable::open(&path)?);

        {
            let mut levels = write_levels(shared)?;
            for input in &inputs {
                if let Some(files) = levels.map.get_mut(&input.level()) {
                    files.retain(|f| !Arc::ptr_eq(f, input));
                }
            }
            let files = levels.map.entry(target).or_default();
            files.push(new_table);
            files.sort_by_key(|f| f.seq());
        }

        for input in &inputs {
            input.mark_for_delete();
        }

        info!(target, file_seq, inputs = inputs.len(), "compaction applied");
        Ok(true)
    }

    /// Selection policy.  Returns the input tables and the target level,
    /// or `None` when no level needs work.
    fn select_compaction(
        shared: &LsmShared,
    ) -> Result<Option<(Vec<Arc<SsTable>>, u32)>, LsmError> {
        let levels = read_levels(shared)?;
        let config = &shared.config;

        // L0: trigger on file count; all files participate (they overlap).
        if let Some(l0) = levels.map.get(&0) {
            if l0.len() >= config.l0_compaction_trigger && config.max_levels > 1 {
                let mut inputs: Vec<Arc<SsTable>> = l0.clone();
                let min_ts = inputs.iter().map(|t| t.min_ts()).min().unwrap_or(0);
                let max_ts = inputs.iter().map(|t| t.max_ts()).max().unwrap_or(0);
                inputs.extend(Self::overlapping(&levels, 1, min_ts, max_ts));
                return Ok(Some((inputs, 1)));
            }
        }

        // Levels >= 1: trigger on total size; the oldest file moves down,
        // merged with whatever it overlaps at the target.
        for level in 1..config.max_levels.saturating_sub(1) {
            let Some(files) = levels.map.get(&level) else {
                continue;
            };
            if files.is_empty() {
                continue;
            }
            let threshold = (1u64 << level) * config.level_base_bytes;
            if levels.level_bytes(level) <= threshold {
                continue;
            }
            let oldest = files
                .iter()
                .min_by_key(|f| f.seq())
                .cloned()
                .ok_or_else(|| LsmError::Internal("non-empty level had no files".into()))?;
            let mut inputs = vec![oldest.clone()];
            inputs.extend(Self::overlapping(
                &levels,
                level + 1,
                oldest.min_ts(),
                oldest.max_ts(),
            ));
            return Ok(Some((inputs, level + 1)));
        }

        Ok(None)
    }

    fn overlapping(levels: &Levels, level: u32, min_ts: i64, max_ts: i64) -> Vec<Arc<SsTable>> {
        levels
            .map
            .get(&level)
            .map(|files| {
                files
                    .iter()
                    .filter(|f| f.overlaps(min_ts, max_ts))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Drop for LsmTree {
    fn drop(&mut self) {
        // Best-effort shutdown for trees dropped without an explicit close.
        let already_closed = self
            .worker
            .lock()
            .map(|guard| guard.is_none())
            .unwrap_or(true);
        if !already_closed {
            if let Err(e) = self.close() {
                warn!(error = %e, "LSM tree close on drop failed");
            }
        }
    }
}

impl std::fmt::Debug for LsmTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmTree")
            .field("dir", &self.shared.config.data_dir)
            .finish_non_exhaustive()
    }
}

// ------------------------------------------------------------------------------------------------
// Lock helpers
// ------------------------------------------------------------------------------------------------

fn read_mem(shared: &LsmShared) -> Result<std::sync::RwLockReadGuard<'_, MemRegion>, LsmError> {
    shared
        .mem
        .read()
        .map_err(|_| LsmError::Internal("memtable lock poisoned".into()))
}

fn write_mem(shared: &LsmShared) -> Result<std::sync::RwLockWriteGuard<'_, MemRegion>, LsmError> {
    shared
        .mem
        .write()
        .map_err(|_| LsmError::Internal("memtable lock poisoned".into()))
}

fn read_levels(shared: &LsmShared) -> Result<std::sync::RwLockReadGuard<'_, Levels>, LsmError> {
    shared
        .levels
        .read()
        .map_err(|_| LsmError::Internal("level lock poisoned".into()))
}

fn write_levels(shared: &LsmShared) -> Result<std::sync::RwLockWriteGuard<'_, Levels>, LsmError> {
    shared
        .levels
        .write()
        .map_err(|_| LsmError::Internal("level lock poisoned".into()))
}
