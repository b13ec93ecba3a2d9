//! # Memtable Module
//!
//! The in-memory, timestamp-sorted write buffer of one LSM instance.
//!
//! ## Design Invariants
//!
//! - Records are totally ordered by timestamp; a write to an existing
//!   timestamp replaces the previous record (last-writer-wins).  The WAL
//!   still holds every write, so nothing is lost before a flush.
//! - The buffer tracks its approximate footprint as the sum of encoded
//!   record sizes and refuses writes past its byte budget — **except**
//!   replacements, which are always accepted and re-accounted.
//! - A memtable owns no I/O.  The LSM tree pairs it with the WAL and
//!   decides when it is sealed and flushed.
//!
//! ## Flush Semantics
//!
//! [`MemTable::iter`] yields records in ascending timestamp order, which is
//! exactly the stream the SSTable builder consumes.  Iteration does not
//! mutate state; the tree drops the sealed memtable after a successful
//! flush.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;

use crate::record::Record;
use tracing::trace;

// ------------------------------------------------------------------------------------------------
// PutOutcome
// ------------------------------------------------------------------------------------------------

/// Result of offering a record to the memtable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// The record was stored (or replaced an existing timestamp).
    Accepted,

    /// The byte budget would be exceeded; the caller must seal and rotate.
    Full,
}

// ------------------------------------------------------------------------------------------------
// MemTable
// ------------------------------------------------------------------------------------------------

/// One stored entry: the record plus the encoded size it was admitted at,
/// kept so replacement adjusts accounting exactly.
#[derive(Debug, Clone)]
struct MemEntry {
    record: Record,
    encoded_len: usize,
}

/// A sorted map from timestamp to record with a bounded byte budget.
#[derive(Debug)]
pub struct MemTable {
    tree: BTreeMap<i64, MemEntry>,
    current_bytes: usize,
    max_bytes: usize,
}

impl MemTable {
    /// Creates an empty memtable with the given byte budget.
    pub fn new(max_bytes: usize) -> Self {
        Self {
            tree: BTreeMap::new(),
            current_bytes: 0,
            max_bytes,
        }
    }

    /// Offers a record at `ts` with its known encoded size.
    ///
    /// Accepts iff `current_bytes + encoded_len <= max_bytes`, **or** the
    /// timestamp already exists (replacement adjusts accounting).
    /// Otherwise returns [`PutOutcome::Full`] without storing anything.
    pub fn put(&mut self, ts: i64, record: Record, encoded_len: usize) -> PutOutcome {
        if !self.tree.contains_key(&ts) && self.current_bytes + encoded_len > self.max_bytes {
            trace!(
                ts,
                encoded_len,
                current_bytes = self.current_bytes,
                "memtable full"
            );
            return PutOutcome::Full;
        }
        self.put_unchecked(ts, record, encoded_len);
        PutOutcome::Accepted
    }

    /// Whether a record of `encoded_len` bytes at `ts` would be accepted.
    ///
    /// Lets the put path decide to rotate *before* moving the record in.
    pub fn can_accept(&self, ts: i64, encoded_len: usize) -> bool {
        self.tree.contains_key(&ts) || self.current_bytes + encoded_len <= self.max_bytes
    }

    /// Stores a record without budget enforcement.
    ///
    /// Used by WAL replay, where every record is already durable and must
    /// land in memory even if the buffer transiently exceeds its budget;
    /// the first post-recovery write rotates as usual.
    pub fn put_unchecked(&mut self, ts: i64, record: Record, encoded_len: usize) {
        if let Some(old) = self.tree.insert(
            ts,
            MemEntry {
                record,
                encoded_len,
            },
        ) {
            self.current_bytes = self.current_bytes.saturating_sub(old.encoded_len);
        }
        self.current_bytes += encoded_len;
    }

    /// Exact-match lookup.
    pub fn get(&self, ts: i64) -> Option<&Record> {
        self.tree.get(&ts).map(|e| &e.record)
    }

    /// Ordered records with timestamps in `[start_ts, end_ts]`, inclusive
    /// on both ends.
    pub fn range(&self, start_ts: i64, end_ts: i64) -> Vec<Record> {
        if start_ts > end_ts {
            return Vec::new();
        }
        self.tree
            .range(start_ts..=end_ts)
            .map(|(_, e)| e.record.clone())
            .collect()
    }

    /// All records in ascending timestamp order, with their encoded sizes.
    ///
    /// Consumed by the SSTable builder on flush and by the WAL rewrite.
    pub fn iter(&self) -> impl Iterator<Item = (&Record, usize)> {
        self.tree.values().map(|e| (&e.record, e.encoded_len))
    }

    /// Approximate in-memory footprint in bytes.
    pub fn size_bytes(&self) -> usize {
        self.current_bytes
    }

    /// Number of distinct timestamps stored.
    pub fn len(&self) -> usize {
        self.tree.len()
    }

    /// Whether the memtable holds no records.
    pub fn is_empty(&self) -> bool {
        self.tree.is_empty()
    }

    /// Whether the buffer has reached its byte budget.
    pub fn is_full(&self) -> bool {
        self.current_bytes >= self.max_bytes
    }

    /// Smallest stored timestamp, if any.
    pub fn min_ts(&self) -> Option<i64> {
        self.tree.keys().next().copied()
    }

    /// Largest stored timestamp, if any.
    pub fn max_ts(&self) -> Option<i64> {
        self.tree.keys().next_back().copied()
    }

    /// Drops all records and resets accounting.
    pub fn clear(&mut self) {
        self.tree.clear();
        self.current_bytes = 0;
    }
}
