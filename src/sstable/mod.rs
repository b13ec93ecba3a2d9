//! # Sorted Series Table (SSTable)
//!
//! An immutable on-disk sorted run of records, produced by flushing a
//! memtable or merging other SSTables.  Once written, a file is never
//! modified; updates arrive as new, higher-sequence tables.
//!
//! # On-disk layout
//!
//! Files are named `L<level>_<seq>.sst`.  All integers are little-endian:
//!
//! ```text
//! [HEADER, 68 bytes fixed]
//! [BLOOM FILTER, variable]
//! [INDEX ENTRIES, 20-byte stride]
//! [DATA: encoded records, variable]
//! ```
//!
//! - **Header** — magic `"SSTB"`, format version, level, sequence number,
//!   entry count, covered time interval, and the three region offsets.
//! - **Bloom filter** — serialized [`TimestampBloom`] over every stored
//!   timestamp; lets point lookups reject absent keys without touching data.
//! - **Index** — one `(i64 timestamp, u64 data_offset, u32 encoded_length)`
//!   entry per record, sorted by timestamp for binary search.  Offsets are
//!   absolute file offsets.
//! - **Data** — the records themselves in the record wire format.
//!
//! Readers reject files with a mismatched magic or a format version newer
//! than they implement; a partially-written file never carries the final
//! name because builds go through a `.tmp` path and an atomic rename.
//!
//! # Concurrency model
//!
//! - SSTables are **immutable**, so reads are lock-free and thread-safe.
//! - Readers and the compactor share tables through `Arc` handles; a table
//!   evicted from the tree is marked for deletion and its file is unlinked
//!   when the last handle drops.

pub mod builder;

#[cfg(test)]
mod tests;

pub use builder::{build_from_memtable, build_from_sstables};

use std::{
    fs::File,
    io,
    path::{Path, PathBuf},
    sync::atomic::{AtomicBool, Ordering},
};

use crate::bloom::{BloomError, TimestampBloom};
use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::record::Record;
use memmap2::Mmap;
use thiserror::Error;
use tracing::warn;

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Magic bytes at offset 0 of every SSTable file.
pub const SST_MAGIC: [u8; 4] = *b"SSTB";

/// Current format version.  Readers reject anything newer.
pub const SST_FORMAT_VERSION: u32 = 1;

/// Fixed size of the encoded header in bytes.
pub const SST_HEADER_SIZE: usize = 68;

/// Fixed stride of one index entry in bytes: `i64 + u64 + u32`.
pub const SST_INDEX_ENTRY_SIZE: usize = 20;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by SSTable operations (read, write, build, merge).
#[derive(Debug, Error)]
pub enum SsTableError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Bloom filter construction or deserialization failure.
    #[error("Bloom filter error: {0}")]
    Bloom(#[from] BloomError),

    /// Invalid magic, bad offsets, or an inconsistent index.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// Internal invariant violation.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// File naming
// ------------------------------------------------------------------------------------------------

/// Builds the canonical file name `L<level>_<seq>.sst`.
pub fn file_name(level: u32, seq: u64) -> String {
    format!("L{level}_{seq}.sst")
}

/// Parses `(level, seq)` out of a file name matching the convention,
/// returning `None` for anything else.
pub fn parse_file_name(name: &str) -> Option<(u32, u64)> {
    let rest = name.strip_prefix('L')?.strip_suffix(".sst")?;
    let (level, seq) = rest.split_once('_')?;
    Some((level.parse().ok()?, seq.parse().ok()?))
}

// ------------------------------------------------------------------------------------------------
// On-disk format structures
// ------------------------------------------------------------------------------------------------

/// SSTable metadata header, written at offset 0.
#[derive(Debug, Clone)]
pub struct SstHeader {
    /// Magic bytes (`b"SSTB"`).
    pub magic: [u8; 4],

    /// Format version.
    pub version: u32,

    /// LSM level this table belongs to.
    pub level: u32,

    /// Sequence number.  For flushed tables this is the flush sequence;
    /// for merged tables it is the largest input sequence, preserving
    /// newest-wins ordering across runs.
    pub seq: u64,

    /// Number of records stored.
    pub entry_count: u64,

    /// Smallest stored timestamp.  Fixed for the life of the file.
    pub min_ts: i64,

    /// Largest stored timestamp.  Fixed for the life of the file.
    pub max_ts: i64,

    /// Absolute offset of the bloom filter region.
    pub bloom_offset: u64,

    /// Absolute offset of the index region.
    pub index_offset: u64,

    /// Absolute offset of the data region.
    pub data_offset: u64,
}

impl Encode for SstHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.level.encode_to(buf)?;
        self.seq.encode_to(buf)?;
        self.entry_count.encode_to(buf)?;
        self.min_ts.encode_to(buf)?;
        self.max_ts.encode_to(buf)?;
        self.bloom_offset.encode_to(buf)?;
        self.index_offset.encode_to(buf)?;
        self.data_offset.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for SstHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (magic, n) = <[u8; 4]>::decode_from(&buf[off..])?;
        off += n;
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (level, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (seq, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (entry_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (min_ts, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (max_ts, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (bloom_offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (index_offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (data_offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                magic,
                version,
                level,
                seq,
                entry_count,
                min_ts,
                max_ts,
                bloom_offset,
                index_offset,
                data_offset,
            },
            off,
        ))
    }
}

/// One index entry: where a record lives and how long it is.
#[derive(Debug, Clone, Copy)]
pub struct IndexEntry {
    /// Record timestamp.
    pub timestamp: i64,

    /// Absolute file offset of the encoded record.
    pub data_offset: u64,

    /// Encoded record length in bytes.
    pub encoded_length: u32,
}

impl Encode for IndexEntry {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.timestamp.encode_to(buf)?;
        self.data_offset.encode_to(buf)?;
        self.encoded_length.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for IndexEntry {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (timestamp, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (data_offset, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (encoded_length, n) = u32::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                timestamp,
                data_offset,
                encoded_length,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// SsTable — immutable reader
// ------------------------------------------------------------------------------------------------

/// A memory-mapped, immutable sorted run.
pub struct SsTable {
    path: PathBuf,
    mmap: Mmap,
    header: SstHeader,
    bloom: TimestampBloom,
    index: Vec<IndexEntry>,
    delete_on_drop: AtomicBool,
}

impl SsTable {
    /// Opens an SSTable, validating its header and loading bloom and index.
    ///
    /// # Errors
    ///
    /// - [`SsTableError::Corruption`] for a bad magic, an unsupported
    ///   version, region offsets outside the file, or an index whose size
    ///   disagrees with the header's entry count.
    ///
    /// # Safety
    ///
    /// Uses `unsafe { Mmap::map(...) }` but is memory-safe because the file
    /// is immutable after the atomic rename, the map is read-only, and all
    /// region boundaries are validated before slicing.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SsTableError> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let mmap = unsafe { Mmap::map(&file)? };

        if mmap.len() < SST_HEADER_SIZE {
            return Err(SsTableError::Corruption("file shorter than header".into()));
        }

        let (header, _) = encoding::decode_from_slice::<SstHeader>(&mmap[..SST_HEADER_SIZE])?;

        if header.magic != SST_MAGIC {
            return Err(SsTableError::Corruption("header magic mismatch".into()));
        }
        if header.version > SST_FORMAT_VERSION {
            return Err(SsTableError::Corruption(format!(
                "unsupported format version {}",
                header.version
            )));
        }

        let file_len = mmap.len() as u64;
        if header.bloom_offset != SST_HEADER_SIZE as u64
            || header.bloom_offset > header.index_offset
            || header.index_offset > header.data_offset
            || header.data_offset > file_len
        {
            return Err(SsTableError::Corruption("region offsets out of order".into()));
        }

        let index_bytes = (header.data_offset - header.index_offset) as usize;
        if index_bytes != header.entry_count as usize * SST_INDEX_ENTRY_SIZE {
            return Err(SsTableError::Corruption(
                "index size disagrees with entry count".into(),
            ));
        }

        let bloom = TimestampBloom::from_bytes(
            &mmap[header.bloom_offset as usize..header.index_offset as usize],
        )?;

        let mut index = Vec::with_capacity(header.entry_count as usize);
        let mut off = header.index_offset as usize;
        for _ in 0..header.entry_count {
            let (entry, n) = IndexEntry::decode_from(&mmap[off..])?;
            off += n;
            if entry.data_offset + entry.encoded_length as u64 > file_len {
                return Err(SsTableError::Corruption("index entry out of bounds".into()));
            }
            index.push(entry);
        }

        Ok(Self {
            path,
            mmap,
            header,
            bloom,
            index,
            delete_on_drop: AtomicBool::new(false),
        })
    }

    /// The table's metadata header.
    pub fn header(&self) -> &SstHeader {
        &self.header
    }

    /// LSM level recorded in the header.
    pub fn level(&self) -> u32 {
        self.header.level
    }

    /// Sequence number recorded in the header.
    pub fn seq(&self) -> u64 {
        self.header.seq
    }

    /// Number of stored records.
    pub fn entry_count(&self) -> u64 {
        self.header.entry_count
    }

    /// Smallest stored timestamp.
    pub fn min_ts(&self) -> i64 {
        self.header.min_ts
    }

    /// Largest stored timestamp.
    pub fn max_ts(&self) -> i64 {
        self.header.max_ts
    }

    /// On-disk size in bytes.
    pub fn file_size(&self) -> u64 {
        self.mmap.len() as u64
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Short-circuit membership test: `false` when `ts` is outside the
    /// covered interval or the bloom filter rejects it.
    pub fn might_contain(&self, ts: i64) -> bool {
        if ts < self.header.min_ts || ts > self.header.max_ts {
            return false;
        }
        self.bloom.might_contain(ts)
    }

    /// Point lookup: bloom-reject, binary search, seek and decode.
    pub fn get(&self, ts: i64) -> Result<Option<Record>, SsTableError> {
        if !self.might_contain(ts) {
            return Ok(None);
        }
        match self.index.binary_search_by_key(&ts, |e| e.timestamp) {
            Ok(i) => Ok(Some(self.decode_at(&self.index[i])?)),
            Err(_) => Ok(None),
        }
    }

    /// Ordered records with timestamps in `[start_ts, end_ts]`, inclusive
    /// on both ends.
    pub fn range(&self, start_ts: i64, end_ts: i64) -> Result<Vec<Record>, SsTableError> {
        if start_ts > end_ts || end_ts < self.header.min_ts || start_ts > self.header.max_ts {
            return Ok(Vec::new());
        }
        let lower = self.index.partition_point(|e| e.timestamp < start_ts);
        let mut out = Vec::new();
        for entry in &self.index[lower..] {
            if entry.timestamp > end_ts {
                break;
            }
            out.push(self.decode_at(entry)?);
        }
        Ok(out)
    }

    /// Whether this table's covered interval intersects `[start_ts, end_ts]`.
    pub fn overlaps(&self, start_ts: i64, end_ts: i64) -> bool {
        start_ts <= self.header.max_ts && end_ts >= self.header.min_ts
    }

    /// All records in timestamp order.
    pub fn iter(&self) -> impl Iterator<Item = Result<Record, SsTableError>> + '_ {
        self.index.iter().map(|entry| self.decode_at(entry))
    }

    /// Raw `(timestamp, encoded bytes)` pairs in timestamp order.
    ///
    /// The merge path copies record bytes verbatim between files, so it
    /// never pays an encode/decode round-trip.
    pub(crate) fn raw_entries(&self) -> impl Iterator<Item = (i64, &[u8])> {
        self.index.iter().map(|entry| {
            let start = entry.data_offset as usize;
            let end = start + entry.encoded_length as usize;
            (entry.timestamp, &self.mmap[start..end])
        })
    }

    /// Marks the backing file for deletion when the last handle drops.
    ///
    /// Called by the tree when the table is evicted by compaction; readers
    /// holding an `Arc` keep the file alive until they finish.
    pub fn mark_for_delete(&self) {
        self.delete_on_drop.store(true, Ordering::Release);
    }

    fn decode_at(&self, entry: &IndexEntry) -> Result<Record, SsTableError> {
        let start = entry.data_offset as usize;
        let end = start + entry.encoded_length as usize;
        let (record, _) = encoding::decode_from_slice::<Record>(&self.mmap[start..end])?;
        Ok(record)
    }
}

impl Drop for SsTable {
    fn drop(&mut self) {
        if self.delete_on_drop.load(Ordering::Acquire) {
            if let Err(e) = std::fs::remove_file(&self.path) {
                warn!(path = %self.path.display(), error = %e, "failed to delete evicted SSTable");
            }
        }
    }
}

impl std::fmt::Debug for SsTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SsTable")
            .field("path", &self.path)
            .field("level", &self.header.level)
            .field("seq", &self.header.seq)
            .field("entries", &self.header.entry_count)
            .finish_non_exhaustive()
    }
}
