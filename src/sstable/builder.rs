//! SSTable construction — flush a memtable or merge existing tables into
//! one new immutable file.
//!
//! # Construction sequence
//!
//! 1. Open `<path>.tmp` and reserve the fixed header region.
//! 2. Write the bloom filter (every timestamp is known up front).
//! 3. Reserve the index region (entry count is known up front).
//! 4. Append each encoded record, collecting its index entry.
//! 5. Seek back and write the index, then the header.
//! 6. Sync and atomically rename `<path>.tmp` → `<path>`.
//!
//! A crash at any point leaves only a `.tmp` file, which startup scanning
//! removes; a file carrying the final name is always complete.
//!
//! # Merge semantics
//!
//! [`build_from_sstables`] performs a k-way merge over the inputs' ordered
//! records.  On equal timestamps the record from the input with the latest
//! sequence number wins.  The output's header sequence is the **largest
//! input sequence**, so newest-wins comparisons against other runs keep
//! working after the merge; the output file name stays unique because it
//! carries the target level.

use std::{
    fs::{self, File, OpenOptions},
    io::{Seek, SeekFrom, Write},
    path::Path,
    sync::Arc,
};

use tracing::{debug, info};

use crate::bloom::TimestampBloom;
use crate::encoding::{self, Encode};
use crate::memtable::MemTable;

use super::{IndexEntry, SST_HEADER_SIZE, SST_INDEX_ENTRY_SIZE, SsTable, SsTableError, SstHeader};
use super::{SST_FORMAT_VERSION, SST_MAGIC};

/// Builds an SSTable at `path` from a sealed memtable.
///
/// Records land in ascending timestamp order (the memtable's native
/// order).  The file is written under a `.tmp` name and renamed into
/// place only when complete.
pub fn build_from_memtable(
    path: impl AsRef<Path>,
    level: u32,
    seq: u64,
    memtable: &MemTable,
) -> Result<(), SsTableError> {
    let encoded: Vec<(i64, Vec<u8>)> = memtable
        .iter()
        .map(|(record, _)| Ok((record.timestamp, encoding::encode_to_vec(record)?)))
        .collect::<Result<_, SsTableError>>()?;

    write_table(path.as_ref(), level, seq, &encoded)?;

    info!(
        path = %path.as_ref().display(),
        level,
        seq,
        entries = encoded.len(),
        "SSTable built from memtable"
    );
    Ok(())
}

/// Merges `inputs` into one SSTable at `path` on the given level.
///
/// Inputs may overlap arbitrarily (the L0 case).  On equal timestamps the
/// record from the highest-sequence input wins; record bytes are copied
/// verbatim, never re-encoded.
pub fn build_from_sstables(
    path: impl AsRef<Path>,
    level: u32,
    inputs: &[Arc<SsTable>],
) -> Result<(), SsTableError> {
    if inputs.is_empty() {
        return Err(SsTableError::Internal("merge requires at least one input".into()));
    }

    // Visit inputs in ascending sequence order so that a later (newer)
    // input overwrites an earlier one on equal timestamps.
    let mut ordered: Vec<&Arc<SsTable>> = inputs.iter().collect();
    ordered.sort_by_key(|t| t.seq());

    let mut merged: std::collections::BTreeMap<i64, Vec<u8>> = std::collections::BTreeMap::new();
    for table in &ordered {
        for (ts, bytes) in table.raw_entries() {
            merged.insert(ts, bytes.to_vec());
        }
    }

    let out_seq = ordered
        .last()
        .map(|t| t.seq())
        .ok_or_else(|| SsTableError::Internal("merge inputs vanished".into()))?;

    let encoded: Vec<(i64, Vec<u8>)> = merged.into_iter().collect();
    write_table(path.as_ref(), level, out_seq, &encoded)?;

    debug!(
        path = %path.as_ref().display(),
        level,
        seq = out_seq,
        inputs = inputs.len(),
        entries = encoded.len(),
        "SSTable built from merge"
    );
    Ok(())
}

/// Shared writer: lays the file out as header / bloom / index / data and
/// publishes it with an atomic rename.
fn write_table(
    final_path: &Path,
    level: u32,
    seq: u64,
    encoded: &[(i64, Vec<u8>)],
) -> Result<(), SsTableError> {
    let tmp_path = final_path.with_extension("tmp");
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(&tmp_path)?;

    // 1. Reserve the header region.
    file.write_all(&[0u8; SST_HEADER_SIZE])?;

    // 2. Bloom filter — all timestamps are known up front.
    let mut bloom = TimestampBloom::new(encoded.len())?;
    for (ts, _) in encoded {
        bloom.add(*ts);
    }
    let bloom_offset = SST_HEADER_SIZE as u64;
    let bloom_bytes = bloom.as_bytes();
    file.write_all(bloom_bytes)?;

    // 3. Reserve the index region.
    let index_offset = bloom_offset + bloom_bytes.len() as u64;
    let index_len = encoded.len() * SST_INDEX_ENTRY_SIZE;
    file.write_all(&vec![0u8; index_len])?;

    // 4. Data region — append records, collecting index entries.
    let data_offset = index_offset + index_len as u64;
    let mut index_entries = Vec::with_capacity(encoded.len());
    let mut cursor = data_offset;
    for (ts, bytes) in encoded {
        file.write_all(bytes)?;
        index_entries.push(IndexEntry {
            timestamp: *ts,
            data_offset: cursor,
            encoded_length: bytes.len() as u32,
        });
        cursor += bytes.len() as u64;
    }

    // 5. Seek back: index, then header.
    let mut index_buf = Vec::with_capacity(index_len);
    for entry in &index_entries {
        entry.encode_to(&mut index_buf)?;
    }
    file.seek(SeekFrom::Start(index_offset))?;
    file.write_all(&index_buf)?;

    let header = SstHeader {
        magic: SST_MAGIC,
        version: SST_FORMAT_VERSION,
        level,
        seq,
        entry_count: encoded.len() as u64,
        min_ts: encoded.first().map(|(ts, _)| *ts).unwrap_or(0),
        max_ts: encoded.last().map(|(ts, _)| *ts).unwrap_or(-1),
        bloom_offset,
        index_offset,
        data_offset,
    };
    let header_buf = encoding::encode_to_vec(&header)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&header_buf)?;

    // 6. Publish atomically.
    sync_and_rename(file, &tmp_path, final_path)
}

fn sync_and_rename(file: File, tmp_path: &Path, final_path: &Path) -> Result<(), SsTableError> {
    file.sync_all()?;
    drop(file);
    fs::rename(tmp_path, final_path)?;
    Ok(())
}
