//! # Table Checkpoints
//!
//! Point-in-time snapshots of a table's records, written as standalone
//! files next to the table's LSM directory.  Checkpoints are a coarse
//! export/restore facility: they do not participate in the read path.
//!
//! # Checkpoint file layout
//!
//! One fixed header followed by length-prefixed records (all integers
//! little-endian):
//!
//! ```text
//! u32  magic            // "CHKP"
//! u32  format version
//! u64  entry count
//! u64  checkpoint id
//! i64  min_ts
//! i64  max_ts
//! 3 x u64 reserved      // future index/metadata extension
//! per record: [u32 len][record bytes]
//! ```
//!
//! The per-record length prefix lets the reader validate truncation
//! before decoding.
//!
//! # The `checkpoints.meta` sidecar
//!
//! Live checkpoints are enumerated in `checkpoints.meta` as
//! `(id, timestamp, count, path)` entries.  Each entry is framed
//! `[u32 len][entry bytes][u32 crc32]`; entries failing the checksum are
//! skipped with a warning, so one torn write never hides the remaining
//! checkpoints.

#[cfg(test)]
mod tests;

use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Write},
    path::PathBuf,
    time::{SystemTime, UNIX_EPOCH},
};

use crc32fast::Hasher as Crc32;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::encoding::{self, Decode, Encode, EncodingError};
use crate::record::Record;

/// Magic constant at offset 0 of a checkpoint file (`"CHKP"` as LE u32).
pub const CHECKPOINT_MAGIC: u32 = u32::from_le_bytes(*b"CHKP");

/// Current checkpoint format version.
pub const CHECKPOINT_VERSION: u32 = 1;

/// File name of the checkpoint catalogue within a checkpoint directory.
pub const CHECKPOINT_META_FILE: &str = "checkpoints.meta";

const U32_SIZE: usize = std::mem::size_of::<u32>();

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by checkpoint operations.
#[derive(Debug, Error)]
pub enum CheckpointError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Invalid magic, unsupported version, or truncated payload.
    #[error("Corruption: {0}")]
    Corruption(String),

    /// The requested checkpoint id is not in the catalogue.
    #[error("checkpoint {0} not found")]
    NotFound(u64),
}

// ------------------------------------------------------------------------------------------------
// Header / catalogue structures
// ------------------------------------------------------------------------------------------------

/// Fixed header of a checkpoint file.
#[derive(Debug, Clone)]
pub struct CheckpointHeader {
    /// Magic constant ([`CHECKPOINT_MAGIC`]).
    pub magic: u32,

    /// Format version.
    pub version: u32,

    /// Number of records that follow.
    pub entry_count: u64,

    /// Checkpoint id.
    pub checkpoint_id: u64,

    /// Smallest stored timestamp.
    pub min_ts: i64,

    /// Largest stored timestamp.
    pub max_ts: i64,

    /// Reserved offsets for a future index/metadata extension.
    pub reserved: [u64; 3],
}

impl Encode for CheckpointHeader {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.magic.encode_to(buf)?;
        self.version.encode_to(buf)?;
        self.entry_count.encode_to(buf)?;
        self.checkpoint_id.encode_to(buf)?;
        self.min_ts.encode_to(buf)?;
        self.max_ts.encode_to(buf)?;
        for r in &self.reserved {
            r.encode_to(buf)?;
        }
        Ok(())
    }
}

impl Decode for CheckpointHeader {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (magic, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (version, n) = u32::decode_from(&buf[off..])?;
        off += n;
        let (entry_count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (checkpoint_id, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (min_ts, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (max_ts, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let mut reserved = [0u64; 3];
        for r in &mut reserved {
            let (v, n) = u64::decode_from(&buf[off..])?;
            off += n;
            *r = v;
        }
        Ok((
            Self {
                magic,
                version,
                entry_count,
                checkpoint_id,
                min_ts,
                max_ts,
                reserved,
            },
            off,
        ))
    }
}

/// One catalogue entry in `checkpoints.meta`.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointMeta {
    /// Checkpoint id.
    pub id: u64,

    /// Creation time in nanoseconds since the UNIX epoch.
    pub timestamp: u64,

    /// Record count of the checkpoint.
    pub count: u64,

    /// Path of the checkpoint file.
    pub path: PathBuf,
}

impl Encode for CheckpointMeta {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.id.encode_to(buf)?;
        self.timestamp.encode_to(buf)?;
        self.count.encode_to(buf)?;
        self.path.encode_to(buf)?;
        Ok(())
    }
}

impl Decode for CheckpointMeta {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let mut off = 0;
        let (id, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (timestamp, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (count, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (path, n) = PathBuf::decode_from(&buf[off..])?;
        off += n;
        Ok((
            Self {
                id,
                timestamp,
                count,
                path,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// Checkpoint store
// ------------------------------------------------------------------------------------------------

/// Manages the checkpoints of one table under a dedicated directory.
#[derive(Debug)]
pub struct CheckpointStore {
    dir: PathBuf,
}

impl CheckpointStore {
    /// Opens (or creates) a checkpoint directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self, CheckpointError> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    /// Writes a checkpoint of `records` under the given id and registers
    /// it in the catalogue.  An existing checkpoint with the same id is
    /// replaced.
    pub fn create(&self, id: u64, records: &[Record]) -> Result<CheckpointMeta, CheckpointError> {
        let path = self.dir.join(format!("checkpoint-{id:06}.ckp"));
        let tmp_path = path.with_extension("tmp");

        let header = CheckpointHeader {
            magic: CHECKPOINT_MAGIC,
            version: CHECKPOINT_VERSION,
            entry_count: records.len() as u64,
            checkpoint_id: id,
            min_ts: records.first().map(|r| r.timestamp).unwrap_or(0),
            max_ts: records.last().map(|r| r.timestamp).unwrap_or(-1),
            reserved: [0; 3],
        };

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&encoding::encode_to_vec(&header)?)?;
        for record in records {
            let bytes = encoding::encode_to_vec(record)?;
            file.write_all(&(bytes.len() as u32).to_le_bytes())?;
            file.write_all(&bytes)?;
        }
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &path)?;

        let meta = CheckpointMeta {
            id,
            timestamp: now_nanos(),
            count: records.len() as u64,
            path,
        };

        let mut catalogue = self.list()?;
        catalogue.retain(|m| m.id != id);
        catalogue.push(meta.clone());
        self.write_catalogue(&catalogue)?;

        info!(id, records = records.len(), dir = %self.dir.display(), "checkpoint created");
        Ok(meta)
    }

    /// Loads the records of checkpoint `id`.
    pub fn load(&self, id: u64) -> Result<Vec<Record>, CheckpointError> {
        let meta = self
            .list()?
            .into_iter()
            .find(|m| m.id == id)
            .ok_or(CheckpointError::NotFound(id))?;

        let mut file = File::open(&meta.path)?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;

        let (header, mut off) = CheckpointHeader::decode_from(&buf)?;
        if header.magic != CHECKPOINT_MAGIC {
            return Err(CheckpointError::Corruption("header magic mismatch".into()));
        }
        if header.version > CHECKPOINT_VERSION {
            return Err(CheckpointError::Corruption(format!(
                "unsupported checkpoint version {}",
                header.version
            )));
        }

        let mut records = Vec::with_capacity(header.entry_count as usize);
        for _ in 0..header.entry_count {
            if buf.len() < off + U32_SIZE {
                return Err(CheckpointError::Corruption("truncated record length".into()));
            }
            let len_bytes: [u8; U32_SIZE] = buf[off..off + U32_SIZE]
                .try_into()
                .map_err(|_| CheckpointError::Corruption("short length prefix".into()))?;
            let len = u32::from_le_bytes(len_bytes) as usize;
            off += U32_SIZE;
            if buf.len() < off + len {
                return Err(CheckpointError::Corruption("truncated record payload".into()));
            }
            let (record, consumed) = encoding::decode_from_slice::<Record>(&buf[off..off + len])?;
            if consumed != len {
                return Err(CheckpointError::Corruption(
                    "record length prefix disagrees with payload".into(),
                ));
            }
            off += len;
            records.push(record);
        }

        debug!(id, records = records.len(), "checkpoint loaded");
        Ok(records)
    }

    /// Enumerates live checkpoints from the catalogue, skipping entries
    /// that fail their checksum.
    pub fn list(&self) -> Result<Vec<CheckpointMeta>, CheckpointError> {
        let meta_path = self.dir.join(CHECKPOINT_META_FILE);
        let buf = match fs::read(&meta_path) {
            Ok(buf) => buf,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        let mut off = 0usize;
        while off + U32_SIZE <= buf.len() {
            let len_bytes: [u8; U32_SIZE] = match buf[off..off + U32_SIZE].try_into() {
                Ok(b) => b,
                Err(_) => break,
            };
            let len = u32::from_le_bytes(len_bytes) as usize;
            let entry_start = off + U32_SIZE;
            let crc_start = entry_start + len;
            if crc_start + U32_SIZE > buf.len() {
                warn!(offset = off, "truncated catalogue entry; stopping scan");
                break;
            }
            let entry_bytes = &buf[entry_start..crc_start];
            let stored_crc = u32::from_le_bytes(match buf[crc_start..crc_start + U32_SIZE].try_into()
            {
                Ok(b) => b,
                Err(_) => break,
            });
            off = crc_start + U32_SIZE;

            let mut hasher = Crc32::new();
            hasher.update(&len_bytes);
            hasher.update(entry_bytes);
            if hasher.finalize() != stored_crc {
                warn!(offset = off, "catalogue entry failed checksum; skipping");
                continue;
            }

            match CheckpointMeta::decode_from(entry_bytes) {
                Ok((meta, _)) => entries.push(meta),
                Err(e) => warn!(offset = off, error = %e, "undecodable catalogue entry; skipping"),
            }
        }
        Ok(entries)
    }

    /// Removes checkpoint `id`: its file and its catalogue entry.
    pub fn delete(&self, id: u64) -> Result<(), CheckpointError> {
        let mut catalogue = self.list()?;
        let Some(pos) = catalogue.iter().position(|m| m.id == id) else {
            return Err(CheckpointError::NotFound(id));
        };
        let meta = catalogue.remove(pos);
        self.write_catalogue(&catalogue)?;
        if let Err(e) = fs::remove_file(&meta.path) {
            warn!(id, error = %e, "checkpoint file removal failed");
        }
        Ok(())
    }

    fn write_catalogue(&self, entries: &[CheckpointMeta]) -> Result<(), CheckpointError> {
        let meta_path = self.dir.join(CHECKPOINT_META_FILE);
        let tmp_path = meta_path.with_extension("tmp");

        let mut buf = Vec::new();
        for entry in entries {
            let bytes = encoding::encode_to_vec(entry)?;
            let len_bytes = (bytes.len() as u32).to_le_bytes();
            let mut hasher = Crc32::new();
            hasher.update(&len_bytes);
            hasher.update(&bytes);
            buf.extend_from_slice(&len_bytes);
            buf.extend_from_slice(&bytes);
            buf.extend_from_slice(&hasher.finalize().to_le_bytes());
        }

        let mut file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp_path)?;
        file.write_all(&buf)?;
        file.sync_all()?;
        drop(file);
        fs::rename(&tmp_path, &meta_path)?;
        Ok(())
    }
}

fn now_nanos() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}
