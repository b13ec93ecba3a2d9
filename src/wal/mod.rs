//! # Write-Ahead Log (WAL)
//!
//! An append-only log of encoded records that protects the active memtable
//! from crash loss.  Every insert is appended here before it is applied in
//! memory; after a successful memtable flush the log is cleared and rebuilt
//! from the records that are still memory-only.
//!
//! # On-disk layout
//!
//! One file per LSM instance, named `wal.log`.  The file is a raw stream of
//! encoded records — no per-record framing beyond the record's own
//! length-prefixed fields:
//!
//! ```text
//! [RECORD_BYTES][RECORD_BYTES]...
//! ```
//!
//! Records are self-describing (see the record wire format), so recovery
//! decodes sequentially from the start.  A truncated trailing record —
//! the signature of a crash mid-append — is discarded with a warning.
//!
//! # Concurrency model
//!
//! - `append` is serialized through an `Arc<Mutex<File>>`.
//! - `recover` runs only at startup, before any `append` is in flight.
//!
//! # Guarantees
//!
//! - **Durability:** `append` hands the bytes to the OS; [`Wal::sync`]
//!   forces them to storage.  The WAL is synced on drop.
//! - **Ordering:** replay yields records in exactly the order they were
//!   appended.

#[cfg(test)]
mod tests;

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
};

use crate::encoding::{self, Encode, EncodingError};
use crate::record::Record;
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

/// File name of the write-ahead log within an LSM data directory.
pub const WAL_FILE_NAME: &str = "wal.log";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by WAL operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WalError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Encoding / decoding error.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// Internal consistency or locking error.
    #[error("Internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// WAL Core
// ------------------------------------------------------------------------------------------------

/// The write-ahead log of one LSM instance.
///
/// See the [module-level documentation](self) for format, concurrency, and
/// guarantees.
#[derive(Debug)]
pub struct Wal {
    /// Thread-safe file handle for append and clear.
    inner_file: Arc<Mutex<File>>,

    /// Path to the WAL file on disk.
    path: PathBuf,
}

impl Wal {
    /// Opens or creates the WAL file at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, WalError> {
        let path_ref = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path_ref)?;

        info!(path = %path_ref.display(), "WAL opened");

        Ok(Self {
            inner_file: Arc::new(Mutex::new(file)),
            path: path_ref.to_path_buf(),
        })
    }

    /// Appends one record.
    ///
    /// Success means the bytes reached the OS; call [`Wal::sync`] to force
    /// them to storage.
    pub fn append(&self, record: &Record) -> Result<(), WalError> {
        let bytes = encoding::encode_to_vec(record)?;
        self.append_encoded(&bytes)
    }

    /// Appends pre-encoded record bytes.
    ///
    /// The put path encodes each record exactly once and shares the bytes
    /// between the WAL append and memtable accounting; this entry point
    /// avoids re-serialization.
    pub fn append_encoded(&self, bytes: &[u8]) -> Result<(), WalError> {
        let mut guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;

        guard.write_all(bytes)?;

        trace!(len = bytes.len(), "WAL record appended");
        Ok(())
    }

    /// Forces all appended bytes to durable storage.
    pub fn sync(&self) -> Result<(), WalError> {
        let guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        guard.sync_all()?;
        Ok(())
    }

    /// Replays the log from the beginning, yielding every intact record in
    /// append order.
    ///
    /// Reading stops at clean EOF or at the first record that cannot be
    /// fully decoded — a truncated tail is the normal signature of a crash
    /// mid-append and is discarded with a warning.
    pub fn recover(&self) -> Result<Vec<Record>, WalError> {
        debug!(path = %self.path.display(), "WAL replay started");

        let buf = {
            let mut guard = self
                .inner_file
                .lock()
                .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
            guard.seek(SeekFrom::Start(0))?;
            let mut buf = Vec::new();
            guard.read_to_end(&mut buf)?;
            buf
        };

        let mut records = Vec::new();
        let mut offset = 0usize;

        while offset < buf.len() {
            match encoding::decode_from_slice::<Record>(&buf[offset..]) {
                Ok((record, consumed)) => {
                    offset += consumed;
                    records.push(record);
                }
                Err(EncodingError::UnexpectedEof { .. }) => {
                    warn!(
                        offset,
                        trailing = buf.len() - offset,
                        "WAL replay discarding truncated trailing record"
                    );
                    break;
                }
                Err(e) => {
                    // Undecodable mid-stream bytes cannot be resynchronized
                    // without framing; everything before this point is intact.
                    warn!(offset, error = %e, "WAL replay stopped at undecodable record");
                    break;
                }
            }
        }

        info!(
            path = %self.path.display(),
            records = records.len(),
            "WAL replay finished"
        );

        Ok(records)
    }

    /// Truncates the log to empty.
    ///
    /// Called exactly after a successful memtable flush.
    pub fn clear(&self) -> Result<(), WalError> {
        let mut guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;

        guard.set_len(0)?;
        guard.seek(SeekFrom::Start(0))?;
        guard.sync_all()?;

        info!(path = %self.path.display(), "WAL cleared");
        Ok(())
    }

    /// Atomically replaces the log contents with the given records.
    ///
    /// Used after a flush: the flushed memtable's records leave the log,
    /// while records that are still memory-only (the active memtable) are
    /// written back so no write exists solely in volatile memory.
    pub fn rewrite(&self, records: &[Record]) -> Result<(), WalError> {
        let mut guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;

        guard.set_len(0)?;
        guard.seek(SeekFrom::Start(0))?;

        let mut buf = Vec::new();
        for record in records {
            record.encode_to(&mut buf)?;
        }
        guard.write_all(&buf)?;
        guard.sync_all()?;

        debug!(
            path = %self.path.display(),
            records = records.len(),
            bytes = buf.len(),
            "WAL rewritten"
        );
        Ok(())
    }

    /// Path of the underlying WAL file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current on-disk file size in bytes.
    pub fn file_size(&self) -> Result<u64, WalError> {
        let guard = self
            .inner_file
            .lock()
            .map_err(|_| WalError::Internal("Mutex poisoned".into()))?;
        Ok(guard.metadata()?.len())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        match self.inner_file.lock() {
            Ok(guard) => {
                if let Err(e) = guard.sync_all() {
                    error!(path = %self.path.display(), error = %e, "WAL sync failed on drop");
                }
            }
            Err(poisoned) => {
                let file = poisoned.into_inner();
                if let Err(e) = file.sync_all() {
                    error!(path = %self.path.display(), error = %e, "WAL sync failed on drop (poisoned lock)");
                } else {
                    warn!(path = %self.path.display(), "WAL recovered and synced after poisoned lock");
                }
            }
        }
    }
}
