//! # Timestamp Bloom Filter
//!
//! A serializable bloom filter over record timestamps, carried by every
//! SSTable so that point lookups can reject absent keys without touching
//! the data region.
//!
//! Backed by the [`bloomfilter`] crate, which combines two independent
//! sip hashes with the hash-function index to derive bit positions and
//! persists its hasher keys alongside the bit array — a filter checks
//! identically before and after a serialize/deserialize round-trip.
//!
//! # Guarantees
//!
//! - **No false negatives:** every added timestamp answers `true`.
//! - **Bounded false positives:** sized for [`BLOOM_FP_RATE`] at the
//!   expected key count (well inside the 3% budget the read path assumes).


use std::io::{self, Read, Write};

use bloomfilter::Bloom;
use thiserror::Error;

/// Target false-positive rate used when sizing a new filter.
pub const BLOOM_FP_RATE: f64 = 0.01;

/// Errors returned by bloom filter construction and (de)serialization.
#[derive(Debug, Error)]
pub enum BloomError {
    /// Underlying I/O error while reading or writing filter bytes.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The serialized byte payload could not be interpreted as a filter.
    #[error("invalid bloom filter payload: {0}")]
    InvalidPayload(String),
}

/// A bloom filter keyed by `i64` timestamps.
pub struct TimestampBloom {
    inner: Bloom<i64>,
}

impl TimestampBloom {
    /// Creates a filter sized for `expected_keys` at [`BLOOM_FP_RATE`].
    ///
    /// A zero expectation is clamped to one key so empty memtables still
    /// produce a structurally valid filter.
    pub fn new(expected_keys: usize) -> Result<Self, BloomError> {
        let inner = Bloom::new_for_fp_rate(expected_keys.max(1), BLOOM_FP_RATE)
            .map_err(|e| BloomError::InvalidPayload(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Adds a timestamp to the filter.
    pub fn add(&mut self, ts: i64) {
        self.inner.set(&ts);
    }

    /// Whether `ts` *might* be present.  `false` is definitive.
    pub fn might_contain(&self, ts: i64) -> bool {
        self.inner.check(&ts)
    }

    /// The serialized filter bytes (bit array plus hasher keys).
    pub fn as_bytes(&self) -> &[u8] {
        self.inner.as_slice()
    }

    /// Reconstructs a filter from bytes produced by [`Self::as_bytes`].
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, BloomError> {
        let inner =
            Bloom::from_slice(bytes).map_err(|e| BloomError::InvalidPayload(e.to_string()))?;
        Ok(Self { inner })
    }

    /// Writes the filter as `[u32 len LE][bytes]`.
    pub fn serialize(&self, writer: &mut impl Write) -> Result<(), BloomError> {
        let bytes = self.as_bytes();
        let len = u32::try_from(bytes.len())
            .map_err(|_| BloomError::InvalidPayload("filter exceeds u32 length".into()))?;
        writer.write_all(&len.to_le_bytes())?;
        writer.write_all(bytes)?;
        Ok(())
    }

    /// Reads a filter previously written by [`Self::serialize`].
    pub fn deserialize(reader: &mut impl Read) -> Result<Self, BloomError> {
        let mut len_bytes = [0u8; 4];
        reader.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        let mut bytes = vec![0u8; len];
        reader.read_exact(&mut bytes)?;
        Self::from_bytes(&bytes)
    }
}

impl std::fmt::Debug for TimestampBloom {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TimestampBloom")
            .field("len_bytes", &self.inner.as_slice().len())
            .finish()
    }
}
