//! Compute-state persistence — named engine checkpoints stored in two
//! reserved tables.
//!
//! The **state** table holds the latest state per compute-engine name;
//! the **checkpoint** table holds numbered snapshots.  Both are ordinary
//! LSM-backed tables of the compute-state kind, so persistence rides the
//! same durability machinery as everything else.
//!
//! A [`ComputeState`] serializes to a length-prefixed binary payload
//! (every variable-size field carries its own size, so the deserializer
//! validates truncation) and is stored hex-encoded in the record's
//! `state` field.  Deletion writes a logical tombstone record; physical
//! reclamation happens at compaction like any other overwrite.

use std::{
    collections::BTreeMap,
    sync::{
        Arc,
        atomic::{AtomicI64, Ordering},
    },
    time::{SystemTime, UNIX_EPOCH},
};

use thiserror::Error;
use tracing::{debug, info};

use crate::encoding::{
    self, Decode, Encode, EncodingError, decode_string_map, encode_string_map,
};
use crate::record::{Record, TimeRange};
use crate::table::{TableConfig, TableError, TableManager, TagFilter};

/// Name of the reserved latest-state table.
pub const STATE_TABLE: &str = "__compute_state";

/// Name of the reserved checkpoint table.
pub const CHECKPOINT_TABLE: &str = "__compute_checkpoints";

/// Tag carrying the owning compute engine's name.
const TAG_COMPUTE_NAME: &str = "compute_name";

/// Tag carrying the checkpoint id on checkpoint records.
const TAG_CHECKPOINT_ID: &str = "checkpoint_id";

/// Field carrying the hex-encoded state payload.
const FIELD_STATE: &str = "state";

/// Field marking a logical tombstone.
const FIELD_DELETED: &str = "deleted";

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors returned by compute-state operations.
#[derive(Debug, Error)]
pub enum StateError {
    /// Error reaching the reserved tables.
    #[error("Table error: {0}")]
    Table(#[from] TableError),

    /// Encoding / decoding error in the state payload.
    #[error("Encoding error: {0}")]
    Encoding(#[from] EncodingError),

    /// No state (or checkpoint) stored under the given name.
    #[error("state not found: {0}")]
    NotFound(String),

    /// The stored payload could not be interpreted.
    #[error("Corruption: {0}")]
    Corruption(String),
}

// ------------------------------------------------------------------------------------------------
// ComputeState
// ------------------------------------------------------------------------------------------------

/// A compute engine's checkpointable state.
#[derive(Debug, Clone, PartialEq)]
pub struct ComputeState {
    /// Owning compute engine name.
    pub compute_name: String,

    /// State capture time in microseconds.
    pub timestamp: i64,

    /// Watermark at capture time.
    pub watermark: i64,

    /// Last executed window.
    pub window_id: u64,

    /// Events processed so far.
    pub processed_events: u64,

    /// Opaque operator-internal state bytes.
    pub operator_state: Vec<u8>,

    /// Free-form metadata.
    pub metadata: BTreeMap<String, String>,
}

impl Encode for ComputeState {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.compute_name.encode_to(buf)?;
        self.timestamp.encode_to(buf)?;
        self.watermark.encode_to(buf)?;
        self.window_id.encode_to(buf)?;
        self.processed_events.encode_to(buf)?;
        self.operator_state.encode_to(buf)?;
        encode_string_map(&self.metadata, buf)?;
        Ok(())
    }
}

impl Decode for ComputeState {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (compute_name, mut off) = String::decode_from(buf)?;
        let (timestamp, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (watermark, n) = i64::decode_from(&buf[off..])?;
        off += n;
        let (window_id, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (processed_events, n) = u64::decode_from(&buf[off..])?;
        off += n;
        let (operator_state, n) = Vec::<u8>::decode_from(&buf[off..])?;
        off += n;
        let (metadata, n) = decode_string_map(&buf[off..])?;
        off += n;
        Ok((
            Self {
                compute_name,
                timestamp,
                watermark,
                window_id,
                processed_events,
                operator_state,
                metadata,
            },
            off,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// ComputeStateManager
// ------------------------------------------------------------------------------------------------

/// Persists named compute-engine checkpoints via the reserved tables.
pub struct ComputeStateManager {
    tables: Arc<TableManager>,

    /// Issues strictly increasing record timestamps so that two saves in
    /// the same microsecond never overwrite each other.
    clock: AtomicI64,
}

impl ComputeStateManager {
    /// Creates the manager, ensuring both reserved tables exist.
    pub fn new(tables: Arc<TableManager>) -> Result<Self, StateError> {
        let config = TableConfig::default();
        for name in [STATE_TABLE, CHECKPOINT_TABLE] {
            match tables.create_compute_state_table(name, &config) {
                Ok(_) | Err(TableError::AlreadyExists(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        info!("compute state manager ready");
        Ok(Self {
            tables,
            clock: AtomicI64::new(now_micros()),
        })
    }

    /// Saves (replaces) the latest state of `state.compute_name`.
    pub fn save_state(&self, state: &ComputeState) -> Result<(), StateError> {
        let table = self.tables.get_compute_state_table(STATE_TABLE)?;
        table.insert(self.state_record(state, None)?)?;
        debug!(name = %state.compute_name, window_id = state.window_id, "state saved");
        Ok(())
    }

    /// Loads the latest state of `compute_name`.
    pub fn load_state(&self, compute_name: &str) -> Result<ComputeState, StateError> {
        let table = self.tables.get_compute_state_table(STATE_TABLE)?;
        let latest = self.latest_record(&table, compute_name, None)?;
        match latest {
            Some(record) if record.field(FIELD_DELETED) != Some("true") => {
                Self::decode_state(&record)
            }
            _ => Err(StateError::NotFound(compute_name.to_string())),
        }
    }

    /// Whether a live state exists for `compute_name`.
    pub fn has_state(&self, compute_name: &str) -> bool {
        self.load_state(compute_name).is_ok()
    }

    /// Logically deletes the state of `compute_name`.
    ///
    /// Writes a tombstone record; real reclamation happens at compaction.
    pub fn delete_state(&self, compute_name: &str) -> Result<(), StateError> {
        let table = self.tables.get_compute_state_table(STATE_TABLE)?;
        table.insert(self.tombstone_record(compute_name, None))?;
        Ok(())
    }

    /// Snapshots the latest state of `compute_name` under checkpoint `id`.
    pub fn create_checkpoint(&self, compute_name: &str, id: u64) -> Result<(), StateError> {
        let state = self.load_state(compute_name)?;
        let table = self.tables.get_compute_state_table(CHECKPOINT_TABLE)?;
        table.insert(self.state_record(&state, Some(id))?)?;
        info!(name = compute_name, id, "checkpoint created");
        Ok(())
    }

    /// Restores the state stored under checkpoint `id`.
    pub fn restore_checkpoint(&self, compute_name: &str, id: u64) -> Result<ComputeState, StateError> {
        let table = self.tables.get_compute_state_table(CHECKPOINT_TABLE)?;
        let latest = self.latest_record(&table, compute_name, Some(id))?;
        match latest {
            Some(record) if record.field(FIELD_DELETED) != Some("true") => {
                Self::decode_state(&record)
            }
            _ => Err(StateError::NotFound(format!("{compute_name}#{id}"))),
        }
    }

    /// Checkpoint ids stored for `compute_name`, ascending, tombstoned
    /// ids excluded.
    pub fn list_checkpoints(&self, compute_name: &str) -> Result<Vec<u64>, StateError> {
        let table = self.tables.get_compute_state_table(CHECKPOINT_TABLE)?;
        let mut filter = TagFilter::new();
        filter.insert(TAG_COMPUTE_NAME.into(), compute_name.into());
        let records = table.query(TimeRange::all(), Some(&filter))?;

        // Per checkpoint id, the newest record decides liveness.
        let mut newest: BTreeMap<u64, (i64, bool)> = BTreeMap::new();
        for record in &records {
            let Some(id) = record
                .tag(TAG_CHECKPOINT_ID)
                .and_then(|raw| raw.parse::<u64>().ok())
            else {
                continue;
            };
            let deleted = record.field(FIELD_DELETED) == Some("true");
            match newest.get(&id) {
                Some((ts, _)) if *ts >= record.timestamp => {}
                _ => {
                    newest.insert(id, (record.timestamp, deleted));
                }
            }
        }
        Ok(newest
            .into_iter()
            .filter(|(_, (_, deleted))| !deleted)
            .map(|(id, _)| id)
            .collect())
    }

    /// Logically deletes checkpoint `id` of `compute_name`.
    pub fn delete_checkpoint(&self, compute_name: &str, id: u64) -> Result<(), StateError> {
        let table = self.tables.get_compute_state_table(CHECKPOINT_TABLE)?;
        table.insert(self.tombstone_record(compute_name, Some(id)))?;
        Ok(())
    }

    /// Forces both reserved tables to flush to L0 immediately.
    pub fn persist_state(&self) -> Result<(), StateError> {
        self.tables.get_compute_state_table(STATE_TABLE)?.flush()?;
        self.tables
            .get_compute_state_table(CHECKPOINT_TABLE)?
            .flush()?;
        Ok(())
    }

    // --------------------------------------------------------------------------------------------
    // Internals
    // --------------------------------------------------------------------------------------------

    fn state_record(
        &self,
        state: &ComputeState,
        checkpoint_id: Option<u64>,
    ) -> Result<Record, StateError> {
        let payload = encoding::encode_to_vec(state)?;
        let mut record = Record::scalar(self.next_ts(), state.processed_events as f64)
            .with_tag(TAG_COMPUTE_NAME, state.compute_name.clone())
            .with_field(FIELD_STATE, to_hex(&payload));
        if let Some(id) = checkpoint_id {
            record = record.with_tag(TAG_CHECKPOINT_ID, id.to_string());
        }
        Ok(record)
    }

    fn tombstone_record(&self, compute_name: &str, checkpoint_id: Option<u64>) -> Record {
        let mut record = Record::scalar(self.next_ts(), 0.0)
            .with_tag(TAG_COMPUTE_NAME, compute_name)
            .with_field(FIELD_DELETED, "true");
        if let Some(id) = checkpoint_id {
            record = record.with_tag(TAG_CHECKPOINT_ID, id.to_string());
        }
        record
    }

    /// Newest record for a name (and optionally a checkpoint id).
    fn latest_record(
        &self,
        table: &crate::table::StreamTable,
        compute_name: &str,
        checkpoint_id: Option<u64>,
    ) -> Result<Option<Record>, StateError> {
        let mut filter = TagFilter::new();
        filter.insert(TAG_COMPUTE_NAME.into(), compute_name.into());
        if let Some(id) = checkpoint_id {
            filter.insert(TAG_CHECKPOINT_ID.into(), id.to_string());
        }
        let records = table.query(TimeRange::all(), Some(&filter))?;
        Ok(records.into_iter().next_back())
    }

    fn decode_state(record: &Record) -> Result<ComputeState, StateError> {
        let Some(hex) = record.field(FIELD_STATE) else {
            return Err(StateError::Corruption("record missing state field".into()));
        };
        let payload = from_hex(hex)
            .ok_or_else(|| StateError::Corruption("state field is not valid hex".into()))?;
        let (state, _) = encoding::decode_from_slice::<ComputeState>(&payload)?;
        Ok(state)
    }

    /// Strictly increasing record timestamps across this manager.
    fn next_ts(&self) -> i64 {
        let now = now_micros();
        self.clock
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                Some(last.max(now - 1).saturating_add(1))
            })
            .unwrap_or(now)
    }
}

impl std::fmt::Debug for ComputeStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeStateManager").finish()
    }
}

// ------------------------------------------------------------------------------------------------
// Helpers
// ------------------------------------------------------------------------------------------------

fn now_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_micros() as i64)
        .unwrap_or(0)
}

fn to_hex(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{byte:02x}"));
    }
    out
}

fn from_hex(hex: &str) -> Option<Vec<u8>> {
    if hex.len() % 2 != 0 {
        return None;
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(hex.get(i..i + 2)?, 16).ok())
        .collect()
}
