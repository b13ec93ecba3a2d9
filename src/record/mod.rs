//! # Record Model
//!
//! The universal record every subsystem speaks: a timestamped measurement
//! with a scalar-or-vector value, an equality-searchable tag map, and a
//! free-form field map.  Records are **immutable once appended** — the
//! storage layers copy them around but never mutate them.
//!
//! ## On-disk layout
//!
//! Records serialize to a length-prefixed, self-describing layout shared by
//! the WAL, SSTable data regions, and checkpoint files (all integers
//! little-endian):
//!
//! ```text
//! i64  timestamp
//! u8   value_kind            // 0 = scalar, 1 = vector
//! if scalar: f64 value
//! if vector: u64 count, count * f64
//! u32  tag_count
//!   per tag:   u32 klen, klen bytes, u32 vlen, vlen bytes
//! u32  field_count
//!   per field: u32 klen, klen bytes, u32 vlen, vlen bytes
//! ```
//!
//! The encoder writes exactly the bytes the decoder expects; decoding fails
//! cleanly on truncation via [`EncodingError::UnexpectedEof`] and never
//! reads past the buffer.
//!
//! ## Time ranges
//!
//! [`TimeRange`] is half-open `[start_us, end_us)` and is the unit windows
//! and queries are described in.  The one deliberate exception: the
//! stream-table query path treats its range as inclusive on both ends, and
//! says so at that call site.


use std::collections::BTreeMap;

use crate::encoding::{
    self, Decode, Encode, EncodingError, decode_string_map, encode_string_map,
};

// ------------------------------------------------------------------------------------------------
// Value
// ------------------------------------------------------------------------------------------------

/// Value kind discriminant for scalar values in the wire format.
const VALUE_KIND_SCALAR: u8 = 0;

/// Value kind discriminant for vector values in the wire format.
const VALUE_KIND_VECTOR: u8 = 1;

/// The measurement payload of a record: a single 64-bit float or an
/// ordered sequence of them, never both.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// A single measurement.
    Scalar(f64),

    /// An ordered sequence of measurements (e.g. an embedding or a
    /// multi-channel sample).
    Vector(Vec<f64>),
}

impl Value {
    /// Returns the scalar payload, or `None` for vectors.
    pub fn as_scalar(&self) -> Option<f64> {
        match self {
            Self::Scalar(v) => Some(*v),
            Self::Vector(_) => None,
        }
    }

    /// Returns the vector payload, or `None` for scalars.
    pub fn as_vector(&self) -> Option<&[f64]> {
        match self {
            Self::Scalar(_) => None,
            Self::Vector(v) => Some(v),
        }
    }

    /// Encoded size in bytes, including the kind discriminant.
    fn encoded_len(&self) -> usize {
        match self {
            Self::Scalar(_) => 1 + 8,
            Self::Vector(v) => 1 + 8 + v.len() * 8,
        }
    }
}

impl Encode for Value {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        match self {
            Self::Scalar(v) => {
                VALUE_KIND_SCALAR.encode_to(buf)?;
                v.encode_to(buf)?;
            }
            Self::Vector(values) => {
                VALUE_KIND_VECTOR.encode_to(buf)?;
                (values.len() as u64).encode_to(buf)?;
                for v in values {
                    v.encode_to(buf)?;
                }
            }
        }
        Ok(())
    }
}

impl Decode for Value {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (kind, mut offset) = u8::decode_from(buf)?;
        match kind {
            VALUE_KIND_SCALAR => {
                let (v, n) = f64::decode_from(&buf[offset..])?;
                offset += n;
                Ok((Self::Scalar(v), offset))
            }
            VALUE_KIND_VECTOR => {
                let (count, n) = u64::decode_from(&buf[offset..])?;
                offset += n;
                if count > encoding::MAX_VEC_ELEMENTS as u64 {
                    return Err(EncodingError::LengthOverflow(format!(
                        "vector value count {count} exceeds MAX_VEC_ELEMENTS"
                    )));
                }
                let mut values = Vec::with_capacity(count as usize);
                for _ in 0..count {
                    let (v, n) = f64::decode_from(&buf[offset..])?;
                    offset += n;
                    values.push(v);
                }
                Ok((Self::Vector(values), offset))
            }
            other => Err(EncodingError::InvalidTag {
                tag: other as u32,
                type_name: "Value",
            }),
        }
    }
}

// ------------------------------------------------------------------------------------------------
// Record
// ------------------------------------------------------------------------------------------------

/// A single immutable time-series record.
///
/// Timestamps are 64-bit signed microseconds since an arbitrary epoch;
/// monotonicity is **not** required of callers — out-of-order ingestion is
/// a first-class workload.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// Event timestamp in microseconds.
    pub timestamp: i64,

    /// Scalar or vector measurement.
    pub value: Value,

    /// Equality-searchable tag map.  Small cardinality per record.
    pub tags: BTreeMap<String, String>,

    /// Free-form field map.  Not indexed.
    pub fields: BTreeMap<String, String>,
}

impl Record {
    /// Creates a record carrying a single scalar measurement.
    pub fn scalar(timestamp: i64, value: f64) -> Self {
        Self {
            timestamp,
            value: Value::Scalar(value),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Creates a record carrying a vector measurement.
    pub fn vector(timestamp: i64, values: Vec<f64>) -> Self {
        Self {
            timestamp,
            value: Value::Vector(values),
            tags: BTreeMap::new(),
            fields: BTreeMap::new(),
        }
    }

    /// Builder-style tag attachment.
    pub fn with_tag(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.tags.insert(key.into(), value.into());
        self
    }

    /// Builder-style field attachment.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    /// Looks up a tag value.
    pub fn tag(&self, key: &str) -> Option<&str> {
        self.tags.get(key).map(String::as_str)
    }

    /// Looks up a field value.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.fields.get(key).map(String::as_str)
    }

    /// Exact encoded size in bytes, computed without serializing.
    ///
    /// The put path encodes each record once and reuses the byte length
    /// for memtable accounting; this is the same number, available to
    /// callers that have not encoded yet.
    pub fn encoded_len(&self) -> usize {
        let maps_len = |map: &BTreeMap<String, String>| {
            4 + map
                .iter()
                .map(|(k, v)| 4 + k.len() + 4 + v.len())
                .sum::<usize>()
        };
        8 + self.value.encoded_len() + maps_len(&self.tags) + maps_len(&self.fields)
    }
}

impl Encode for Record {
    fn encode_to(&self, buf: &mut Vec<u8>) -> Result<(), EncodingError> {
        self.timestamp.encode_to(buf)?;
        self.value.encode_to(buf)?;
        encode_string_map(&self.tags, buf)?;
        encode_string_map(&self.fields, buf)?;
        Ok(())
    }
}

impl Decode for Record {
    fn decode_from(buf: &[u8]) -> Result<(Self, usize), EncodingError> {
        let (timestamp, mut offset) = i64::decode_from(buf)?;
        let (value, n) = Value::decode_from(&buf[offset..])?;
        offset += n;
        let (tags, n) = decode_string_map(&buf[offset..])?;
        offset += n;
        let (fields, n) = decode_string_map(&buf[offset..])?;
        offset += n;
        Ok((
            Self {
                timestamp,
                value,
                tags,
                fields,
            },
            offset,
        ))
    }
}

// ------------------------------------------------------------------------------------------------
// TimeRange
// ------------------------------------------------------------------------------------------------

/// A half-open time interval `[start_us, end_us)` in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    /// Inclusive lower bound.
    pub start_us: i64,

    /// Exclusive upper bound.
    pub end_us: i64,
}

impl TimeRange {
    /// Constructs a range without validation; use [`TimeRange::is_valid`]
    /// or let the consuming operation reject degenerate ranges.
    pub fn new(start_us: i64, end_us: i64) -> Self {
        Self { start_us, end_us }
    }

    /// The full representable range.
    pub fn all() -> Self {
        Self {
            start_us: i64::MIN,
            end_us: i64::MAX,
        }
    }

    /// A range is valid when it is non-degenerate.
    pub fn is_valid(&self) -> bool {
        self.start_us < self.end_us
    }

    /// Whether `ts` falls inside the half-open interval.
    pub fn contains(&self, ts: i64) -> bool {
        ts >= self.start_us && ts < self.end_us
    }

    /// Interval length in microseconds (saturating).
    pub fn len_us(&self) -> i64 {
        self.end_us.saturating_sub(self.start_us)
    }

    /// Whether two half-open ranges overlap.
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.start_us < other.end_us && other.start_us < self.end_us
    }
}

impl std::fmt::Display for TimeRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}, {})", self.start_us, self.end_us)
    }
}
