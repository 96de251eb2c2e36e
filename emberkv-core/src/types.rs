//! Core types for EmberKV

use bytes::Bytes;
use std::cmp::Ordering;
use std::fmt;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering as AtomicOrdering};

/// Write timestamp: wall-clock milliseconds scaled by [`TICKS_PER_MILLI`]
/// plus a process-local tie-breaker.
pub type Timestamp = i64;

/// Tie-breaker ticks available within one millisecond
pub const TICKS_PER_MILLI: i64 = 1_000_000;

static SEQUENCE: AtomicU64 = AtomicU64::new(0);
static LAST_TIMESTAMP: AtomicI64 = AtomicI64::new(0);

/// Generate the next write timestamp.
///
/// Strictly increasing within the process, even if the wall clock stalls
/// or steps backwards.
pub fn next_timestamp() -> Timestamp {
    let millis = chrono::Utc::now().timestamp_millis().max(0);
    let tick = (SEQUENCE.fetch_add(1, AtomicOrdering::Relaxed) % TICKS_PER_MILLI as u64) as i64;
    let candidate = millis.saturating_mul(TICKS_PER_MILLI) + tick;

    let previous = LAST_TIMESTAMP
        .fetch_update(AtomicOrdering::SeqCst, AtomicOrdering::SeqCst, |last| {
            Some(candidate.max(last + 1))
        })
        .unwrap_or_else(|last| last);
    candidate.max(previous + 1)
}

/// Versioned value stored under a key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Value {
    /// Live value written at `timestamp`
    Present { timestamp: Timestamp, data: Bytes },
    /// Deletion marker written at `timestamp`
    Tombstone { timestamp: Timestamp },
    /// Lookup sentinel for "never written"; never persisted
    Absent,
}

impl Value {
    /// Create a present value stamped now
    pub fn present(data: impl Into<Bytes>) -> Self {
        Value::Present {
            timestamp: next_timestamp(),
            data: data.into(),
        }
    }

    /// Create a tombstone stamped now
    pub fn tombstone() -> Self {
        Value::Tombstone {
            timestamp: next_timestamp(),
        }
    }

    /// Timestamp of the value, `None` for [`Value::Absent`]
    pub fn timestamp(&self) -> Option<Timestamp> {
        match self {
            Value::Present { timestamp, .. } | Value::Tombstone { timestamp } => Some(*timestamp),
            Value::Absent => None,
        }
    }

    /// Payload bytes of a present value
    pub fn data(&self) -> Option<&Bytes> {
        match self {
            Value::Present { data, .. } => Some(data),
            _ => None,
        }
    }

    /// Payload size; tombstones and absent values count as zero
    pub fn payload_len(&self) -> usize {
        self.data().map_or(0, |d| d.len())
    }

    pub fn is_tombstone(&self) -> bool {
        matches!(self, Value::Tombstone { .. })
    }

    pub fn is_absent(&self) -> bool {
        matches!(self, Value::Absent)
    }

    /// Pick the value with the highest timestamp, ignoring absent ones.
    ///
    /// Returns [`Value::Absent`] when no candidate carries a version.
    pub fn newest<I>(values: I) -> Value
    where
        I: IntoIterator<Item = Value>,
    {
        values
            .into_iter()
            .filter(|v| !v.is_absent())
            .max_by_key(|v| v.timestamp())
            .unwrap_or(Value::Absent)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Present { timestamp, data } => {
                write!(f, "PRESENT, ts={}, len={}", timestamp, data.len())
            }
            Value::Tombstone { timestamp } => write!(f, "REMOVED, ts={}", timestamp),
            Value::Absent => write!(f, "ABSENT"),
        }
    }
}

/// A key with one version of its value; the unit of storage and merging
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Cell {
    pub key: Bytes,
    pub value: Value,
}

impl Cell {
    /// Create a new cell
    pub fn new(key: impl Into<Bytes>, value: Value) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

impl Ord for Cell {
    /// Key ascending, then newest version first
    fn cmp(&self, other: &Self) -> Ordering {
        self.key
            .cmp(&other.key)
            .then_with(|| other.value.timestamp().cmp(&self.value.timestamp()))
    }
}

impl PartialOrd for Cell {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
