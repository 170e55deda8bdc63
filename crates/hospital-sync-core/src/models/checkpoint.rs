//! Pull checkpoints: the `(updated_at, id)` high-water mark.

use std::cmp::Ordering;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// `updated_at` of the beginning-of-time checkpoint.
pub const EPOCH_UPDATED_AT: &str = "1970-01-01T00:00:00.000Z";

/// Compare two server timestamps as instants, falling back to text order
/// when either side is not RFC 3339.
pub fn compare_timestamps(a: &str, b: &str) -> Ordering {
    match (parse_instant(a), parse_instant(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Identifier assigned by the remote authority. Sent as either a number or a string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RecordId {
    Int(i64),
    Text(String),
}

impl RecordId {
    /// Interpret a stored document id, preferring the numeric form.
    pub fn from_document_id(id: &str) -> Self {
        id.parse::<i64>()
            .map(RecordId::Int)
            .unwrap_or_else(|_| RecordId::Text(id.to_string()))
    }
}

impl Ord for RecordId {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (RecordId::Int(a), RecordId::Int(b)) => a.cmp(b),
            (RecordId::Text(a), RecordId::Text(b)) => a.cmp(b),
            (RecordId::Int(_), RecordId::Text(_)) => Ordering::Less,
            (RecordId::Text(_), RecordId::Int(_)) => Ordering::Greater,
        }
    }
}

impl PartialOrd for RecordId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for RecordId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RecordId::Int(id) => write!(f, "{}", id),
            RecordId::Text(id) => f.write_str(id),
        }
    }
}

impl From<i64> for RecordId {
    fn from(id: i64) -> Self {
        RecordId::Int(id)
    }
}

impl From<i32> for RecordId {
    fn from(id: i32) -> Self {
        RecordId::Int(i64::from(id))
    }
}

impl From<String> for RecordId {
    fn from(id: String) -> Self {
        RecordId::Text(id)
    }
}

impl From<&str> for RecordId {
    fn from(id: &str) -> Self {
        RecordId::Text(id.to_string())
    }
}

/// High-water mark of documents already pulled for one replication identifier.
///
/// Ordered by `updated_at` (as an instant), then `id`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub updated_at: String,
    pub id: RecordId,
}

impl Checkpoint {
    pub fn new(updated_at: impl Into<String>, id: impl Into<RecordId>) -> Self {
        Self {
            updated_at: updated_at.into(),
            id: id.into(),
        }
    }

    /// The sentinel used before anything has been pulled.
    pub fn beginning() -> Self {
        Self::new(EPOCH_UPDATED_AT, 0)
    }

    pub fn is_beginning(&self) -> bool {
        *self == Self::beginning()
    }

    /// True when `self` lies strictly after `other`.
    pub fn is_ahead_of(&self, other: &Checkpoint) -> bool {
        self > other
    }
}

impl Default for Checkpoint {
    fn default() -> Self {
        Self::beginning()
    }
}

impl Ord for Checkpoint {
    fn cmp(&self, other: &Self) -> Ordering {
        compare_timestamps(&self.updated_at, &other.updated_at)
            .then_with(|| self.id.cmp(&other.id))
    }
}

impl PartialOrd for Checkpoint {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for Checkpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.updated_at, self.id)
    }
}
