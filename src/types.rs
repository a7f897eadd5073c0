//! Common types used throughout recsync
//!
//! This module contains shared type definitions, type aliases,
//! and the record/tier vocabulary used across multiple modules.

use base64::Engine as _;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

// ============================================================================
// Type Aliases
// ============================================================================

/// JSON value type (re-exported from serde_json)
pub type JsonValue = serde_json::Value;

/// JSON object type
pub type JsonObject = serde_json::Map<String, JsonValue>;

/// Point in time used for record timestamps and fences
pub type Timestamp = DateTime<Utc>;

// ============================================================================
// Sync Mode
// ============================================================================

/// Which slice of history a coordinator uploads
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Tail new records from the fence forward
    Live,
    /// Backfill records older than the fence, newest first
    Historical,
}

impl Mode {
    /// Both modes, live first
    pub const ALL: [Mode; 2] = [Mode::Live, Mode::Historical];

    /// Lowercase name used in state keys and logs
    pub fn as_str(self) -> &'static str {
        match self {
            Mode::Live => "live",
            Mode::Historical => "historical",
        }
    }

    /// The opposite mode
    pub fn other(self) -> Mode {
        match self {
            Mode::Live => Mode::Historical,
            Mode::Historical => Mode::Live,
        }
    }

    /// Order in which records of this mode are uploaded
    pub fn sort_order(self) -> SortOrder {
        match self {
            Mode::Live => SortOrder::Ascending,
            Mode::Historical => SortOrder::Descending,
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Mode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "live" | "current" => Ok(Mode::Live),
            "historical" | "history" => Ok(Mode::Historical),
            other => Err(Error::invalid_value("mode", format!("unknown mode '{other}'"))),
        }
    }
}

// ============================================================================
// Sort Order
// ============================================================================

/// Time ordering of a merged upload stream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SortOrder {
    /// Oldest first
    Ascending,
    /// Newest first
    Descending,
}

impl SortOrder {
    /// True when `a` must be uploaded strictly before `b`
    pub fn precedes(self, a: Timestamp, b: Timestamp) -> bool {
        match self {
            SortOrder::Ascending => a < b,
            SortOrder::Descending => a > b,
        }
    }

    /// Comparator for sorting a buffer into upload order
    pub fn compare(self, a: &Timestamp, b: &Timestamp) -> std::cmp::Ordering {
        match self {
            SortOrder::Ascending => a.cmp(b),
            SortOrder::Descending => b.cmp(a),
        }
    }
}

// ============================================================================
// Records
// ============================================================================

/// Name of a category of records (glucose, insulin, workouts, ...)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordType(String);

impl RecordType {
    /// Create a record type from its name
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// The type name
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordType {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

impl From<String> for RecordType {
    fn from(name: String) -> Self {
        Self(name)
    }
}

/// A single typed field value carried by a record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FieldValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Time(Timestamp),
    Text(String),
}

impl FieldValue {
    /// JSON form of the value, or `None` when it has no JSON encoding
    pub fn to_json(&self) -> Option<JsonValue> {
        match self {
            FieldValue::Bool(b) => Some(JsonValue::Bool(*b)),
            FieldValue::Integer(i) => Some(JsonValue::from(*i)),
            FieldValue::Float(f) => serde_json::Number::from_f64(*f).map(JsonValue::Number),
            FieldValue::Time(t) => Some(JsonValue::String(t.to_rfc3339())),
            FieldValue::Text(s) => Some(JsonValue::String(s.clone())),
        }
    }
}

/// A time-stamped item read from the data source
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Source-assigned unique identifier
    pub id: String,

    /// Record category
    #[serde(rename = "type")]
    pub record_type: RecordType,

    /// Timestamp used for fences and upload ordering
    pub time: Timestamp,

    /// Type-specific payload
    #[serde(default)]
    pub fields: BTreeMap<String, FieldValue>,
}

impl Record {
    /// Create a record without fields
    pub fn new(id: impl Into<String>, record_type: impl Into<RecordType>, time: Timestamp) -> Self {
        Self {
            id: id.into(),
            record_type: record_type.into(),
            time,
            fields: BTreeMap::new(),
        }
    }

    /// Add a field
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: FieldValue) -> Self {
        self.fields.insert(name.into(), value);
        self
    }
}

/// Notice that a previously seen record was removed at the source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletionMarker {
    /// Identifier of the removed record
    pub id: String,

    /// Category of the removed record
    #[serde(rename = "type")]
    pub record_type: RecordType,
}

impl DeletionMarker {
    /// Create a deletion marker
    pub fn new(id: impl Into<String>, record_type: impl Into<RecordType>) -> Self {
        Self {
            id: id.into(),
            record_type: record_type.into(),
        }
    }
}

// ============================================================================
// Cursor
// ============================================================================

/// Opaque resumption token produced by the data source
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Cursor(Vec<u8>);

impl Cursor {
    /// Wrap raw cursor bytes
    pub fn new(bytes: impl Into<Vec<u8>>) -> Self {
        Self(bytes.into())
    }

    /// Raw cursor bytes
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Encode for persistence
    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.0)
    }

    /// Decode a persisted cursor
    pub fn from_base64(encoded: &str) -> Result<Self> {
        base64::engine::general_purpose::STANDARD
            .decode(encoded)
            .map(Self)
            .map_err(|e| Error::state(format!("corrupt cursor: {e}")))
    }
}

// ============================================================================
// Tiers
// ============================================================================

/// One rung of the batch-size ladder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tier {
    /// Maximum records per upload
    pub batch_limit: usize,
    /// Maximum deletions per upload
    pub delete_limit: usize,
    /// Per-upload request timeout
    pub timeout: Duration,
}

/// Ordered tiers, index 0 being the largest batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierTable {
    tiers: Vec<Tier>,
}

impl TierTable {
    /// Build a table from parallel columns, which must be non-empty and of equal length
    pub fn from_columns(
        batch_limits: &[usize],
        delete_limits: &[usize],
        timeouts_secs: &[u64],
    ) -> Result<Self> {
        if batch_limits.is_empty() {
            return Err(Error::invalid_value("tiers", "at least one tier is required"));
        }
        if batch_limits.len() != delete_limits.len() || batch_limits.len() != timeouts_secs.len() {
            return Err(Error::invalid_value(
                "tiers",
                format!(
                    "column lengths differ (batch {}, delete {}, timeout {})",
                    batch_limits.len(),
                    delete_limits.len(),
                    timeouts_secs.len()
                ),
            ));
        }
        if batch_limits.iter().any(|&l| l == 0) {
            return Err(Error::invalid_value("tiers", "batch limits must be positive"));
        }
        if delete_limits.iter().any(|&l| l == 0) {
            return Err(Error::invalid_value("tiers", "delete limits must be positive"));
        }

        let tiers = batch_limits
            .iter()
            .zip(delete_limits)
            .zip(timeouts_secs)
            .map(|((&batch_limit, &delete_limit), &secs)| Tier {
                batch_limit,
                delete_limit,
                timeout: Duration::from_secs(secs),
            })
            .collect();
        Ok(Self { tiers })
    }

    /// Tier at `index`, clamped to the last tier
    pub fn get(&self, index: usize) -> Tier {
        self.tiers[self.clamp(index)]
    }

    /// Clamp an index into range
    pub fn clamp(&self, index: usize) -> usize {
        index.min(self.max_index())
    }

    /// Index of the smallest tier
    pub fn max_index(&self) -> usize {
        self.tiers.len() - 1
    }

    /// Number of tiers
    pub fn len(&self) -> usize {
        self.tiers.len()
    }

    /// Always false; a table has at least one tier
    pub fn is_empty(&self) -> bool {
        self.tiers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_mode_serde() {
        let mode: Mode = serde_json::from_str("\"historical\"").unwrap();
        assert_eq!(mode, Mode::Historical);

        let json = serde_json::to_string(&Mode::Live).unwrap();
        assert_eq!(json, "\"live\"");
    }

    #[test]
    fn test_mode_from_str() {
        assert_eq!("Live".parse::<Mode>().unwrap(), Mode::Live);
        assert_eq!("historical".parse::<Mode>().unwrap(), Mode::Historical);
        assert!("sideways".parse::<Mode>().is_err());
    }

    #[test]
    fn test_sort_order() {
        let early = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let late = Utc.with_ymd_and_hms(2024, 1, 2, 0, 0, 0).unwrap();

        assert!(Mode::Live.sort_order().precedes(early, late));
        assert!(Mode::Historical.sort_order().precedes(late, early));
        assert!(!SortOrder::Ascending.precedes(early, early));
    }

    #[test]
    fn test_field_value_non_finite() {
        assert_eq!(FieldValue::Float(f64::NAN).to_json(), None);
        assert_eq!(FieldValue::Float(f64::INFINITY).to_json(), None);
        assert_eq!(
            FieldValue::Float(5.5).to_json(),
            Some(serde_json::json!(5.5))
        );
    }

    #[test]
    fn test_record_deserialize() {
        let record: Record = serde_json::from_value(serde_json::json!({
            "id": "r1",
            "type": "glucose",
            "time": "2024-03-01T10:00:00Z",
            "fields": {"value": 5.4, "units": "mmol/L", "calibrated": true}
        }))
        .unwrap();

        assert_eq!(record.record_type.as_str(), "glucose");
        assert_eq!(record.fields["value"], FieldValue::Float(5.4));
        assert_eq!(record.fields["calibrated"], FieldValue::Bool(true));
        assert_eq!(
            record.fields["units"],
            FieldValue::Text("mmol/L".to_string())
        );
    }

    #[test]
    fn test_cursor_base64() {
        let cursor = Cursor::new(vec![0u8, 1, 2, 255]);
        let decoded = Cursor::from_base64(&cursor.to_base64()).unwrap();
        assert_eq!(decoded, cursor);
        assert!(Cursor::from_base64("not base64!!").is_err());
    }

    #[test]
    fn test_tier_table() {
        let table = TierTable::from_columns(&[500, 100, 20], &[500, 100, 20], &[60, 120, 240])
            .unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(table.max_index(), 2);
        assert_eq!(table.get(1).batch_limit, 100);
        assert_eq!(table.get(9).timeout, Duration::from_secs(240));
    }

    #[test]
    fn test_tier_table_rejects_bad_columns() {
        assert!(TierTable::from_columns(&[], &[], &[]).is_err());
        assert!(TierTable::from_columns(&[10, 5], &[10], &[60, 60]).is_err());
        assert!(TierTable::from_columns(&[0], &[10], &[60]).is_err());
        assert!(TierTable::from_columns(&[10, 5], &[10, 0], &[60, 60]).is_err());
    }
}
