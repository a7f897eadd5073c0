//! State types for tracking sync progress
//!
//! These types are serialized to JSON and persisted between runs.
//! The store is a flat map of named entries; each entry remembers the
//! scope it belongs to so scopes can be reset independently.

use crate::error::Result;
use crate::types::{Cursor, Mode, RecordType, Timestamp};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Independently resettable partition of persisted state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    /// Identity and account-wide settings; survives mode resets
    Account,
    /// Live mode cursors, counters and flags
    Live,
    /// Historical mode cursors, counters and flags
    Historical,
    /// Store bookkeeping (schema version); never reset
    Meta,
}

impl Scope {
    /// Scopes cleared by a full reset
    pub const RESETTABLE: [Scope; 3] = [Scope::Account, Scope::Live, Scope::Historical];

    /// The scope owned by a mode
    pub fn for_mode(mode: Mode) -> Self {
        match mode {
            Mode::Live => Scope::Live,
            Mode::Historical => Scope::Historical,
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Scope::Account => "account",
            Scope::Live => "live",
            Scope::Historical => "historical",
            Scope::Meta => "meta",
        };
        f.write_str(name)
    }
}

/// A typed persisted value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum StoredValue {
    Bool(bool),
    Int(i64),
    Text(String),
    Time(Timestamp),
    /// Base64-encoded cursor bytes
    Cursor(String),
}

impl StoredValue {
    /// Boolean view
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            StoredValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Integer view
    pub fn as_int(&self) -> Option<i64> {
        match self {
            StoredValue::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Text view
    pub fn as_text(&self) -> Option<&str> {
        match self {
            StoredValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Time view
    pub fn as_time(&self) -> Option<Timestamp> {
        match self {
            StoredValue::Time(t) => Some(*t),
            _ => None,
        }
    }

    /// Decoded cursor, if this is a cursor value
    pub fn as_cursor(&self) -> Option<Result<Cursor>> {
        match self {
            StoredValue::Cursor(encoded) => Some(Cursor::from_base64(encoded)),
            _ => None,
        }
    }
}

/// One persisted entry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Scope this entry is cleared with
    pub scope: Scope,
    /// The value
    pub value: StoredValue,
}

/// On-disk state document
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PersistedState {
    /// All entries by key name
    #[serde(default)]
    pub entries: BTreeMap<String, Entry>,
}

impl PersistedState {
    /// Create an empty state
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a value by key
    pub fn value(&self, key: &StateKey) -> Option<&StoredValue> {
        self.entries.get(key.name()).map(|e| &e.value)
    }

    /// Insert or replace a value
    pub fn insert(&mut self, key: &StateKey, value: StoredValue) {
        self.entries.insert(
            key.name().to_string(),
            Entry {
                scope: key.scope(),
                value,
            },
        );
    }

    /// Remove a value
    pub fn remove(&mut self, key: &StateKey) -> Option<Entry> {
        self.entries.remove(key.name())
    }

    /// Remove every entry of a scope
    pub fn clear_scope(&mut self, scope: Scope) {
        self.entries.retain(|_, e| e.scope != scope);
    }

    /// Entries of one scope
    pub fn scope_entries(&self, scope: Scope) -> BTreeMap<String, Entry> {
        self.entries
            .iter()
            .filter(|(_, e)| e.scope == scope)
            .map(|(k, e)| (k.clone(), e.clone()))
            .collect()
    }
}

// ============================================================================
// Keys
// ============================================================================

/// Name of a persisted entry together with its scope
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StateKey {
    scope: Scope,
    name: String,
}

impl StateKey {
    /// Account-wide key
    pub fn account(name: impl Into<String>) -> Self {
        Self {
            scope: Scope::Account,
            name: name.into(),
        }
    }

    /// Store bookkeeping key
    pub fn meta(name: impl Into<String>) -> Self {
        Self {
            scope: Scope::Meta,
            name: name.into(),
        }
    }

    /// Mode-global key such as `historicalTierIndex`
    pub fn mode(mode: Mode, suffix: &str) -> Self {
        Self {
            scope: Scope::for_mode(mode),
            name: format!("{}{}", mode.as_str(), suffix),
        }
    }

    /// Per-(mode, type) key, `{mode}-{type}-{field}`
    pub fn record_type(mode: Mode, record_type: &RecordType, field: TypeField) -> Self {
        Self {
            scope: Scope::for_mode(mode),
            name: format!("{}-{}-{}", mode.as_str(), record_type, field.as_str()),
        }
    }

    /// Every key of one (mode, type)
    pub fn all_for_type(mode: Mode, record_type: &RecordType) -> Vec<Self> {
        TypeField::ALL
            .iter()
            .map(|&field| Self::record_type(mode, record_type, field))
            .collect()
    }

    /// Key name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Key scope
    pub fn scope(&self) -> Scope {
        self.scope
    }
}

/// Fields stored per (mode, type)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeField {
    Cursor,
    TotalSamplesCount,
    TotalSamplesUploadCount,
    TotalDeletesUploadCount,
    LastSuccessfulUploadTime,
    EarliestUploadedTime,
    LatestUploadedTime,
    EarliestRecordTime,
    LatestRecordTime,
    HistoricalStartDate,
    HistoricalEndDate,
    HistoricalTotalDays,
    HistoricalCurrentDay,
}

impl TypeField {
    /// Every per-type field
    pub const ALL: [TypeField; 13] = [
        TypeField::Cursor,
        TypeField::TotalSamplesCount,
        TypeField::TotalSamplesUploadCount,
        TypeField::TotalDeletesUploadCount,
        TypeField::LastSuccessfulUploadTime,
        TypeField::EarliestUploadedTime,
        TypeField::LatestUploadedTime,
        TypeField::EarliestRecordTime,
        TypeField::LatestRecordTime,
        TypeField::HistoricalStartDate,
        TypeField::HistoricalEndDate,
        TypeField::HistoricalTotalDays,
        TypeField::HistoricalCurrentDay,
    ];

    /// Field name inside the key
    pub fn as_str(self) -> &'static str {
        match self {
            TypeField::Cursor => "cursor",
            TypeField::TotalSamplesCount => "totalSamplesCount",
            TypeField::TotalSamplesUploadCount => "totalSamplesUploadCount",
            TypeField::TotalDeletesUploadCount => "totalDeletesUploadCount",
            TypeField::LastSuccessfulUploadTime => "lastSuccessfulUploadTime",
            TypeField::EarliestUploadedTime => "earliestUploadedSampleTime",
            TypeField::LatestUploadedTime => "latestUploadedSampleTime",
            TypeField::EarliestRecordTime => "earliestRecordTime",
            TypeField::LatestRecordTime => "latestRecordTime",
            TypeField::HistoricalStartDate => "historicalStartDate",
            TypeField::HistoricalEndDate => "historicalEndDate",
            TypeField::HistoricalTotalDays => "historicalTotalDays",
            TypeField::HistoricalCurrentDay => "historicalCurrentDay",
        }
    }
}

/// Mode-global fields
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeField {
    FenceDate,
    TierIndex,
    HasPendingUploads,
    IsResumable,
    CountingComplete,
    TotalSamplesCount,
    TotalSamplesUploadCount,
    TotalDeletesUploadCount,
    LastSuccessfulUploadTime,
    EarliestUploadedTime,
    LatestUploadedTime,
    EarliestRecordTime,
    LatestRecordTime,
    TotalDays,
    CurrentDay,
}

impl ModeField {
    /// Suffix appended to the mode name
    pub fn as_str(self) -> &'static str {
        match self {
            ModeField::FenceDate => "FenceDate",
            ModeField::TierIndex => "TierIndex",
            ModeField::HasPendingUploads => "HasPendingUploads",
            ModeField::IsResumable => "IsResumable",
            ModeField::CountingComplete => "CountingComplete",
            ModeField::TotalSamplesCount => "TotalSamplesCount",
            ModeField::TotalSamplesUploadCount => "TotalSamplesUploadCount",
            ModeField::TotalDeletesUploadCount => "TotalDeletesUploadCount",
            ModeField::LastSuccessfulUploadTime => "LastSuccessfulUploadTime",
            ModeField::EarliestUploadedTime => "EarliestUploadedSampleTime",
            ModeField::LatestUploadedTime => "LatestUploadedSampleTime",
            ModeField::EarliestRecordTime => "EarliestRecordTime",
            ModeField::LatestRecordTime => "LatestRecordTime",
            ModeField::TotalDays => "TotalDays",
            ModeField::CurrentDay => "CurrentDay",
        }
    }

    /// Key for this field in `mode`
    pub fn key(self, mode: Mode) -> StateKey {
        StateKey::mode(mode, self.as_str())
    }
}

/// Well-known keys outside the per-mode families
pub mod keys {
    use super::StateKey;

    /// Current on-disk layout version
    pub const SCHEMA_VERSION: i64 = 1;

    /// Layout version entry
    pub fn schema_version() -> StateKey {
        StateKey::meta("schemaVersion")
    }

    /// Account the stored progress belongs to
    pub fn account_id() -> StateKey {
        StateKey::account("accountId")
    }

    /// Whether the host has enabled syncing
    pub fn interface_enabled() -> StateKey {
        StateKey::account("interfaceEnabled")
    }
}
