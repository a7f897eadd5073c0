//! Query and result types for the data source

use crate::types::{Cursor, DeletionMarker, Record, RecordType, SortOrder, Timestamp};
use serde::{Deserialize, Serialize};

/// Time bounds a mode reads within; `None` leaves that side open.
///
/// The start bound is inclusive and the end bound exclusive, so a live
/// start fence and an equal historical end fence never both match a record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FenceWindow {
    /// Inclusive lower bound
    pub start: Option<Timestamp>,
    /// Exclusive upper bound
    pub end: Option<Timestamp>,
}

impl FenceWindow {
    /// Unbounded window
    pub fn open() -> Self {
        Self::default()
    }

    /// Everything at or after `start`
    pub fn from(start: Timestamp) -> Self {
        Self {
            start: Some(start),
            end: None,
        }
    }

    /// Everything before `end`
    pub fn until(end: Timestamp) -> Self {
        Self {
            start: None,
            end: Some(end),
        }
    }

    /// Whether `time` falls inside the window
    pub fn contains(&self, time: Timestamp) -> bool {
        self.start.map_or(true, |s| time >= s) && self.end.map_or(true, |e| time < e)
    }
}

/// One incremental read
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncrementalQuery {
    /// Type to read
    pub record_type: RecordType,
    /// Resume point; `None` reads from the beginning
    pub cursor: Option<Cursor>,
    /// Time bounds
    pub window: FenceWindow,
    /// Maximum records plus deletions returned
    pub limit: usize,
    /// Ascending reads follow insertion order and report deletions;
    /// descending reads walk record time newest first and skip them
    pub order: SortOrder,
}

/// Result of an incremental read
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryResult {
    /// New records inside the window
    pub records: Vec<Record>,
    /// Records removed since the cursor
    pub deletions: Vec<DeletionMarker>,
    /// Cursor after this read; `None` when nothing was consumed
    pub cursor: Option<Cursor>,
}

impl QueryResult {
    /// Number of items returned
    pub fn len(&self) -> usize {
        self.records.len() + self.deletions.len()
    }

    /// True when nothing was returned
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// One page of a counting pass
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountQuery {
    /// Type to count
    pub record_type: RecordType,
    /// Counting cursor, separate from the read cursor
    pub cursor: Option<Cursor>,
    /// Time bounds
    pub window: FenceWindow,
    /// Items scanned per page
    pub page_size: usize,
}

/// Result of one counting page
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CountPage {
    /// Records inside the window on this page
    pub count: u64,
    /// Earliest counted record time
    pub earliest: Option<Timestamp>,
    /// Latest counted record time
    pub latest: Option<Timestamp>,
    /// Cursor for the next page
    pub cursor: Option<Cursor>,
    /// True when the source has nothing beyond this page
    pub done: bool,
}

/// Earliest and latest record times of a type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub earliest: Timestamp,
    pub latest: Timestamp,
}

/// Outcome of an access request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AccessStatus {
    Granted,
    Denied,
}
