//! Reader state and step types

use crate::source::{CountPage, CountQuery, DateRange, IncrementalQuery};
use crate::types::{Record, Timestamp};

/// Why a reader stopped
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReaderStop {
    /// The last read buffered at least one item, or the buffer was already full
    WithResults,
    /// The last read returned nothing
    WithNoResults,
    /// The query failed
    Error(String),
    /// The coordinator stopped the reader
    TurnedOff,
}

/// Lifecycle of a reader
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReaderState {
    #[default]
    Idle,
    /// Historical pre-pass in progress
    Counting,
    /// A query is outstanding
    Reading,
    Stopped(ReaderStop),
}

/// What the coordinator should do after asking a reader to read
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStep {
    /// Run this query and hand the result to `apply_read_result`
    Query(IncrementalQuery),
    /// The reader stopped without querying
    Stopped(ReaderStop),
    /// A read or count is already in progress
    Busy,
}

/// What the coordinator should do after a counting page
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CountStep {
    /// Fetch the next page
    Next(CountQuery),
    /// Counting is complete
    Finished,
    /// Counting failed
    Failed(String),
}

/// Result of a counting worker: one page, plus the full range on the first page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CountOutcome {
    /// Earliest and latest record of the type, fetched with the first page
    pub range: Option<DateRange>,
    /// The page itself
    pub page: CountPage,
}

/// Counting accumulated across pages
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct CountProgress {
    pub page_size: usize,
    pub total: u64,
    pub earliest: Option<Timestamp>,
    pub latest: Option<Timestamp>,
    pub range: Option<DateRange>,
}

/// What the current round has uploaded for one type
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoundStats {
    /// Records confirmed uploaded
    pub records: u64,
    /// Deletions confirmed uploaded
    pub deletes: u64,
    /// Earliest uploaded record time
    pub earliest: Option<Timestamp>,
    /// Latest uploaded record time
    pub latest: Option<Timestamp>,
}

impl RoundStats {
    /// Account for one uploaded record
    pub fn note_record(&mut self, record: &Record) {
        self.records += 1;
        self.earliest = Some(self.earliest.map_or(record.time, |t| t.min(record.time)));
        self.latest = Some(self.latest.map_or(record.time, |t| t.max(record.time)));
    }

    /// True when nothing was uploaded
    pub fn is_empty(&self) -> bool {
        self.records == 0 && self.deletes == 0
    }
}
