//! Per-type incremental reader

use super::types::{
    CountOutcome, CountProgress, CountStep, ReadStep, ReaderState, ReaderStop, RoundStats,
};
use crate::error::Result;
use crate::source::{CountQuery, FenceWindow, IncrementalQuery, QueryResult};
use crate::state::{StateKey, StateStore, TypeField};
use crate::stats::day_span;
use crate::types::{Cursor, DeletionMarker, Mode, Record, RecordType, Timestamp};
use std::collections::VecDeque;
use tracing::{debug, info, warn};

/// Reads one record type for one mode.
///
/// The reader never awaits a query itself. It hands out query values, the
/// coordinator runs them, and the results come back through
/// [`TypeReader::apply_read_result`]. Only [`TypeReader::commit_round`]
/// moves the persisted cursor.
#[derive(Debug)]
pub struct TypeReader {
    mode: Mode,
    record_type: RecordType,
    store: StateStore,
    state: ReaderState,
    committed_cursor: Option<Cursor>,
    pending_cursor: Option<Cursor>,
    records: VecDeque<Record>,
    deletions: VecDeque<DeletionMarker>,
    read_limit: usize,
    window: FenceWindow,
    last_read_full: bool,
    change_pending: bool,
    count: CountProgress,
    count_cursor: Option<Cursor>,
    round: RoundStats,
}

impl TypeReader {
    /// Create a reader; call [`TypeReader::load`] before the first read
    pub fn new(mode: Mode, record_type: RecordType, store: StateStore) -> Self {
        Self {
            mode,
            record_type,
            store,
            state: ReaderState::Idle,
            committed_cursor: None,
            pending_cursor: None,
            records: VecDeque::new(),
            deletions: VecDeque::new(),
            read_limit: 1,
            window: FenceWindow::open(),
            last_read_full: false,
            change_pending: false,
            count: CountProgress::default(),
            count_cursor: None,
            round: RoundStats::default(),
        }
    }

    /// Load the committed cursor from the store
    pub async fn load(&mut self) -> Result<()> {
        self.committed_cursor = self.store.get_cursor(&self.key(TypeField::Cursor)).await?;
        self.pending_cursor = self.committed_cursor.clone();
        Ok(())
    }

    fn key(&self, field: TypeField) -> StateKey {
        StateKey::record_type(self.mode, &self.record_type, field)
    }

    // ========================================================================
    // Accessors
    // ========================================================================

    /// Type this reader serves
    pub fn record_type(&self) -> &RecordType {
        &self.record_type
    }

    /// Mode this reader serves
    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Current state
    pub fn state(&self) -> &ReaderState {
        &self.state
    }

    /// A query is outstanding
    pub fn is_reading(&self) -> bool {
        self.state == ReaderState::Reading
    }

    /// The counting pre-pass is running
    pub fn is_counting(&self) -> bool {
        self.state == ReaderState::Counting
    }

    /// Cursor as last persisted
    pub fn committed_cursor(&self) -> Option<&Cursor> {
        self.committed_cursor.as_ref()
    }

    /// Cursor after the latest read of this round
    pub fn pending_cursor(&self) -> Option<&Cursor> {
        self.pending_cursor.as_ref()
    }

    /// Records waiting in the buffer
    pub fn buffered_records(&self) -> usize {
        self.records.len()
    }

    /// Records or deletions waiting in the buffers
    pub fn has_buffered(&self) -> bool {
        !self.records.is_empty() || !self.deletions.is_empty()
    }

    /// What this round has uploaded so far
    pub fn round_stats(&self) -> &RoundStats {
        &self.round
    }

    /// Set the per-read limit
    pub fn set_read_limit(&mut self, limit: usize) {
        self.read_limit = limit.max(1);
    }

    /// Per-read limit
    pub fn read_limit(&self) -> usize {
        self.read_limit
    }

    /// Set the fence window
    pub fn set_window(&mut self, window: FenceWindow) {
        self.window = window;
    }

    /// Fence window
    pub fn window(&self) -> FenceWindow {
        self.window
    }

    // ========================================================================
    // Reading
    // ========================================================================

    /// Begin a read; a no-op while a read or count is in progress
    pub fn start_reading(&mut self) -> ReadStep {
        if matches!(self.state, ReaderState::Reading | ReaderState::Counting) {
            return ReadStep::Busy;
        }
        self.state = ReaderState::Reading;
        self.read_more()
    }

    /// Query for more unless the buffer already holds a full batch
    pub fn read_more(&mut self) -> ReadStep {
        if self.records.len() >= self.read_limit {
            self.state = ReaderState::Stopped(ReaderStop::WithResults);
            return ReadStep::Stopped(ReaderStop::WithResults);
        }

        self.change_pending = false;
        ReadStep::Query(IncrementalQuery {
            record_type: self.record_type.clone(),
            cursor: self.pending_cursor.clone(),
            window: self.window,
            limit: self.read_limit,
            order: self.mode.sort_order(),
        })
    }

    /// Apply a query result; returns `None` when the reader was not reading
    pub fn apply_read_result(&mut self, result: Result<QueryResult>) -> Option<ReaderStop> {
        if !self.is_reading() {
            debug!(mode = %self.mode, record_type = %self.record_type, "Ignoring read result while not reading");
            return None;
        }

        let stop = match result {
            Ok(result) => {
                let returned = result.len();
                self.last_read_full = returned >= self.read_limit;
                if let Some(cursor) = result.cursor {
                    self.pending_cursor = Some(cursor);
                }

                self.records.extend(result.records);
                let order = self.mode.sort_order();
                self.records
                    .make_contiguous()
                    .sort_by(|a, b| order.compare(&a.time, &b.time));
                self.deletions.extend(result.deletions);

                debug!(
                    mode = %self.mode,
                    record_type = %self.record_type,
                    returned,
                    buffered = self.records.len(),
                    "Read completed"
                );
                if returned > 0 {
                    ReaderStop::WithResults
                } else {
                    ReaderStop::WithNoResults
                }
            }
            Err(e) => {
                warn!(mode = %self.mode, record_type = %self.record_type, error = %e, "Read failed");
                ReaderStop::Error(e.to_string())
            }
        };

        self.state = ReaderState::Stopped(stop.clone());
        Some(stop)
    }

    /// Stop any read or count in progress
    pub fn stop_reading(&mut self) {
        if matches!(self.state, ReaderState::Reading | ReaderState::Counting) {
            self.state = ReaderState::Stopped(ReaderStop::TurnedOff);
        }
    }

    /// Time of the next record in upload order
    pub fn next_record_time(&self) -> Option<Timestamp> {
        self.records.front().map(|r| r.time)
    }

    /// Take the next record in upload order
    pub fn pop_next_record(&mut self) -> Option<Record> {
        self.records.pop_front()
    }

    /// Take any buffered deletion
    pub fn next_deletion(&mut self) -> Option<DeletionMarker> {
        self.deletions.pop_front()
    }

    /// New data for this type was announced
    pub fn note_change(&mut self) {
        self.change_pending = true;
    }

    /// Whether another round should read this type
    pub fn more_to_read(&self) -> bool {
        self.last_read_full || self.change_pending
    }

    // ========================================================================
    // Round Commit
    // ========================================================================

    /// Account for a record the remote side accepted
    pub fn note_uploaded(&mut self, record: &Record) {
        self.round.note_record(record);
    }

    /// Account for deletions the remote side accepted
    pub fn note_deletes_uploaded(&mut self, count: u64) {
        self.round.deletes += count;
    }

    /// Whether committing would change anything
    pub fn has_uncommitted_progress(&self) -> bool {
        self.pending_cursor != self.committed_cursor || !self.round.is_empty()
    }

    /// Persist the pending cursor and this round's stats in one write
    pub async fn commit_round(&mut self, upload_time: Timestamp) -> Result<()> {
        if !self.has_uncommitted_progress() {
            return Ok(());
        }

        let cursor_key = self.key(TypeField::Cursor);
        let uploads_key = self.key(TypeField::TotalSamplesUploadCount);
        let deletes_key = self.key(TypeField::TotalDeletesUploadCount);
        let last_upload_key = self.key(TypeField::LastSuccessfulUploadTime);
        let earliest_key = self.key(TypeField::EarliestUploadedTime);
        let latest_key = self.key(TypeField::LatestUploadedTime);
        let total_days_key = self.key(TypeField::HistoricalTotalDays);
        let current_day_key = self.key(TypeField::HistoricalCurrentDay);

        let cursor = self.pending_cursor.clone();
        let round = self.round.clone();
        let is_historical = self.mode == Mode::Historical;
        let end_fence = self.window.end;

        self.store
            .update(|w| {
                if let Some(cursor) = &cursor {
                    w.set_cursor(&cursor_key, cursor);
                }
                if round.records > 0 {
                    let total = w.get_int(&uploads_key) + round.records as i64;
                    w.set_int(&uploads_key, total);
                    w.set_time(&last_upload_key, upload_time);

                    let earliest = match (w.get_time(&earliest_key), round.earliest) {
                        (Some(a), Some(b)) => Some(a.min(b)),
                        (a, b) => a.or(b),
                    };
                    let latest = match (w.get_time(&latest_key), round.latest) {
                        (Some(a), Some(b)) => Some(a.max(b)),
                        (a, b) => a.or(b),
                    };
                    if let Some(earliest) = earliest {
                        w.set_time(&earliest_key, earliest);
                    }
                    if let Some(latest) = latest {
                        w.set_time(&latest_key, latest);
                    }

                    if is_historical {
                        if let (Some(earliest), Some(end)) = (earliest, end_fence) {
                            let total_days = w.get_int(&total_days_key);
                            let mut day = day_span(earliest, end);
                            if total_days > 0 {
                                day = day.min(total_days);
                            }
                            w.set_int(&current_day_key, day);
                        }
                    }
                }
                if round.deletes > 0 {
                    let total = w.get_int(&deletes_key) + round.deletes as i64;
                    w.set_int(&deletes_key, total);
                }
            })
            .await?;

        debug!(
            mode = %self.mode,
            record_type = %self.record_type,
            records = round.records,
            deletes = round.deletes,
            "Committed round"
        );
        self.committed_cursor = self.pending_cursor.clone();
        self.round = RoundStats::default();
        Ok(())
    }

    /// Drop buffers and uncommitted progress so the next read starts from the committed cursor
    pub fn reset_for_next_round(&mut self) {
        self.records.clear();
        self.deletions.clear();
        self.pending_cursor = self.committed_cursor.clone();
        self.round = RoundStats::default();
        self.state = ReaderState::Idle;
    }

    /// Forget everything persisted for this (mode, type)
    pub async fn reset_persistent_state(&mut self) -> Result<()> {
        let keys = StateKey::all_for_type(self.mode, &self.record_type);
        self.store.update(|w| w.remove_all(&keys)).await?;

        self.committed_cursor = None;
        self.pending_cursor = None;
        self.records.clear();
        self.deletions.clear();
        self.round = RoundStats::default();
        self.count = CountProgress::default();
        self.count_cursor = None;
        self.last_read_full = false;
        self.change_pending = false;
        self.state = ReaderState::Idle;
        info!(mode = %self.mode, record_type = %self.record_type, "Reset reader state");
        Ok(())
    }

    // ========================================================================
    // Counting
    // ========================================================================

    /// Begin the counting pre-pass; uses its own cursor, never the read cursor
    pub fn start_counting(&mut self, page_size: usize) -> CountQuery {
        self.state = ReaderState::Counting;
        self.count = CountProgress {
            page_size: page_size.max(1),
            ..CountProgress::default()
        };
        self.count_cursor = None;
        self.count_query()
    }

    fn count_query(&self) -> CountQuery {
        CountQuery {
            record_type: self.record_type.clone(),
            cursor: self.count_cursor.clone(),
            window: self.window,
            page_size: self.count.page_size,
        }
    }

    /// Apply a counting page; returns `None` when the reader was not counting
    pub fn apply_count_outcome(&mut self, result: Result<CountOutcome>) -> Option<CountStep> {
        if !self.is_counting() {
            return None;
        }

        match result {
            Ok(outcome) => {
                if let Some(range) = outcome.range {
                    self.count.range = Some(range);
                }
                let page = outcome.page;
                self.count.total += page.count;
                if let Some(t) = page.earliest {
                    self.count.earliest = Some(self.count.earliest.map_or(t, |e| e.min(t)));
                }
                if let Some(t) = page.latest {
                    self.count.latest = Some(self.count.latest.map_or(t, |l| l.max(t)));
                }
                self.count_cursor = page.cursor;

                if page.done {
                    self.state = ReaderState::Idle;
                    Some(CountStep::Finished)
                } else {
                    Some(CountStep::Next(self.count_query()))
                }
            }
            Err(e) => {
                warn!(mode = %self.mode, record_type = %self.record_type, error = %e, "Counting failed");
                let message = e.to_string();
                self.state = ReaderState::Stopped(ReaderStop::Error(message.clone()));
                Some(CountStep::Failed(message))
            }
        }
    }

    /// Records counted so far
    pub fn counted(&self) -> u64 {
        self.count.total
    }

    /// Persist the counting results: totals, date span and full range
    pub async fn finish_counting(&mut self) -> Result<()> {
        let total = self.count.total as i64;
        let start = self.count.earliest;
        let end = self.window.end;
        let range = self.count.range;

        let total_key = self.key(TypeField::TotalSamplesCount);
        let start_key = self.key(TypeField::HistoricalStartDate);
        let end_key = self.key(TypeField::HistoricalEndDate);
        let days_key = self.key(TypeField::HistoricalTotalDays);
        let current_day_key = self.key(TypeField::HistoricalCurrentDay);
        let earliest_key = self.key(TypeField::EarliestRecordTime);
        let latest_key = self.key(TypeField::LatestRecordTime);

        self.store
            .update(|w| {
                w.set_int(&total_key, total);
                if let Some(start) = start {
                    w.set_time(&start_key, start);
                }
                if let Some(end) = end {
                    w.set_time(&end_key, end);
                }
                let days = match (start, end) {
                    (Some(start), Some(end)) => day_span(start, end),
                    _ => 0,
                };
                w.set_int(&days_key, days);
                if w.get(&current_day_key).is_none() {
                    w.set_int(&current_day_key, 0);
                }
                if let Some(range) = range {
                    w.set_time(&earliest_key, range.earliest);
                    w.set_time(&latest_key, range.latest);
                }
            })
            .await?;

        info!(mode = %self.mode, record_type = %self.record_type, total, "Counting finished");
        Ok(())
    }
}
