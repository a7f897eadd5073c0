//! Stats summary types

use crate::types::{Mode, RecordType, Timestamp};
use serde::Serialize;

/// Progress of one record type in one mode
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct TypeStats {
    pub record_type: Option<RecordType>,
    pub mode: Option<Mode>,
    /// At least one batch containing this type was confirmed
    pub has_successfully_uploaded: bool,
    pub last_successful_upload_time: Option<Timestamp>,
    /// Records counted by the historical pre-pass
    pub total_samples_count: i64,
    pub total_samples_upload_count: i64,
    pub total_deletes_upload_count: i64,
    pub earliest_uploaded_time: Option<Timestamp>,
    pub latest_uploaded_time: Option<Timestamp>,
    pub earliest_record_time: Option<Timestamp>,
    pub latest_record_time: Option<Timestamp>,
    pub historical_start_date: Option<Timestamp>,
    pub historical_end_date: Option<Timestamp>,
    pub historical_total_days: i64,
    pub historical_current_day: i64,
}

/// Progress of one mode, aggregated across its types
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GlobalProgress {
    pub mode: Option<Mode>,
    pub has_successfully_uploaded: bool,
    pub last_successful_upload_time: Option<Timestamp>,
    pub total_samples_count: i64,
    pub total_samples_upload_count: i64,
    pub total_deletes_upload_count: i64,
    pub earliest_uploaded_time: Option<Timestamp>,
    pub latest_uploaded_time: Option<Timestamp>,
    pub earliest_record_time: Option<Timestamp>,
    pub latest_record_time: Option<Timestamp>,
    pub total_days: i64,
    pub current_day: i64,
}

impl GlobalProgress {
    /// Share of counted records uploaded, 0 to 100; `None` before counting finishes
    pub fn percent_complete(&self) -> Option<f64> {
        if self.total_samples_count <= 0 {
            return None;
        }
        let ratio = self.total_samples_upload_count as f64 / self.total_samples_count as f64;
        Some((ratio * 100.0).min(100.0))
    }
}
