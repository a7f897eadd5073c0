//! Stats aggregation over the state store

use super::types::{GlobalProgress, TypeStats};
use crate::error::Result;
use crate::state::{ModeField, StateKey, StateStore, TypeField};
use crate::types::{Mode, RecordType, Timestamp};
use tracing::debug;

/// Whole days covered from `from` to `to`, counting both end days; never negative
pub fn day_span(from: Timestamp, to: Timestamp) -> i64 {
    let days = (to.date_naive() - from.date_naive()).num_days() + 1;
    days.max(0)
}

fn min_time(a: Option<Timestamp>, b: Option<Timestamp>) -> Option<Timestamp> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.min(b)),
        (a, b) => a.or(b),
    }
}

fn max_time(a: Option<Timestamp>, b: Option<Timestamp>) -> Option<Timestamp> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Fold per-type stats into a mode summary
pub fn aggregate(mode: Mode, stats: &[TypeStats]) -> GlobalProgress {
    stats.iter().fold(
        GlobalProgress {
            mode: Some(mode),
            ..GlobalProgress::default()
        },
        |mut acc, s| {
            acc.has_successfully_uploaded |= s.has_successfully_uploaded;
            acc.last_successful_upload_time =
                max_time(acc.last_successful_upload_time, s.last_successful_upload_time);
            acc.total_samples_count += s.total_samples_count;
            acc.total_samples_upload_count += s.total_samples_upload_count;
            acc.total_deletes_upload_count += s.total_deletes_upload_count;
            acc.earliest_uploaded_time =
                min_time(acc.earliest_uploaded_time, s.earliest_uploaded_time);
            acc.latest_uploaded_time = max_time(acc.latest_uploaded_time, s.latest_uploaded_time);
            acc.earliest_record_time = min_time(acc.earliest_record_time, s.earliest_record_time);
            acc.latest_record_time = max_time(acc.latest_record_time, s.latest_record_time);
            acc.total_days = acc.total_days.max(s.historical_total_days);
            acc.current_day = acc.current_day.max(s.historical_current_day);
            acc
        },
    )
}

/// Reads per-type stats and maintains the mode-global summary keys
#[derive(Debug, Clone)]
pub struct StatsAggregator {
    store: StateStore,
}

impl StatsAggregator {
    /// Create an aggregator over `store`
    pub fn new(store: StateStore) -> Self {
        Self { store }
    }

    /// Stats of one type
    pub async fn type_stats(&self, mode: Mode, record_type: &RecordType) -> TypeStats {
        let key = |field| StateKey::record_type(mode, record_type, field);
        let last_upload = self.store.get_time(&key(TypeField::LastSuccessfulUploadTime)).await;

        TypeStats {
            record_type: Some(record_type.clone()),
            mode: Some(mode),
            has_successfully_uploaded: last_upload.is_some(),
            last_successful_upload_time: last_upload,
            total_samples_count: self.store.get_int(&key(TypeField::TotalSamplesCount)).await,
            total_samples_upload_count: self
                .store
                .get_int(&key(TypeField::TotalSamplesUploadCount))
                .await,
            total_deletes_upload_count: self
                .store
                .get_int(&key(TypeField::TotalDeletesUploadCount))
                .await,
            earliest_uploaded_time: self.store.get_time(&key(TypeField::EarliestUploadedTime)).await,
            latest_uploaded_time: self.store.get_time(&key(TypeField::LatestUploadedTime)).await,
            earliest_record_time: self.store.get_time(&key(TypeField::EarliestRecordTime)).await,
            latest_record_time: self.store.get_time(&key(TypeField::LatestRecordTime)).await,
            historical_start_date: self.store.get_time(&key(TypeField::HistoricalStartDate)).await,
            historical_end_date: self.store.get_time(&key(TypeField::HistoricalEndDate)).await,
            historical_total_days: self.store.get_int(&key(TypeField::HistoricalTotalDays)).await,
            historical_current_day: self
                .store
                .get_int(&key(TypeField::HistoricalCurrentDay))
                .await,
        }
    }

    /// Stats of every type in a mode, in the order given
    pub async fn mode_stats(&self, mode: Mode, types: &[RecordType]) -> Vec<TypeStats> {
        let mut stats = Vec::with_capacity(types.len());
        for record_type in types {
            stats.push(self.type_stats(mode, record_type).await);
        }
        stats
    }

    /// Mode summary as last written by [`StatsAggregator::refresh`]
    pub async fn global_progress(&self, mode: Mode) -> GlobalProgress {
        let key = |field: ModeField| field.key(mode);
        let last_upload = self.store.get_time(&key(ModeField::LastSuccessfulUploadTime)).await;

        GlobalProgress {
            mode: Some(mode),
            has_successfully_uploaded: last_upload.is_some(),
            last_successful_upload_time: last_upload,
            total_samples_count: self.store.get_int(&key(ModeField::TotalSamplesCount)).await,
            total_samples_upload_count: self
                .store
                .get_int(&key(ModeField::TotalSamplesUploadCount))
                .await,
            total_deletes_upload_count: self
                .store
                .get_int(&key(ModeField::TotalDeletesUploadCount))
                .await,
            earliest_uploaded_time: self.store.get_time(&key(ModeField::EarliestUploadedTime)).await,
            latest_uploaded_time: self.store.get_time(&key(ModeField::LatestUploadedTime)).await,
            earliest_record_time: self.store.get_time(&key(ModeField::EarliestRecordTime)).await,
            latest_record_time: self.store.get_time(&key(ModeField::LatestRecordTime)).await,
            total_days: self.store.get_int(&key(ModeField::TotalDays)).await,
            current_day: self.store.get_int(&key(ModeField::CurrentDay)).await,
        }
    }

    /// Recompute the mode summary from per-type stats and persist it
    pub async fn refresh(&self, mode: Mode, types: &[RecordType]) -> Result<GlobalProgress> {
        let stats = self.mode_stats(mode, types).await;
        let mut progress = aggregate(mode, &stats);
        let previous_day = self.store.get_int(&ModeField::CurrentDay.key(mode)).await;
        progress.current_day = progress.current_day.max(previous_day);

        let summary = progress.clone();
        self.store
            .update(|w| {
                let key = |field: ModeField| field.key(mode);
                w.set_int(&key(ModeField::TotalSamplesCount), summary.total_samples_count);
                w.set_int(
                    &key(ModeField::TotalSamplesUploadCount),
                    summary.total_samples_upload_count,
                );
                w.set_int(
                    &key(ModeField::TotalDeletesUploadCount),
                    summary.total_deletes_upload_count,
                );
                let times = [
                    (ModeField::LastSuccessfulUploadTime, summary.last_successful_upload_time),
                    (ModeField::EarliestUploadedTime, summary.earliest_uploaded_time),
                    (ModeField::LatestUploadedTime, summary.latest_uploaded_time),
                    (ModeField::EarliestRecordTime, summary.earliest_record_time),
                    (ModeField::LatestRecordTime, summary.latest_record_time),
                ];
                for (field, time) in times {
                    match time {
                        Some(t) => w.set_time(&key(field), t),
                        None => w.remove(&key(field)),
                    }
                }
                if mode == Mode::Historical {
                    w.set_int(&key(ModeField::TotalDays), summary.total_days);
                    w.set_int(&key(ModeField::CurrentDay), summary.current_day);
                }
            })
            .await?;

        debug!(
            %mode,
            uploaded = progress.total_samples_upload_count,
            deletes = progress.total_deletes_upload_count,
            "Refreshed progress"
        );
        Ok(progress)
    }

    /// Mark every historical type as having reached its last day
    pub async fn finish_historical(&self, types: &[RecordType]) -> Result<()> {
        let mut days = Vec::with_capacity(types.len());
        for record_type in types {
            let total_key =
                StateKey::record_type(Mode::Historical, record_type, TypeField::HistoricalTotalDays);
            let current_key =
                StateKey::record_type(Mode::Historical, record_type, TypeField::HistoricalCurrentDay);
            days.push((current_key, self.store.get_int(&total_key).await));
        }

        self.store
            .update(|w| {
                for (current_key, total) in &days {
                    w.set_int(current_key, *total);
                }
            })
            .await?;
        self.refresh(Mode::Historical, types).await?;
        Ok(())
    }
}
