//! Tests for the stats module

use super::*;
use crate::state::{ModeField, StateKey, StateStore, TypeField};
use crate::types::{Mode, RecordType, Timestamp};
use chrono::{TimeZone, Utc};
use pretty_assertions::assert_eq;
use test_case::test_case;

fn at(day: u32, hour: u32) -> Timestamp {
    Utc.with_ymd_and_hms(2024, 6, day, hour, 0, 0).unwrap()
}

fn types() -> Vec<RecordType> {
    vec![RecordType::new("glucose"), RecordType::new("insulin")]
}

async fn seed(store: &StateStore, mode: Mode, name: &str, uploaded: i64, earliest: u32, latest: u32) {
    let rt = RecordType::new(name);
    let key = |field| StateKey::record_type(mode, &rt, field);
    store.set_int(&key(TypeField::TotalSamplesUploadCount), uploaded).await.unwrap();
    store.set_int(&key(TypeField::TotalSamplesCount), uploaded * 2).await.unwrap();
    store
        .set_time(&key(TypeField::EarliestUploadedTime), at(earliest, 0))
        .await
        .unwrap();
    store
        .set_time(&key(TypeField::LatestUploadedTime), at(latest, 0))
        .await
        .unwrap();
    store
        .set_time(&key(TypeField::LastSuccessfulUploadTime), at(20, 0))
        .await
        .unwrap();
}

#[test_case(at(1, 0), at(1, 23), 1 ; "same day")]
#[test_case(at(1, 23), at(2, 0), 2 ; "across midnight")]
#[test_case(at(1, 0), at(10, 0), 10 ; "ten days")]
#[test_case(at(5, 0), at(1, 0), 0 ; "reversed")]
fn test_day_span(from: Timestamp, to: Timestamp, expected: i64) {
    assert_eq!(day_span(from, to), expected);
}

#[test]
fn test_percent_complete() {
    let mut progress = GlobalProgress::default();
    assert_eq!(progress.percent_complete(), None);

    progress.total_samples_count = 200;
    progress.total_samples_upload_count = 50;
    assert_eq!(progress.percent_complete(), Some(25.0));

    progress.total_samples_upload_count = 300;
    assert_eq!(progress.percent_complete(), Some(100.0));
}

#[tokio::test]
async fn test_type_stats_defaults() {
    let aggregator = StatsAggregator::new(StateStore::in_memory());
    let stats = aggregator.type_stats(Mode::Live, &RecordType::new("glucose")).await;

    assert!(!stats.has_successfully_uploaded);
    assert_eq!(stats.total_samples_upload_count, 0);
    assert_eq!(stats.earliest_uploaded_time, None);
}

#[tokio::test]
async fn test_refresh_aggregates_types() {
    let store = StateStore::in_memory();
    seed(&store, Mode::Live, "glucose", 10, 3, 6).await;
    seed(&store, Mode::Live, "insulin", 5, 2, 4).await;
    let aggregator = StatsAggregator::new(store.clone());

    let progress = aggregator.refresh(Mode::Live, &types()).await.unwrap();

    assert_eq!(progress.total_samples_upload_count, 15);
    assert_eq!(progress.total_samples_count, 30);
    assert_eq!(progress.earliest_uploaded_time, Some(at(2, 0)));
    assert_eq!(progress.latest_uploaded_time, Some(at(6, 0)));
    assert!(progress.has_successfully_uploaded);

    // Persisted and readable back
    assert_eq!(aggregator.global_progress(Mode::Live).await, progress);
    assert_eq!(
        store.get_int(&ModeField::TotalSamplesUploadCount.key(Mode::Live)).await,
        15
    );
    // Other mode untouched
    assert_eq!(
        store
            .get_int(&ModeField::TotalSamplesUploadCount.key(Mode::Historical))
            .await,
        0
    );
}

#[tokio::test]
async fn test_historical_current_day_never_decreases() {
    let store = StateStore::in_memory();
    let rt = RecordType::new("glucose");
    let key = |field| StateKey::record_type(Mode::Historical, &rt, field);
    store.set_int(&key(TypeField::HistoricalTotalDays), 30).await.unwrap();
    store.set_int(&key(TypeField::HistoricalCurrentDay), 4).await.unwrap();
    store.set_int(&ModeField::CurrentDay.key(Mode::Historical), 9).await.unwrap();
    let aggregator = StatsAggregator::new(store);

    let progress = aggregator
        .refresh(Mode::Historical, &[rt.clone()])
        .await
        .unwrap();

    assert_eq!(progress.total_days, 30);
    assert_eq!(progress.current_day, 9);
}

#[tokio::test]
async fn test_finish_historical_moves_to_last_day() {
    let store = StateStore::in_memory();
    let rt = RecordType::new("glucose");
    let key = |field| StateKey::record_type(Mode::Historical, &rt, field);
    store.set_int(&key(TypeField::HistoricalTotalDays), 12).await.unwrap();
    store.set_int(&key(TypeField::HistoricalCurrentDay), 7).await.unwrap();
    let aggregator = StatsAggregator::new(store.clone());

    aggregator.finish_historical(&[rt.clone()]).await.unwrap();

    assert_eq!(store.get_int(&key(TypeField::HistoricalCurrentDay)).await, 12);
    assert_eq!(aggregator.global_progress(Mode::Historical).await.current_day, 12);
}
