//! Tests for engine module

use super::*;
use crate::coordinator::RunState;
use crate::source::MemoryDataStore;
use crate::state::{Scope, StateKey, TypeField};
use crate::types::{Record, RecordType};
use chrono::Utc;
use pretty_assertions::assert_eq;
use std::time::Duration;
use tokio::time::timeout;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(5);

fn config(base_url: &str) -> HostConfig {
    HostConfig::builder()
        .account_id("acct-1")
        .upload_target_id("ds-1")
        .base_url(base_url)
        .auth_token("secret-token")
        .record_type("glucose")
        .record_type("insulin")
        .build()
        .unwrap()
}

fn recent(minutes_ago: i64) -> Record {
    Record::new(
        format!("g{minutes_ago}"),
        "glucose",
        Utc::now() - chrono::Duration::minutes(minutes_ago),
    )
}

async fn open(config: HostConfig, store: StateStore, source: MemoryDataStore) -> Engine {
    Engine::with_http(config, store, Arc::new(source)).await.unwrap()
}

async fn wait_for_state(engine: &Engine, mode: Mode, expected: fn(&RunState) -> bool) {
    timeout(WAIT, async {
        loop {
            if expected(&engine.status(mode).await.unwrap().state) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("state not reached");
}

// ============================================================================
// Opening
// ============================================================================

#[tokio::test]
async fn test_open_stores_schema_and_account() {
    let store = StateStore::in_memory();
    let engine = open(config("http://localhost:1"), store.clone(), MemoryDataStore::new()).await;

    assert_eq!(store.get_int(&keys::schema_version()).await, keys::SCHEMA_VERSION);
    assert_eq!(engine.account_id().await.as_deref(), Some("acct-1"));
    assert!(engine.is_connected());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_open_resets_state_from_old_layout() {
    let store = StateStore::in_memory();
    let cursor = StateKey::record_type(Mode::Live, &RecordType::new("glucose"), TypeField::Cursor);
    store.set_int(&keys::schema_version(), 0).await.unwrap();
    store.set_int(&cursor, 12).await.unwrap();

    let engine = open(config("http://localhost:1"), store.clone(), MemoryDataStore::new()).await;

    assert!(store.get(&cursor).await.is_none());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_open_with_other_account_resets_state() {
    let store = StateStore::in_memory();
    store.ensure_schema_version(keys::SCHEMA_VERSION).await.unwrap();
    store.set_text(&keys::account_id(), "acct-0").await.unwrap();
    store
        .set_int(&ModeField::TierIndex.key(Mode::Historical), 2)
        .await
        .unwrap();

    let engine = open(config("http://localhost:1"), store.clone(), MemoryDataStore::new()).await;

    assert!(store.scope_entries(Scope::Historical).await.is_empty());
    assert_eq!(store.get_text(&keys::account_id()).await.as_deref(), Some("acct-1"));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_open_rejects_invalid_config() {
    let mut config = config("http://localhost:1");
    config.record_types.clear();
    let result = Engine::with_http(config, StateStore::in_memory(), Arc::new(MemoryDataStore::new())).await;
    assert!(result.is_err());
}

// ============================================================================
// Run Control
// ============================================================================

#[tokio::test]
async fn test_live_run_posts_to_endpoint() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/datasets/ds-1/data"))
        .and(header("authorization", "Bearer secret-token"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    let source = MemoryDataStore::from_records(vec![recent(20), recent(10)]);
    let engine = open(config(&server.uri()), StateStore::in_memory(), source).await;

    engine.start(Mode::Live).unwrap();
    wait_for_state(&engine, Mode::Live, |s| *s == RunState::Armed).await;

    let progress = engine.progress(Mode::Live).await;
    assert_eq!(progress.total_samples_upload_count, 2);
    assert!(progress.has_successfully_uploaded);
    assert!(!engine.is_uploading(Mode::Live).await.unwrap());

    let stats = engine.stats_for_mode(Mode::Live).await;
    assert_eq!(stats.len(), 2);
    assert_eq!(stats[0].total_samples_upload_count, 2);
    assert_eq!(stats[1].total_samples_upload_count, 0);

    engine.stop(Mode::Live).unwrap();
    wait_for_state(&engine, Mode::Live, |s| {
        *s == RunState::Stopped(StopReason::TurnedOff)
    })
    .await;
    engine.shutdown().await;
}

#[tokio::test]
async fn test_retry_info_reports_tiers() {
    let engine = open(config("http://localhost:1"), StateStore::in_memory(), MemoryDataStore::new()).await;

    let info = engine.retry_info(Mode::Historical).await.unwrap();
    assert_eq!(
        info,
        RetryInfo {
            tier_index: 1,
            max_tier_index: 2,
        }
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn test_resume_needs_account() {
    let mut config = config("http://localhost:1");
    config.account_id = None;
    let engine = open(config, StateStore::in_memory(), MemoryDataStore::new()).await;

    assert!(engine.resume_if_resumable(None).await.unwrap().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn test_resume_skips_finished_backfill() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    let engine = open(config(&server.uri()), StateStore::in_memory(), MemoryDataStore::new()).await;

    assert_eq!(engine.resume_if_resumable(None).await.unwrap(), vec![Mode::Live]);

    engine
        .store()
        .set_bool(&ModeField::IsResumable.key(Mode::Historical), true)
        .await
        .unwrap();
    assert_eq!(
        engine.resume_if_resumable(None).await.unwrap(),
        vec![Mode::Live, Mode::Historical]
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn test_switch_account_clears_everything() {
    let engine = open(config("http://localhost:1"), StateStore::in_memory(), MemoryDataStore::new()).await;
    let store = engine.store().clone();
    store
        .set_int(&ModeField::TierIndex.key(Mode::Live), 2)
        .await
        .unwrap();
    store
        .set_int(&ModeField::TierIndex.key(Mode::Historical), 2)
        .await
        .unwrap();

    assert!(!engine.switch_account("acct-1").await.unwrap());
    assert_eq!(store.get_int(&ModeField::TierIndex.key(Mode::Live)).await, 2);

    assert!(engine.switch_account("acct-2").await.unwrap());
    assert!(store.scope_entries(Scope::Live).await.is_empty());
    assert!(store.scope_entries(Scope::Historical).await.is_empty());
    assert_eq!(engine.account_id().await.as_deref(), Some("acct-2"));
    assert_eq!(store.get_int(&keys::schema_version()).await, keys::SCHEMA_VERSION);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_reset_mode_keeps_other_mode() {
    let engine = open(config("http://localhost:1"), StateStore::in_memory(), MemoryDataStore::new()).await;
    let store = engine.store().clone();
    store
        .set_int(&ModeField::TierIndex.key(Mode::Live), 2)
        .await
        .unwrap();
    store
        .set_bool(&ModeField::IsResumable.key(Mode::Historical), true)
        .await
        .unwrap();
    let live_before = store.scope_entries(Scope::Live).await;

    engine.reset_mode(Mode::Historical).await.unwrap();

    assert_eq!(store.scope_entries(Scope::Live).await, live_before);
    assert!(!engine.is_resumable(Mode::Historical).await);
    assert_eq!(engine.account_id().await.as_deref(), Some("acct-1"));
    engine.shutdown().await;
}

#[tokio::test]
async fn test_set_connected_only_logs_changes() {
    let engine = open(config("http://localhost:1"), StateStore::in_memory(), MemoryDataStore::new()).await;
    engine.set_connected(false);
    assert!(!engine.is_connected());
    engine.set_connected(true);
    assert!(engine.is_connected());
    engine.shutdown().await;
}

#[test]
fn test_reset_target_modes() {
    assert_eq!(ResetTarget::Mode(Mode::Live).modes(), vec![Mode::Live]);
    assert_eq!(ResetTarget::All.modes(), vec![Mode::Live, Mode::Historical]);
}
