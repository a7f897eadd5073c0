//! Integration tests driving the engine end to end
//!
//! Memory data store → coordinators → scripted transport or mock HTTP server

use async_trait::async_trait;
use chrono::Utc;
use pretty_assertions::assert_eq;
use recsync::config::{HostConfig, TierConfig};
use recsync::coordinator::RunState;
use recsync::engine::Engine;
use recsync::source::MemoryDataStore;
use recsync::state::{Scope, StateStore};
use recsync::transport::{TransportResponse, UploadTransport};
use recsync::{JsonValue, Mode, Record, StopReason, SyncEvent, Timestamp};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::timeout;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const WAIT: Duration = Duration::from_secs(10);

// ============================================================================
// Helpers
// ============================================================================

/// Accepts every batch, except that call number `hang_on` never returns
#[derive(Default)]
struct ScriptedTransport {
    creates: Mutex<Vec<Vec<String>>>,
    hang_on: Option<usize>,
}

impl ScriptedTransport {
    fn hanging_on(call: usize) -> Self {
        Self {
            hang_on: Some(call),
            ..Self::default()
        }
    }

    fn creates(&self) -> Vec<Vec<String>> {
        self.creates.lock().unwrap().clone()
    }
}

#[async_trait]
impl UploadTransport for ScriptedTransport {
    async fn create_batch(
        &self,
        body: &JsonValue,
        _timeout: Duration,
    ) -> recsync::Result<TransportResponse> {
        let ids = body
            .as_array()
            .unwrap()
            .iter()
            .map(|item| item["id"].as_str().unwrap().to_string())
            .collect();
        let call = {
            let mut creates = self.creates.lock().unwrap();
            creates.push(ids);
            creates.len()
        };
        if self.hang_on == Some(call) {
            std::future::pending::<()>().await;
        }
        Ok(TransportResponse::new(200, ""))
    }

    async fn delete_batch(
        &self,
        _body: &JsonValue,
        _timeout: Duration,
    ) -> recsync::Result<TransportResponse> {
        Ok(TransportResponse::new(200, ""))
    }
}

fn config(types: &[&str], batch_limit: usize) -> HostConfig {
    let mut builder = HostConfig::builder()
        .account_id("acct-1")
        .upload_target_id("ds-1")
        .tiers(TierConfig {
            batch_limits: vec![batch_limit, 2, 1],
            delete_limits: vec![batch_limit, 2, 1],
            timeouts_secs: vec![60, 120, 240],
        })
        .initial_tier_index(0);
    for record_type in types {
        builder = builder.record_type(*record_type);
    }
    builder.build().unwrap()
}

fn minutes_ago(minutes: i64) -> Timestamp {
    Utc::now() - chrono::Duration::minutes(minutes)
}

fn hours_ago(hours: i64) -> Timestamp {
    Utc::now() - chrono::Duration::hours(hours)
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

async fn next_stop(events: &mut broadcast::Receiver<SyncEvent>, mode: Mode) -> StopReason {
    timeout(WAIT, async {
        loop {
            match events.recv().await.unwrap() {
                SyncEvent::RunStopped { mode: m, reason } if m == mode => return reason,
                _ => {}
            }
        }
    })
    .await
    .expect("run did not stop")
}

// ============================================================================
// Crash-Safe Resume
// ============================================================================

#[tokio::test]
async fn test_killed_upload_resends_only_unconfirmed_records() {
    let dir = tempfile::tempdir().unwrap();
    let state_path = dir.path().join("state.json");
    let source = MemoryDataStore::from_records(vec![
        Record::new("g1", "glucose", minutes_ago(30)),
        Record::new("g2", "glucose", minutes_ago(20)),
        Record::new("g3", "glucose", minutes_ago(10)),
    ]);

    // First process: batch one is confirmed, batch two is in flight when it dies
    let first = Arc::new(ScriptedTransport::hanging_on(2));
    let engine = Engine::open(
        config(&["glucose"], 2),
        StateStore::from_file(&state_path).unwrap(),
        Arc::new(source.clone()),
        first.clone(),
    )
    .await
    .unwrap();
    engine.start(Mode::Live).unwrap();
    timeout(WAIT, async {
        while !engine.is_uploading(Mode::Live).await.unwrap() || first.creates().len() < 2 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap();
    engine.shutdown().await;
    assert_eq!(first.creates(), vec![vec!["g1", "g2"], vec!["g3"]]);

    // Second process over the same state file
    let second = Arc::new(ScriptedTransport::default());
    let engine = Engine::open(
        config(&["glucose"], 2),
        StateStore::from_file(&state_path).unwrap(),
        Arc::new(source),
        second.clone(),
    )
    .await
    .unwrap();
    engine.start(Mode::Live).unwrap();
    wait_for_state(&engine, Mode::Live, |s| *s == RunState::Armed).await;

    assert_eq!(second.creates(), vec![vec!["g3"]]);
    assert_eq!(engine.progress(Mode::Live).await.total_samples_upload_count, 3);
    engine.shutdown().await;
}

// ============================================================================
// Merge Ordering
// ============================================================================

#[tokio::test]
async fn test_merged_upload_order_per_mode() {
    let types = ["glucose", "insulin", "steps"];
    let mut records = Vec::new();
    let mut times = HashMap::new();
    for i in 0..12_i64 {
        let record_type = types[(i % 3) as usize];
        let live_id = format!("live-{i}");
        let old_id = format!("old-{i}");
        let live_time = minutes_ago(120 - i * 7);
        let old_time = hours_ago(30 + i * 5);
        times.insert(live_id.clone(), live_time);
        times.insert(old_id.clone(), old_time);
        records.push(Record::new(live_id, record_type, live_time));
        records.push(Record::new(old_id, record_type, old_time));
    }
    // Source order is by type, not by time
    records.sort_by(|a, b| a.record_type.as_str().cmp(b.record_type.as_str()));
    let source = MemoryDataStore::from_records(records);

    let transport = Arc::new(ScriptedTransport::default());
    let engine = Engine::open(
        config(&types, 5),
        StateStore::in_memory(),
        Arc::new(source),
        transport.clone(),
    )
    .await
    .unwrap();
    let mut events = engine.subscribe();

    engine.start(Mode::Live).unwrap();
    wait_for_state(&engine, Mode::Live, |s| *s == RunState::Armed).await;
    let live: Vec<String> = transport.creates().into_iter().flatten().collect();

    engine.start(Mode::Historical).unwrap();
    assert_eq!(next_stop(&mut events, Mode::Historical).await, StopReason::UploadComplete);
    let historical: Vec<String> = transport
        .creates()
        .into_iter()
        .flatten()
        .skip(live.len())
        .collect();

    assert_eq!(live.len(), 12);
    assert!(live.iter().all(|id| id.starts_with("live-")));
    assert!(live.windows(2).all(|w| times[&w[0]] < times[&w[1]]));

    assert_eq!(historical.len(), 12);
    assert!(historical.iter().all(|id| id.starts_with("old-")));
    assert!(historical.windows(2).all(|w| times[&w[0]] > times[&w[1]]));

    let progress = engine.progress(Mode::Historical).await;
    assert_eq!(progress.total_samples_count, 12);
    assert_eq!(progress.percent_complete(), Some(100.0));
    assert_eq!(progress.current_day, progress.total_days);
    engine.shutdown().await;
}

// ============================================================================
// Historical Completion & Resumability
// ============================================================================

#[tokio::test]
async fn test_historical_completes_exactly_once() {
    let source = MemoryDataStore::from_records(vec![
        Record::new("h1", "glucose", hours_ago(50)),
        Record::new("h2", "glucose", hours_ago(40)),
    ]);
    let transport = Arc::new(ScriptedTransport::default());
    let engine = Engine::open(
        config(&["glucose"], 500),
        StateStore::in_memory(),
        Arc::new(source),
        transport.clone(),
    )
    .await
    .unwrap();
    let mut events = engine.subscribe();

    engine.start(Mode::Historical).unwrap();
    assert_eq!(next_stop(&mut events, Mode::Historical).await, StopReason::UploadComplete);
    for _ in 0..5 {
        engine.tick(Mode::Historical).unwrap();
    }
    let status = engine.status(Mode::Historical).await.unwrap();

    assert_eq!(status.state, RunState::Stopped(StopReason::UploadComplete));
    let extra = timeout(Duration::from_millis(100), next_stop(&mut events, Mode::Historical)).await;
    assert!(extra.is_err());
    assert!(!engine.is_resumable(Mode::Historical).await);
    assert_eq!(transport.creates(), vec![vec!["h2", "h1"]]);
    engine.shutdown().await;
}

#[tokio::test]
async fn test_budget_stop_resumes_where_it_left_off() {
    let source = MemoryDataStore::from_records(vec![
        Record::new("h1", "glucose", hours_ago(80)),
        Record::new("h2", "glucose", hours_ago(70)),
        Record::new("h3", "glucose", hours_ago(60)),
        Record::new("h4", "glucose", hours_ago(50)),
    ]);
    let transport = Arc::new(ScriptedTransport::default());
    let engine = Engine::open(
        config(&["glucose"], 2),
        StateStore::in_memory(),
        Arc::new(source),
        transport.clone(),
    )
    .await
    .unwrap();
    let mut events = engine.subscribe();

    engine
        .start_with_budget(Mode::Historical, Duration::from_secs(1))
        .unwrap();
    assert_eq!(next_stop(&mut events, Mode::Historical).await, StopReason::BudgetExpiring);
    assert!(engine.is_resumable(Mode::Historical).await);

    let resumed = engine.resume_if_resumable(None).await.unwrap();
    assert_eq!(resumed, vec![Mode::Live, Mode::Historical]);
    assert_eq!(next_stop(&mut events, Mode::Historical).await, StopReason::UploadComplete);

    assert_eq!(
        transport.creates(),
        vec![vec!["h4", "h3"], vec!["h2", "h1"]]
    );
    let progress = engine.progress(Mode::Historical).await;
    assert_eq!(progress.total_samples_count, 4);
    assert_eq!(progress.total_samples_upload_count, 4);
    engine.shutdown().await;
}

// ============================================================================
// Partial Rejection over HTTP
// ============================================================================

#[tokio::test]
async fn test_partial_rejection_over_http() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/datasets/ds-1/data"))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "errors": [
                {"code": "value-out-of-range"},
                {"source": {"pointer": "/2/value"}},
                {"source": {"pointer": "/7/time"}}
            ]
        })))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/v1/datasets/ds-1/data"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;

    let records: Vec<Record> = (0..10)
        .map(|i| Record::new(format!("r{i}"), "glucose", minutes_ago(60 - i)))
        .collect();
    let mut config = config(&["glucose"], 500);
    config.base_url = server.uri();
    let engine = Engine::with_http(
        config,
        StateStore::in_memory(),
        Arc::new(MemoryDataStore::from_records(records)),
    )
    .await
    .unwrap();

    engine.start(Mode::Live).unwrap();
    wait_for_state(&engine, Mode::Live, |s| *s == RunState::Armed).await;

    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests.len(), 2);
    let resent: JsonValue = serde_json::from_slice(&requests[1].body).unwrap();
    let ids: Vec<&str> = resent
        .as_array()
        .unwrap()
        .iter()
        .map(|item| item["id"].as_str().unwrap())
        .collect();
    assert_eq!(ids, vec!["r0", "r1", "r3", "r4", "r5", "r6", "r8", "r9"]);
    assert_eq!(engine.progress(Mode::Live).await.total_samples_upload_count, 8);
    engine.shutdown().await;
}

// ============================================================================
// Scope Isolation
// ============================================================================

#[tokio::test]
async fn test_mode_resets_are_isolated() {
    let source = MemoryDataStore::from_records(vec![
        Record::new("old", "glucose", hours_ago(48)),
        Record::new("new", "glucose", minutes_ago(5)),
    ]);
    let transport = Arc::new(ScriptedTransport::default());
    let store = StateStore::in_memory();
    let engine = Engine::open(
        config(&["glucose"], 500),
        store.clone(),
        Arc::new(source),
        transport.clone(),
    )
    .await
    .unwrap();
    let mut events = engine.subscribe();

    engine.start(Mode::Live).unwrap();
    wait_for_state(&engine, Mode::Live, |s| *s == RunState::Armed).await;
    engine.start(Mode::Historical).unwrap();
    next_stop(&mut events, Mode::Historical).await;
    engine.stop(Mode::Live).unwrap();
    next_stop(&mut events, Mode::Live).await;

    let live = store.scope_entries(Scope::Live).await;
    let historical = store.scope_entries(Scope::Historical).await;
    let account = store.scope_entries(Scope::Account).await;
    assert!(!live.is_empty());
    assert!(!historical.is_empty());

    engine.reset_mode(Mode::Historical).await.unwrap();
    assert!(store.scope_entries(Scope::Historical).await.is_empty());
    assert_eq!(store.scope_entries(Scope::Live).await, live);
    assert_eq!(store.scope_entries(Scope::Account).await, account);

    engine.reset_mode(Mode::Live).await.unwrap();
    assert!(store.scope_entries(Scope::Live).await.is_empty());
    assert_eq!(store.scope_entries(Scope::Account).await, account);
    engine.shutdown().await;
}
