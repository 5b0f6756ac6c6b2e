//! SQLite-backed stores: schema round trips, TTL expiry with purge, the
//! shared-pool audit log, and a durable harness end to end.
//!
//! File-backed databases under a tempdir rather than `sqlite::memory:`; a
//! pooled in-memory database is a fresh database per connection, which these
//! tests must not depend on.

#![cfg(feature = "sqlite")]

mod common;

use std::sync::Arc;
use std::time::Duration as StdDuration;

use chrono::{Duration, Utc};
use serde_json::json;

use faultline::audit::{
    AuditStore, InteractionRecord, InteractionStatus, RecoveryAttempt, SqliteAuditStore,
    SystemMetric, new_record_id,
};
use faultline::backend::SimulatedBackend;
use faultline::checkpoint::Checkpoint;
use faultline::config::HarnessConfig;
use faultline::harness::{ChatRequest, Harness};
use faultline::session::SessionState;
use faultline::stores::{
    CheckpointStore, InjectionMarker, SessionStore, SqliteStateStore,
};
use faultline::turn::Turn;

use common::*;

fn file_url(dir: &tempfile::TempDir, name: &str) -> String {
    format!("sqlite://{}?mode=rwc", dir.path().join(name).display())
}

fn sample_record(session_id: &str, failure_mode: Option<&str>) -> InteractionRecord {
    let injected = failure_mode.is_some();
    InteractionRecord {
        id: new_record_id(),
        session_id: session_id.into(),
        request_message: "how do I export my data?".into(),
        response: if injected {
            "Authentication failed: Invalid API key".into()
        } else {
            "You can export from the settings page.".into()
        },
        natural_response: injected.then(|| "You can export from the settings page.".into()),
        failure_mode: failure_mode.map(str::to_string),
        injection_applied: injected,
        status: if injected {
            InteractionStatus::Error
        } else {
            InteractionStatus::Success
        },
        natural_status: InteractionStatus::Success,
        processing_time_ms: 12,
        token_count: 9,
        model_used: "test-model".into(),
        metadata: json!({"source": "test"}),
        created_at: Utc::now(),
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_round_trips_sessions_counters_and_markers() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStateStore::connect(&file_url(&dir, "state.db"))
        .await
        .expect("connect");

    let mut state = SessionState::default();
    state.push_turn(Turn::user("hello"));
    state.push_turn(Turn::assistant("hi there"));
    state.context.insert("plan".into(), json!("premium"));
    store.save("s1", &state).await.expect("save");
    assert_eq!(store.load("s1").await.expect("load"), state);

    // Counter cells fold over the persisted blob on load.
    assert_eq!(store.increment_failure_count("s1").await.expect("bump"), 1);
    assert_eq!(store.increment_failure_count("s1").await.expect("bump"), 2);
    assert_eq!(store.increment_recovery_count("s1").await.expect("bump"), 1);
    let loaded = store.load("s1").await.expect("load");
    assert_eq!(loaded.failure_count, 2);
    assert_eq!(loaded.recovery_count, 1);

    let marker = InjectionMarker {
        mode: "api_timeout".into(),
        at: Utc::now(),
    };
    store
        .set_injection_marker("s1", &marker, Duration::seconds(60))
        .await
        .expect("set marker");
    let read_back = store.injection_marker("s1").await.expect("get marker").expect("live marker");
    assert_eq!(read_back.mode, "api_timeout");

    assert_eq!(store.bump_request_counter("s1").await.expect("bump"), 1);
    assert_eq!(store.bump_request_counter("s1").await.expect("bump"), 2);

    store.reset("s1").await.expect("reset");
    assert_eq!(store.load("s1").await.expect("load"), SessionState::default());
    assert_eq!(store.injection_marker("s1").await.expect("get marker"), None);
    assert_eq!(store.bump_request_counter("s1").await.expect("bump"), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_checkpoints_round_trip_overwrite_and_remove() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStateStore::connect(&file_url(&dir, "state.db"))
        .await
        .expect("connect");

    let mut state = SessionState::default();
    state.push_turn(Turn::user("one"));
    let checkpoint = Checkpoint {
        session_id: "s1".into(),
        tag: "stable".into(),
        state: state.clone(),
        captured_at: Utc::now(),
    };
    store.put_checkpoint(&checkpoint).await.expect("put");

    let loaded = store
        .get_checkpoint("s1", "stable")
        .await
        .expect("get")
        .expect("live checkpoint");
    assert_eq!(loaded.state, state);
    assert_eq!(loaded.tag, "stable");

    // Same tag replaces the snapshot.
    state.push_turn(Turn::assistant("two"));
    store
        .put_checkpoint(&Checkpoint {
            session_id: "s1".into(),
            tag: "stable".into(),
            state: state.clone(),
            captured_at: Utc::now(),
        })
        .await
        .expect("put");
    let replaced = store
        .get_checkpoint("s1", "stable")
        .await
        .expect("get")
        .expect("live checkpoint");
    assert_eq!(replaced.state.turns.len(), 2);

    assert!(store.remove_checkpoint("s1", "stable").await.expect("remove"));
    assert!(!store.remove_checkpoint("s1", "stable").await.expect("remove"));
    assert!(store.get_checkpoint("s1", "stable").await.expect("get").is_none());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_cells_expire_and_purge_reclaims_rows() {
    let dir = tempfile::tempdir().expect("tempdir");
    let store = SqliteStateStore::connect(&file_url(&dir, "state.db"))
        .await
        .expect("connect")
        .with_ttls(
            Duration::milliseconds(20),
            Duration::milliseconds(20),
            Duration::milliseconds(20),
        );

    let mut state = SessionState::default();
    state.push_turn(Turn::user("ephemeral"));
    store.save("s1", &state).await.expect("save");
    store.increment_failure_count("s1").await.expect("bump");
    store
        .set_injection_marker(
            "s1",
            &InjectionMarker {
                mode: "auth_error".into(),
                at: Utc::now(),
            },
            Duration::milliseconds(20),
        )
        .await
        .expect("set marker");

    tokio::time::sleep(StdDuration::from_millis(60)).await;

    // Expired rows read as absent even before any cleanup runs.
    assert_eq!(store.load("s1").await.expect("load"), SessionState::default());
    assert_eq!(store.injection_marker("s1").await.expect("get marker"), None);

    // One session row, one counter cell, one marker.
    assert_eq!(store.purge_expired().await.expect("purge"), 3);
    assert_eq!(store.purge_expired().await.expect("purge"), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_audit_log_records_and_aggregates() {
    let dir = tempfile::tempdir().expect("tempdir");
    let state = SqliteStateStore::connect(&file_url(&dir, "shared.db"))
        .await
        .expect("connect");
    let audit = SqliteAuditStore::from_pool(state.pool());

    let clean = sample_record("a", None);
    let injected = sample_record("a", Some("auth_error"));
    audit.record_interaction(&clean).await.expect("record");
    audit.record_interaction(&injected).await.expect("record");

    let fetched = audit
        .get_interaction(&injected.id)
        .await
        .expect("get")
        .expect("stored record");
    assert_eq!(fetched, injected);
    assert!(fetched.is_consistent());
    assert_eq!(audit.get_interaction("missing").await.expect("get"), None);

    let history = audit.session_history("a", 10).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].id, injected.id, "newest first");

    let analytics = audit.failure_analytics(24).await.expect("analytics");
    assert_eq!(analytics.total_interactions, 2);
    assert_eq!(analytics.failure_counts.get("auth_error"), Some(&1));
    assert_eq!(analytics.status_distribution.get("success"), Some(&1));
    assert_eq!(analytics.status_distribution.get("error"), Some(&1));

    let attempt = RecoveryAttempt {
        id: new_record_id(),
        interaction_id: injected.id.clone(),
        strategy: "rollback".into(),
        attempt_number: 1,
        success: true,
        data: Some(json!({"checkpoint": "pre_request"})),
        notes: Some("restored and replayed".into()),
        created_at: Utc::now(),
    };
    audit.insert_attempt(&attempt).await.expect("attempt");
    assert_eq!(audit.count_attempts(&injected.id).await.expect("count"), 1);
    let status = audit.recovery_status(&injected.id).await.expect("status");
    assert!(status.recovered);
    assert_eq!(status.successful_strategy.as_deref(), Some("rollback"));

    let analysis = audit.failure_analysis().await.expect("analysis");
    let row = analysis
        .iter()
        .find(|row| row.session_id == "a" && row.failure_mode == "auth_error")
        .expect("analysis row");
    assert_eq!(row.occurrences, 1);
    assert!(row.recovered);
    assert_eq!(row.average_attempts_to_recovery, Some(1.0));

    audit
        .record_metric(&SystemMetric::new("latency_ms", 250.0, Some(200.0)))
        .await
        .expect("metric");
    let health = audit.system_health(24).await.expect("health");
    assert_eq!(health.len(), 1);
    assert_eq!(health[0].threshold_violations, 1);

    audit
        .save_scenario(&quality_scenario("confident_nonsense", 0.5))
        .await
        .expect("save scenario");
    let scenarios = audit.load_scenarios().await.expect("load scenarios");
    assert_eq!(scenarios.len(), 1);
    assert_eq!(scenarios[0].name, "confident_nonsense");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sqlite_harness_end_to_end() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config =
        HarnessConfig::default().with_database_url(file_url(&dir, "harness.db"));
    let harness = Harness::connect_sqlite(config).await.expect("connect");
    let backend = SimulatedBackend::new();

    harness
        .process(ChatRequest::new("durable", "hello there"), &backend)
        .await
        .expect("process");
    let response = harness
        .process(
            ChatRequest::new("durable", "break it").with_failure_mode("hallucination"),
            &backend,
        )
        .await
        .expect("forced turn");
    assert!(response.failure_injection_applied);

    let history = harness.session_history("durable", 10).await.expect("history");
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].failure_mode.as_deref(), Some("hallucination"));
    assert!(history.iter().all(InteractionRecord::is_consistent));

    harness.reset_session("durable").await.expect("reset");
    let probe = harness
        .checkpoints()
        .capture("durable", "probe")
        .await
        .expect("capture");
    assert_eq!(probe.state, SessionState::default());
    // The audit trail survived the reset.
    assert_eq!(harness.session_history("durable", 10).await.expect("history").len(), 2);
}
