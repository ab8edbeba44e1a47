//! End-to-end consolidation runs over an in-memory upstream.

mod common;

use chrono::Utc;
use common::{build_config, search_row, test_config, FakeUpstream, TestEntityBuilder};
use nerva_lib::cache::{CacheSnapshot, ConsolidationCache, RefreshOutcome, SnapshotSource};
use nerva_lib::core::{CircuitState, Domain, NervaError};
use nerva_lib::Application;
use pretty_assertions::assert_eq;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn upstream() -> FakeUpstream {
    FakeUpstream::new()
        .with_entities(
            Domain::Apm,
            vec![search_row("g1", "checkout", Domain::Apm)],
        )
        .with_entities(
            Domain::Infra,
            vec![
                search_row("g1", "checkout-host", Domain::Infra),
                search_row("g2", "db-host", Domain::Infra),
                json!({"name": "no guid", "domain": "INFRA"}),
            ],
        )
}

#[tokio::test]
async fn test_refresh_collects_filters_and_persists() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(upstream());
    let config = build_config(test_config(dir.path(), vec![Domain::Apm, Domain::Infra]));
    let app = Application::with_transport(config, Arc::clone(&fake) as _).unwrap();

    let outcome = app.refresh_once().await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Refreshed { entities: 2 });

    let snapshot = app.cache().read();
    assert_eq!(snapshot.source, SnapshotSource::Live);
    assert_eq!(snapshot.get("g1").map(|e| e.domain), Some(Domain::Apm));
    assert_eq!(
        snapshot.get("g1").and_then(|e| e.metrics["30min"].get("apdex")).cloned(),
        Some(json!([{"score": 0.9}]))
    );
    assert!(app.cache().path().exists());
    assert!(!app.refresher().needs_refresh());
    assert_eq!(fake.searches(), 2);
}

#[tokio::test]
async fn test_insufficient_run_keeps_previous_snapshot() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(upstream());
    let config = build_config(test_config(dir.path(), vec![Domain::Apm, Domain::Infra]));
    let app = Application::with_transport(config, Arc::clone(&fake) as _).unwrap();

    app.refresh_once().await.unwrap();

    // Every metric now comes back as NRQL's "no data" shape.
    fake.set_metric_rows(json!([{"score": null}]));
    let outcome = app.refresh_once().await.unwrap();

    match outcome {
        RefreshOutcome::KeptPrevious { entities, reason } => {
            assert_eq!(entities, 2);
            assert!(reason.contains("valid entities"));
        },
        other => panic!("expected the previous snapshot to be kept, got {other:?}"),
    }

    let snapshot = app.cache().read();
    assert_eq!(snapshot.source, SnapshotSource::Fallback);
    assert!(snapshot.fallback_reason.is_some());
    assert!(snapshot.last_check.is_some());
    assert!(snapshot.get("g1").is_some() && snapshot.get("g2").is_some());
    assert!(app.refresher().needs_refresh());
}

#[tokio::test]
async fn test_insufficient_run_without_previous_data_fails() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(upstream());
    fake.set_metric_rows(json!([]));
    let config = build_config(test_config(dir.path(), vec![Domain::Apm]));
    let app = Application::with_transport(config, Arc::clone(&fake) as _).unwrap();

    let err = app.refresh_once().await.unwrap_err();
    assert!(matches!(err, NervaError::CollectionInsufficient(_)));
    assert!(app.cache().read().is_empty());
    assert!(!app.cache().path().exists());
}

#[tokio::test]
async fn test_missing_credentials_abort_the_run() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(upstream());
    let mut config = build_config(test_config(dir.path(), vec![Domain::Apm]));
    config.upstream.api_key = None;
    let app = Application::with_transport(config, Arc::clone(&fake) as _).unwrap();

    let err = app.refresh_once().await.unwrap_err();
    assert!(matches!(err, NervaError::Config(_)));
    assert_eq!(fake.calls(), 0);
}

#[tokio::test]
async fn test_open_circuit_aborts_and_keeps_snapshot() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(upstream());
    let config = build_config(
        test_config(dir.path(), vec![Domain::Apm, Domain::Infra])
            .retries(1, Duration::from_millis(1))
            .failure_threshold(1),
    );
    let app = Application::with_transport(config, Arc::clone(&fake) as _).unwrap();

    app.refresh_once().await.unwrap();
    let before = app.cache().read();

    fake.fail_with(Some(503));
    let err = app.refresh_once().await.unwrap_err();

    assert!(matches!(err, NervaError::CircuitOpen { .. }));
    assert_eq!(app.executor().breaker().state(), CircuitState::Open);
    assert!(Arc::ptr_eq(&before, &app.cache().read()));
}

#[tokio::test]
async fn test_concurrent_refreshes_share_one_run() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(
        FakeUpstream::with_delay(Duration::from_millis(30))
            .with_entities(Domain::Apm, vec![search_row("g1", "checkout", Domain::Apm)]),
    );
    let config = build_config(test_config(dir.path(), vec![Domain::Apm]));
    let app = Application::with_transport(config, Arc::clone(&fake) as _).unwrap();

    let (first, second) = tokio::join!(app.refresh_once(), app.refresh_once());

    assert_eq!(first.unwrap(), RefreshOutcome::Refreshed { entities: 1 });
    assert_eq!(second.unwrap(), RefreshOutcome::Refreshed { entities: 1 });
    assert_eq!(fake.searches(), 1);
}

#[tokio::test]
async fn test_run_loop_refreshes_until_shutdown() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(upstream());
    let config = build_config(test_config(dir.path(), vec![Domain::Apm]));
    let app = Application::with_transport(config, Arc::clone(&fake) as _).unwrap();
    let cache = Arc::clone(app.cache());

    app.run_until(tokio::time::sleep(Duration::from_millis(200)))
        .await
        .unwrap();

    assert_eq!(cache.read().len(), 1);
    assert!(cache.path().exists());
}

#[tokio::test]
async fn test_fallback_keeps_data_age_across_restart() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(upstream());
    let config = build_config(test_config(dir.path(), vec![Domain::Apm, Domain::Infra]));
    let app = Application::with_transport(config, Arc::clone(&fake) as _).unwrap();

    let consolidated_at = Utc::now() - chrono::Duration::hours(20);
    let mut old = CacheSnapshot::from_entities(vec![TestEntityBuilder::new("g1")
        .metric("30min", "apdex", json!([{"score": 0.8}]))
        .build()]);
    old.generated_at = Some(consolidated_at);
    app.cache().install(old);

    fake.set_metric_rows(json!([{"score": null}]));
    let outcome = app.refresh_once().await.unwrap();
    assert!(matches!(outcome, RefreshOutcome::KeptPrevious { .. }));
    assert_eq!(app.cache().read().generated_at, Some(consolidated_at));
    assert!(app.cache().stats().age_secs.unwrap() >= 20 * 3600 - 60);

    let restarted = ConsolidationCache::new(&app.config().cache);
    let restored = restarted
        .restore()
        .await
        .expect("fallback file is younger than max_age");
    assert_eq!(restored.source, SnapshotSource::Fallback);
    assert_eq!(restored.generated_at, Some(consolidated_at));
    assert!(restarted.needs_refresh());
}

#[tokio::test]
async fn test_recovery_run_after_cooldown_collects_every_domain() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(
        FakeUpstream::with_delay(Duration::from_millis(5))
            .with_entities(Domain::Apm, vec![search_row("g1", "checkout", Domain::Apm)])
            .with_entities(Domain::Infra, vec![search_row("g2", "db-host", Domain::Infra)]),
    );
    let config = build_config(
        test_config(dir.path(), vec![Domain::Apm, Domain::Infra])
            .failure_threshold(1)
            .cooldown(Duration::from_millis(50)),
    );
    let app = Application::with_transport(config, Arc::clone(&fake) as _).unwrap();

    app.refresh_once().await.unwrap();

    fake.fail_with(Some(503));
    let _ = app.refresh_once().await;
    assert_eq!(app.executor().breaker().state(), CircuitState::Open);

    fake.fail_with(None);
    tokio::time::sleep(Duration::from_millis(80)).await;

    let outcome = app.refresh_once().await.unwrap();
    assert_eq!(outcome, RefreshOutcome::Refreshed { entities: 2 });
    assert_eq!(app.executor().breaker().state(), CircuitState::Closed);
    assert_eq!(app.cache().read().source, SnapshotSource::Live);
}

#[tokio::test]
async fn test_failed_domains_keep_previous_snapshot() {
    let dir = TempDir::new().unwrap();
    let fake = Arc::new(upstream());
    let config = build_config(
        test_config(dir.path(), vec![Domain::Apm, Domain::Browser, Domain::Infra])
            .max_failed_domains(1),
    );
    let app = Application::with_transport(config, Arc::clone(&fake) as _).unwrap();

    assert_eq!(
        app.refresh_once().await.unwrap(),
        RefreshOutcome::Refreshed { entities: 2 }
    );

    fake.fail_domain(Domain::Browser, 503);
    fake.fail_domain(Domain::Infra, 503);
    match app.refresh_once().await.unwrap() {
        RefreshOutcome::KeptPrevious { entities, reason } => {
            assert_eq!(entities, 2);
            assert!(reason.contains("domain searches failed"));
        },
        other => panic!("expected the previous snapshot to be kept, got {other:?}"),
    }

    let snapshot = app.cache().read();
    assert_eq!(snapshot.source, SnapshotSource::Fallback);
    assert!(snapshot.get("g2").is_some());
}

#[tokio::test]
async fn test_collection_respects_global_in_flight_limit() {
    let dir = TempDir::new().unwrap();
    let domains = vec![Domain::Apm, Domain::Browser, Domain::Infra];
    let mut fake = FakeUpstream::with_delay(Duration::from_millis(5));
    for domain in &domains {
        let rows = (0..4)
            .map(|i| search_row(&format!("{}-{i}", domain.as_str()), "svc", *domain))
            .collect();
        fake = fake.with_entities(*domain, rows);
    }
    let fake = Arc::new(fake);
    let config = build_config(test_config(dir.path(), domains).pacing(2, Duration::ZERO));
    let app = Application::with_transport(config, Arc::clone(&fake) as _).unwrap();

    let outcome = app.refresh_once().await.unwrap();

    assert_eq!(outcome, RefreshOutcome::Refreshed { entities: 12 });
    assert_eq!(fake.peak_in_flight(), 2);
}
