//! End-to-end sync tests against mock context sources

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use conversa_gateway::db::{AuthRecord, NewSource, SourceCapabilities, SourceRepo, SourceStateRepo};
use conversa_gateway::sync::{SnapshotReader, SweepOutcome};
use serde_json::json;
use tokio::sync::watch;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod common;
use common::{create_test_source, link_test_user, pack_body, setup_test_db, test_orchestrator};

const GENERATED_AT: &str = "2026-03-01T12:00:00Z";

#[tokio::test]
async fn test_sweep_merges_sources_by_priority_and_union() {
    let linden = MockServer::start().await;
    let harbor = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/context-pack"))
        .and(query_param("user_id", "user-1"))
        .and(query_param("audience", "conversa"))
        .respond_with(ResponseTemplate::new(200).set_body_json(pack_body(
            GENERATED_AT,
            json!({"locale": "es-ES", "display_name": "Ana"}),
            json!({"top_entities": [{"id": "x"}, {"id": "y"}]}),
        )))
        .mount(&linden)
        .await;

    Mock::given(method("GET"))
        .and(path("/context-pack"))
        .respond_with(ResponseTemplate::new(200).set_body_json(pack_body(
            GENERATED_AT,
            json!({"locale": "en-US", "tz": "Europe/Madrid"}),
            json!({"top_entities": [{"id": "y"}, {"id": "z"}]}),
        )))
        .mount(&harbor)
        .await;

    let db = setup_test_db();
    create_test_source(&db, "linden-api", &linden.uri(), SourceCapabilities::default());
    create_test_source(&db, "harbor-notes", &harbor.uri(), SourceCapabilities::default());
    link_test_user(&db, "linden-api", "user-1");
    link_test_user(&db, "harbor-notes", "user-1");

    let (orchestrator, store) = test_orchestrator(&db, &["linden-api", "harbor-notes"]);
    let reports = orchestrator.tick(Utc::now()).await.unwrap();

    assert_eq!(reports.len(), 1);
    assert_eq!(reports[0].outcome, SweepOutcome::Stored);
    assert_eq!(reports[0].conflicts, 1);

    let latest = store.get_latest("user-1").unwrap().unwrap();
    let payload = &latest.snapshot.payload;
    assert_eq!(payload.facts["locale"], json!("es-ES"));
    assert_eq!(payload.facts["tz"], json!("Europe/Madrid"));
    assert_eq!(payload.facts["display_name"], json!("Ana"));
    assert_eq!(payload.sources.len(), 2);

    let ids: Vec<&str> = payload.recents["top_entities"]
        .iter()
        .filter_map(|e| e["id"].as_str())
        .collect();
    assert_eq!(ids.len(), 3);
    assert_eq!(ids.iter().filter(|id| **id == "y").count(), 1);
}

#[tokio::test]
async fn test_conditional_fetch_not_modified_keeps_snapshot() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/context-pack"))
        .respond_with(
            ResponseTemplate::new(200)
                .insert_header("ETag", "\"v1\"")
                .set_body_json(pack_body(GENERATED_AT, json!({"locale": "es-ES"}), json!({}))),
        )
        .up_to_n_times(1)
        .mount(&server)
        .await;

    Mock::given(method("GET"))
        .and(path("/context-pack"))
        .and(header("If-None-Match", "\"v1\""))
        .respond_with(ResponseTemplate::new(304))
        .expect(1)
        .mount(&server)
        .await;

    let db = setup_test_db();
    create_test_source(
        &db,
        "linden-api",
        &server.uri(),
        SourceCapabilities {
            supports_conditional_fetch: true,
            supports_cursor: false,
        },
    );
    link_test_user(&db, "linden-api", "user-1");

    let (orchestrator, store) = test_orchestrator(&db, &[]);
    let now = Utc::now();

    let first = orchestrator.tick(now).await.unwrap();
    assert_eq!(first[0].outcome, SweepOutcome::Stored);
    let stored = store.get_latest("user-1").unwrap().unwrap();

    let state = SourceStateRepo::new(db.clone())
        .get("linden-api", "user-1")
        .unwrap()
        .unwrap();
    assert_eq!(state.etag.as_deref(), Some("v1"));

    let later = now + chrono::Duration::hours(2);
    let second = orchestrator.tick(later).await.unwrap();
    assert_eq!(second[0].outcome, SweepOutcome::NotModified);

    let after = store.get_latest("user-1").unwrap().unwrap();
    assert_eq!(after.id, stored.id);
    assert_eq!(store.history("user-1").unwrap().len(), 1);

    let state = SourceStateRepo::new(db)
        .get("linden-api", "user-1")
        .unwrap()
        .unwrap();
    assert!(state.next_run_at.unwrap() > later);
}

#[tokio::test]
async fn test_transient_failure_backs_off() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/context-pack"))
        .respond_with(ResponseTemplate::new(503))
        .mount(&server)
        .await;

    let db = setup_test_db();
    create_test_source(&db, "linden-api", &server.uri(), SourceCapabilities::default());
    link_test_user(&db, "linden-api", "user-1");

    let (orchestrator, store) = test_orchestrator(&db, &[]);
    let states = SourceStateRepo::new(db.clone());
    let now = Utc::now();

    let reports = orchestrator.tick(now).await.unwrap();
    assert_eq!(reports[0].outcome, SweepOutcome::NoSnapshot);
    assert!(store.get_latest("user-1").unwrap().is_none());

    let state = states.get("linden-api", "user-1").unwrap().unwrap();
    assert_eq!(state.consecutive_failures, 1);
    let first_delay = state.next_run_at.unwrap() - now;
    assert!(first_delay > chrono::Duration::seconds(59));
    assert!(first_delay <= chrono::Duration::seconds(60));

    // not due inside the backoff window
    let early = now + chrono::Duration::seconds(30);
    assert!(orchestrator.tick(early).await.unwrap().is_empty());

    let retry_at = now + chrono::Duration::seconds(61);
    orchestrator.tick(retry_at).await.unwrap();
    let state = states.get("linden-api", "user-1").unwrap().unwrap();
    assert_eq!(state.consecutive_failures, 2);
    let second_delay = state.next_run_at.unwrap() - retry_at;
    assert!(second_delay > chrono::Duration::seconds(119));
    assert!(second_delay <= chrono::Duration::seconds(120));
}

#[tokio::test]
async fn test_unsupported_schema_is_discarded() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/context-pack"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "schema_version": "2.0",
            "generated_at": GENERATED_AT,
            "facts": {"locale": "es-ES"},
        })))
        .mount(&server)
        .await;

    let db = setup_test_db();
    create_test_source(&db, "linden-api", &server.uri(), SourceCapabilities::default());
    link_test_user(&db, "linden-api", "user-1");

    let (orchestrator, store) = test_orchestrator(&db, &[]);
    let reports = orchestrator.tick(Utc::now()).await.unwrap();

    assert_eq!(reports[0].outcome, SweepOutcome::NoSnapshot);
    assert_eq!(reports[0].sources[0].outcome, "schema_unsupported");
    assert!(store.get_latest("user-1").unwrap().is_none());

    let state = SourceStateRepo::new(db)
        .get("linden-api", "user-1")
        .unwrap()
        .unwrap();
    assert!(state.last_error.unwrap().contains("2.0"));
}

#[tokio::test]
async fn test_bearer_credentials_are_sent() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/context-pack"))
        .and(header("Authorization", "Bearer pack-token"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(pack_body(GENERATED_AT, json!({"locale": "es-ES"}), json!({}))),
        )
        .expect(1)
        .mount(&server)
        .await;

    let db = setup_test_db();
    let mut new = NewSource::new("linden-api", "Linden", &server.uri());
    new.auth = AuthRecord::Bearer {
        token: "pack-token".to_string(),
    };
    SourceRepo::new(db.clone()).create(&new).unwrap();
    link_test_user(&db, "linden-api", "user-1");

    let (orchestrator, _store) = test_orchestrator(&db, &[]);
    let reports = orchestrator.tick(Utc::now()).await.unwrap();
    assert_eq!(reports[0].outcome, SweepOutcome::Stored);
}

#[tokio::test]
async fn test_read_miss_triggers_background_sync() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/context-pack"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(pack_body(GENERATED_AT, json!({"locale": "es-ES"}), json!({}))),
        )
        .mount(&server)
        .await;

    let db = setup_test_db();
    create_test_source(&db, "linden-api", &server.uri(), SourceCapabilities::default());
    link_test_user(&db, "linden-api", "user-1");

    let (orchestrator, store) = test_orchestrator(&db, &[]);
    let (handle, signals) = orchestrator.channel();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(Arc::clone(&orchestrator).run(signals, shutdown_rx));

    let reader = SnapshotReader::new(Arc::clone(&store), handle, Duration::from_secs(30));
    assert!(reader.read_for_chat("user-1").is_none());

    let mut payload = None;
    for _ in 0..100 {
        payload = reader.read_for_chat("user-1");
        if payload.is_some() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert_eq!(payload.unwrap().facts["locale"], json!("es-ES"));

    shutdown_tx.send(true).unwrap();
    tokio::time::timeout(Duration::from_secs(5), task)
        .await
        .unwrap()
        .unwrap();
}
