//! API endpoint integration tests

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    http::{Request, StatusCode, header},
    response::Response,
};
use chrono::Utc;
use conversa_gateway::DbPool;
use conversa_gateway::api::ApiServerBuilder;
use conversa_gateway::sync::pack::SNAPSHOT_SCHEMA_VERSION;
use conversa_gateway::sync::{ContextSnapshot, MergedPayload, SnapshotReader, SnapshotStore};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tower::ServiceExt;

mod common;
use common::{link_test_user, setup_test_db, test_orchestrator};

const API_KEY: &str = "test-api-key";

/// Test router plus the store behind it and the sync queue receiver
fn build_test_router(db: DbPool) -> (axum::Router, Arc<SnapshotStore>, mpsc::Receiver<String>) {
    let (orchestrator, store) = test_orchestrator(&db, &[]);
    let (handle, signals) = orchestrator.channel();
    let reader = SnapshotReader::new(Arc::clone(&store), handle.clone(), Duration::from_secs(30));

    let server = ApiServerBuilder::new(db, Arc::clone(&store), reader, handle, 0)
        .api_key(Some(API_KEY.to_string()))
        .build();

    (server.router(), store, signals)
}

fn request(method: &str, uri: &str, body: Option<Value>) -> Request<Body> {
    let builder = Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {API_KEY}"));

    match body {
        Some(json) => builder
            .header(header::CONTENT_TYPE, "application/json")
            .body(Body::from(json.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn body_json(response: Response) -> Value {
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

fn snapshot_for(user_id: &str) -> ContextSnapshot {
    let payload = MergedPayload {
        schema_version: SNAPSHOT_SCHEMA_VERSION.to_string(),
        generated_at: Utc::now(),
        facts: BTreeMap::from([("locale".to_string(), json!("es-ES"))]),
        recents: BTreeMap::new(),
        pointers: BTreeMap::new(),
        sources: vec![],
    };
    ContextSnapshot::new(user_id, payload, Utc::now())
}

#[tokio::test]
async fn test_health_endpoint() {
    let (app, _store, _signals) = build_test_router(setup_test_db());

    let response = app
        .oneshot(Request::builder().uri("/health").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert!(json["version"].is_string());
}

#[tokio::test]
async fn test_ready_endpoint() {
    let (app, _store, _signals) = build_test_router(setup_test_db());

    let response = app
        .oneshot(Request::builder().uri("/ready").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "ok");
    assert_eq!(json["checks"]["database"]["status"], "ok");
    assert_eq!(json["checks"]["sync"]["status"], "ok");
}

#[tokio::test]
async fn test_metrics_without_recorder_is_not_found() {
    let (app, _store, _signals) = build_test_router(setup_test_db());

    let response = app
        .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_requires_auth() {
    let (app, _store, _signals) = build_test_router(setup_test_db());

    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/admin/sources")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(body_json(response).await["error"]["code"], "unauthorized");

    let response = app
        .oneshot(
            Request::builder()
                .uri("/api/admin/sources")
                .header(header::AUTHORIZATION, "Bearer wrong-key")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn test_source_lifecycle() {
    let (app, _store, _signals) = build_test_router(setup_test_db());

    let response = app
        .clone()
        .oneshot(request(
            "POST",
            "/api/admin/sources",
            Some(json!({
                "source_id": "linden-api",
                "display_name": "Linden",
                "base_url": "https://linden.example.com",
                "auth": {"type": "bearer", "token": "secret-token"},
                "poll_interval_secs": 900,
            })),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::CREATED);
    let created = body_json(response).await;
    assert_eq!(created["source_id"], "linden-api");
    assert_eq!(created["auth"], "bearer");
    assert!(!created.to_string().contains("secret-token"));

    let response = app
        .clone()
        .oneshot(request(
            "PATCH",
            "/api/admin/sources/linden-api",
            Some(json!({"enabled": false})),
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["enabled"], false);

    let response = app
        .clone()
        .oneshot(request("GET", "/api/admin/sources", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);

    let response = app
        .clone()
        .oneshot(request("DELETE", "/api/admin/sources/linden-api", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(request("GET", "/api/admin/sources/linden-api", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_create_source_rejects_bad_url() {
    let (app, _store, _signals) = build_test_router(setup_test_db());

    let response = app
        .oneshot(request(
            "POST",
            "/api/admin/sources",
            Some(json!({
                "source_id": "linden-api",
                "display_name": "Linden",
                "base_url": "not a url",
            })),
        ))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    assert_eq!(body_json(response).await["error"]["code"], "validation_error");
}

#[tokio::test]
async fn test_link_unknown_source_is_not_found() {
    let (app, _store, _signals) = build_test_router(setup_test_db());

    let response = app
        .oneshot(request("PUT", "/api/admin/sources/missing/users/user-1", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_link_and_list_users() {
    let db = setup_test_db();
    common::create_test_source(
        &db,
        "linden-api",
        "https://linden.example.com",
        conversa_gateway::db::SourceCapabilities::default(),
    );
    let (app, _store, _signals) = build_test_router(db);

    let response = app
        .clone()
        .oneshot(request("PUT", "/api/admin/sources/linden-api/users/user-1", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .clone()
        .oneshot(request("GET", "/api/admin/sources/linden-api/users", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["users"], json!(["user-1"]));

    let response = app
        .clone()
        .oneshot(request("DELETE", "/api/admin/sources/linden-api/users/user-1", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NO_CONTENT);

    let response = app
        .oneshot(request("DELETE", "/api/admin/sources/linden-api/users/user-1", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sync_now_is_queued() {
    let db = setup_test_db();
    common::create_test_source(
        &db,
        "linden-api",
        "https://linden.example.com",
        conversa_gateway::db::SourceCapabilities::default(),
    );
    link_test_user(&db, "linden-api", "user-1");
    let (app, _store, mut signals) = build_test_router(db);

    let response = app
        .oneshot(request("POST", "/api/admin/users/user-1/sync", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::ACCEPTED);
    assert_eq!(body_json(response).await["accepted"], true);
    assert_eq!(signals.try_recv().unwrap(), "user-1");
}

#[tokio::test]
async fn test_sync_now_without_orchestrator_is_unavailable() {
    let (app, _store, signals) = build_test_router(setup_test_db());
    drop(signals);

    let response = app
        .oneshot(request("POST", "/api/admin/users/user-1/sync", None))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body_json(response).await["error"]["code"], "sync_unavailable");
}

#[tokio::test]
async fn test_context_miss_then_hit() {
    let (app, store, mut signals) = build_test_router(setup_test_db());

    // public route: no API key needed
    let response = app
        .clone()
        .oneshot(
            Request::builder()
                .uri("/api/context/user-1")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert!(body_json(response).await["context"].is_null());
    assert_eq!(signals.try_recv().unwrap(), "user-1");

    store.put(&snapshot_for("user-1")).await.unwrap();

    let response = app
        .oneshot(request("GET", "/api/context/user-1", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["context"]["facts"]["locale"], "es-ES");
    assert!(signals.try_recv().is_err());
}

#[tokio::test]
async fn test_snapshot_endpoints() {
    let (app, store, _signals) = build_test_router(setup_test_db());

    let response = app
        .clone()
        .oneshot(request("GET", "/api/admin/users/user-1/snapshot", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    store.put(&snapshot_for("user-1")).await.unwrap();

    let response = app
        .clone()
        .oneshot(request("GET", "/api/admin/users/user-1/snapshot", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["user_id"], "user-1");
    assert_eq!(json["payload"]["facts"]["locale"], "es-ES");
    assert!(json["id"].is_string());

    let response = app
        .oneshot(request("GET", "/api/admin/users/user-1/snapshots", None))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await.as_array().unwrap().len(), 1);
}
