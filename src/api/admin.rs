//! Admin API endpoints: source registry, links, sync state and snapshots

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    routing::{get, post, put},
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{ApiError, ApiState, api_error, auth::require_api_key, error_response};
use crate::db::{NewSource, Source, SourceCapabilities, SourceSyncState, SourceUpdate, StoredSnapshot};

// --- Request/Response types ---

/// A source as returned by the API; credentials are never echoed
#[derive(Serialize)]
pub struct SourceResponse {
    pub source_id: String,
    pub display_name: String,
    pub base_url: String,
    pub auth: &'static str,
    pub capabilities: SourceCapabilities,
    pub poll_interval_secs: u32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Source> for SourceResponse {
    fn from(s: Source) -> Self {
        Self {
            auth: s.auth.kind(),
            source_id: s.source_id,
            display_name: s.display_name,
            base_url: s.base_url,
            capabilities: s.capabilities,
            poll_interval_secs: s.poll_interval_secs,
            enabled: s.enabled,
            created_at: s.created_at,
            updated_at: s.updated_at,
        }
    }
}

#[derive(Serialize)]
pub struct LinkedUsersResponse {
    pub source_id: String,
    pub users: Vec<String>,
}

#[derive(Serialize)]
pub struct SyncAccepted {
    pub accepted: bool,
}

fn not_found(what: &str) -> ApiError {
    error_response(StatusCode::NOT_FOUND, "not_found", &format!("{what} not found"))
}

// --- Source handlers ---

/// List registered sources
async fn list_sources(
    State(state): State<Arc<ApiState>>,
) -> Result<Json<Vec<SourceResponse>>, ApiError> {
    let sources = state.sources.list().map_err(|e| api_error(&e))?;
    Ok(Json(sources.into_iter().map(SourceResponse::from).collect()))
}

/// Register a source
async fn create_source(
    State(state): State<Arc<ApiState>>,
    Json(req): Json<NewSource>,
) -> Result<(StatusCode, Json<SourceResponse>), ApiError> {
    let source = state.sources.create(&req).map_err(|e| api_error(&e))?;
    tracing::info!(source_id = %source.source_id, "context source registered");
    Ok((StatusCode::CREATED, Json(source.into())))
}

/// Get a source
async fn get_source(
    State(state): State<Arc<ApiState>>,
    Path(source_id): Path<String>,
) -> Result<Json<SourceResponse>, ApiError> {
    state
        .sources
        .get(&source_id)
        .map_err(|e| api_error(&e))?
        .map(|s| Json(s.into()))
        .ok_or_else(|| not_found("Source"))
}

/// Update a source; `source_id` itself cannot change
async fn update_source(
    State(state): State<Arc<ApiState>>,
    Path(source_id): Path<String>,
    Json(req): Json<SourceUpdate>,
) -> Result<Json<SourceResponse>, ApiError> {
    let source = state
        .sources
        .update(&source_id, &req)
        .map_err(|e| api_error(&e))?
        .ok_or_else(|| not_found("Source"))?;

    tracing::info!(source_id = %source.source_id, enabled = source.enabled, "context source updated");
    Ok(Json(source.into()))
}

/// Soft-delete a source
async fn delete_source(
    State(state): State<Arc<ApiState>>,
    Path(source_id): Path<String>,
) -> Result<StatusCode, ApiError> {
    if state.sources.soft_delete(&source_id).map_err(|e| api_error(&e))? {
        tracing::info!(source_id = %source_id, "context source deleted");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Source"))
    }
}

// --- Link handlers ---

/// Users linked to a source
async fn list_linked_users(
    State(state): State<Arc<ApiState>>,
    Path(source_id): Path<String>,
) -> Result<Json<LinkedUsersResponse>, ApiError> {
    state
        .sources
        .get(&source_id)
        .map_err(|e| api_error(&e))?
        .ok_or_else(|| not_found("Source"))?;

    let users = state
        .links
        .users_for_source(&source_id)
        .map_err(|e| api_error(&e))?;
    Ok(Json(LinkedUsersResponse { source_id, users }))
}

/// Link a user to a source (idempotent)
async fn link_user(
    State(state): State<Arc<ApiState>>,
    Path((source_id, user_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    state
        .links
        .link(&source_id, &user_id)
        .map_err(|e| api_error(&e))?;
    Ok(StatusCode::NO_CONTENT)
}

/// Unlink a user from a source
async fn unlink_user(
    State(state): State<Arc<ApiState>>,
    Path((source_id, user_id)): Path<(String, String)>,
) -> Result<StatusCode, ApiError> {
    if state
        .links
        .unlink(&source_id, &user_id)
        .map_err(|e| api_error(&e))?
    {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(not_found("Link"))
    }
}

/// Sync state of one (source, user) pair
async fn get_state(
    State(state): State<Arc<ApiState>>,
    Path((source_id, user_id)): Path<(String, String)>,
) -> Result<Json<SourceSyncState>, ApiError> {
    state
        .states
        .get(&source_id, &user_id)
        .map_err(|e| api_error(&e))?
        .map(Json)
        .ok_or_else(|| not_found("Sync state"))
}

// --- User handlers ---

/// Queue an out-of-band sync of every source linked to the user
async fn sync_now(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
) -> Result<(StatusCode, Json<SyncAccepted>), ApiError> {
    if state.sync.request(&user_id) {
        Ok((StatusCode::ACCEPTED, Json(SyncAccepted { accepted: true })))
    } else {
        Err(error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "sync_unavailable",
            "sync queue is full or not running",
        ))
    }
}

/// Per-source sync state of a user
async fn list_user_states(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<SourceSyncState>>, ApiError> {
    let states = state
        .states
        .list_for_user(&user_id)
        .map_err(|e| api_error(&e))?;
    Ok(Json(states))
}

/// Latest snapshot of a user
async fn get_snapshot(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
) -> Result<Json<StoredSnapshot>, ApiError> {
    state
        .store
        .get_latest(&user_id)
        .map_err(|e| api_error(&e))?
        .map(Json)
        .ok_or_else(|| not_found("Snapshot"))
}

/// Snapshot history of a user, newest first
async fn list_snapshots(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
) -> Result<Json<Vec<StoredSnapshot>>, ApiError> {
    let history = state.store.history(&user_id).map_err(|e| api_error(&e))?;
    Ok(Json(history))
}

/// Build admin router with auth middleware
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/sources", get(list_sources).post(create_source))
        .route(
            "/sources/{source_id}",
            get(get_source).patch(update_source).delete(delete_source),
        )
        .route("/sources/{source_id}/users", get(list_linked_users))
        .route(
            "/sources/{source_id}/users/{user_id}",
            put(link_user).delete(unlink_user),
        )
        .route("/sources/{source_id}/state/{user_id}", get(get_state))
        .route("/users/{user_id}/sync", post(sync_now))
        .route("/users/{user_id}/state", get(list_user_states))
        .route("/users/{user_id}/snapshot", get(get_snapshot))
        .route("/users/{user_id}/snapshots", get(list_snapshots))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .with_state(state)
}
