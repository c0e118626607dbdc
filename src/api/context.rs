//! Chat-time context lookup

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State},
    routing::get,
};
use serde::Serialize;

use super::ApiState;
use crate::sync::MergedPayload;

/// Latest merged context, `null` when none is available yet
#[derive(Serialize)]
pub struct ContextResponse {
    pub context: Option<MergedPayload>,
}

/// Serve the latest snapshot payload; a miss schedules a background sync
async fn get_context(
    State(state): State<Arc<ApiState>>,
    Path(user_id): Path<String>,
) -> Json<ContextResponse> {
    Json(ContextResponse {
        context: state.reader.read_for_chat(&user_id),
    })
}

/// Build context router
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/{user_id}", get(get_context))
        .with_state(state)
}
