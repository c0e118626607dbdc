//! Bearer API key middleware for admin routes

use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::{StatusCode, header},
    middleware::Next,
    response::Response,
};

use super::{ApiError, ApiState, error_response};

/// Bearer token from the `Authorization` header
fn bearer_token(req: &Request) -> Option<&str> {
    req.headers()
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::trim)
}

/// Reject requests without the configured API key
///
/// With no key configured every request passes.
pub async fn require_api_key(
    State(state): State<Arc<ApiState>>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let Some(expected) = state.api_key.as_deref() else {
        return Ok(next.run(req).await);
    };

    match bearer_token(&req) {
        Some(key) if key == expected => Ok(next.run(req).await),
        Some(_) => {
            tracing::warn!(path = %req.uri().path(), "invalid API key");
            Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized", "invalid API key"))
        }
        None => {
            tracing::debug!(path = %req.uri().path(), "missing API key");
            Err(error_response(StatusCode::UNAUTHORIZED, "unauthorized", "missing API key"))
        }
    }
}
