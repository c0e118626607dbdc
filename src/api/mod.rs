//! HTTP API server for the Conversa gateway

pub mod admin;
mod auth;
pub mod context;
pub mod health;

use std::sync::Arc;

use axum::Router;
use axum::http::StatusCode;
use axum::Json;
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::db::{DbPool, SourceLinkRepo, SourceRepo, SourceStateRepo};
use crate::sync::{SnapshotReader, SnapshotStore, SyncHandle};
use crate::{Error, Result};

/// Shared state for API handlers
#[derive(Clone)]
pub struct ApiState {
    pub db: DbPool,
    pub api_key: Option<String>,
    pub sources: SourceRepo,
    pub links: SourceLinkRepo,
    pub states: SourceStateRepo,
    pub store: Arc<SnapshotStore>,
    pub reader: SnapshotReader,
    pub sync: SyncHandle,
    /// Whether the background orchestrator is running
    pub sync_enabled: bool,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: ErrorDetail,
}

#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    pub code: String,
    pub message: String,
}

/// Handler error: status plus JSON body
pub type ApiError = (StatusCode, Json<ErrorResponse>);

pub(crate) fn error_response(status: StatusCode, code: &str, message: &str) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: ErrorDetail {
                code: code.to_string(),
                message: message.to_string(),
            },
        }),
    )
}

/// Map a crate error onto a status and error code
pub(crate) fn api_error(e: &Error) -> ApiError {
    match e {
        Error::Validation(msg) => error_response(StatusCode::BAD_REQUEST, "validation_error", msg),
        Error::NotFound(what) => {
            error_response(StatusCode::NOT_FOUND, "not_found", &format!("{what} not found"))
        }
        _ => {
            tracing::error!(error = %e, "request failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "db_error", &e.to_string())
        }
    }
}

/// Configuration for building an API server
pub struct ApiServerBuilder {
    db: DbPool,
    store: Arc<SnapshotStore>,
    reader: SnapshotReader,
    sync: SyncHandle,
    port: u16,
    api_key: Option<String>,
    sync_enabled: bool,
    metrics: Option<PrometheusHandle>,
}

impl ApiServerBuilder {
    /// Create a new API server builder
    #[must_use]
    pub const fn new(
        db: DbPool,
        store: Arc<SnapshotStore>,
        reader: SnapshotReader,
        sync: SyncHandle,
        port: u16,
    ) -> Self {
        Self {
            db,
            store,
            reader,
            sync,
            port,
            api_key: None,
            sync_enabled: true,
            metrics: None,
        }
    }

    /// Set the API key for admin endpoints
    #[must_use]
    pub fn api_key(mut self, key: Option<String>) -> Self {
        self.api_key = key;
        self
    }

    /// Record whether the orchestrator runs (reported by `/ready`)
    #[must_use]
    pub const fn sync_enabled(mut self, enabled: bool) -> Self {
        self.sync_enabled = enabled;
        self
    }

    /// Serve this recorder at `/metrics`
    #[must_use]
    pub fn metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Build the API server
    #[must_use]
    pub fn build(self) -> ApiServer {
        let state = Arc::new(ApiState {
            sources: SourceRepo::new(self.db.clone()),
            links: SourceLinkRepo::new(self.db.clone()),
            states: SourceStateRepo::new(self.db.clone()),
            db: self.db,
            api_key: self.api_key,
            store: self.store,
            reader: self.reader,
            sync: self.sync,
            sync_enabled: self.sync_enabled,
            metrics: self.metrics,
        });

        ApiServer {
            state,
            port: self.port,
        }
    }
}

/// API server
pub struct ApiServer {
    state: Arc<ApiState>,
    port: u16,
}

impl ApiServer {
    /// Build the router with all routes
    #[must_use]
    pub fn router(&self) -> Router {
        let router = Router::new()
            .nest("/api/admin", admin::router(self.state.clone()))
            .nest("/api/context", context::router(self.state.clone()))
            .merge(health::router())
            .merge(health::ready_router(self.state.clone()));

        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);

        router.layer(cors).layer(TraceLayer::new_for_http())
    }

    /// Run the API server until `shutdown` resolves
    ///
    /// # Errors
    ///
    /// Returns error if server fails to bind or run
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.state.api_key.is_none() {
            tracing::warn!("CONVERSA_API_KEY not set - admin endpoints are unauthenticated");
        }

        let addr = format!("0.0.0.0:{}", self.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| Error::Config(format!("failed to bind API server: {e}")))?;

        tracing::info!(port = self.port, "API server listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(|e| Error::Config(format!("API server error: {e}")))?;

        Ok(())
    }
}
