//! Context pack fetcher: one incremental pull against one source for one user

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use reqwest::header::{ACCEPT, ETAG, HeaderName, IF_NONE_MATCH};
use secrecy::ExposeSecret;

use super::pack::{ContextPack, PackLimits, PackRejection, parse_pack};
use crate::db::{AuthDescriptor, Source, SourceSyncState};
use crate::{Error, Result};

/// Path of the pull endpoint, relative to the source base URL
pub const CONTEXT_PACK_PATH: &str = "/context-pack";

/// Failure class of a fetch, which decides how it is retried
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FetchErrorKind {
    /// Network, timeout, 5xx, 408, 429
    Transient,
    /// Auth, permission and other 4xx, or an unusable auth descriptor
    Fatal,
    /// Unknown major schema version
    SchemaUnsupported,
    /// Malformed body or missing required fields
    Invalid,
}

impl FetchErrorKind {
    /// Label used in logs and metrics
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Transient => "transient",
            Self::Fatal => "fatal",
            Self::SchemaUnsupported => "schema_unsupported",
            Self::Invalid => "invalid",
        }
    }
}

/// A classified fetch failure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchError {
    pub kind: FetchErrorKind,
    pub message: String,
}

impl FetchError {
    fn new(kind: FetchErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Failure for a source that did not answer within the sweep deadline
    #[must_use]
    pub fn timed_out() -> Self {
        Self::new(FetchErrorKind::Transient, "sweep deadline exceeded")
    }
}

impl std::fmt::Display for FetchError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

impl From<PackRejection> for FetchError {
    fn from(rejection: PackRejection) -> Self {
        let kind = match rejection {
            PackRejection::SchemaUnsupported(_) => FetchErrorKind::SchemaUnsupported,
            PackRejection::Invalid(_) => FetchErrorKind::Invalid,
        };
        Self::new(kind, rejection.to_string())
    }
}

/// A pack accepted from a source
#[derive(Debug, Clone)]
pub struct FreshPack {
    pub pack: ContextPack,
    /// New conditional-fetch token
    pub etag: Option<String>,
    /// New incremental cursor
    pub cursor: Option<String>,
    /// Whether size caps were applied
    pub truncated: bool,
    /// Size of the response body
    pub payload_bytes: usize,
}

/// Result of one fetch
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Fresh(Box<FreshPack>),
    NotModified,
    Error(FetchError),
}

impl FetchOutcome {
    /// Label used in logs and metrics
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Fresh(_) => "fresh",
            Self::NotModified => "not_modified",
            Self::Error(e) => e.kind.as_str(),
        }
    }
}

/// Pulls context packs from a source
#[async_trait]
pub trait Fetcher: Send + Sync {
    /// Fetch the pack of `user_id` from `source`, given the prior sync state
    async fn fetch(
        &self,
        source: &Source,
        user_id: &str,
        prior: Option<&SourceSyncState>,
    ) -> FetchOutcome;
}

/// HTTP implementation of [`Fetcher`]
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    audience: String,
    timeout: Duration,
    limits: PackLimits,
}

impl HttpFetcher {
    /// Create a fetcher; every request carries `timeout`
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client cannot be built
    pub fn new(audience: &str, timeout: Duration, limits: PackLimits) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("conversa-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            audience: audience.to_string(),
            timeout,
            limits,
        })
    }

    fn build_request(
        &self,
        source: &Source,
        user_id: &str,
        prior: Option<&SourceSyncState>,
    ) -> std::result::Result<reqwest::RequestBuilder, FetchError> {
        let url = format!("{}{CONTEXT_PACK_PATH}", source.base_url.trim_end_matches('/'));

        let mut query = vec![("user_id", user_id), ("audience", self.audience.as_str())];
        if source.capabilities.supports_cursor
            && let Some(cursor) = prior.and_then(|s| s.since_cursor.as_deref())
        {
            query.push(("since", cursor));
        }

        let mut request = self
            .client
            .get(url)
            .query(&query)
            .header(ACCEPT, "application/json")
            .timeout(self.timeout);

        if source.capabilities.supports_conditional_fetch
            && let Some(etag) = prior.and_then(|s| s.etag.as_deref())
        {
            request = request.header(IF_NONE_MATCH, format!("\"{etag}\""));
        }

        apply_auth(request, &source.auth)
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(
        &self,
        source: &Source,
        user_id: &str,
        prior: Option<&SourceSyncState>,
    ) -> FetchOutcome {
        let request = match self.build_request(source, user_id, prior) {
            Ok(request) => request,
            Err(e) => return FetchOutcome::Error(e),
        };

        tracing::debug!(source_id = %source.source_id, user_id, "fetching context pack");

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return FetchOutcome::Error(classify_transport(&e)),
        };

        let status = response.status();
        if status == StatusCode::NOT_MODIFIED {
            return FetchOutcome::NotModified;
        }
        if !status.is_success() {
            return FetchOutcome::Error(classify_status(status));
        }

        let etag = response
            .headers()
            .get(ETAG)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim_start_matches("W/").trim_matches('"').to_string())
            .filter(|v| !v.is_empty());

        let body = match read_capped(response, self.limits.body_max_bytes).await {
            Ok(body) => body,
            Err(e) => return FetchOutcome::Error(e),
        };

        match parse_pack(&source.source_id, &body, &self.limits) {
            Ok(parsed) => {
                let mut pack = parsed.pack;
                if pack.version.is_none() {
                    pack.version.clone_from(&etag);
                }
                FetchOutcome::Fresh(Box::new(FreshPack {
                    pack,
                    etag,
                    cursor: parsed.cursor,
                    truncated: parsed.truncated,
                    payload_bytes: body.len(),
                }))
            }
            Err(rejection) => FetchOutcome::Error(rejection.into()),
        }
    }
}

/// Read the response body, giving up as soon as it exceeds `max` bytes
async fn read_capped(
    mut response: reqwest::Response,
    max: usize,
) -> std::result::Result<Vec<u8>, FetchError> {
    let too_large = || {
        FetchError::new(
            FetchErrorKind::Invalid,
            format!("response body exceeds {max} bytes"),
        )
    };

    if let Some(len) = response.content_length()
        && len > u64::try_from(max).unwrap_or(u64::MAX)
    {
        return Err(too_large());
    }

    let mut body = Vec::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| classify_transport(&e))? {
        if body.len() + chunk.len() > max {
            return Err(too_large());
        }
        body.extend_from_slice(&chunk);
    }
    Ok(body)
}

/// Attach credentials; a descriptor without its secret cannot succeed
fn apply_auth(
    request: reqwest::RequestBuilder,
    auth: &AuthDescriptor,
) -> std::result::Result<reqwest::RequestBuilder, FetchError> {
    let missing = |what: &str| FetchError::new(FetchErrorKind::Fatal, format!("{what} missing"));

    match auth {
        AuthDescriptor::None => Ok(request),
        AuthDescriptor::Bearer { token } => {
            if token.expose_secret().is_empty() {
                return Err(missing("bearer token"));
            }
            Ok(request.bearer_auth(token.expose_secret()))
        }
        AuthDescriptor::Basic { username, password } => {
            if username.is_empty() {
                return Err(missing("basic auth username"));
            }
            Ok(request.basic_auth(username, Some(password.expose_secret())))
        }
        AuthDescriptor::ApiKey { header, key } => {
            if key.expose_secret().is_empty() {
                return Err(missing("api key"));
            }
            let name = HeaderName::from_bytes(header.as_bytes()).map_err(|_| {
                FetchError::new(FetchErrorKind::Fatal, format!("invalid api key header {header:?}"))
            })?;
            Ok(request.header(name, key.expose_secret()))
        }
    }
}

/// Map an HTTP status to a failure class
#[must_use]
pub fn classify_status(status: StatusCode) -> FetchError {
    let kind = if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        FetchErrorKind::Transient
    } else {
        FetchErrorKind::Fatal
    };
    FetchError::new(kind, format!("HTTP {status}"))
}

fn classify_transport(e: &reqwest::Error) -> FetchError {
    let kind = if e.is_builder() {
        FetchErrorKind::Fatal
    } else {
        FetchErrorKind::Transient
    };
    let message = if e.is_timeout() {
        "request timed out".to_string()
    } else {
        e.to_string()
    };
    FetchError::new(kind, message)
}
