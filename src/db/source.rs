//! Context source registry: CRUD over registered sources

use std::sync::{Arc, LazyLock};

use chrono::{DateTime, Utc};
use regex::Regex;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::{DbPool, conn, format_datetime, parse_datetime, parse_datetime_opt};
use crate::{Error, Result};

/// Default poll interval for a new source (1 hour)
pub const DEFAULT_POLL_INTERVAL_SECS: u32 = 3600;

/// Allowed poll interval range in seconds
const POLL_INTERVAL_RANGE: std::ops::RangeInclusive<u32> = 60..=86_400;

static SOURCE_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9][a-z0-9-]*[a-z0-9]$").expect("valid regex"));

const SOURCE_COLUMNS: &str = "id, source_id, display_name, base_url, auth, supports_conditional_fetch, \
     supports_cursor, poll_interval_secs, enabled, created_at, updated_at, deleted_at";

/// Capability flags declared by a source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceCapabilities {
    /// Source honors `If-None-Match` and answers 304 when unchanged
    #[serde(default)]
    pub supports_conditional_fetch: bool,
    /// Source accepts a `since` cursor for incremental packs
    #[serde(default)]
    pub supports_cursor: bool,
}

/// How the fetcher authenticates against a source
///
/// Secrets stay wrapped in [`SecretString`] and are only exposed when the
/// request headers are built.
#[derive(Debug, Default)]
pub enum AuthDescriptor {
    #[default]
    None,
    Bearer {
        token: SecretString,
    },
    Basic {
        username: String,
        password: SecretString,
    },
    ApiKey {
        header: String,
        key: SecretString,
    },
}

/// Wire/storage form of [`AuthDescriptor`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthRecord {
    #[default]
    None,
    Bearer {
        #[serde(default)]
        token: String,
    },
    Basic {
        #[serde(default)]
        username: String,
        #[serde(default)]
        password: String,
    },
    ApiKey {
        #[serde(default = "default_api_key_header")]
        header: String,
        #[serde(default)]
        key: String,
    },
}

fn default_api_key_header() -> String {
    "X-Api-Key".to_string()
}

impl From<AuthRecord> for AuthDescriptor {
    fn from(record: AuthRecord) -> Self {
        match record {
            AuthRecord::None => Self::None,
            AuthRecord::Bearer { token } => Self::Bearer {
                token: SecretString::from(token),
            },
            AuthRecord::Basic { username, password } => Self::Basic {
                username,
                password: SecretString::from(password),
            },
            AuthRecord::ApiKey { header, key } => Self::ApiKey {
                header,
                key: SecretString::from(key),
            },
        }
    }
}

impl AuthDescriptor {
    /// Short label for logs and API responses (never includes secrets)
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Bearer { .. } => "bearer",
            Self::Basic { .. } => "basic",
            Self::ApiKey { .. } => "api_key",
        }
    }

    /// Convert back to the storage form, exposing secrets
    #[must_use]
    pub fn to_record(&self) -> AuthRecord {
        match self {
            Self::None => AuthRecord::None,
            Self::Bearer { token } => AuthRecord::Bearer {
                token: token.expose_secret().to_string(),
            },
            Self::Basic { username, password } => AuthRecord::Basic {
                username: username.clone(),
                password: password.expose_secret().to_string(),
            },
            Self::ApiKey { header, key } => AuthRecord::ApiKey {
                header: header.clone(),
                key: key.expose_secret().to_string(),
            },
        }
    }
}

/// A registered external provider of context packs
#[derive(Debug, Clone)]
pub struct Source {
    pub id: String,
    pub source_id: String,
    pub display_name: String,
    pub base_url: String,
    pub auth: Arc<AuthDescriptor>,
    pub capabilities: SourceCapabilities,
    pub poll_interval_secs: u32,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Source {
    /// Whether the orchestrator may schedule this source
    #[must_use]
    pub const fn is_schedulable(&self) -> bool {
        self.enabled && self.deleted_at.is_none()
    }
}

/// Input for registering a source
#[derive(Debug, Clone, Deserialize)]
pub struct NewSource {
    pub source_id: String,
    pub display_name: String,
    pub base_url: String,
    #[serde(default)]
    pub auth: AuthRecord,
    #[serde(default)]
    pub capabilities: SourceCapabilities,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u32,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

const fn default_poll_interval() -> u32 {
    DEFAULT_POLL_INTERVAL_SECS
}

const fn default_enabled() -> bool {
    true
}

impl NewSource {
    /// Minimal constructor with defaults for everything but identity and address
    #[must_use]
    pub fn new(source_id: &str, display_name: &str, base_url: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            display_name: display_name.to_string(),
            base_url: base_url.to_string(),
            auth: AuthRecord::None,
            capabilities: SourceCapabilities::default(),
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            enabled: true,
        }
    }

    /// Validate all fields
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        validate_source_id(&self.source_id)?;
        validate_display_name(&self.display_name)?;
        validate_base_url(&self.base_url)?;
        validate_poll_interval(self.poll_interval_secs)
    }
}

/// Partial update of a source; `source_id` is immutable and rejected if present
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SourceUpdate {
    pub display_name: Option<String>,
    pub base_url: Option<String>,
    pub auth: Option<AuthRecord>,
    pub capabilities: Option<SourceCapabilities>,
    pub poll_interval_secs: Option<u32>,
    pub enabled: Option<bool>,
}

impl SourceUpdate {
    /// Validate the fields that are present
    ///
    /// # Errors
    ///
    /// Returns [`Error::Validation`] describing the first invalid field
    pub fn validate(&self) -> Result<()> {
        if let Some(name) = &self.display_name {
            validate_display_name(name)?;
        }
        if let Some(url) = &self.base_url {
            validate_base_url(url)?;
        }
        if let Some(secs) = self.poll_interval_secs {
            validate_poll_interval(secs)?;
        }
        Ok(())
    }
}

/// Validate a source identifier (`^[a-z0-9][a-z0-9-]*[a-z0-9]$`, at most 64 chars)
///
/// # Errors
///
/// Returns [`Error::Validation`] if the identifier is malformed
pub fn validate_source_id(source_id: &str) -> Result<()> {
    if source_id.len() > 64 || !SOURCE_ID_REGEX.is_match(source_id) {
        return Err(Error::Validation(format!(
            "source_id must be lowercase alphanumeric with inner hyphens, 2-64 chars: {source_id:?}"
        )));
    }
    Ok(())
}

fn validate_display_name(name: &str) -> Result<()> {
    let len = name.chars().count();
    if len == 0 || len > 256 {
        return Err(Error::Validation("display_name must be 1-256 chars".to_string()));
    }
    Ok(())
}

fn validate_base_url(base_url: &str) -> Result<()> {
    let parsed = url::Url::parse(base_url)
        .map_err(|e| Error::Validation(format!("invalid base_url {base_url:?}: {e}")))?;
    if !matches!(parsed.scheme(), "http" | "https") {
        return Err(Error::Validation("base_url must be http:// or https://".to_string()));
    }
    Ok(())
}

fn validate_poll_interval(secs: u32) -> Result<()> {
    if !POLL_INTERVAL_RANGE.contains(&secs) {
        return Err(Error::Validation(format!(
            "poll_interval_secs must be within {}..={}",
            POLL_INTERVAL_RANGE.start(),
            POLL_INTERVAL_RANGE.end()
        )));
    }
    Ok(())
}

/// Repository for registered sources
#[derive(Debug, Clone)]
pub struct SourceRepo {
    pool: DbPool,
}

impl SourceRepo {
    /// Create a new source repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Register a new source
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad input or a duplicate `source_id`,
    /// or a database error
    pub fn create(&self, new: &NewSource) -> Result<Source> {
        new.validate()?;

        let conn = conn(&self.pool)?;

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM context_sources WHERE source_id = ?1)",
            [&new.source_id],
            |row| row.get(0),
        )?;
        if exists {
            return Err(Error::Validation(format!(
                "context source {:?} already exists",
                new.source_id
            )));
        }

        let id = Uuid::new_v4().to_string();
        let now = format_datetime(Utc::now());
        let auth = serde_json::to_string(&new.auth)?;

        conn.execute(
            "INSERT INTO context_sources (id, source_id, display_name, base_url, auth, \
             supports_conditional_fetch, supports_cursor, poll_interval_secs, enabled, created_at, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)",
            rusqlite::params![
                id,
                new.source_id,
                new.display_name,
                new.base_url.trim_end_matches('/'),
                auth,
                new.capabilities.supports_conditional_fetch,
                new.capabilities.supports_cursor,
                new.poll_interval_secs,
                new.enabled,
                now,
            ],
        )?;

        tracing::info!(source_id = %new.source_id, "registered context source");

        conn.query_row(
            &format!("SELECT {SOURCE_COLUMNS} FROM context_sources WHERE id = ?1"),
            [&id],
            row_to_source,
        )
        .map_err(Into::into)
    }

    /// Get a source by its stable identifier (soft-deleted sources are hidden)
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, source_id: &str) -> Result<Option<Source>> {
        let conn = conn(&self.pool)?;

        let result = conn.query_row(
            &format!(
                "SELECT {SOURCE_COLUMNS} FROM context_sources WHERE source_id = ?1 AND deleted_at IS NULL"
            ),
            [source_id],
            row_to_source,
        );

        match result {
            Ok(source) => Ok(Some(source)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List all sources that are not soft-deleted, ordered by `source_id`
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list(&self) -> Result<Vec<Source>> {
        self.query_sources("deleted_at IS NULL")
    }

    /// List sources eligible for scheduling
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_enabled(&self) -> Result<Vec<Source>> {
        self.query_sources("deleted_at IS NULL AND enabled = 1")
    }

    fn query_sources(&self, filter: &str) -> Result<Vec<Source>> {
        let conn = conn(&self.pool)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {SOURCE_COLUMNS} FROM context_sources WHERE {filter} ORDER BY source_id"
        ))?;

        let sources = stmt
            .query_map([], row_to_source)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(sources)
    }

    /// Apply a partial update; returns `None` if the source does not exist
    ///
    /// # Errors
    ///
    /// Returns a validation error for bad input, or a database error
    pub fn update(&self, source_id: &str, update: &SourceUpdate) -> Result<Option<Source>> {
        update.validate()?;

        let Some(current) = self.get(source_id)? else {
            return Ok(None);
        };

        let display_name = update.display_name.as_ref().unwrap_or(&current.display_name);
        let base_url = update
            .base_url
            .as_deref()
            .map_or(current.base_url.as_str(), |u| u.trim_end_matches('/'));
        let auth = match &update.auth {
            Some(record) => serde_json::to_string(record)?,
            None => serde_json::to_string(&current.auth.to_record())?,
        };
        let capabilities = update.capabilities.unwrap_or(current.capabilities);
        let poll_interval_secs = update.poll_interval_secs.unwrap_or(current.poll_interval_secs);
        let enabled = update.enabled.unwrap_or(current.enabled);

        {
            let conn = conn(&self.pool)?;
            conn.execute(
                "UPDATE context_sources SET display_name = ?1, base_url = ?2, auth = ?3, \
                 supports_conditional_fetch = ?4, supports_cursor = ?5, poll_interval_secs = ?6, \
                 enabled = ?7, updated_at = ?8 WHERE source_id = ?9",
                rusqlite::params![
                    display_name,
                    base_url,
                    auth,
                    capabilities.supports_conditional_fetch,
                    capabilities.supports_cursor,
                    poll_interval_secs,
                    enabled,
                    format_datetime(Utc::now()),
                    source_id,
                ],
            )?;
        }

        if update.enabled == Some(false) && current.enabled {
            tracing::info!(source_id, "context source disabled");
        }

        self.get(source_id)
    }

    /// Soft-delete a source; sync state is kept
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn soft_delete(&self, source_id: &str) -> Result<bool> {
        let conn = conn(&self.pool)?;
        let now = format_datetime(Utc::now());

        let affected = conn.execute(
            "UPDATE context_sources SET deleted_at = ?1, updated_at = ?1 \
             WHERE source_id = ?2 AND deleted_at IS NULL",
            rusqlite::params![now, source_id],
        )?;

        Ok(affected > 0)
    }
}

fn row_to_source(row: &rusqlite::Row<'_>) -> rusqlite::Result<Source> {
    let auth_json: String = row.get(4)?;
    let auth: AuthRecord = serde_json::from_str(&auth_json).unwrap_or_else(|e| {
        tracing::warn!(error = %e, "unreadable auth descriptor, treating as none");
        AuthRecord::None
    });

    Ok(Source {
        id: row.get(0)?,
        source_id: row.get(1)?,
        display_name: row.get(2)?,
        base_url: row.get(3)?,
        auth: Arc::new(auth.into()),
        capabilities: SourceCapabilities {
            supports_conditional_fetch: row.get(5)?,
            supports_cursor: row.get(6)?,
        },
        poll_interval_secs: row.get(7)?,
        enabled: row.get(8)?,
        created_at: parse_datetime(&row.get::<_, String>(9)?),
        updated_at: parse_datetime(&row.get::<_, String>(10)?),
        deleted_at: parse_datetime_opt(row.get(11)?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_memory;

    fn setup() -> SourceRepo {
        SourceRepo::new(init_memory().unwrap())
    }

    #[test]
    fn test_create_and_get() {
        let repo = setup();
        let mut new = NewSource::new("linden-api", "Linden", "https://linden.example.com/");
        new.auth = AuthRecord::Bearer {
            token: "s3cret".to_string(),
        };
        new.capabilities.supports_conditional_fetch = true;

        let created = repo.create(&new).unwrap();
        assert_eq!(created.source_id, "linden-api");
        assert_eq!(created.base_url, "https://linden.example.com");
        assert_eq!(created.auth.kind(), "bearer");
        assert!(created.capabilities.supports_conditional_fetch);
        assert!(!created.capabilities.supports_cursor);

        let fetched = repo.get("linden-api").unwrap().unwrap();
        assert_eq!(fetched.id, created.id);
        assert_eq!(fetched.poll_interval_secs, DEFAULT_POLL_INTERVAL_SECS);
    }

    #[test]
    fn test_duplicate_source_id_rejected() {
        let repo = setup();
        let new = NewSource::new("linden-api", "Linden", "https://linden.example.com");
        repo.create(&new).unwrap();

        let err = repo.create(&new).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_validation() {
        assert!(validate_source_id("linden-api").is_ok());
        assert!(validate_source_id("a1").is_ok());
        assert!(validate_source_id("-linden").is_err());
        assert!(validate_source_id("Linden").is_err());
        assert!(validate_source_id("x").is_err());
        assert!(validate_source_id(&"a".repeat(65)).is_err());

        assert!(validate_base_url("http://localhost:8080").is_ok());
        assert!(validate_base_url("ftp://example.com").is_err());
        assert!(validate_base_url("not a url").is_err());

        assert!(validate_poll_interval(59).is_err());
        assert!(validate_poll_interval(60).is_ok());
        assert!(validate_poll_interval(86_401).is_err());
    }

    #[test]
    fn test_update_and_disable() {
        let repo = setup();
        repo.create(&NewSource::new("linden-api", "Linden", "https://linden.example.com"))
            .unwrap();

        let update = SourceUpdate {
            display_name: Some("Linden API".to_string()),
            enabled: Some(false),
            ..SourceUpdate::default()
        };
        let updated = repo.update("linden-api", &update).unwrap().unwrap();
        assert_eq!(updated.display_name, "Linden API");
        assert!(!updated.enabled);
        assert!(!updated.is_schedulable());

        assert!(repo.list_enabled().unwrap().is_empty());
        assert_eq!(repo.list().unwrap().len(), 1);

        assert!(repo.update("missing", &update).unwrap().is_none());
    }

    #[test]
    fn test_update_rejects_source_id() {
        let json = r#"{"source_id": "renamed"}"#;
        assert!(serde_json::from_str::<SourceUpdate>(json).is_err());
    }

    #[test]
    fn test_soft_delete_hides_source() {
        let repo = setup();
        repo.create(&NewSource::new("linden-api", "Linden", "https://linden.example.com"))
            .unwrap();

        assert!(repo.soft_delete("linden-api").unwrap());
        assert!(!repo.soft_delete("linden-api").unwrap());
        assert!(repo.get("linden-api").unwrap().is_none());
        assert!(repo.list().unwrap().is_empty());
    }

    #[test]
    fn test_timestamps_are_stored_fixed_width() {
        let repo = setup();
        repo.create(&NewSource::new("linden-api", "Linden", "https://linden.example.com"))
            .unwrap();
        repo.soft_delete("linden-api").unwrap();

        let conn = conn(&repo.pool).unwrap();
        let (created, deleted): (String, String) = conn
            .query_row(
                "SELECT created_at, deleted_at FROM context_sources WHERE source_id = 'linden-api'",
                [],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        for stamp in [created, deleted] {
            assert_eq!(stamp.len(), "2026-01-01T00:00:00.000000Z".len());
            assert!(stamp.ends_with('Z'));
        }
    }

    #[test]
    fn test_auth_record_roundtrip_keeps_secret() {
        let record: AuthRecord =
            serde_json::from_str(r#"{"type": "api_key", "key": "abc"}"#).unwrap();
        let descriptor = AuthDescriptor::from(record);
        assert_eq!(descriptor.kind(), "api_key");

        match descriptor.to_record() {
            AuthRecord::ApiKey { header, key } => {
                assert_eq!(header, "X-Api-Key");
                assert_eq!(key, "abc");
            }
            other => panic!("unexpected record: {other:?}"),
        }

        // Debug output must not leak the secret
        assert!(!format!("{descriptor:?}").contains("abc"));
    }
}
