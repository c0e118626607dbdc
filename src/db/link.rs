//! Users linked to a source

use chrono::Utc;

use super::{DbPool, conn, format_datetime};
use crate::{Error, Result};

/// Repository for (source, user) links
#[derive(Debug, Clone)]
pub struct SourceLinkRepo {
    pool: DbPool,
}

impl SourceLinkRepo {
    /// Create a new link repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Link a user to a source (idempotent)
    ///
    /// # Errors
    ///
    /// Returns [`Error::NotFound`] if the source does not exist, or a database error
    pub fn link(&self, source_id: &str, user_id: &str) -> Result<()> {
        let conn = conn(&self.pool)?;

        let exists: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM context_sources WHERE source_id = ?1 AND deleted_at IS NULL)",
            [source_id],
            |row| row.get(0),
        )?;
        if !exists {
            return Err(Error::NotFound(format!("context source {source_id}")));
        }

        conn.execute(
            "INSERT OR IGNORE INTO context_source_users (source_id, user_id, linked_at) VALUES (?1, ?2, ?3)",
            rusqlite::params![source_id, user_id, format_datetime(Utc::now())],
        )?;

        Ok(())
    }

    /// Remove a link; returns whether it existed
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn unlink(&self, source_id: &str, user_id: &str) -> Result<bool> {
        let conn = conn(&self.pool)?;

        let affected = conn.execute(
            "DELETE FROM context_source_users WHERE source_id = ?1 AND user_id = ?2",
            [source_id, user_id],
        )?;

        Ok(affected > 0)
    }

    /// Users linked to a source, ordered by id
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn users_for_source(&self, source_id: &str) -> Result<Vec<String>> {
        let conn = conn(&self.pool)?;

        let mut stmt = conn.prepare(
            "SELECT user_id FROM context_source_users WHERE source_id = ?1 ORDER BY user_id",
        )?;

        let users = stmt
            .query_map([source_id], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;

        Ok(users)
    }
}
