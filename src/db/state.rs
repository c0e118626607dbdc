//! Per (source, user) synchronization state

use chrono::{DateTime, Utc};
use serde::Serialize;

use super::{DbPool, conn, format_datetime, parse_datetime_opt};
use crate::Result;

const STATE_COLUMNS: &str = "source_id, user_id, last_success_at, last_attempt_at, last_error, \
     etag, since_cursor, next_run_at, consecutive_failures, last_pack";

/// Sync progress of one source for one user
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SourceSyncState {
    pub source_id: String,
    pub user_id: String,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    /// Conditional-fetch token from the last accepted response
    pub etag: Option<String>,
    /// Incremental cursor from the last accepted pack
    pub since_cursor: Option<String>,
    pub next_run_at: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    /// Raw JSON of the last accepted pack, reused when the source reports no change
    #[serde(skip_serializing)]
    pub last_pack: Option<String>,
}

impl SourceSyncState {
    /// Fresh state for a pair that has never been scheduled
    #[must_use]
    pub fn new(source_id: &str, user_id: &str) -> Self {
        Self {
            source_id: source_id.to_string(),
            user_id: user_id.to_string(),
            ..Self::default()
        }
    }

    /// Whether the pair may run at `now`
    #[must_use]
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.next_run_at.is_none_or(|at| at <= now)
    }
}

/// Repository for sync state rows
#[derive(Debug, Clone)]
pub struct SourceStateRepo {
    pool: DbPool,
}

impl SourceStateRepo {
    /// Create a new state repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the state of a (source, user) pair
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get(&self, source_id: &str, user_id: &str) -> Result<Option<SourceSyncState>> {
        let conn = conn(&self.pool)?;

        let result = conn.query_row(
            &format!(
                "SELECT {STATE_COLUMNS} FROM context_source_state WHERE source_id = ?1 AND user_id = ?2"
            ),
            [source_id, user_id],
            row_to_state,
        );

        match result {
            Ok(state) => Ok(Some(state)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// List every state row for a user, ordered by source
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_for_user(&self, user_id: &str) -> Result<Vec<SourceSyncState>> {
        let conn = conn(&self.pool)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM context_source_state WHERE user_id = ?1 ORDER BY source_id"
        ))?;

        let states = stmt
            .query_map([user_id], row_to_state)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(states)
    }

    /// Insert or replace the state of a pair
    ///
    /// `next_run_at` never moves backwards: the stored value is kept when it
    /// is later than the one being written.
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn upsert(&self, state: &SourceSyncState) -> Result<()> {
        let conn = conn(&self.pool)?;

        conn.execute(
            "INSERT INTO context_source_state (source_id, user_id, last_success_at, last_attempt_at, \
             last_error, etag, since_cursor, next_run_at, consecutive_failures, last_pack) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10) \
             ON CONFLICT(source_id, user_id) DO UPDATE SET \
                last_success_at = excluded.last_success_at, \
                last_attempt_at = excluded.last_attempt_at, \
                last_error = excluded.last_error, \
                etag = excluded.etag, \
                since_cursor = excluded.since_cursor, \
                next_run_at = CASE \
                    WHEN next_run_at IS NULL THEN excluded.next_run_at \
                    WHEN excluded.next_run_at IS NULL THEN next_run_at \
                    ELSE MAX(next_run_at, excluded.next_run_at) END, \
                consecutive_failures = excluded.consecutive_failures, \
                last_pack = excluded.last_pack",
            rusqlite::params![
                state.source_id,
                state.user_id,
                state.last_success_at.map(format_datetime),
                state.last_attempt_at.map(format_datetime),
                state.last_error,
                state.etag,
                state.since_cursor,
                state.next_run_at.map(format_datetime),
                state.consecutive_failures,
                state.last_pack,
            ],
        )?;

        Ok(())
    }

    /// List every state row of a source
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn list_for_source(&self, source_id: &str) -> Result<Vec<SourceSyncState>> {
        let conn = conn(&self.pool)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT {STATE_COLUMNS} FROM context_source_state WHERE source_id = ?1 ORDER BY user_id"
        ))?;

        let states = stmt
            .query_map([source_id], row_to_state)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(states)
    }
}

fn row_to_state(row: &rusqlite::Row<'_>) -> rusqlite::Result<SourceSyncState> {
    Ok(SourceSyncState {
        source_id: row.get(0)?,
        user_id: row.get(1)?,
        last_success_at: parse_datetime_opt(row.get(2)?),
        last_attempt_at: parse_datetime_opt(row.get(3)?),
        last_error: row.get(4)?,
        etag: row.get(5)?,
        since_cursor: row.get(6)?,
        next_run_at: parse_datetime_opt(row.get(7)?),
        consecutive_failures: row.get(8)?,
        last_pack: row.get(9)?,
    })
}
