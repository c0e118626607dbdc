//! Merged context snapshots: history rows plus one latest pointer per user

use rusqlite::OptionalExtension;
use rusqlite::types::Type;
use serde::Serialize;
use uuid::Uuid;

use super::{DbPool, conn, format_datetime, parse_datetime};
use crate::Result;
use crate::sync::pack::{ContextSnapshot, MergedPayload};

const SNAPSHOT_COLUMNS: &str =
    "id, user_id, schema_version, generated_at, payload, payload_hash, created_at";

/// A persisted snapshot
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredSnapshot {
    pub id: String,
    #[serde(flatten)]
    pub snapshot: ContextSnapshot,
}

/// Result of [`SnapshotRepo::put`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    /// A new history row was written and became the latest
    Stored { id: String },
    /// The latest snapshot already had the same content hash
    Unchanged { id: String },
}

/// Repository for context snapshots
#[derive(Debug, Clone)]
pub struct SnapshotRepo {
    pool: DbPool,
}

impl SnapshotRepo {
    /// Create a new snapshot repository
    #[must_use]
    pub const fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Latest snapshot of a user
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn get_latest(&self, user_id: &str) -> Result<Option<StoredSnapshot>> {
        let conn = conn(&self.pool)?;

        let snapshot = conn
            .query_row(
                &format!(
                    "SELECT {SNAPSHOT_COLUMNS} FROM context_snapshots WHERE id = \
                     (SELECT snapshot_id FROM context_snapshot_latest WHERE user_id = ?1)"
                ),
                [user_id],
                row_to_snapshot,
            )
            .optional()?;

        Ok(snapshot)
    }

    /// Store a snapshot and make it the latest, in one transaction
    ///
    /// Keeps at most `history_limit` rows per user (the latest always survives).
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails; the previous latest
    /// snapshot is untouched in that case
    pub fn put(&self, snapshot: &ContextSnapshot, history_limit: usize) -> Result<PutOutcome> {
        let mut conn = conn(&self.pool)?;
        let tx = conn.transaction()?;

        let latest: Option<(String, String)> = tx
            .query_row(
                "SELECT s.id, s.payload_hash FROM context_snapshot_latest l \
                 JOIN context_snapshots s ON s.id = l.snapshot_id WHERE l.user_id = ?1",
                [&snapshot.user_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        if let Some((id, hash)) = latest
            && hash == snapshot.content_hash
        {
            return Ok(PutOutcome::Unchanged { id });
        }

        let id = Uuid::new_v4().to_string();
        let payload = serde_json::to_string(&snapshot.payload)?;

        tx.execute(
            "INSERT INTO context_snapshots (id, user_id, schema_version, generated_at, payload, payload_hash, created_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            rusqlite::params![
                id,
                snapshot.user_id,
                snapshot.schema_version,
                format_datetime(snapshot.generated_at),
                payload,
                snapshot.content_hash,
                format_datetime(snapshot.created_at),
            ],
        )?;

        tx.execute(
            "INSERT INTO context_snapshot_latest (user_id, snapshot_id) VALUES (?1, ?2) \
             ON CONFLICT(user_id) DO UPDATE SET snapshot_id = excluded.snapshot_id",
            [&snapshot.user_id, &id],
        )?;

        let keep = i64::try_from(history_limit.max(1)).unwrap_or(i64::MAX);
        let pruned = tx.execute(
            "DELETE FROM context_snapshots WHERE user_id = ?1 AND id != ?2 AND id NOT IN \
             (SELECT id FROM context_snapshots WHERE user_id = ?1 \
              ORDER BY created_at DESC, rowid DESC LIMIT ?3)",
            rusqlite::params![snapshot.user_id, id, keep],
        )?;

        tx.commit()?;

        if pruned > 0 {
            tracing::debug!(user_id = %snapshot.user_id, pruned, "pruned snapshot history");
        }

        Ok(PutOutcome::Stored { id })
    }

    /// Snapshot history of a user, newest first
    ///
    /// # Errors
    ///
    /// Returns error if database operation fails
    pub fn history(&self, user_id: &str, limit: usize) -> Result<Vec<StoredSnapshot>> {
        let conn = conn(&self.pool)?;
        let limit = i64::try_from(limit).unwrap_or(i64::MAX);

        let mut stmt = conn.prepare(&format!(
            "SELECT {SNAPSHOT_COLUMNS} FROM context_snapshots WHERE user_id = ?1 \
             ORDER BY created_at DESC, rowid DESC LIMIT ?2"
        ))?;

        let snapshots = stmt
            .query_map(rusqlite::params![user_id, limit], row_to_snapshot)?
            .collect::<std::result::Result<Vec<_>, _>>()?;

        Ok(snapshots)
    }
}

fn row_to_snapshot(row: &rusqlite::Row<'_>) -> rusqlite::Result<StoredSnapshot> {
    let payload_json: String = row.get(4)?;
    let payload: MergedPayload = serde_json::from_str(&payload_json)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(4, Type::Text, Box::new(e)))?;

    Ok(StoredSnapshot {
        id: row.get(0)?,
        snapshot: ContextSnapshot {
            user_id: row.get(1)?,
            schema_version: row.get(2)?,
            generated_at: parse_datetime(&row.get::<_, String>(3)?),
            payload,
            content_hash: row.get(5)?,
            created_at: parse_datetime(&row.get::<_, String>(6)?),
        },
    })
}
