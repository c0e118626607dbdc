//! Database schema and migrations

use rusqlite::Connection;

use crate::Result;

/// Current schema version
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the database schema
///
/// # Errors
///
/// Returns error if migration fails
pub fn init(conn: &Connection) -> Result<()> {
    let version: i32 = conn
        .query_row("PRAGMA user_version", [], |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        migrate_v1(conn)?;
    }
    if version < 2 {
        migrate_v2(conn)?;
    }
    if version < 3 {
        migrate_v3(conn)?;
    }

    Ok(())
}

fn migrate_v1(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Registered context sources
        CREATE TABLE IF NOT EXISTS context_sources (
            id TEXT PRIMARY KEY,
            source_id TEXT NOT NULL UNIQUE,
            display_name TEXT NOT NULL,
            base_url TEXT NOT NULL,
            auth TEXT NOT NULL DEFAULT '{"type":"none"}',
            supports_conditional_fetch INTEGER NOT NULL DEFAULT 0,
            supports_cursor INTEGER NOT NULL DEFAULT 0,
            poll_interval_secs INTEGER NOT NULL DEFAULT 3600,
            enabled INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL DEFAULT (datetime('now')),
            updated_at TEXT NOT NULL DEFAULT (datetime('now')),
            deleted_at TEXT
        );

        CREATE INDEX IF NOT EXISTS idx_context_sources_enabled ON context_sources(enabled);

        -- Per (source, user) sync progress
        CREATE TABLE IF NOT EXISTS context_source_state (
            source_id TEXT NOT NULL REFERENCES context_sources(source_id) ON DELETE CASCADE,
            user_id TEXT NOT NULL,
            last_success_at TEXT,
            last_attempt_at TEXT,
            last_error TEXT,
            etag TEXT,
            since_cursor TEXT,
            next_run_at TEXT,
            PRIMARY KEY (source_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_source_state_next_run ON context_source_state(source_id, next_run_at);

        -- Users linked to a source (eligible for sync)
        CREATE TABLE IF NOT EXISTS context_source_users (
            source_id TEXT NOT NULL REFERENCES context_sources(source_id) ON DELETE CASCADE,
            user_id TEXT NOT NULL,
            linked_at TEXT NOT NULL DEFAULT (datetime('now')),
            PRIMARY KEY (source_id, user_id)
        );

        CREATE INDEX IF NOT EXISTS idx_source_users_user ON context_source_users(user_id);

        PRAGMA user_version = 1;
        "#,
    )?;

    tracing::info!("migrated to schema v1");
    Ok(())
}

fn migrate_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Merged snapshots (history)
        CREATE TABLE IF NOT EXISTS context_snapshots (
            id TEXT PRIMARY KEY,
            user_id TEXT NOT NULL,
            schema_version TEXT NOT NULL,
            generated_at TEXT NOT NULL,
            payload TEXT NOT NULL,
            payload_hash TEXT NOT NULL,
            created_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_context_snapshots_user ON context_snapshots(user_id, created_at);

        -- Single authoritative snapshot per user
        CREATE TABLE IF NOT EXISTS context_snapshot_latest (
            user_id TEXT PRIMARY KEY,
            snapshot_id TEXT NOT NULL REFERENCES context_snapshots(id)
        );

        PRAGMA user_version = 2;
        ",
    )?;

    tracing::info!("migrated to schema v2 (context snapshots)");
    Ok(())
}

fn migrate_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r"
        -- Backoff bookkeeping and last accepted pack per (source, user)
        ALTER TABLE context_source_state ADD COLUMN consecutive_failures INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE context_source_state ADD COLUMN last_pack TEXT;

        PRAGMA user_version = 3;
        ",
    )?;

    tracing::info!("migrated to schema v3 (backoff state, last pack)");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_init() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();

        for table in [
            "context_sources",
            "context_source_state",
            "context_source_users",
            "context_snapshots",
            "context_snapshot_latest",
        ] {
            let count: i32 = conn
                .query_row(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    [table],
                    |row| row.get(0),
                )
                .unwrap();
            assert_eq!(count, 1, "missing table {table}");
        }
    }

    #[test]
    fn test_schema_idempotent() {
        let conn = Connection::open_in_memory().unwrap();
        init(&conn).unwrap();
        init(&conn).unwrap();

        let version: i32 = conn
            .query_row("PRAGMA user_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }
}
