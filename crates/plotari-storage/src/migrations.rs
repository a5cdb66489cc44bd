//! Database schema migrations.

use rusqlite::Connection;
use tracing::info;

use plotari_core::error::PlotariError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), PlotariError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| PlotariError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| PlotariError::Storage(format!("Failed to query migration version: {}", e)))?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: conversations");
    }

    Ok(())
}

/// Version 1: one JSON document per conversation. Timestamps are Unix
/// milliseconds so expiry sweeps can run on the indexed column.
fn apply_v1(conn: &Connection) -> Result<(), PlotariError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS conversations (
            user_id         TEXT NOT NULL,
            session_id      TEXT NOT NULL,
            payload         TEXT NOT NULL,
            message_count   INTEGER NOT NULL DEFAULT 0,
            created_at      INTEGER NOT NULL,
            last_activity   INTEGER NOT NULL,
            expires_at      INTEGER NOT NULL,
            PRIMARY KEY (user_id, session_id)
        );

        CREATE INDEX IF NOT EXISTS idx_conversations_expires_at
            ON conversations (expires_at);

        CREATE INDEX IF NOT EXISTS idx_conversations_user
            ON conversations (user_id, last_activity DESC);

        INSERT INTO schema_migrations (version, name) VALUES (1, 'conversations');
        ",
    )
    .map_err(|e| PlotariError::Storage(format!("Migration v1 failed: {}", e)))?;
    Ok(())
}
