//! Database schema migrations.
//!
//! Applies the entries schema and tracks applied versions in
//! schema_migrations.

use rusqlite::Connection;
use tracing::info;

use marginalia_core::error::MarginaliaError;

/// Run all pending database migrations.
pub fn run_migrations(conn: &Connection) -> Result<(), MarginaliaError> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            version     INTEGER PRIMARY KEY NOT NULL,
            name        TEXT NOT NULL,
            applied_at  INTEGER NOT NULL DEFAULT (strftime('%s', 'now'))
        );",
    )
    .map_err(|e| MarginaliaError::Storage(format!("Failed to create migrations table: {}", e)))?;

    let current_version: i64 = conn
        .query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_migrations",
            [],
            |row| row.get(0),
        )
        .map_err(|e| {
            MarginaliaError::Storage(format!("Failed to query migration version: {}", e))
        })?;

    if current_version < 1 {
        apply_v1(conn)?;
        info!("Applied migration v1: entries");
    }

    Ok(())
}

/// Version 1: entries table.
///
/// `seq` orders entries by insertion and never repeats (AUTOINCREMENT).
/// `version` is bumped by every update and guards read-modify-write cycles.
/// Embeddings are little-endian f32 blobs.
fn apply_v1(conn: &Connection) -> Result<(), MarginaliaError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS entries (
            seq         INTEGER PRIMARY KEY AUTOINCREMENT,
            id          TEXT NOT NULL UNIQUE,
            content     TEXT NOT NULL CHECK (length(trim(content)) > 0),
            metadata    TEXT NOT NULL,
            embedding   BLOB NOT NULL,
            dimensions  INTEGER NOT NULL CHECK (dimensions > 0),
            version     INTEGER NOT NULL DEFAULT 0,
            created_at  INTEGER NOT NULL,
            updated_at  INTEGER NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_entries_updated_at
            ON entries (updated_at DESC);

        INSERT OR IGNORE INTO schema_migrations (version, name) VALUES (1, 'entries');
        ",
    )
    .map_err(|e| MarginaliaError::Storage(format!("Failed to apply migration v1: {}", e)))?;

    Ok(())
}
