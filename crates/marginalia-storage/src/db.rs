//! SQLite handle for the entry store.
//!
//! One connection serves every reader and writer. Join commits depend on
//! that: both endpoint rows are rewritten in a single transaction on this
//! connection, so no other write can interleave between the two
//! version-guarded updates.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::Connection;
use tracing::info;

use marginalia_core::error::MarginaliaError;

use crate::migrations;

/// The entry store's only connection.
///
/// `with_conn` holds the lock for one closure. A transaction opened inside
/// that closure is the unit of atomicity; two separate calls are never
/// atomic together, which is why join retries re-read before committing.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) the store file, enable WAL and bring the `entries`
    /// schema up to date. Missing parent directories are created.
    pub fn new(path: &Path) -> Result<Self, MarginaliaError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)
            .map_err(|e| MarginaliaError::Storage(format!("Failed to open entry store: {}", e)))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA cache_size = -65536;",
        )
        .map_err(|e| MarginaliaError::Storage(format!("Failed to set pragmas: {}", e)))?;

        let db = Self::migrated(conn)?;
        info!(path = %path.display(), "Entry store opened");
        Ok(db)
    }

    /// A private in-memory store with the current schema.
    pub fn in_memory() -> Result<Self, MarginaliaError> {
        let conn = Connection::open_in_memory().map_err(|e| {
            MarginaliaError::Storage(format!("Failed to open in-memory entry store: {}", e))
        })?;
        Self::migrated(conn)
    }

    fn migrated(conn: Connection) -> Result<Self, MarginaliaError> {
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.with_conn(migrations::run_migrations)?;
        Ok(db)
    }

    /// Run `f` with exclusive use of the connection.
    pub fn with_conn<F, T>(&self, f: F) -> Result<T, MarginaliaError>
    where
        F: FnOnce(&Connection) -> Result<T, MarginaliaError>,
    {
        let conn = self
            .conn
            .lock()
            .map_err(|e| MarginaliaError::Storage(format!("Entry store lock poisoned: {}", e)))?;
        f(&conn)
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database").finish_non_exhaustive()
    }
}
