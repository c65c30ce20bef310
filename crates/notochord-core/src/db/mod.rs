//! Relational backing store.
//!
//! A [`Database`] is a cheap, cloneable handle over one SQLite connection.
//! Every component locks the connection for the duration of a single
//! statement group and releases it before returning, so components can be
//! freely combined without holding locks across calls.

mod schema;
mod sql;
mod staging;

pub use schema::{FeatureRole, WidgetRole};
pub use sql::{IdQuery, SqlDialect};
pub(crate) use sql::placeholders as sql_placeholders;
pub use staging::StagingTable;

use crate::config::StoreDefaults;
use crate::error::{NotochordError, Result};
use rusqlite::Connection;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::debug;

/// Shared handle to the backing relational store.
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
    dialect: SqlDialect,
    path: Option<PathBuf>,
}

impl Database {
    /// Open (or create) a store at the given path.
    ///
    /// Creates parent directories and the schema if they don't exist.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_timeout(db_path, StoreDefaults::BUSY_TIMEOUT_MS)
    }

    /// Open a store with a custom busy timeout.
    pub fn open_with_timeout(db_path: impl AsRef<Path>, busy_timeout_ms: u64) -> Result<Self> {
        let db_path = db_path.as_ref();

        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                std::fs::create_dir_all(parent).map_err(|e| NotochordError::Io {
                    message: format!("Failed to create store directory: {}", parent.display()),
                    path: Some(parent.to_path_buf()),
                    source: Some(e),
                })?;
            }
        }

        let conn = Connection::open(db_path).map_err(|e| NotochordError::Database {
            message: format!("Failed to open store database: {}", e),
            source: Some(e),
        })?;
        Self::configure_connection(&conn, busy_timeout_ms)?;
        schema::ensure_schema(&conn)?;

        debug!("Opened feature store at {}", db_path.display());

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            dialect: SqlDialect::Sqlite,
            path: Some(db_path.to_path_buf()),
        })
    }

    /// Open a private in-memory store. Mostly useful for tests.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::configure_connection(&conn, StoreDefaults::BUSY_TIMEOUT_MS)?;
        schema::ensure_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            dialect: SqlDialect::Sqlite,
            path: None,
        })
    }

    fn configure_connection(conn: &Connection, busy_timeout_ms: u64) -> Result<()> {
        conn.execute_batch(&format!(
            "PRAGMA journal_mode=WAL;\n\
             PRAGMA busy_timeout={};\n\
             PRAGMA synchronous=NORMAL;\n\
             PRAGMA temp_store=MEMORY;\n\
             PRAGMA foreign_keys=ON;",
            busy_timeout_ms,
        ))?;
        Ok(())
    }

    /// Lock the connection for one group of statements.
    ///
    /// The guard must be released before any [`StagingTable`] created on
    /// this handle is dropped.
    pub fn lock_conn(&self) -> Result<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| NotochordError::lock_failed())
    }

    /// SQL dialect of the backing store.
    pub fn dialect(&self) -> &SqlDialect {
        &self.dialect
    }

    /// Path of the database file, `None` for in-memory stores.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Render the insert-if-absent prefix for `table (columns)`.
    pub fn insert_ignore(&self, table: &str, columns: &[&str]) -> Result<String> {
        self.dialect.insert_ignore(table, columns)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_parent_dirs() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("store.sqlite");

        let db = Database::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(db.path(), Some(path.as_path()));
    }

    #[test]
    fn test_reopen_keeps_schema() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("store.sqlite");

        {
            let db = Database::open(&path).unwrap();
            let conn = db.lock_conn().unwrap();
            conn.execute("INSERT INTO datasource (name) VALUES ('rss')", [])
                .unwrap();
        }

        let db = Database::open(&path).unwrap();
        let conn = db.lock_conn().unwrap();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM datasource", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }

    #[test]
    fn test_roles_are_seeded() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock_conn().unwrap();
        let widget_roles: i64 = conn
            .query_row("SELECT COUNT(*) FROM model_widget_type", [], |row| row.get(0))
            .unwrap();
        let feature_roles: i64 = conn
            .query_row("SELECT COUNT(*) FROM model_feature_type", [], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(widget_roles, 3);
        assert_eq!(feature_roles, 3);
    }

    #[test]
    fn test_foreign_keys_enforced() {
        let db = Database::open_in_memory().unwrap();
        let conn = db.lock_conn().unwrap();
        let enabled: i64 = conn
            .query_row("PRAGMA foreign_keys", [], |row| row.get(0))
            .unwrap();
        assert_eq!(enabled, 1);

        let err = conn
            .execute(
                "INSERT INTO widget_feature (idwidget, idfeature, value) VALUES (1, 1, 0.5)",
                [],
            )
            .unwrap_err();
        assert_eq!(
            err.sqlite_error_code(),
            Some(rusqlite::ErrorCode::ConstraintViolation)
        );
    }
}
