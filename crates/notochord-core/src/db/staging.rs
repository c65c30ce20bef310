//! Scoped temporary relations.
//!
//! A [`StagingTable`] exists from construction until it is dropped. Dropping
//! it removes the table on every exit path, including `?` early returns and
//! panics unwinding through the owner.

use super::sql::placeholders;
use super::Database;
use crate::error::Result;
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, warn};

static STAGING_COUNTER: AtomicU64 = AtomicU64::new(0);

/// A process-local temporary table dropped when this value goes out of scope.
pub struct StagingTable {
    db: Database,
    name: String,
}

impl StagingTable {
    /// Create `temp.<prefix>_<n>` with the given column definitions.
    ///
    /// The numeric suffix keeps concurrently open tables apart, so scopes may
    /// nest.
    pub fn create(db: &Database, prefix: &str, columns: &str) -> Result<Self> {
        let name = format!(
            "{}_{}",
            prefix,
            STAGING_COUNTER.fetch_add(1, Ordering::Relaxed)
        );

        {
            let conn = db.lock_conn()?;
            // A stale table can survive a crashed scope on a long-lived connection.
            conn.execute_batch(&format!(
                "DROP TABLE IF EXISTS temp.{name};\n\
                 CREATE TEMP TABLE {name} ({columns});",
            ))?;
        }

        debug!("Created staging table {}", name);

        Ok(Self {
            db: db.clone(),
            name,
        })
    }

    /// Unqualified table name for use in SQL.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Bulk-insert rows in multi-row statements of at most `batch_size` rows.
    ///
    /// Returns the number of rows inserted.
    pub fn populate<I>(&self, columns: &[&str], rows: I, batch_size: usize) -> Result<usize>
    where
        I: IntoIterator<Item = Vec<Value>>,
    {
        let batch_size = batch_size.max(1);
        let row_placeholders = format!("({})", placeholders(columns.len()));
        let prefix = format!("INSERT INTO {} ({}) VALUES ", self.name, columns.join(", "));

        let conn = self.db.lock_conn()?;
        let mut total = 0;
        let mut batch: Vec<Value> = Vec::with_capacity(batch_size * columns.len());
        let mut batch_rows = 0;

        let flush = |batch: &mut Vec<Value>, batch_rows: &mut usize| -> Result<()> {
            if *batch_rows == 0 {
                return Ok(());
            }
            let sql = format!(
                "{}{}",
                prefix,
                vec![row_placeholders.as_str(); *batch_rows].join(", ")
            );
            conn.execute(&sql, params_from_iter(batch.iter()))?;
            batch.clear();
            *batch_rows = 0;
            Ok(())
        };

        for row in rows {
            debug_assert_eq!(row.len(), columns.len());
            batch.extend(row);
            batch_rows += 1;
            total += 1;
            if batch_rows == batch_size {
                flush(&mut batch, &mut batch_rows)?;
            }
        }
        flush(&mut batch, &mut batch_rows)?;

        Ok(total)
    }
}

impl Drop for StagingTable {
    fn drop(&mut self) {
        let result = self.db.lock_conn().and_then(|conn| {
            conn.execute_batch(&format!("DROP TABLE IF EXISTS temp.{};", self.name))?;
            Ok(())
        });

        match result {
            Ok(()) => debug!("Dropped staging table {}", self.name),
            Err(e) => warn!("Failed to drop staging table {}: {}", self.name, e),
        }
    }
}
