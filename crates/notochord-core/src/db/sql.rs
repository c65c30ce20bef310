//! SQL rendering helpers: dialect-specific insert-if-absent and composable
//! identifier queries.

use crate::error::{NotochordError, Result};
use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection};

/// SQL dialect of a backing store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SqlDialect {
    Sqlite,
    Postgres,
    Mysql,
    Other(String),
}

impl SqlDialect {
    pub fn name(&self) -> &str {
        match self {
            SqlDialect::Sqlite => "sqlite",
            SqlDialect::Postgres => "postgresql",
            SqlDialect::Mysql => "mysql",
            SqlDialect::Other(name) => name,
        }
    }

    /// Render an insert that silently skips rows violating a uniqueness
    /// constraint. The returned text ends right after the column list; the
    /// caller appends `VALUES ...` or `SELECT ...`, and for Postgres the
    /// trailing [`SqlDialect::conflict_suffix`].
    ///
    /// Unknown dialects fail with `ConcurrencyConflict`: plain inserts would
    /// either abort on a race or duplicate rows.
    pub fn insert_ignore(&self, table: &str, columns: &[&str]) -> Result<String> {
        let columns = columns.join(", ");
        match self {
            SqlDialect::Sqlite => Ok(format!("INSERT OR IGNORE INTO {} ({})", table, columns)),
            SqlDialect::Mysql => Ok(format!("INSERT IGNORE INTO {} ({})", table, columns)),
            SqlDialect::Postgres => Ok(format!("INSERT INTO {} ({})", table, columns)),
            SqlDialect::Other(name) => Err(NotochordError::ConcurrencyConflict {
                dialect: name.clone(),
            }),
        }
    }

    /// Trailing clause that completes [`SqlDialect::insert_ignore`].
    pub fn conflict_suffix(&self) -> &'static str {
        match self {
            SqlDialect::Postgres => " ON CONFLICT DO NOTHING",
            _ => "",
        }
    }

    /// Trailing clause turning a plain `INSERT` into an upsert that
    /// overwrites `updates` when `keys` collide.
    pub fn upsert_suffix(&self, keys: &[&str], updates: &[&str]) -> Result<String> {
        match self {
            SqlDialect::Sqlite | SqlDialect::Postgres => Ok(format!(
                " ON CONFLICT ({}) DO UPDATE SET {}",
                keys.join(", "),
                updates
                    .iter()
                    .map(|col| format!("{col} = excluded.{col}"))
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
            SqlDialect::Mysql => Ok(format!(
                " ON DUPLICATE KEY UPDATE {}",
                updates
                    .iter()
                    .map(|col| format!("{col} = VALUES({col})"))
                    .collect::<Vec<_>>()
                    .join(", ")
            )),
            SqlDialect::Other(name) => Err(NotochordError::ConcurrencyConflict {
                dialect: name.clone(),
            }),
        }
    }
}

/// `?, ?, ?` with `n` placeholders.
pub(crate) fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// An ordered, single-column selection of identifiers.
///
/// The SQL must project one integer column named `id` and use anonymous `?`
/// placeholders only, so it can be embedded in larger statements whose own
/// parameters precede it.
#[derive(Debug, Clone)]
pub struct IdQuery {
    sql: String,
    params: Vec<Value>,
}

impl IdQuery {
    pub fn new(sql: impl Into<String>, params: Vec<Value>) -> Self {
        Self {
            sql: sql.into(),
            params,
        }
    }

    /// Select exactly the given ids, in the given order.
    pub fn from_ids(ids: &[i64]) -> Self {
        let json = format!(
            "[{}]",
            ids.iter().map(|id| id.to_string()).collect::<Vec<_>>().join(",")
        );
        Self::new(
            "SELECT CAST(value AS INTEGER) AS id FROM json_each(?) ORDER BY key",
            vec![Value::Text(json)],
        )
    }

    /// Every widget in ascending id order.
    pub fn all_widgets() -> Self {
        Self::new("SELECT idwidget AS id FROM widget ORDER BY idwidget", Vec::new())
    }

    /// Widgets restricted to `[min_id, max_id)` and to the named datasources.
    /// An empty datasource list means no restriction.
    pub fn filter_widgets(min_id: Option<i64>, max_id: Option<i64>, datasources: &[&str]) -> Self {
        let mut sql = String::from(
            "SELECT w.idwidget AS id FROM widget w \
             JOIN datasource ds ON ds.iddatasource = w.iddatasource WHERE 1 = 1",
        );
        let mut params = Vec::new();

        if let Some(min_id) = min_id {
            sql.push_str(" AND w.idwidget >= ?");
            params.push(Value::Integer(min_id));
        }
        if let Some(max_id) = max_id {
            sql.push_str(" AND w.idwidget < ?");
            params.push(Value::Integer(max_id));
        }
        if !datasources.is_empty() {
            sql.push_str(&format!(" AND ds.name IN ({})", placeholders(datasources.len())));
            params.extend(datasources.iter().map(|name| Value::Text(name.to_string())));
        }
        sql.push_str(" ORDER BY w.idwidget");

        Self::new(sql, params)
    }

    /// Every feature of one feature set in ascending id order.
    pub fn features_in_set(idfeature_set: i64) -> Self {
        Self::new(
            "SELECT idfeature AS id FROM feature WHERE idfeature_set = ? ORDER BY idfeature",
            vec![Value::Integer(idfeature_set)],
        )
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Run the query and collect ids in query order.
    pub fn fetch(&self, conn: &Connection) -> Result<Vec<i64>> {
        let mut stmt = conn.prepare(&self.sql)?;
        let ids = stmt
            .query_map(params_from_iter(self.params.iter()), |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<i64>>>()?;
        Ok(ids)
    }

    /// Number of rows the query selects.
    pub fn count(&self, conn: &Connection) -> Result<i64> {
        let count = conn.query_row(
            &format!("SELECT COUNT(*) FROM ({}) AS q", self.sql),
            params_from_iter(self.params.iter()),
            |row| row.get(0),
        )?;
        Ok(count)
    }
}
