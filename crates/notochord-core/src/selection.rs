//! Ordered role membership of widgets and features per model.
//!
//! Rows get an autoincrementing surrogate key on insert and are always read
//! back ordered by it. That order is the canonical row/column order used when
//! encoding matrices and decoding predictions, so assignments never reorder
//! or duplicate rows that already exist.

use crate::config::StoreDefaults;
use crate::db::{FeatureRole, IdQuery, WidgetRole};
use crate::db::{sql_placeholders, Database};
use crate::error::{NotochordError, Result};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection};
use tracing::debug;

/// A role whose memberships live in one selection table.
pub trait SelectionRole: Copy + std::fmt::Display {
    /// Selection table name.
    const TABLE: &'static str;
    /// Surrogate key column that fixes insertion order.
    const KEY: &'static str;
    /// Column holding the selected widget or feature id.
    const MEMBER: &'static str;
    /// Column holding the role id.
    const ROLE: &'static str;

    fn role_id(&self) -> i64;
}

impl SelectionRole for WidgetRole {
    const TABLE: &'static str = "model_widget";
    const KEY: &'static str = "idmodel_widget";
    const MEMBER: &'static str = "idwidget";
    const ROLE: &'static str = "idmodel_widget_type";

    fn role_id(&self) -> i64 {
        self.id()
    }
}

impl SelectionRole for FeatureRole {
    const TABLE: &'static str = "model_feature";
    const KEY: &'static str = "idmodel_feature";
    const MEMBER: &'static str = "idfeature";
    const ROLE: &'static str = "idmodel_feature_type";

    fn role_id(&self) -> i64 {
        self.id()
    }
}

/// Persists and replays `(model, role) -> ordered ids`.
#[derive(Clone)]
pub struct SelectionRegistry {
    db: Database,
    batch_size: usize,
}

impl SelectionRegistry {
    pub fn new(db: Database) -> Self {
        Self::with_batch_size(db, StoreDefaults::SELECTION_BATCH)
    }

    pub fn with_batch_size(db: Database, batch_size: usize) -> Self {
        Self {
            db,
            batch_size: batch_size.max(1),
        }
    }

    /// Assign every id selected by `query`, in query order, skipping ids the
    /// role already holds.
    ///
    /// Returns the number of newly assigned ids.
    pub fn assign<R: SelectionRole>(&self, model: i64, role: R, query: &IdQuery) -> Result<usize> {
        let conn = self.db.lock_conn()?;
        let inserted = assign_with(&conn, &self.db, model, role, query)?;
        debug!("Assigned {} ids to model {} as {}", inserted, model, role);
        Ok(inserted)
    }

    /// Assign an explicit id list in batches, in list order.
    pub fn assign_ids<R: SelectionRole>(&self, model: i64, role: R, ids: &[i64]) -> Result<usize> {
        let conn = self.db.lock_conn()?;
        let inserted = assign_ids_with(&conn, &self.db, model, role, ids, self.batch_size)?;
        debug!("Assigned {} explicit ids to model {} as {}", inserted, model, role);
        Ok(inserted)
    }

    /// Ids assigned to the role, in original assignment order.
    pub fn enumerate<R: SelectionRole>(&self, model: i64, role: R) -> Result<Vec<i64>> {
        let conn = self.db.lock_conn()?;
        Ok(enumerate_with(&conn, model, role)?
            .into_iter()
            .map(|(_, id)| id)
            .collect())
    }

    /// Number of distinct ids assigned to the role.
    pub fn count<R: SelectionRole>(&self, model: i64, role: R) -> Result<i64> {
        let conn = self.db.lock_conn()?;
        let count = conn.query_row(
            &format!(
                "SELECT COUNT(DISTINCT {}) FROM {} WHERE idmodel = ?1 AND {} = ?2",
                R::MEMBER,
                R::TABLE,
                R::ROLE
            ),
            params![model, role.role_id()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Query selecting the role's ids in assignment order.
    pub fn as_query<R: SelectionRole>(&self, model: i64, role: R) -> IdQuery {
        IdQuery::new(
            format!(
                "SELECT {} AS id FROM {} WHERE idmodel = ? AND {} = ? ORDER BY {}",
                R::MEMBER,
                R::TABLE,
                R::ROLE,
                R::KEY
            ),
            vec![Value::Integer(model), Value::Integer(role.role_id())],
        )
    }

    /// Forget some of a role's members. Remaining members keep their order.
    pub fn remove<R: SelectionRole>(&self, model: i64, role: R, ids: &[i64]) -> Result<usize> {
        let conn = self.db.lock_conn()?;
        let mut removed = 0;
        for batch in ids.chunks(self.batch_size) {
            let sql = format!(
                "DELETE FROM {} WHERE idmodel = ? AND {} = ? AND {} IN ({})",
                R::TABLE,
                R::ROLE,
                R::MEMBER,
                sql_placeholders(batch.len())
            );
            let params = [Value::Integer(model), Value::Integer(role.role_id())]
                .into_iter()
                .chain(batch.iter().map(|&id| Value::Integer(id)));
            removed += conn.execute(&sql, params_from_iter(params))?;
        }
        Ok(removed)
    }
}

/// [`SelectionRegistry::assign`] on a locked connection or open transaction.
pub(crate) fn assign_with<R: SelectionRole>(
    conn: &Connection,
    db: &Database,
    model: i64,
    role: R,
    query: &IdQuery,
) -> Result<usize> {
    // Positions are numbered inside the subquery so the outer ORDER BY, not
    // the planner, fixes insertion order.
    let sql = format!(
        "{} SELECT ?, q.id, ? FROM (
            SELECT s.id AS id, ROW_NUMBER() OVER () AS pos FROM ({}) AS s
         ) AS q
         WHERE q.id IS NOT NULL
         ORDER BY q.pos{}",
        db.insert_ignore(R::TABLE, &["idmodel", R::MEMBER, R::ROLE])?,
        query.sql(),
        db.dialect().conflict_suffix(),
    );
    let params = [Value::Integer(model), Value::Integer(role.role_id())]
        .into_iter()
        .chain(query.params().iter().cloned());

    ensure_model(conn, model)?;
    Ok(conn.execute(&sql, params_from_iter(params))?)
}

/// [`SelectionRegistry::assign_ids`] on a locked connection or open
/// transaction.
pub(crate) fn assign_ids_with<R: SelectionRole>(
    conn: &Connection,
    db: &Database,
    model: i64,
    role: R,
    ids: &[i64],
    batch_size: usize,
) -> Result<usize> {
    let prefix = db.insert_ignore(R::TABLE, &["idmodel", R::MEMBER, R::ROLE])?;
    let suffix = db.dialect().conflict_suffix();

    ensure_model(conn, model)?;

    let mut inserted = 0;
    for batch in ids.chunks(batch_size.max(1)) {
        let sql = format!(
            "{} VALUES {}{}",
            prefix,
            vec!["(?, ?, ?)"; batch.len()].join(", "),
            suffix
        );
        let params = batch.iter().flat_map(|&id| {
            [
                Value::Integer(model),
                Value::Integer(id),
                Value::Integer(role.role_id()),
            ]
        });
        inserted += conn.execute(&sql, params_from_iter(params))?;
    }
    Ok(inserted)
}

/// `(surrogate key, member id)` pairs in canonical order on a locked
/// connection.
pub(crate) fn enumerate_with<R: SelectionRole>(
    conn: &Connection,
    model: i64,
    role: R,
) -> Result<Vec<(i64, i64)>> {
    page_with(conn, model, role, None, None)
}

/// Up to `limit` `(key, member)` pairs whose key is greater than `after`.
pub(crate) fn page_with<R: SelectionRole>(
    conn: &Connection,
    model: i64,
    role: R,
    after: Option<i64>,
    limit: Option<usize>,
) -> Result<Vec<(i64, i64)>> {
    let sql = format!(
        "SELECT {key}, {member} FROM {table} \
         WHERE idmodel = ?1 AND {role} = ?2 AND {key} > ?3 \
         ORDER BY {key} ASC LIMIT ?4",
        key = R::KEY,
        member = R::MEMBER,
        table = R::TABLE,
        role = R::ROLE,
    );
    // SQLite treats a negative LIMIT as unbounded.
    let limit = limit.map(|l| l as i64).unwrap_or(-1);

    let mut stmt = conn.prepare_cached(&sql)?;
    let rows = stmt
        .query_map(
            params![model, role.role_id(), after.unwrap_or(i64::MIN), limit],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )?
        .collect::<rusqlite::Result<Vec<(i64, i64)>>>()?;
    Ok(rows)
}

pub(crate) fn ensure_model(conn: &Connection, model: i64) -> Result<()> {
    let exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM model WHERE idmodel = ?1",
        [model],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Err(NotochordError::not_found("Model", model));
    }
    Ok(())
}
