//! Datasources, widgets and feature sets.

use crate::config::StoreDefaults;
use crate::db::{sql_placeholders, Database, IdQuery, StagingTable};
use crate::error::{NotochordError, Result};
use chrono::Utc;
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, info};

/// One feature value keyed by widget content key rather than widget id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WidgetFeatureUpload {
    pub uuid: String,
    pub datasource: i64,
    pub feature: i64,
    pub value: f64,
}

/// Widget with its content key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WidgetKey {
    pub id: i64,
    pub datasource: i64,
    pub uuid: String,
}

#[derive(Clone)]
pub struct WidgetStore {
    db: Database,
    batch_size: usize,
}

impl WidgetStore {
    pub fn new(db: Database) -> Self {
        Self::with_batch_size(db, StoreDefaults::STAGING_BATCH)
    }

    pub fn with_batch_size(db: Database, batch_size: usize) -> Self {
        Self {
            db,
            batch_size: batch_size.max(1),
        }
    }

    /// Id of the named datasource, created if missing.
    pub fn ensure_datasource(&self, name: &str) -> Result<i64> {
        let conn = self.db.lock_conn()?;
        conn.execute(
            &format!(
                "{} VALUES (?1){}",
                self.db.insert_ignore("datasource", &["name"])?,
                self.db.dialect().conflict_suffix()
            ),
            [name],
        )?;
        let id = conn.query_row(
            "SELECT iddatasource FROM datasource WHERE name = ?1",
            [name],
            |row| row.get(0),
        )?;
        Ok(id)
    }

    /// Id of the named datasource.
    pub fn datasource(&self, name: &str) -> Result<i64> {
        let conn = self.db.lock_conn()?;
        conn.query_row(
            "SELECT iddatasource FROM datasource WHERE name = ?1",
            [name],
            |row| row.get(0),
        )
        .optional()?
        .ok_or_else(|| NotochordError::not_found("Datasource", name))
    }

    /// Every datasource as `(id, name)`, in id order.
    pub fn datasources(&self) -> Result<Vec<(i64, String)>> {
        let conn = self.db.lock_conn()?;
        let mut stmt = conn.prepare("SELECT iddatasource, name FROM datasource ORDER BY iddatasource")?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    /// Register content keys under a datasource. Keys already present are
    /// skipped. Returns the number of new widgets.
    pub fn add_widgets<S: AsRef<str>>(&self, datasource: i64, uuids: &[S]) -> Result<usize> {
        let prefix = self
            .db
            .insert_ignore("widget", &["iddatasource", "insert_time", "uuid"])?;
        let now = Utc::now().to_rfc3339();

        let conn = self.db.lock_conn()?;
        let mut added = 0;
        for batch in uuids.chunks(self.batch_size) {
            let sql = format!(
                "{} VALUES {}{}",
                prefix,
                vec!["(?, ?, ?)"; batch.len()].join(", "),
                self.db.dialect().conflict_suffix()
            );
            let params = batch.iter().flat_map(|uuid| {
                [
                    Value::Integer(datasource),
                    Value::Text(now.clone()),
                    Value::Text(uuid.as_ref().to_string()),
                ]
            });
            added += conn.execute(&sql, params_from_iter(params))?;
        }

        debug!("Added {} widgets to datasource {}", added, datasource);
        Ok(added)
    }

    /// Widget ids for content keys, in input order. Unknown keys map to
    /// `None`.
    pub fn widget_ids<S: AsRef<str>>(&self, datasource: i64, uuids: &[S]) -> Result<Vec<Option<i64>>> {
        let conn = self.db.lock_conn()?;
        let mut found: HashMap<String, i64> = HashMap::new();

        for batch in uuids.chunks(self.batch_size) {
            let sql = format!(
                "SELECT uuid, idwidget FROM widget WHERE iddatasource = ? AND uuid IN ({})",
                sql_placeholders(batch.len())
            );
            let params = std::iter::once(Value::Integer(datasource))
                .chain(batch.iter().map(|uuid| Value::Text(uuid.as_ref().to_string())));
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt.query_map(params_from_iter(params), |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            for row in rows {
                let (uuid, id) = row?;
                found.insert(uuid, id);
            }
        }

        Ok(uuids
            .iter()
            .map(|uuid| found.get(uuid.as_ref()).copied())
            .collect())
    }

    /// Widgets selected by `query` with their content keys, in query order.
    pub fn widget_keys(&self, query: &IdQuery) -> Result<Vec<WidgetKey>> {
        let conn = self.db.lock_conn()?;
        let sql = format!(
            "SELECT w.idwidget, w.iddatasource, w.uuid
             FROM ({}) AS q JOIN widget w ON w.idwidget = q.id",
            query.sql()
        );
        let mut stmt = conn.prepare(&sql)?;
        let mut keys: HashMap<i64, WidgetKey> = stmt
            .query_map(params_from_iter(query.params().iter()), |row| {
                Ok(WidgetKey {
                    id: row.get(0)?,
                    datasource: row.get(1)?,
                    uuid: row.get(2)?,
                })
            })?
            .map(|key| key.map(|key| (key.id, key)))
            .collect::<rusqlite::Result<_>>()?;

        // Joins don't keep the subquery order; reapply it.
        let order = query.fetch(&conn)?;
        Ok(order.into_iter().filter_map(|id| keys.remove(&id)).collect())
    }

    /// Id of the feature set `name`, global when `model` is `None` and
    /// private to the model otherwise. Created if missing.
    pub fn ensure_feature_set(&self, name: &str, model: Option<i64>) -> Result<i64> {
        let conn = self.db.lock_conn()?;
        ensure_feature_set_with(&conn, &self.db, name, model)
    }

    /// Load uuid-keyed feature values, creating unknown widgets. Values
    /// already stored for a `(widget, feature)` pair are kept.
    pub fn upload_widget_features(&self, rows: &[WidgetFeatureUpload]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let staging = StagingTable::create(
            &self.db,
            "tmp_upload",
            "uuid TEXT NOT NULL, iddatasource INTEGER NOT NULL, idfeature INTEGER NOT NULL, value REAL",
        )?;
        staging.populate(
            &["uuid", "iddatasource", "idfeature", "value"],
            rows.iter().map(|row| {
                vec![
                    Value::Text(row.uuid.clone()),
                    Value::Integer(row.datasource),
                    Value::Integer(row.feature),
                    Value::Real(row.value),
                ]
            }),
            self.batch_size,
        )?;

        let inserted = {
            let conn = self.db.lock_conn()?;
            let tx = conn
                .unchecked_transaction()
                .map_err(NotochordError::transaction)?;

            tx.execute(
                &format!(
                    "{} SELECT DISTINCT iddatasource, ?1, uuid FROM {}{}",
                    self.db
                        .insert_ignore("widget", &["iddatasource", "insert_time", "uuid"])?,
                    staging.name(),
                    self.db.dialect().conflict_suffix()
                ),
                [Utc::now().to_rfc3339()],
            )
            .map_err(NotochordError::transaction)?;

            let inserted = tx
                .execute(
                    &format!(
                        "{} SELECT w.idwidget, t.idfeature, t.value
                         FROM {} t
                         JOIN widget w ON w.uuid = t.uuid AND w.iddatasource = t.iddatasource{}",
                        self.db
                            .insert_ignore("widget_feature", &["idwidget", "idfeature", "value"])?,
                        staging.name(),
                        self.db.dialect().conflict_suffix()
                    ),
                    [],
                )
                .map_err(NotochordError::transaction)?;

            tx.commit().map_err(NotochordError::transaction)?;
            inserted
        };

        info!("Uploaded {} widget feature values", inserted);
        Ok(inserted)
    }
}

/// Insert-if-absent a feature set and return its id, on a locked connection.
pub(crate) fn ensure_feature_set_with(
    conn: &Connection,
    db: &Database,
    name: &str,
    model: Option<i64>,
) -> Result<i64> {
    conn.execute(
        &format!(
            "{} VALUES (?1, ?2){}",
            db.insert_ignore("feature_set", &["idmodel", "name"])?,
            db.dialect().conflict_suffix()
        ),
        params![model, name],
    )?;
    let id = conn.query_row(
        "SELECT idfeature_set FROM feature_set WHERE IFNULL(idmodel, 0) = IFNULL(?1, 0) AND name = ?2",
        params![model, name],
        |row| row.get(0),
    )?;
    Ok(id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_datasources_are_unique() {
        let db = Database::open_in_memory().unwrap();
        let store = WidgetStore::new(db);

        let rss = store.ensure_datasource("rss").unwrap();
        assert_eq!(store.ensure_datasource("rss").unwrap(), rss);
        let wiki = store.ensure_datasource("wiki").unwrap();
        assert_ne!(rss, wiki);
        assert_eq!(store.datasource("wiki").unwrap(), wiki);
        assert!(matches!(
            store.datasource("mail"),
            Err(NotochordError::NotFound { .. })
        ));
        assert_eq!(store.datasources().unwrap().len(), 2);
    }

    #[test]
    fn test_add_widgets_skips_known_keys() {
        let db = Database::open_in_memory().unwrap();
        let store = WidgetStore::with_batch_size(db, 2);
        let rss = store.ensure_datasource("rss").unwrap();

        assert_eq!(store.add_widgets(rss, &["a", "b", "c"]).unwrap(), 3);
        assert_eq!(store.add_widgets(rss, &["c", "d"]).unwrap(), 1);

        let ids = store.widget_ids(rss, &["d", "x", "a"]).unwrap();
        assert!(ids[0].is_some());
        assert_eq!(ids[1], None);
        assert!(ids[2].is_some());

        let keys = store
            .widget_keys(&IdQuery::from_ids(&[ids[0].unwrap(), ids[2].unwrap()]))
            .unwrap();
        assert_eq!(
            keys.iter().map(|k| k.uuid.as_str()).collect::<Vec<_>>(),
            vec!["d", "a"]
        );
    }

    #[test]
    fn test_feature_set_scopes() {
        let db = Database::open_in_memory().unwrap();
        {
            let conn = db.lock_conn().unwrap();
            conn.execute(
                "INSERT INTO model (insert_time, uuid, hyperparameters) VALUES ('t', 'm', x'00')",
                [],
            )
            .unwrap();
        }
        let store = WidgetStore::new(db);

        let global = store.ensure_feature_set("words", None).unwrap();
        assert_eq!(store.ensure_feature_set("words", None).unwrap(), global);
        let private = store.ensure_feature_set("words", Some(1)).unwrap();
        assert_ne!(global, private);
        assert_eq!(store.ensure_feature_set("words", Some(1)).unwrap(), private);
    }

    #[test]
    fn test_upload_widget_features() {
        let db = Database::open_in_memory().unwrap();
        let store = WidgetStore::new(db.clone());
        let rss = store.ensure_datasource("rss").unwrap();
        let fs = store.ensure_feature_set("words", None).unwrap();
        {
            let conn = db.lock_conn().unwrap();
            conn.execute(
                "INSERT INTO feature (idfeature_set, name) VALUES (?1, 'x'), (?1, 'y')",
                [fs],
            )
            .unwrap();
        }

        let upload = |uuid: &str, feature: i64, value: f64| WidgetFeatureUpload {
            uuid: uuid.to_string(),
            datasource: rss,
            feature,
            value,
        };
        let rows = vec![upload("a", 1, 1.0), upload("a", 2, 2.0), upload("b", 1, 3.0)];
        assert_eq!(store.upload_widget_features(&rows).unwrap(), 3);

        // Existing pairs are left alone.
        let again = vec![upload("a", 1, 9.0), upload("c", 2, 4.0)];
        assert_eq!(store.upload_widget_features(&again).unwrap(), 1);

        let ids = store.widget_ids(rss, &["a", "b", "c"]).unwrap();
        assert!(ids.iter().all(Option::is_some));

        let conn = db.lock_conn().unwrap();
        let value: f64 = conn
            .query_row(
                "SELECT value FROM widget_feature WHERE idwidget = ?1 AND idfeature = 1",
                [ids[0]],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, 1.0);
    }
}
