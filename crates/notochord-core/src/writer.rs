//! Idempotent bulk upsert of computed values into `widget_feature`.
//!
//! Input is normalized to `(widget, feature, value)` rows and shape-checked
//! first. Rows are then loaded into a staging table and swapped into the live
//! table with one delete plus one insert inside a single transaction, so
//! readers see either none or all of a batch and every `(widget, feature)`
//! pair keeps at most one row.

use crate::config::StoreDefaults;
use crate::db::{Database, FeatureRole, IdQuery, StagingTable};
use crate::error::{NotochordError, Result};
use crate::matrix::CooMatrix;
use crate::selection::{ensure_model, enumerate_with};
use ndarray::{Array1, Array2};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use std::collections::BTreeMap;
use tracing::{debug, info};

/// Values accepted by [`PredictionWriter::write`].
#[derive(Debug, Clone, PartialEq)]
pub enum PredictionValues {
    /// One value per widget for a model with a single output feature.
    Vector(Array1<f64>),
    /// Shape `(widgets, output features)`.
    Dense(Array2<f64>),
    /// Row and column indices are offsets into the widget and feature lists,
    /// or raw ids when neither list is given.
    Sparse(CooMatrix),
    /// One inner list per widget, one value per output feature.
    Rows(Vec<Vec<f64>>),
}

impl From<Array1<f64>> for PredictionValues {
    fn from(values: Array1<f64>) -> Self {
        PredictionValues::Vector(values)
    }
}

impl From<Array2<f64>> for PredictionValues {
    fn from(values: Array2<f64>) -> Self {
        PredictionValues::Dense(values)
    }
}

impl From<CooMatrix> for PredictionValues {
    fn from(values: CooMatrix) -> Self {
        PredictionValues::Sparse(values)
    }
}

impl From<Vec<Vec<f64>>> for PredictionValues {
    fn from(values: Vec<Vec<f64>>) -> Self {
        PredictionValues::Rows(values)
    }
}

/// A `(widget, feature, value)` row bound for `widget_feature`.
pub type ValueRow = (i64, i64, f64);

/// Writes model outputs and other computed values.
#[derive(Clone)]
pub struct PredictionWriter {
    db: Database,
    batch_size: usize,
}

impl PredictionWriter {
    pub fn new(db: Database) -> Self {
        Self::with_batch_size(db, StoreDefaults::STAGING_BATCH)
    }

    /// Use `batch_size` rows per staging insert.
    pub fn with_batch_size(db: Database, batch_size: usize) -> Self {
        Self {
            db,
            batch_size: batch_size.max(1),
        }
    }

    /// Persist `values` as the model's predictions for `widget_ids`.
    ///
    /// Columns map to the model's `predicts` features in selection order. A
    /// sparse input without widget ids is written in raw mode, its indices
    /// taken as widget and feature ids. Returns the number of rows written.
    pub fn write(
        &self,
        model: i64,
        widget_ids: Option<&[i64]>,
        values: &PredictionValues,
    ) -> Result<usize> {
        let raw = widget_ids.is_none() && matches!(values, PredictionValues::Sparse(_));

        let features: Option<Vec<i64>> = if raw {
            None
        } else {
            let conn = self.db.lock_conn()?;
            ensure_model(&conn, model)?;
            Some(
                enumerate_with(&conn, model, FeatureRole::Predicts)?
                    .into_iter()
                    .map(|(_, id)| id)
                    .collect(),
            )
        };

        let rows = normalize(widget_ids, features.as_deref(), values)?;
        let written = self.upsert(&rows)?;

        info!("Wrote {} prediction values for model {}", written, model);
        Ok(written)
    }

    /// Persist `values` against explicit widget and feature id lists.
    pub fn write_values(
        &self,
        widget_ids: Option<&[i64]>,
        feature_ids: Option<&[i64]>,
        values: &PredictionValues,
    ) -> Result<usize> {
        let rows = normalize(widget_ids, feature_ids, values)?;
        self.upsert(&rows)
    }

    /// Replace-or-insert rows through a staging table.
    ///
    /// When a pair occurs more than once in `rows`, the last occurrence wins.
    pub fn upsert(&self, rows: &[ValueRow]) -> Result<usize> {
        if rows.is_empty() {
            return Ok(0);
        }

        let staging = StagingTable::create(
            &self.db,
            "tmp_widget_feature",
            "idwidget INTEGER NOT NULL, idfeature INTEGER NOT NULL, value REAL",
        )?;
        staging.populate(
            &["idwidget", "idfeature", "value"],
            rows.iter().map(|&(widget, feature, value)| {
                vec![
                    Value::Integer(widget),
                    Value::Integer(feature),
                    Value::Real(value),
                ]
            }),
            self.batch_size,
        )?;

        let written = {
            let conn = self.db.lock_conn()?;
            let tx = conn
                .unchecked_transaction()
                .map_err(NotochordError::transaction)?;

            let deleted = tx
                .execute(
                    &format!(
                        "DELETE FROM widget_feature WHERE EXISTS (
                            SELECT 1 FROM {tmp} s
                            WHERE s.idwidget = widget_feature.idwidget
                              AND s.idfeature = widget_feature.idfeature)",
                        tmp = staging.name()
                    ),
                    [],
                )
                .map_err(NotochordError::transaction)?;

            let inserted = tx
                .execute(
                    &format!(
                        "INSERT INTO widget_feature (idwidget, idfeature, value)
                         SELECT idwidget, idfeature, value FROM {tmp}
                         WHERE rowid IN (
                            SELECT MAX(rowid) FROM {tmp} GROUP BY idwidget, idfeature)",
                        tmp = staging.name()
                    ),
                    [],
                )
                .map_err(NotochordError::transaction)?;

            tx.commit().map_err(NotochordError::transaction)?;
            debug!("Replaced {} and inserted {} widget values", deleted, inserted);
            inserted
        };

        Ok(written)
    }

    /// Stored values of the model's private features, one entry per widget
    /// in ascending widget order.
    ///
    /// `features` defaults to the model's `predicts` features. Each vector
    /// follows `features` order with `None` where a widget has no value.
    pub fn read_predictions(
        &self,
        model: i64,
        features: Option<&[i64]>,
    ) -> Result<Vec<(i64, Vec<Option<f64>>)>> {
        let conn = self.db.lock_conn()?;
        ensure_model(&conn, model)?;

        let features: Vec<i64> = match features {
            Some(features) => features.to_vec(),
            None => enumerate_with(&conn, model, FeatureRole::Predicts)?
                .into_iter()
                .map(|(_, id)| id)
                .collect(),
        };
        let column: BTreeMap<i64, usize> = features
            .iter()
            .enumerate()
            .map(|(col, &id)| (id, col))
            .collect();

        let wanted = IdQuery::from_ids(&features);
        let sql = format!(
            "SELECT wf.idwidget, wf.idfeature, wf.value
             FROM feature_set fs
             JOIN feature f ON f.idfeature_set = fs.idfeature_set
             JOIN widget_feature wf ON wf.idfeature = f.idfeature
             WHERE fs.idmodel = ? AND wf.idfeature IN ({})
             ORDER BY wf.idwidget ASC, wf.idfeature ASC",
            wanted.sql()
        );
        let params = std::iter::once(Value::Integer(model)).chain(wanted.params().iter().cloned());

        let mut stmt = conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(params), |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, Option<f64>>(2)?,
            ))
        })?;

        let mut out: Vec<(i64, Vec<Option<f64>>)> = Vec::new();
        for row in rows {
            let (widget, feature, value) = row?;
            if out.last().map(|(w, _)| *w) != Some(widget) {
                out.push((widget, vec![None; features.len()]));
            }
            if let (Some(&col), Some((_, vector))) = (column.get(&feature), out.last_mut()) {
                vector[col] = value;
            }
        }

        Ok(out)
    }
}

fn shape_mismatch(expected: impl std::fmt::Debug, actual: impl std::fmt::Debug) -> NotochordError {
    NotochordError::ShapeMismatch {
        expected: format!("{:?}", expected),
        actual: format!("{:?}", actual),
    }
}

fn missing_ids(field: &str) -> NotochordError {
    NotochordError::Validation {
        field: field.to_string(),
        message: "required unless writing a raw sparse matrix".to_string(),
    }
}

fn require<'a>(ids: Option<&'a [i64]>, field: &str) -> Result<&'a [i64]> {
    ids.ok_or_else(|| missing_ids(field))
}

/// Flatten any accepted input into rows, failing on the first shape
/// disagreement.
fn normalize(
    widget_ids: Option<&[i64]>,
    feature_ids: Option<&[i64]>,
    values: &PredictionValues,
) -> Result<Vec<ValueRow>> {
    match values {
        PredictionValues::Vector(vector) => {
            let widgets = require(widget_ids, "widget_ids")?;
            let features = require(feature_ids, "feature_ids")?;
            if features.len() != 1 || vector.len() != widgets.len() {
                return Err(shape_mismatch(
                    (widgets.len(), features.len()),
                    (vector.len(), 1),
                ));
            }
            Ok(widgets
                .iter()
                .zip(vector.iter())
                .map(|(&widget, &value)| (widget, features[0], value))
                .collect())
        }
        PredictionValues::Dense(dense) => {
            let widgets = require(widget_ids, "widget_ids")?;
            let features = require(feature_ids, "feature_ids")?;
            if dense.dim() != (widgets.len(), features.len()) {
                return Err(shape_mismatch((widgets.len(), features.len()), dense.dim()));
            }
            Ok(dense
                .indexed_iter()
                .map(|((r, c), &value)| (widgets[r], features[c], value))
                .collect())
        }
        PredictionValues::Rows(rows) => {
            let widgets = require(widget_ids, "widget_ids")?;
            let features = require(feature_ids, "feature_ids")?;
            if rows.len() != widgets.len() {
                return Err(shape_mismatch(widgets.len(), rows.len()));
            }
            if let Some(bad) = rows.iter().find(|row| row.len() != features.len()) {
                return Err(shape_mismatch(features.len(), bad.len()));
            }
            Ok(widgets
                .iter()
                .zip(rows)
                .flat_map(|(&widget, row)| {
                    features
                        .iter()
                        .zip(row)
                        .map(move |(&feature, &value)| (widget, feature, value))
                })
                .collect())
        }
        PredictionValues::Sparse(coo) => match (widget_ids, feature_ids) {
            (None, None) => coo
                .iter()
                .map(|(r, c, value)| {
                    let widget = i64::try_from(r).map_err(|_| shape_mismatch("i64 widget id", r))?;
                    let feature = i64::try_from(c).map_err(|_| shape_mismatch("i64 feature id", c))?;
                    Ok((widget, feature, value))
                })
                .collect(),
            (Some(widgets), Some(features)) => {
                let (nrows, ncols) = coo.shape();
                if nrows > widgets.len() || ncols > features.len() {
                    return Err(shape_mismatch((widgets.len(), features.len()), coo.shape()));
                }
                coo.iter()
                    .map(|(r, c, value)| match (widgets.get(r), features.get(c)) {
                        (Some(&widget), Some(&feature)) => Ok((widget, feature, value)),
                        _ => Err(shape_mismatch((widgets.len(), features.len()), (r, c))),
                    })
                    .collect()
            }
            (None, Some(_)) => Err(missing_ids("widget_ids")),
            (Some(_), None) => Err(missing_ids("feature_ids")),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::selection::SelectionRegistry;
    use ndarray::array;

    /// Model 1 with `n` predicts features and widgets 1..=30.
    fn fixture(n: usize) -> (Database, Vec<i64>) {
        let db = Database::open_in_memory().unwrap();
        {
            let conn = db.lock_conn().unwrap();
            conn.execute_batch(
                "INSERT INTO model (insert_time, uuid, hyperparameters) VALUES ('t', 'm', x'00');
                 INSERT INTO feature_set (idmodel, name) VALUES (1, 'out');
                 INSERT INTO datasource (name) VALUES ('rss');",
            )
            .unwrap();
            for it in 1..=30 {
                conn.execute(
                    "INSERT INTO widget (iddatasource, insert_time, uuid) VALUES (1, 't', ?1)",
                    [format!("w{}", it)],
                )
                .unwrap();
            }
            for it in 0..n {
                conn.execute(
                    "INSERT INTO feature (idfeature_set, name) VALUES (1, ?1)",
                    [format!("out{}", it)],
                )
                .unwrap();
            }
        }
        let features: Vec<i64> = (1..=n as i64).collect();
        SelectionRegistry::new(db.clone())
            .assign_ids(1, FeatureRole::Predicts, &features)
            .unwrap();
        (db, features)
    }

    fn value_count(db: &Database) -> i64 {
        let conn = db.lock_conn().unwrap();
        conn.query_row("SELECT COUNT(*) FROM widget_feature", [], |row| row.get(0))
            .unwrap()
    }

    #[test]
    fn test_overwrite_keeps_one_row_per_pair() {
        let (db, _) = fixture(2);
        let writer = PredictionWriter::new(db.clone());

        let values = PredictionValues::Rows(vec![vec![0.1, 0.2], vec![0.3, 0.4]]);
        assert_eq!(writer.write(1, Some(&[1, 2]), &values).unwrap(), 4);
        assert_eq!(value_count(&db), 4);

        let update = PredictionValues::Rows(vec![vec![0.9, 0.9]]);
        writer.write(1, Some(&[1]), &update).unwrap();
        assert_eq!(value_count(&db), 4);

        let predictions = writer.read_predictions(1, None).unwrap();
        assert_eq!(
            predictions,
            vec![
                (1, vec![Some(0.9), Some(0.9)]),
                (2, vec![Some(0.3), Some(0.4)]),
            ]
        );
    }

    #[test]
    fn test_repeated_write_is_idempotent() {
        let (db, _) = fixture(2);
        let writer = PredictionWriter::new(db.clone());
        let values = PredictionValues::Dense(array![[1.0, 2.0], [3.0, 4.0], [5.0, 6.0]]);

        writer.write(1, Some(&[1, 2, 3]), &values).unwrap();
        writer.write(1, Some(&[1, 2, 3]), &values).unwrap();
        assert_eq!(value_count(&db), 6);
    }

    #[test]
    fn test_vector_needs_single_feature() {
        let (db, _) = fixture(1);
        let writer = PredictionWriter::new(db.clone());
        writer
            .write(1, Some(&[4, 5]), &array![0.25, 0.75].into())
            .unwrap();
        assert_eq!(
            writer.read_predictions(1, None).unwrap(),
            vec![(4, vec![Some(0.25)]), (5, vec![Some(0.75)])]
        );

        let (db, _) = fixture(2);
        let err = PredictionWriter::new(db)
            .write(1, Some(&[4, 5]), &array![0.25, 0.75].into())
            .unwrap_err();
        assert!(matches!(err, NotochordError::ShapeMismatch { .. }));
    }

    #[test]
    fn test_shape_mismatch_leaves_store_untouched() {
        let (db, _) = fixture(2);
        let writer = PredictionWriter::new(db.clone());

        let ragged = PredictionValues::Rows(vec![vec![0.1, 0.2], vec![0.3]]);
        let err = writer.write(1, Some(&[1, 2]), &ragged).unwrap_err();
        assert!(matches!(err, NotochordError::ShapeMismatch { .. }));

        let dense = PredictionValues::Dense(array![[1.0, 2.0]]);
        assert!(writer.write(1, Some(&[1, 2]), &dense).is_err());
        assert_eq!(value_count(&db), 0);
    }

    #[test]
    fn test_sparse_offsets_and_raw_mode() {
        let (db, features) = fixture(3);
        let writer = PredictionWriter::with_batch_size(db.clone(), 2);

        let coo = CooMatrix::from_triplets([(0, 2, 1.5), (1, 0, 2.5)]);
        writer.write(1, Some(&[10, 20]), &coo.into()).unwrap();
        let predictions = writer.read_predictions(1, Some(&features)).unwrap();
        assert_eq!(
            predictions,
            vec![
                (10, vec![None, None, Some(1.5)]),
                (20, vec![Some(2.5), None, None]),
            ]
        );

        // Raw mode: indices are ids.
        let raw = CooMatrix::from_triplets([(30, 1, 7.0), (30, 1, 8.0)]);
        assert_eq!(writer.write(1, None, &raw.into()).unwrap(), 1);
        let conn = db.lock_conn().unwrap();
        let value: f64 = conn
            .query_row(
                "SELECT value FROM widget_feature WHERE idwidget = 30 AND idfeature = 1",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(value, 8.0);
    }

    #[test]
    fn test_staging_table_is_dropped() {
        let (db, _) = fixture(1);
        let writer = PredictionWriter::new(db.clone());
        writer
            .write(1, Some(&[1]), &PredictionValues::Rows(vec![vec![1.0]]))
            .unwrap();

        let conn = db.lock_conn().unwrap();
        let leftover: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_temp_master WHERE name LIKE 'tmp_widget_feature%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(leftover, 0);
    }

    #[test]
    fn test_failed_swap_leaves_values() {
        let (db, _) = fixture(1);
        let writer = PredictionWriter::new(db.clone());
        writer.upsert(&[(1, 1, 0.5), (2, 1, 0.25)]).unwrap();

        // Widget 999 does not exist, so the insert half of the swap fails
        // after the delete half already ran.
        let err = writer.upsert(&[(1, 1, 9.0), (999, 1, 1.0)]).unwrap_err();
        assert!(matches!(err, NotochordError::Transaction { .. }));

        assert_eq!(
            writer.read_predictions(1, None).unwrap(),
            vec![(1, vec![Some(0.5)]), (2, vec![Some(0.25)])]
        );

        let conn = db.lock_conn().unwrap();
        let leftover: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM sqlite_temp_master WHERE name LIKE 'tmp_widget_feature%'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(leftover, 0);
    }
}
