//! Streams a model's selected widgets as fixed-size feature matrices.
//!
//! Columns are the model's input features in selection order and are fixed
//! for the whole stream. Rows are the widgets of one role, in selection
//! order, cut into contiguous chunks. Chunks are fetched lazily by keyset
//! pagination on the selection key, so at most one chunk of widget ids is
//! held at a time.

use crate::db::{Database, FeatureRole, IdQuery, WidgetRole};
use crate::error::{NotochordError, Result};
use crate::matrix::{FeatureMatrix, MatrixLayout};
use crate::selection::{ensure_model, enumerate_with, page_with, SelectionRegistry};
use rusqlite::params;
use std::collections::HashMap;
use tracing::debug;

/// One chunk of a stream: row labels and the matching matrix.
#[derive(Debug, Clone, PartialEq)]
pub struct MatrixChunk {
    /// Widget id of each matrix row, in row order.
    pub widget_ids: Vec<i64>,
    pub matrix: FeatureMatrix,
}

impl MatrixChunk {
    pub fn len(&self) -> usize {
        self.widget_ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.widget_ids.is_empty()
    }

    pub fn into_parts(self) -> (Vec<i64>, FeatureMatrix) {
        (self.widget_ids, self.matrix)
    }
}

/// Builds [`MatrixStream`]s over the selection tables.
#[derive(Clone)]
pub struct ChunkedMatrixReader {
    db: Database,
}

impl ChunkedMatrixReader {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Stream the widgets of `role` for `model`.
    ///
    /// `batch_size` of `None` yields everything in one chunk; `Some(0)`
    /// yields nothing. Labelled retrieval is not supported and fails before
    /// anything is read.
    pub fn stream(
        &self,
        model: i64,
        role: WidgetRole,
        batch_size: Option<usize>,
        layout: MatrixLayout,
        supervised: bool,
    ) -> Result<MatrixStream> {
        if supervised {
            return Err(NotochordError::NotImplemented(
                "supervised retrieval of features with labels",
            ));
        }

        let columns: Vec<i64> = {
            let conn = self.db.lock_conn()?;
            ensure_model(&conn, model)?;
            enumerate_with(&conn, model, FeatureRole::Input)?
                .into_iter()
                .map(|(_, id)| id)
                .collect()
        };

        debug!(
            "Streaming {} widgets of model {} over {} input features",
            role,
            model,
            columns.len()
        );

        Ok(MatrixStream {
            db: self.db.clone(),
            model,
            role,
            batch_size,
            layout,
            column_index: columns
                .iter()
                .enumerate()
                .map(|(col, &id)| (id, col))
                .collect(),
            columns,
            last_key: None,
            done: batch_size == Some(0),
        })
    }

    /// Record `query` as the model's training widgets, then stream them.
    pub fn training_data(
        &self,
        model: i64,
        query: &IdQuery,
        batch_size: Option<usize>,
        layout: MatrixLayout,
    ) -> Result<MatrixStream> {
        self.assign_and_stream(model, WidgetRole::TrainedOn, query, batch_size, layout)
    }

    /// Record `query` as widgets to predict on, then stream them.
    pub fn predict_data(
        &self,
        model: i64,
        query: &IdQuery,
        batch_size: Option<usize>,
        layout: MatrixLayout,
    ) -> Result<MatrixStream> {
        self.assign_and_stream(model, WidgetRole::PredictsOn, query, batch_size, layout)
    }

    /// Record `query` as validation widgets, then stream them.
    pub fn validation_data(
        &self,
        model: i64,
        query: &IdQuery,
        batch_size: Option<usize>,
        layout: MatrixLayout,
    ) -> Result<MatrixStream> {
        self.assign_and_stream(model, WidgetRole::ValidatedOn, query, batch_size, layout)
    }

    fn assign_and_stream(
        &self,
        model: i64,
        role: WidgetRole,
        query: &IdQuery,
        batch_size: Option<usize>,
        layout: MatrixLayout,
    ) -> Result<MatrixStream> {
        SelectionRegistry::new(self.db.clone()).assign(model, role, query)?;
        self.stream(model, role, batch_size, layout, false)
    }
}

/// Lazy, single-pass sequence of [`MatrixChunk`]s.
///
/// After an error the stream is exhausted.
pub struct MatrixStream {
    db: Database,
    model: i64,
    role: WidgetRole,
    batch_size: Option<usize>,
    layout: MatrixLayout,
    columns: Vec<i64>,
    column_index: HashMap<i64, usize>,
    last_key: Option<i64>,
    done: bool,
}

impl MatrixStream {
    /// Feature id of each matrix column, shared by every chunk.
    pub fn columns(&self) -> &[i64] {
        &self.columns
    }

    fn next_chunk(&mut self) -> Result<Option<MatrixChunk>> {
        let conn = self.db.lock_conn()?;

        let page = page_with(&conn, self.model, self.role, self.last_key, self.batch_size)?;
        let (first_key, last_key) = match (page.first(), page.last()) {
            (Some(first), Some(last)) => (first.0, last.0),
            _ => return Ok(None),
        };

        self.last_key = Some(last_key);
        if self.batch_size.map_or(true, |size| page.len() < size) {
            self.done = true;
        }

        let widget_ids: Vec<i64> = page.into_iter().map(|(_, id)| id).collect();
        let row_index: HashMap<i64, usize> = widget_ids
            .iter()
            .enumerate()
            .map(|(row, &id)| (id, row))
            .collect();

        let mut stmt = conn.prepare_cached(
            "SELECT mw.idwidget, wf.idfeature, wf.value
             FROM model_widget mw
             JOIN widget_feature wf ON wf.idwidget = mw.idwidget
             JOIN model_feature mf ON mf.idfeature = wf.idfeature
                AND mf.idmodel = mw.idmodel
                AND mf.idmodel_feature_type = ?1
             WHERE mw.idmodel = ?2
               AND mw.idmodel_widget_type = ?3
               AND mw.idmodel_widget BETWEEN ?4 AND ?5",
        )?;
        let rows = stmt.query_map(
            params![
                FeatureRole::Input.id(),
                self.model,
                self.role.id(),
                first_key,
                last_key
            ],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, Option<f64>>(2)?,
                ))
            },
        )?;

        let mut triplets = Vec::new();
        for row in rows {
            let (widget, feature, value) = row?;
            let (Some(&r), Some(&c), Some(v)) =
                (row_index.get(&widget), self.column_index.get(&feature), value)
            else {
                continue;
            };
            triplets.push((r, c, v as f32));
        }

        let matrix = FeatureMatrix::from_triplets(
            self.layout,
            (widget_ids.len(), self.columns.len()),
            &triplets,
        )?;

        debug!(
            "Read chunk of {} widgets with {} values for model {}",
            widget_ids.len(),
            triplets.len(),
            self.model
        );

        Ok(Some(MatrixChunk { widget_ids, matrix }))
    }
}

impl Iterator for MatrixStream {
    type Item = Result<MatrixChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_chunk() {
            Ok(Some(chunk)) => Some(Ok(chunk)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixture {
        db: Database,
        model: i64,
        features: Vec<i64>,
        widgets: Vec<i64>,
    }

    /// Model with three input features over seven widgets. Widget `i` has
    /// value `i` on feature `i % 3`.
    fn fixture() -> Fixture {
        let db = Database::open_in_memory().unwrap();
        let (model, features, widgets) = {
            let conn = db.lock_conn().unwrap();
            conn.execute_batch(
                "INSERT INTO datasource (name) VALUES ('src');
                 INSERT INTO feature_set (name) VALUES ('words');
                 INSERT INTO feature (idfeature_set, name) VALUES (1, 'f0'), (1, 'f1'), (1, 'f2');
                 INSERT INTO model (insert_time, uuid, hyperparameters) VALUES ('t', 'm', x'00');",
            )
            .unwrap();
            let mut widgets = Vec::new();
            for i in 0..7 {
                conn.execute(
                    "INSERT INTO widget (iddatasource, insert_time, uuid) VALUES (1, 't', ?1)",
                    [format!("w{}", i)],
                )
                .unwrap();
                let widget = conn.last_insert_rowid();
                conn.execute(
                    "INSERT INTO widget_feature (idwidget, idfeature, value) VALUES (?1, ?2, ?3)",
                    params![widget, (i % 3) + 1, i as f64],
                )
                .unwrap();
                widgets.push(widget);
            }
            (1, vec![1, 2, 3], widgets)
        };

        let registry = SelectionRegistry::new(db.clone());
        registry
            .assign_ids(model, FeatureRole::Input, &features)
            .unwrap();

        Fixture {
            db,
            model,
            features,
            widgets,
        }
    }

    #[test]
    fn test_chunks_of_three_over_seven() {
        let fx = fixture();
        let reader = ChunkedMatrixReader::new(fx.db.clone());

        let chunks: Vec<MatrixChunk> = reader
            .training_data(fx.model, &IdQuery::from_ids(&fx.widgets), Some(3), MatrixLayout::Dense)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();

        assert_eq!(chunks.iter().map(|c| c.len()).collect::<Vec<_>>(), vec![3, 3, 1]);
        for chunk in &chunks {
            assert_eq!(chunk.matrix.shape(), (chunk.len(), fx.features.len()));
        }

        let all: Vec<i64> = chunks.iter().flat_map(|c| c.widget_ids.clone()).collect();
        assert_eq!(all, fx.widgets);

        // Widget 4 (index 4) holds 4.0 in column 1.
        assert_eq!(chunks[1].matrix.get(1, 1), 4.0);
        assert_eq!(chunks[1].matrix.get(1, 0), 0.0);
    }

    #[test]
    fn test_sparse_matches_dense() {
        let fx = fixture();
        let reader = ChunkedMatrixReader::new(fx.db.clone());
        SelectionRegistry::new(fx.db.clone())
            .assign_ids(fx.model, WidgetRole::PredictsOn, &fx.widgets)
            .unwrap();

        let dense: Vec<_> = reader
            .stream(fx.model, WidgetRole::PredictsOn, Some(4), MatrixLayout::Dense, false)
            .unwrap()
            .map(|c| c.unwrap().matrix.to_dense())
            .collect();
        let sparse: Vec<_> = reader
            .stream(fx.model, WidgetRole::PredictsOn, Some(4), MatrixLayout::Sparse, false)
            .unwrap()
            .map(|c| {
                let chunk = c.unwrap();
                assert_eq!(chunk.matrix.layout(), MatrixLayout::Sparse);
                chunk.matrix.to_dense()
            })
            .collect();

        assert_eq!(dense, sparse);
    }

    #[test]
    fn test_batch_size_edge_cases() {
        let fx = fixture();
        let reader = ChunkedMatrixReader::new(fx.db.clone());
        SelectionRegistry::new(fx.db.clone())
            .assign_ids(fx.model, WidgetRole::TrainedOn, &fx.widgets)
            .unwrap();

        let none: Vec<_> = reader
            .stream(fx.model, WidgetRole::TrainedOn, Some(0), MatrixLayout::Dense, false)
            .unwrap()
            .collect();
        assert!(none.is_empty());

        let single: Vec<_> = reader
            .stream(fx.model, WidgetRole::TrainedOn, None, MatrixLayout::Dense, false)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(single.len(), 1);
        assert_eq!(single[0].len(), 7);

        let exact: Vec<_> = reader
            .stream(fx.model, WidgetRole::TrainedOn, Some(7), MatrixLayout::Dense, false)
            .unwrap()
            .collect::<Result<_>>()
            .unwrap();
        assert_eq!(exact.len(), 1);
    }

    #[test]
    fn test_empty_role_yields_nothing() {
        let fx = fixture();
        let reader = ChunkedMatrixReader::new(fx.db.clone());
        let mut stream = reader
            .stream(fx.model, WidgetRole::ValidatedOn, Some(3), MatrixLayout::Sparse, false)
            .unwrap();
        assert_eq!(stream.columns(), &fx.features[..]);
        assert!(stream.next().is_none());
    }

    #[test]
    fn test_widget_without_values_is_zero_row() {
        let fx = fixture();
        {
            let conn = fx.db.lock_conn().unwrap();
            conn.execute("DELETE FROM widget_feature WHERE idwidget = ?1", [fx.widgets[0]])
                .unwrap();
        }
        let reader = ChunkedMatrixReader::new(fx.db.clone());
        let chunk = reader
            .training_data(fx.model, &IdQuery::from_ids(&fx.widgets[..2]), None, MatrixLayout::Dense)
            .unwrap()
            .next()
            .unwrap()
            .unwrap();

        assert_eq!(chunk.matrix.shape(), (2, 3));
        assert!(chunk.matrix.to_dense().row(0).iter().all(|&v| v == 0.0));
        assert_eq!(chunk.matrix.get(1, 1), 1.0);
    }

    #[test]
    fn test_supervised_is_not_implemented() {
        let fx = fixture();
        let reader = ChunkedMatrixReader::new(fx.db.clone());
        let result = reader.stream(fx.model, WidgetRole::TrainedOn, Some(3), MatrixLayout::Dense, true);
        assert!(matches!(result, Err(NotochordError::NotImplemented(_))));
    }
}
