//! Random k-fold partitioning of a widget selection, done inside the store.

use crate::db::{Database, IdQuery, StagingTable};
use crate::error::{NotochordError, Result};
use rusqlite::params_from_iter;
use rusqlite::types::Value;
use tracing::info;

/// Assigns every widget of a query to one of `k` folds.
///
/// The assignment lives in a temporary table owned by this value and is
/// dropped with it. Queries handed out by [`CrossValidationPartitioner::iter`]
/// read that table and are only valid while the partitioner is alive.
pub struct CrossValidationPartitioner {
    staging: StagingTable,
    folds: usize,
    total: i64,
}

impl CrossValidationPartitioner {
    /// Randomly split `query` into `folds` groups of near-equal size.
    pub fn new(db: &Database, query: &IdQuery, folds: usize) -> Result<Self> {
        if folds == 0 {
            return Err(NotochordError::Validation {
                field: "folds".to_string(),
                message: "at least one fold is required".to_string(),
            });
        }

        let staging = StagingTable::create(
            db,
            "tmp_widget_random",
            "idfold INTEGER NOT NULL, idwidget INTEGER NOT NULL",
        )?;

        let total = {
            let conn = db.lock_conn()?;

            // Row numbers over a random order, cut into `folds` contiguous
            // runs. Each widget is counted once however often the query
            // yields it, and ids that are not widgets are dropped.
            let sql = format!(
                "INSERT INTO {} (idfold, idwidget)
                 SELECT ((ROW_NUMBER() OVER (ORDER BY RANDOM())) - 1) * ? / COUNT(*) OVER (),
                        w.idwidget
                 FROM widget w
                 WHERE w.idwidget IN (SELECT q.id FROM ({}) AS q)",
                staging.name(),
                query.sql()
            );
            let params = std::iter::once(Value::Integer(folds as i64))
                .chain(query.params().iter().cloned());
            conn.execute(&sql, params_from_iter(params))? as i64
        };

        info!("Partitioned {} widgets into {} folds", total, folds);

        Ok(Self {
            staging,
            folds,
            total,
        })
    }

    /// Number of folds.
    pub fn folds(&self) -> usize {
        self.folds
    }

    /// Number of partitioned widgets.
    pub fn total(&self) -> i64 {
        self.total
    }

    /// `(train, validation)` queries for fold `fold`.
    pub fn fold(&self, fold: usize) -> Option<(IdQuery, IdQuery)> {
        if fold >= self.folds {
            return None;
        }
        let select = |op: &str| {
            IdQuery::new(
                format!(
                    "SELECT idwidget AS id FROM {} WHERE idfold {} ? ORDER BY idwidget",
                    self.staging.name(),
                    op
                ),
                vec![Value::Integer(fold as i64)],
            )
        };
        Some((select("!="), select("=")))
    }

    /// Every fold's `(train, validation)` pair, in fold order.
    pub fn iter(&self) -> impl Iterator<Item = (IdQuery, IdQuery)> + '_ {
        (0..self.folds).filter_map(move |fold| self.fold(fold))
    }
}
