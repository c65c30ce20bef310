//! Model records, feature selection at creation, training state and metrics.
//!
//! A model is created with its input features and, optionally, its output
//! features. Output features are mirrored into feature sets private to the
//! model, one per source feature set and with the same feature names. The
//! mirrored features form the model's `predicts` role, in output order, and
//! are what [`crate::writer::PredictionWriter`] writes to.

use crate::config::StoreDefaults;
use crate::db::{Database, FeatureRole, IdQuery};
use crate::error::{NotochordError, Result};
use crate::identifier_cache::IdentifierCache;
use crate::selection::{assign_ids_with, assign_with, enumerate_with};
use crate::widgets::ensure_feature_set_with;
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Derived training state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelStatus {
    New,
    Trained,
}

impl ModelStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelStatus::New => "new",
            ModelStatus::Trained => "trained",
        }
    }
}

impl std::fmt::Display for ModelStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of one `model` row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelRecord {
    id: i64,
    uuid: String,
    insert_time: DateTime<Utc>,
    hyperparameters: Vec<u8>,
    trained_time: Option<DateTime<Utc>>,
    trained_package: Option<Vec<u8>>,
}

impl ModelRecord {
    pub fn id(&self) -> i64 {
        self.id
    }

    pub fn uuid(&self) -> &str {
        &self.uuid
    }

    pub fn insert_time(&self) -> DateTime<Utc> {
        self.insert_time
    }

    /// Serialized hyperparameters, opaque to the store.
    pub fn hyperparameters(&self) -> &[u8] {
        &self.hyperparameters
    }

    pub fn trained_time(&self) -> Option<DateTime<Utc>> {
        self.trained_time
    }

    /// Serialized trained parameters, opaque to the store.
    pub fn trained_package(&self) -> Option<&[u8]> {
        self.trained_package.as_deref()
    }

    pub fn status(&self) -> ModelStatus {
        if self.trained_time.is_some() {
            ModelStatus::Trained
        } else {
            ModelStatus::New
        }
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            uuid: row.get(1)?,
            insert_time: parse_time(2, row.get(2)?)?,
            hyperparameters: row.get(3)?,
            trained_time: row
                .get::<_, Option<String>>(4)?
                .map(|value| parse_time(4, value))
                .transpose()?,
            trained_package: row.get(5)?,
        })
    }
}

fn parse_time(column: usize, value: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(column, Type::Text, Box::new(e)))
}

const MODEL_COLUMNS: &str =
    "idmodel, uuid, insert_time, hyperparameters, trained_time, trained_package";

/// Creates and updates models.
#[derive(Clone)]
pub struct ModelStore {
    db: Database,
    cache: Arc<IdentifierCache>,
}

impl ModelStore {
    pub fn new(db: Database, cache: Arc<IdentifierCache>) -> Self {
        Self { db, cache }
    }

    /// Persist a new model selecting `inputs` as input features and
    /// `outputs` as output features.
    ///
    /// Runs in one transaction: a failed selection leaves no model behind.
    pub fn create(
        &self,
        hyperparameters: &[u8],
        inputs: &IdQuery,
        outputs: Option<&IdQuery>,
    ) -> Result<ModelRecord> {
        let (id, mirrored) = {
            let conn = self.db.lock_conn()?;
            let tx = conn
                .unchecked_transaction()
                .map_err(NotochordError::transaction)?;

            tx.execute(
                "INSERT INTO model (insert_time, uuid, hyperparameters) VALUES (?1, ?2, ?3)",
                params![
                    Utc::now().to_rfc3339(),
                    uuid::Uuid::new_v4().to_string(),
                    hyperparameters
                ],
            )?;
            let id = tx.last_insert_rowid();

            assign_with(&tx, &self.db, id, FeatureRole::Input, inputs)?;
            let mirrored = match outputs {
                Some(outputs) => {
                    assign_with(&tx, &self.db, id, FeatureRole::Output, outputs)?;
                    self.mirror_outputs(&tx, id)?
                }
                None => Vec::new(),
            };

            tx.commit().map_err(NotochordError::transaction)?;
            (id, mirrored)
        };

        for (namespace, pairs) in mirrored {
            self.cache.remember(namespace, pairs)?;
        }

        let model = self.get(id)?;
        info!("Created model {} ({})", model.id(), model.uuid());
        Ok(model)
    }

    /// Copy output features into model-private feature sets and select the
    /// copies as `predicts`, keeping output order.
    ///
    /// Returns the names read from the store per private set, for caching
    /// after commit.
    fn mirror_outputs(
        &self,
        conn: &Connection,
        model: i64,
    ) -> Result<Vec<(i64, Vec<(String, i64)>)>> {
        let outputs: Vec<i64> = enumerate_with(conn, model, FeatureRole::Output)?
            .into_iter()
            .map(|(_, feature)| feature)
            .collect();

        // (source set name, feature name) per output, then one private set
        // per distinct source set.
        let query = IdQuery::from_ids(&outputs);
        let mut stmt = conn.prepare(&format!(
            "SELECT f.idfeature, fs.name, f.name
             FROM ({}) AS q
             JOIN feature f ON f.idfeature = q.id
             JOIN feature_set fs ON fs.idfeature_set = f.idfeature_set",
            query.sql()
        ))?;
        let names: HashMap<i64, (String, String)> = stmt
            .query_map(params_from_iter(query.params().iter()), |row| {
                Ok((row.get(0)?, (row.get(1)?, row.get(2)?)))
            })?
            .collect::<rusqlite::Result<_>>()?;

        let mut private_sets: HashMap<String, i64> = HashMap::new();
        for (set_name, _) in names.values() {
            if !private_sets.contains_key(set_name) {
                let id = ensure_feature_set_with(conn, &self.db, set_name, Some(model))?;
                private_sets.insert(set_name.clone(), id);
            }
        }

        // Positions and names per private set, resolved one set at a time.
        let mut grouped: HashMap<i64, (Vec<usize>, Vec<&str>)> = HashMap::new();
        for (it, feature) in outputs.iter().enumerate() {
            let (set_name, name) = names
                .get(feature)
                .ok_or_else(|| NotochordError::not_found("Feature", feature))?;
            let namespace = private_sets
                .get(set_name)
                .copied()
                .ok_or_else(|| NotochordError::not_found("Feature set", set_name))?;
            let (positions, set_names) = grouped.entry(namespace).or_default();
            positions.push(it);
            set_names.push(name.as_str());
        }

        let mut predicts = vec![0; outputs.len()];
        let mut fetched = Vec::with_capacity(grouped.len());
        for (namespace, (positions, set_names)) in &grouped {
            let (ids, pairs) =
                self.cache
                    .resolve_with(conn, &self.db, *namespace, set_names.as_slice())?;
            for (&it, id) in positions.iter().zip(ids) {
                predicts[it] = id;
            }
            fetched.push((*namespace, pairs));
        }

        assign_ids_with(
            conn,
            &self.db,
            model,
            FeatureRole::Predicts,
            &predicts,
            StoreDefaults::SELECTION_BATCH,
        )?;
        Ok(fetched)
    }

    pub fn get(&self, id: i64) -> Result<ModelRecord> {
        let conn = self.db.lock_conn()?;
        conn.query_row(
            &format!("SELECT {} FROM model WHERE idmodel = ?1", MODEL_COLUMNS),
            [id],
            ModelRecord::from_row,
        )
        .optional()?
        .ok_or_else(|| NotochordError::not_found("Model", id))
    }

    pub fn get_by_uuid(&self, uuid: &str) -> Result<ModelRecord> {
        let conn = self.db.lock_conn()?;
        conn.query_row(
            &format!("SELECT {} FROM model WHERE uuid = ?1", MODEL_COLUMNS),
            [uuid],
            ModelRecord::from_row,
        )
        .optional()?
        .ok_or_else(|| NotochordError::not_found("Model", uuid))
    }

    /// Store trained parameters and mark the model trained. Training again
    /// overwrites both.
    pub fn set_trained(&self, id: i64, package: &[u8]) -> Result<ModelRecord> {
        let updated = {
            let conn = self.db.lock_conn()?;
            conn.execute(
                "UPDATE model SET trained_time = ?1, trained_package = ?2 WHERE idmodel = ?3",
                params![Utc::now().to_rfc3339(), package, id],
            )?
        };
        if updated == 0 {
            return Err(NotochordError::not_found("Model", id));
        }
        info!("Model {} trained", id);
        self.get(id)
    }

    /// Set a named metric, registering the metric name on first use.
    pub fn set_metric(&self, id: i64, name: &str, value: f64) -> Result<()> {
        let conn = self.db.lock_conn()?;
        crate::selection::ensure_model(&conn, id)?;
        conn.execute(
            &format!(
                "{} VALUES (?1){}",
                self.db.insert_ignore("metric_type", &["name"])?,
                self.db.dialect().conflict_suffix()
            ),
            [name],
        )?;
        conn.execute(
            &format!(
                "INSERT INTO metric (idmodel, idmetric_type, value)
                 SELECT ?1, idmetric_type, ?3 FROM metric_type WHERE name = ?2{}",
                self.db
                    .dialect()
                    .upsert_suffix(&["idmodel", "idmetric_type"], &["value"])?
            ),
            params![id, name, value],
        )?;
        Ok(())
    }

    /// Value of a named metric. Fails for names never registered; `None`
    /// when this model has no value.
    pub fn get_metric(&self, id: i64, name: &str) -> Result<Option<f64>> {
        let conn = self.db.lock_conn()?;
        let metric_type: i64 = conn
            .query_row(
                "SELECT idmetric_type FROM metric_type WHERE name = ?1",
                [name],
                |row| row.get(0),
            )
            .optional()?
            .ok_or_else(|| NotochordError::not_found("Metric type", name))?;

        let value = conn
            .query_row(
                "SELECT value FROM metric WHERE idmodel = ?1 AND idmetric_type = ?2",
                params![id, metric_type],
                |row| row.get::<_, Option<f64>>(0),
            )
            .optional()?;
        Ok(value.flatten())
    }

    /// Every metric of the model as `(name, value)`, sorted by name.
    pub fn metrics(&self, id: i64) -> Result<Vec<(String, f64)>> {
        let conn = self.db.lock_conn()?;
        let mut stmt = conn.prepare(
            "SELECT mt.name, m.value FROM metric m
             JOIN metric_type mt ON mt.idmetric_type = m.idmetric_type
             WHERE m.idmodel = ?1 AND m.value IS NOT NULL
             ORDER BY mt.name",
        )?;
        let metrics = stmt
            .query_map([id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(metrics)
    }
}
