//! Relational schema and selection roles.

use crate::error::Result;
use rusqlite::Connection;
use serde::{Deserialize, Serialize};

/// Role an entity plays for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WidgetRole {
    TrainedOn,
    PredictsOn,
    ValidatedOn,
}

impl WidgetRole {
    pub const ALL: [WidgetRole; 3] = [
        WidgetRole::TrainedOn,
        WidgetRole::PredictsOn,
        WidgetRole::ValidatedOn,
    ];

    /// Seeded row id in `model_widget_type`.
    pub fn id(&self) -> i64 {
        match self {
            WidgetRole::TrainedOn => 1,
            WidgetRole::PredictsOn => 2,
            WidgetRole::ValidatedOn => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            WidgetRole::TrainedOn => "trained_on",
            WidgetRole::PredictsOn => "predicts_on",
            WidgetRole::ValidatedOn => "validated_on",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "trained_on" | "train" => Some(WidgetRole::TrainedOn),
            "predicts_on" | "predict" => Some(WidgetRole::PredictsOn),
            "validated_on" | "validate" => Some(WidgetRole::ValidatedOn),
            _ => None,
        }
    }
}

impl std::fmt::Display for WidgetRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Role a feature plays for a model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureRole {
    Input,
    Output,
    Predicts,
}

impl FeatureRole {
    pub const ALL: [FeatureRole; 3] = [FeatureRole::Input, FeatureRole::Output, FeatureRole::Predicts];

    /// Seeded row id in `model_feature_type`.
    pub fn id(&self) -> i64 {
        match self {
            FeatureRole::Input => 1,
            FeatureRole::Output => 2,
            FeatureRole::Predicts => 3,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FeatureRole::Input => "input",
            FeatureRole::Output => "output",
            FeatureRole::Predicts => "predicts",
        }
    }
}

impl std::fmt::Display for FeatureRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Create tables, indexes and role rows if they don't exist.
pub(crate) fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS datasource (
            iddatasource INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS widget (
            idwidget INTEGER PRIMARY KEY AUTOINCREMENT,
            iddatasource INTEGER NOT NULL
                REFERENCES datasource(iddatasource) ON DELETE CASCADE,
            insert_time TEXT NOT NULL,
            uuid TEXT NOT NULL,
            UNIQUE (iddatasource, uuid)
        );

        CREATE TABLE IF NOT EXISTS object_store (
            idobject_store INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE,
            uri TEXT,
            kwargs TEXT
        );

        CREATE TABLE IF NOT EXISTS model (
            idmodel INTEGER PRIMARY KEY AUTOINCREMENT,
            insert_time TEXT NOT NULL,
            uuid TEXT NOT NULL UNIQUE,
            hyperparameters BLOB NOT NULL,
            trained_time TEXT,
            trained_package BLOB
        );

        CREATE TABLE IF NOT EXISTS feature_set (
            idfeature_set INTEGER PRIMARY KEY AUTOINCREMENT,
            idmodel INTEGER REFERENCES model(idmodel) ON DELETE CASCADE,
            idobject_store INTEGER REFERENCES object_store(idobject_store),
            name TEXT NOT NULL
        );

        -- NULL model ids must still collide on name
        CREATE UNIQUE INDEX IF NOT EXISTS idx_feature_set_scope_name
            ON feature_set(IFNULL(idmodel, 0), name);

        CREATE TABLE IF NOT EXISTS feature (
            idfeature INTEGER PRIMARY KEY AUTOINCREMENT,
            idfeature_set INTEGER NOT NULL
                REFERENCES feature_set(idfeature_set) ON DELETE CASCADE,
            name TEXT NOT NULL,
            UNIQUE (idfeature_set, name)
        );

        CREATE TABLE IF NOT EXISTS widget_feature (
            idwidget INTEGER NOT NULL REFERENCES widget(idwidget) ON DELETE CASCADE,
            idfeature INTEGER NOT NULL REFERENCES feature(idfeature) ON DELETE CASCADE,
            value REAL,
            PRIMARY KEY (idwidget, idfeature)
        );

        CREATE INDEX IF NOT EXISTS idx_widget_feature_feature
            ON widget_feature(idfeature);

        CREATE TABLE IF NOT EXISTS model_feature_type (
            idmodel_feature_type INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS model_feature (
            idmodel_feature INTEGER PRIMARY KEY AUTOINCREMENT,
            idmodel INTEGER NOT NULL REFERENCES model(idmodel) ON DELETE CASCADE,
            idfeature INTEGER NOT NULL REFERENCES feature(idfeature) ON DELETE CASCADE,
            idmodel_feature_type INTEGER NOT NULL
                REFERENCES model_feature_type(idmodel_feature_type),
            UNIQUE (idmodel, idmodel_feature_type, idfeature)
        );

        CREATE INDEX IF NOT EXISTS idx_model_feature_order
            ON model_feature(idmodel, idmodel_feature_type, idmodel_feature);

        CREATE TABLE IF NOT EXISTS model_widget_type (
            idmodel_widget_type INTEGER PRIMARY KEY,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS model_widget (
            idmodel_widget INTEGER PRIMARY KEY AUTOINCREMENT,
            idmodel INTEGER NOT NULL REFERENCES model(idmodel) ON DELETE CASCADE,
            idwidget INTEGER NOT NULL REFERENCES widget(idwidget) ON DELETE CASCADE,
            idmodel_widget_type INTEGER NOT NULL
                REFERENCES model_widget_type(idmodel_widget_type),
            UNIQUE (idmodel, idmodel_widget_type, idwidget)
        );

        CREATE INDEX IF NOT EXISTS idx_model_widget_order
            ON model_widget(idmodel, idmodel_widget_type, idmodel_widget);

        CREATE TABLE IF NOT EXISTS metric_type (
            idmetric_type INTEGER PRIMARY KEY AUTOINCREMENT,
            name TEXT NOT NULL UNIQUE
        );

        CREATE TABLE IF NOT EXISTS metric (
            idmodel INTEGER NOT NULL REFERENCES model(idmodel) ON DELETE CASCADE,
            idmetric_type INTEGER NOT NULL
                REFERENCES metric_type(idmetric_type) ON DELETE CASCADE,
            value REAL,
            PRIMARY KEY (idmodel, idmetric_type)
        );",
    )?;

    for role in WidgetRole::ALL {
        conn.execute(
            "INSERT OR IGNORE INTO model_widget_type (idmodel_widget_type, name) VALUES (?1, ?2)",
            rusqlite::params![role.id(), role.as_str()],
        )?;
    }

    for role in FeatureRole::ALL {
        conn.execute(
            "INSERT OR IGNORE INTO model_feature_type (idmodel_feature_type, name) VALUES (?1, ?2)",
            rusqlite::params![role.id(), role.as_str()],
        )?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_widget_role_parsing() {
        for role in WidgetRole::ALL {
            assert_eq!(WidgetRole::from_str(role.as_str()), Some(role));
        }
        assert_eq!(WidgetRole::from_str("train"), Some(WidgetRole::TrainedOn));
        assert_eq!(WidgetRole::from_str("bogus"), None);
    }

    #[test]
    fn test_global_feature_sets_are_unique_by_name() {
        let conn = Connection::open_in_memory().unwrap();
        ensure_schema(&conn).unwrap();

        conn.execute("INSERT OR IGNORE INTO feature_set (name) VALUES ('words')", [])
            .unwrap();
        conn.execute("INSERT OR IGNORE INTO feature_set (name) VALUES ('words')", [])
            .unwrap();

        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM feature_set", [], |row| row.get(0))
            .unwrap();
        assert_eq!(count, 1);
    }
}
