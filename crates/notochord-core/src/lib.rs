//! Notochord Core - relational feature store for machine-learning pipelines.
//!
//! Widgets (the entities being learned about) carry sparse numeric feature
//! values. Models select widgets and features by role, stream them out as
//! dense or sparse matrix chunks, write predictions back, and record
//! metrics. Everything lives in one SQLite database.
//!
//! # Example
//!
//! ```rust,ignore
//! use notochord_core::{FeatureStore, IdQuery, MatrixLayout, WidgetRole};
//!
//! let store = FeatureStore::open("/var/lib/notochord/store.db")?;
//! let set = store.widgets().ensure_feature_set("bag_of_words", None)?;
//! let model = store.models().create(b"{}", &IdQuery::features_in_set(set), None)?;
//!
//! for chunk in store.reader().training_data(model.id(), &IdQuery::all_widgets(), Some(512), MatrixLayout::Sparse)? {
//!     let chunk = chunk?;
//!     println!("{} widgets", chunk.len());
//! }
//! ```

pub mod coherence;
pub mod config;
pub mod crossval;
pub mod db;
pub mod error;
pub mod features;
pub mod identifier_cache;
pub mod matrix;
pub mod model;
pub mod object_store;
pub mod reader;
pub mod selection;
pub mod widgets;
pub mod writer;

// Re-export commonly used types
pub use coherence::{CoherenceCollection, CoherenceStore, MemoryCoherenceStore};
pub use config::{FeatureSetNames, StoreConfig, StoreDefaults};
pub use crossval::CrossValidationPartitioner;
pub use db::{Database, FeatureRole, IdQuery, SqlDialect, StagingTable, WidgetRole};
pub use error::{NotochordError, Result};
pub use features::{bag_of_words, datasource_indicator, tokenize, BagOfWords};
pub use identifier_cache::IdentifierCache;
pub use matrix::{CooMatrix, CsrMatrix, FeatureMatrix, MatrixLayout};
pub use model::{ModelRecord, ModelStatus, ModelStore};
pub use object_store::{FileStore, MemoryStore, ObjectStore, StoreDescriptor, StoreRegistry};
pub use reader::{ChunkedMatrixReader, MatrixChunk, MatrixStream};
pub use selection::{SelectionRegistry, SelectionRole};
pub use widgets::{WidgetFeatureUpload, WidgetKey, WidgetStore};
pub use writer::{PredictionValues, PredictionWriter, ValueRow};

use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Entry point owning the database handle, the shared feature-name cache
/// and the runtime tunables.
///
/// Components handed out by the accessors share the same connection and
/// cache, so they are cheap to create per call.
#[derive(Clone)]
pub struct FeatureStore {
    db: Database,
    cache: Arc<IdentifierCache>,
    config: StoreConfig,
}

impl FeatureStore {
    /// Open (or create) a store at `db_path` with default settings.
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(db_path, StoreConfig::default())
    }

    pub fn open_with_config(db_path: impl AsRef<Path>, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let db = Database::open_with_timeout(db_path.as_ref(), config.busy_timeout_ms)?;
        info!("Opened feature store at {}", db_path.as_ref().display());
        Self::with_database(db, config)
    }

    /// Store backed by a private in-memory database.
    pub fn open_in_memory() -> Result<Self> {
        Self::with_database(Database::open_in_memory()?, StoreConfig::default())
    }

    fn with_database(db: Database, config: StoreConfig) -> Result<Self> {
        config.validate()?;
        let cache =
            IdentifierCache::with_batch_size(config.cache_capacity, config.feature_resolve_batch)?;
        Ok(Self {
            db,
            cache: Arc::new(cache),
            config,
        })
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn cache(&self) -> &IdentifierCache {
        &self.cache
    }

    /// Resolve feature names within a feature set, creating missing ones.
    pub fn resolve<S: AsRef<str>>(&self, namespace: i64, names: &[S]) -> Result<Vec<i64>> {
        self.cache.resolve(&self.db, namespace, names)
    }

    pub fn selection(&self) -> SelectionRegistry {
        SelectionRegistry::with_batch_size(self.db.clone(), self.config.selection_batch)
    }

    pub fn reader(&self) -> ChunkedMatrixReader {
        ChunkedMatrixReader::new(self.db.clone())
    }

    pub fn writer(&self) -> PredictionWriter {
        PredictionWriter::with_batch_size(self.db.clone(), self.config.staging_batch)
    }

    /// Partition `widgets` into `folds` random folds.
    pub fn crossval(&self, widgets: &IdQuery, folds: usize) -> Result<CrossValidationPartitioner> {
        CrossValidationPartitioner::new(&self.db, widgets, folds)
    }

    pub fn models(&self) -> ModelStore {
        ModelStore::new(self.db.clone(), self.cache.clone())
    }

    pub fn widgets(&self) -> WidgetStore {
        WidgetStore::with_batch_size(self.db.clone(), self.config.staging_batch)
    }

    pub fn object_stores(&self) -> StoreRegistry {
        StoreRegistry::new(self.db.clone())
    }

    /// Populate the `datasource` feature set for every widget.
    pub fn datasource_indicator(&self) -> Result<usize> {
        datasource_indicator(&self.db, &self.cache)
    }

    /// Run a bag-of-words extraction over `widgets`, reading their content
    /// from `store`.
    pub fn bag_of_words(
        &self,
        job: &BagOfWords,
        store: &dyn ObjectStore,
        widgets: &IdQuery,
    ) -> Result<usize> {
        job.run(&self.db, &self.cache, store, widgets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_open_creates_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("nested").join("store.db");

        let store = FeatureStore::open(&path).unwrap();
        assert!(path.exists());
        assert_eq!(store.database().path(), Some(path.as_path()));
        assert_eq!(store.config(), &StoreConfig::default());
    }

    #[test]
    fn test_open_with_invalid_config() {
        let temp = TempDir::new().unwrap();
        let config = StoreConfig {
            staging_batch: 0,
            ..StoreConfig::default()
        };
        assert!(matches!(
            FeatureStore::open_with_config(temp.path().join("store.db"), config),
            Err(NotochordError::Config { .. })
        ));
    }

    #[test]
    fn test_components_share_cache() {
        let store = FeatureStore::open_in_memory().unwrap();
        let set = store.widgets().ensure_feature_set("words", None).unwrap();

        let ids = store.resolve(set, &["alpha", "beta"]).unwrap();
        assert_eq!(store.cache().cached_len(), 2);
        assert_eq!(store.clone().resolve(set, &["beta"]).unwrap(), vec![ids[1]]);
    }
}
