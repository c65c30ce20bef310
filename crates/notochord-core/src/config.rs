//! Centralized configuration for the feature store.
//!
//! Batch sizes exist to bound per-statement parameter counts and per-call
//! memory; they have no bearing on correctness.

use crate::error::{NotochordError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Store-level constants.
pub struct StoreDefaults;

impl StoreDefaults {
    /// Feature-name cache capacity (2^16 entries).
    pub const CACHE_CAPACITY: usize = 65_536;
    /// Names per insert-then-read round trip when resolving features.
    pub const FEATURE_RESOLVE_BATCH: usize = 445;
    /// Ids per insert when assigning explicit selections.
    pub const SELECTION_BATCH: usize = 490;
    /// Rows per insert when filling a staging table.
    pub const STAGING_BATCH: usize = 200;
    pub const BUSY_TIMEOUT_MS: u64 = 30_000;
}

/// Names of the built-in feature sets.
pub struct FeatureSetNames;

impl FeatureSetNames {
    pub const DATASOURCE: &'static str = "datasource";
    pub const BAG_OF_WORDS: &'static str = "bag_of_words";
}

/// Runtime tunables for a [`crate::FeatureStore`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", default)]
pub struct StoreConfig {
    pub cache_capacity: usize,
    pub feature_resolve_batch: usize,
    pub selection_batch: usize,
    pub staging_batch: usize,
    pub busy_timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cache_capacity: StoreDefaults::CACHE_CAPACITY,
            feature_resolve_batch: StoreDefaults::FEATURE_RESOLVE_BATCH,
            selection_batch: StoreDefaults::SELECTION_BATCH,
            staging_batch: StoreDefaults::STAGING_BATCH,
            busy_timeout_ms: StoreDefaults::BUSY_TIMEOUT_MS,
        }
    }
}

impl StoreConfig {
    /// Load a config from a JSON file. Missing keys fall back to defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents =
            std::fs::read_to_string(path).map_err(|e| NotochordError::io_with_path(e, path))?;
        let config: StoreConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make batching or caching meaningless.
    pub fn validate(&self) -> Result<()> {
        let checks = [
            ("cache_capacity", self.cache_capacity),
            ("feature_resolve_batch", self.feature_resolve_batch),
            ("selection_batch", self.selection_batch),
            ("staging_batch", self.staging_batch),
        ];

        for (field, value) in checks {
            if value == 0 {
                return Err(NotochordError::Config {
                    message: format!("{} must be greater than zero", field),
                });
            }
        }

        Ok(())
    }
}
