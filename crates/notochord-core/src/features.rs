//! Built-in feature extractors.

use crate::config::FeatureSetNames;
use crate::db::{Database, IdQuery};
use crate::error::{NotochordError, Result};
use crate::identifier_cache::IdentifierCache;
use crate::object_store::ObjectStore;
use crate::widgets::WidgetStore;
use crate::writer::{PredictionWriter, ValueRow};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::LazyLock;
use tracing::{debug, info, warn};

static WORD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-zA-Z]+").expect("word regex must compile"));

/// Mark every widget with a value of 1 on the feature named after its
/// datasource, in the global `datasource` feature set.
///
/// Existing values are kept. Returns the number of rows added.
pub fn datasource_indicator(db: &Database, cache: &IdentifierCache) -> Result<usize> {
    let widgets = WidgetStore::new(db.clone());
    let feature_set = widgets.ensure_feature_set(FeatureSetNames::DATASOURCE, None)?;

    let names: Vec<String> = widgets
        .datasources()?
        .into_iter()
        .map(|(_, name)| name)
        .collect();
    cache.resolve(db, feature_set, names.as_slice())?;

    let conn = db.lock_conn()?;
    let inserted = conn.execute(
        &format!(
            "{} SELECT w.idwidget, f.idfeature, 1.0
             FROM widget w
             JOIN datasource ds ON ds.iddatasource = w.iddatasource
             JOIN feature f ON f.name = ds.name AND f.idfeature_set = ?1{}",
            db.insert_ignore("widget_feature", &["idwidget", "idfeature", "value"])?,
            db.dialect().conflict_suffix()
        ),
        [feature_set],
    )?;

    info!("Added {} datasource indicator values", inserted);
    Ok(inserted)
}

/// Lowercased word counts of `text`.
pub fn tokenize(text: &str) -> BTreeMap<String, usize> {
    let mut counts = BTreeMap::new();
    for word in WORD.find_iter(text) {
        *counts.entry(word.as_str().to_lowercase()).or_insert(0) += 1;
    }
    counts
}

/// Word counts of every selected widget's content with default settings.
pub fn bag_of_words(
    db: &Database,
    cache: &IdentifierCache,
    store: &dyn ObjectStore,
    widgets: &IdQuery,
) -> Result<usize> {
    BagOfWords::default().run(db, cache, store, widgets)
}

/// Word-count extractor over widget content.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BagOfWords {
    /// Global feature set receiving one feature per word.
    pub output_feature_set: String,
    /// JSON field holding the text. `None` reads the whole object as UTF-8.
    pub input_field: Option<String>,
    /// Widgets per resolve and write round.
    pub chunk_size: usize,
}

impl Default for BagOfWords {
    fn default() -> Self {
        Self {
            output_feature_set: FeatureSetNames::BAG_OF_WORDS.to_string(),
            input_field: None,
            chunk_size: 1024,
        }
    }
}

impl BagOfWords {
    /// Count words in the content of each selected widget and store the
    /// counts as feature values, replacing earlier counts.
    ///
    /// Widgets whose content is missing from `store` are skipped. Returns
    /// the number of values written.
    pub fn run(
        &self,
        db: &Database,
        cache: &IdentifierCache,
        store: &dyn ObjectStore,
        widgets: &IdQuery,
    ) -> Result<usize> {
        let widget_store = WidgetStore::new(db.clone());
        let feature_set = widget_store.ensure_feature_set(&self.output_feature_set, None)?;
        let writer = PredictionWriter::new(db.clone());
        let keys = widget_store.widget_keys(widgets)?;

        let mut written = 0;
        for chunk in keys.chunks(self.chunk_size.max(1)) {
            let mut counted: Vec<(i64, BTreeMap<String, usize>)> = Vec::with_capacity(chunk.len());
            for key in chunk {
                match self.text(store, &key.uuid) {
                    Ok(text) => counted.push((key.id, tokenize(&text))),
                    Err(NotochordError::NotFound { .. }) => {
                        warn!("No content for widget {} ({})", key.id, key.uuid);
                    }
                    Err(e) => return Err(e),
                }
            }

            let names: Vec<&str> = counted
                .iter()
                .flat_map(|(_, counts)| counts.keys().map(String::as_str))
                .collect();
            let ids = cache.resolve(db, feature_set, names.as_slice())?;

            let mut ids = ids.into_iter();
            let mut rows: Vec<ValueRow> = Vec::with_capacity(names.len());
            for (widget, counts) in &counted {
                for (&count, id) in counts.values().zip(ids.by_ref()) {
                    rows.push((*widget, id, count as f64));
                }
            }

            written += writer.upsert(&rows)?;
            debug!("Counted words for {} widgets", counted.len());
        }

        info!("Wrote {} bag of words values", written);
        Ok(written)
    }

    fn text(&self, store: &dyn ObjectStore, key: &str) -> Result<String> {
        match &self.input_field {
            None => Ok(String::from_utf8_lossy(&store.get(key)?).into_owned()),
            Some(field) => {
                let content = store.get_json(key)?;
                Ok(content
                    .get(field)
                    .and_then(|value| value.as_str())
                    .unwrap_or_default()
                    .to_string())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_store::{MemoryStore, StoreDescriptor};
    use serde_json::json;

    #[test]
    fn test_tokenize() {
        let counts = tokenize("The cat, the HAT; 42 cats!");
        assert_eq!(counts.get("the"), Some(&2));
        assert_eq!(counts.get("cat"), Some(&1));
        assert_eq!(counts.get("cats"), Some(&1));
        assert_eq!(counts.get("42"), None);
        assert_eq!(counts.len(), 4);
    }

    #[test]
    fn test_datasource_indicator() {
        let db = Database::open_in_memory().unwrap();
        let widgets = WidgetStore::new(db.clone());
        let rss = widgets.ensure_datasource("rss").unwrap();
        let wiki = widgets.ensure_datasource("wiki").unwrap();
        widgets.add_widgets(rss, &["a", "b"]).unwrap();
        widgets.add_widgets(wiki, &["c"]).unwrap();

        let cache = IdentifierCache::new(16).unwrap();
        assert_eq!(datasource_indicator(&db, &cache).unwrap(), 3);
        assert_eq!(datasource_indicator(&db, &cache).unwrap(), 0);

        let conn = db.lock_conn().unwrap();
        let rss_rows: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM widget_feature wf
                 JOIN feature f ON f.idfeature = wf.idfeature
                 WHERE f.name = 'rss' AND wf.value = 1.0",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(rss_rows, 2);
    }

    #[test]
    fn test_bag_of_words() {
        let db = Database::open_in_memory().unwrap();
        let widgets = WidgetStore::new(db.clone());
        let rss = widgets.ensure_datasource("rss").unwrap();
        widgets.add_widgets(rss, &["d1", "d2", "d3"]).unwrap();

        let store = MemoryStore::new(StoreDescriptor {
            id: 1,
            name: "content".to_string(),
            uri: "memory://content".to_string(),
            options: serde_json::Value::Null,
        });
        store.put_json("d1", &json!({"body": "red fish blue fish"})).unwrap();
        store.put_json("d2", &json!({"body": "Blue sky"})).unwrap();

        let cache = IdentifierCache::new(64).unwrap();
        let job = BagOfWords {
            input_field: Some("body".to_string()),
            chunk_size: 2,
            ..BagOfWords::default()
        };
        // d3 has no content and is skipped.
        assert_eq!(job.run(&db, &cache, &store, &IdQuery::all_widgets()).unwrap(), 5);

        let conn = db.lock_conn().unwrap();
        let fish: f64 = conn
            .query_row(
                "SELECT wf.value FROM widget_feature wf
                 JOIN feature f ON f.idfeature = wf.idfeature
                 JOIN widget w ON w.idwidget = wf.idwidget
                 WHERE f.name = 'fish' AND w.uuid = 'd1'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(fish, 2.0);

        let blue_widgets: i64 = conn
            .query_row(
                "SELECT COUNT(*) FROM widget_feature wf
                 JOIN feature f ON f.idfeature = wf.idfeature
                 WHERE f.name = 'blue'",
                [],
                |row| row.get(0),
            )
            .unwrap();
        assert_eq!(blue_widgets, 2);
    }
}
