//! Feature-name to feature-id resolution with an in-process LRU in front of
//! the store.
//!
//! Misses are created with insert-if-absent and read back in the same batch,
//! so concurrent creators never produce two ids for one `(feature set, name)`
//! pair: whoever loses the insert race reads the winner's id.

use crate::config::StoreDefaults;
use crate::db::{sql_placeholders, Database};
use crate::error::{NotochordError, Result};
use lru::LruCache;
use rusqlite::{params_from_iter, Connection};
use rusqlite::types::Value;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Mutex;
use tracing::debug;

/// Bounded LRU cache of `(feature set, name) -> feature id`.
pub struct IdentifierCache {
    cache: Mutex<LruCache<(i64, String), i64>>,
    batch_size: usize,
}

impl IdentifierCache {
    /// Create a cache holding at most `capacity` names.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_batch_size(capacity, StoreDefaults::FEATURE_RESOLVE_BATCH)
    }

    /// Create a cache with a custom number of names per store round trip.
    pub fn with_batch_size(capacity: usize, batch_size: usize) -> Result<Self> {
        let capacity = NonZeroUsize::new(capacity).ok_or_else(|| NotochordError::Config {
            message: "identifier cache capacity must be greater than zero".to_string(),
        })?;

        Ok(Self {
            cache: Mutex::new(LruCache::new(capacity)),
            batch_size: batch_size.max(1),
        })
    }

    /// Resolve `names` within feature set `namespace`, creating missing
    /// features.
    ///
    /// The result has one id per input name, in input order. Repeated names
    /// map to the same id. Nothing is returned unless every name resolved.
    pub fn resolve<S: AsRef<str>>(
        &self,
        db: &Database,
        namespace: i64,
        names: &[S],
    ) -> Result<Vec<i64>> {
        let (ids, fetched) = {
            let conn = db.lock_conn()?;
            self.resolve_with(&conn, db, namespace, names)?
        };
        self.remember(namespace, fetched)?;
        Ok(ids)
    }

    /// [`IdentifierCache::resolve`] on a locked connection or open
    /// transaction, leaving the cache untouched.
    ///
    /// Also returns the `(name, id)` pairs read from the store, to be passed
    /// to [`IdentifierCache::remember`] once they are durable.
    pub(crate) fn resolve_with<S: AsRef<str>>(
        &self,
        conn: &Connection,
        db: &Database,
        namespace: i64,
        names: &[S],
    ) -> Result<(Vec<i64>, Vec<(String, i64)>)> {
        let mut resolved: Vec<Option<i64>> = vec![None; names.len()];
        // Distinct missed names in first-seen order, with every position they fill.
        let mut missing: Vec<&str> = Vec::new();
        let mut positions: HashMap<&str, Vec<usize>> = HashMap::new();

        {
            let mut cache = self.cache.lock().map_err(|_| NotochordError::lock_failed())?;
            for (it, name) in names.iter().enumerate() {
                let name = name.as_ref();
                match cache.get(&(namespace, name.to_string())) {
                    Some(&id) => resolved[it] = Some(id),
                    None => {
                        let slots = positions.entry(name).or_default();
                        if slots.is_empty() {
                            missing.push(name);
                        }
                        slots.push(it);
                    }
                }
            }
        }

        if !missing.is_empty() {
            debug!(
                "Resolving {} uncached feature names in feature set {}",
                missing.len(),
                namespace
            );
            ensure_namespace(conn, namespace)?;
        }

        let mut fetched = Vec::with_capacity(missing.len());
        for batch in missing.chunks(self.batch_size) {
            for (name, id) in insert_and_fetch(conn, db, namespace, batch)? {
                if let Some(slots) = positions.get(name.as_str()) {
                    for &it in slots {
                        resolved[it] = Some(id);
                    }
                }
                fetched.push((name, id));
            }
        }

        let ids = resolved
            .into_iter()
            .enumerate()
            .map(|(it, id)| {
                id.ok_or_else(|| NotochordError::Database {
                    message: format!(
                        "Feature '{}' was not readable after insert in feature set {}",
                        names[it].as_ref(),
                        namespace
                    ),
                    source: None,
                })
            })
            .collect::<Result<Vec<i64>>>()?;
        Ok((ids, fetched))
    }

    /// Cache `(name, id)` pairs of feature set `namespace`.
    pub(crate) fn remember(&self, namespace: i64, pairs: Vec<(String, i64)>) -> Result<()> {
        let mut cache = self.cache.lock().map_err(|_| NotochordError::lock_failed())?;
        for (name, id) in pairs {
            cache.put((namespace, name), id);
        }
        Ok(())
    }

    /// Number of names currently cached.
    pub fn cached_len(&self) -> usize {
        self.cache.lock().map(|cache| cache.len()).unwrap_or(0)
    }

    /// Forget every cached name. The store is untouched.
    pub fn clear(&self) {
        if let Ok(mut cache) = self.cache.lock() {
            cache.clear();
        }
    }
}

impl Default for IdentifierCache {
    fn default() -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(StoreDefaults::CACHE_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            )),
            batch_size: StoreDefaults::FEATURE_RESOLVE_BATCH,
        }
    }
}

fn ensure_namespace(conn: &Connection, namespace: i64) -> Result<()> {
    let exists: i64 = conn.query_row(
        "SELECT COUNT(*) FROM feature_set WHERE idfeature_set = ?1",
        [namespace],
        |row| row.get(0),
    )?;
    if exists == 0 {
        return Err(NotochordError::not_found("Feature set", namespace));
    }
    Ok(())
}

/// One insert-if-absent plus one read for a batch of distinct names.
fn insert_and_fetch(
    conn: &Connection,
    db: &Database,
    namespace: i64,
    batch: &[&str],
) -> Result<Vec<(String, i64)>> {
    let insert = format!(
        "{} VALUES {}{}",
        db.insert_ignore("feature", &["idfeature_set", "name"])?,
        vec!["(?, ?)"; batch.len()].join(", "),
        db.dialect().conflict_suffix(),
    );
    let insert_params = batch
        .iter()
        .flat_map(|name| [Value::Integer(namespace), Value::Text(name.to_string())]);
    conn.execute(&insert, params_from_iter(insert_params))?;

    let select = format!(
        "SELECT name, idfeature FROM feature WHERE idfeature_set = ? AND name IN ({})",
        sql_placeholders(batch.len())
    );
    let select_params = std::iter::once(Value::Integer(namespace))
        .chain(batch.iter().map(|name| Value::Text(name.to_string())));

    let mut stmt = conn.prepare(&select)?;
    let found = stmt
        .query_map(params_from_iter(select_params), |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    Ok(found)
}
