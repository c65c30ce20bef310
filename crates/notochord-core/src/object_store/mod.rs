//! Key to blob stores holding raw widget content.
//!
//! Stores are described by a row in `object_store` (name, URI and JSON
//! options) and built by a [`StoreRegistry`] from the URI scheme.

mod file;
mod memory;

pub use file::{Compression, FileStore, FileStoreOptions, Marshal};
pub use memory::MemoryStore;

use crate::db::Database;
use crate::error::{NotochordError, Result};
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::info;

/// Persisted identity of an object store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreDescriptor {
    pub id: i64,
    pub name: String,
    pub uri: String,
    #[serde(default)]
    pub options: serde_json::Value,
}

impl StoreDescriptor {
    /// Scheme part of the URI, e.g. `file` for `file:///data`.
    pub fn scheme(&self) -> &str {
        uri_scheme(&self.uri)
    }
}

/// Split `scheme://rest` into its scheme; URIs without one are `file`.
pub(crate) fn uri_scheme(uri: &str) -> &str {
    uri.split_once("://").map(|(scheme, _)| scheme).unwrap_or("file")
}

/// Content store keyed by widget content key.
pub trait ObjectStore: Send + Sync {
    fn descriptor(&self) -> &StoreDescriptor;

    /// Prepare backing resources. Safe to call more than once.
    fn initialize(&self) -> Result<()>;

    fn exists(&self, key: &str) -> Result<bool>;

    fn get(&self, key: &str) -> Result<Vec<u8>>;

    fn put(&self, key: &str, content: &[u8]) -> Result<()>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Content parsed as JSON.
    fn get_json(&self, key: &str) -> Result<serde_json::Value> {
        Ok(serde_json::from_slice(&self.get(key)?)?)
    }

    fn put_json(&self, key: &str, content: &serde_json::Value) -> Result<()> {
        self.put(key, &serde_json::to_vec(content)?)
    }

    /// Set one field of a stored JSON object.
    fn post(&self, key: &str, field: &str, value: serde_json::Value) -> Result<()> {
        let mut content = self.get_json(key)?;
        let object = content.as_object_mut().ok_or_else(|| NotochordError::Validation {
            field: key.to_string(),
            message: "stored content is not a JSON object".to_string(),
        })?;
        object.insert(field.to_string(), value);
        self.put_json(key, &content)
    }
}

/// Builds a store for a descriptor of a registered scheme.
pub type StoreConstructor = fn(StoreDescriptor) -> Result<Box<dyn ObjectStore>>;

fn open_file_store(descriptor: StoreDescriptor) -> Result<Box<dyn ObjectStore>> {
    Ok(Box::new(FileStore::new(descriptor)?))
}

fn open_memory_store(descriptor: StoreDescriptor) -> Result<Box<dyn ObjectStore>> {
    Ok(Box::new(MemoryStore::new(descriptor)))
}

/// Scheme to constructor mapping plus persistence of store descriptors.
pub struct StoreRegistry {
    db: Database,
    schemes: HashMap<String, StoreConstructor>,
}

impl StoreRegistry {
    /// Registry with the built-in `file` and `memory` schemes.
    pub fn new(db: Database) -> Self {
        let mut registry = Self::empty(db);
        registry.register("file", open_file_store);
        registry.register("memory", open_memory_store);
        registry
    }

    pub fn empty(db: Database) -> Self {
        Self {
            db,
            schemes: HashMap::new(),
        }
    }

    /// Register or replace the constructor for `scheme`.
    pub fn register(&mut self, scheme: &str, constructor: StoreConstructor) {
        self.schemes.insert(scheme.to_string(), constructor);
    }

    /// Registered schemes, sorted.
    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.schemes.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }

    /// Persist a store descriptor (or reuse the existing one of that name)
    /// and return the initialized store.
    pub fn create(
        &self,
        name: &str,
        uri: &str,
        options: serde_json::Value,
    ) -> Result<Box<dyn ObjectStore>> {
        let constructor = self.constructor(uri_scheme(uri))?;

        {
            let conn = self.db.lock_conn()?;
            conn.execute(
                &format!(
                    "{} VALUES (?1, ?2, ?3){}",
                    self.db
                        .insert_ignore("object_store", &["name", "uri", "kwargs"])?,
                    self.db.dialect().conflict_suffix()
                ),
                params![name, uri, serde_json::to_string(&options)?],
            )?;
        }

        let descriptor = self.descriptor(name)?;
        let store = constructor(descriptor)?;
        store.initialize()?;

        info!("Created object store '{}' at {}", name, uri);
        Ok(store)
    }

    /// Build a previously created store.
    pub fn open(&self, name: &str) -> Result<Box<dyn ObjectStore>> {
        let descriptor = self.descriptor(name)?;
        let constructor = self.constructor(descriptor.scheme())?;
        constructor(descriptor)
    }

    /// Stored descriptor of the named store.
    pub fn descriptor(&self, name: &str) -> Result<StoreDescriptor> {
        let conn = self.db.lock_conn()?;
        let row = conn
            .query_row(
                "SELECT idobject_store, name, uri, kwargs FROM object_store WHERE name = ?1",
                [name],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                    ))
                },
            )
            .optional()?
            .ok_or_else(|| NotochordError::not_found("Object store", name))?;

        let (id, name, uri, options) = row;
        Ok(StoreDescriptor {
            id,
            name,
            uri: uri.unwrap_or_default(),
            options: match options {
                Some(options) => serde_json::from_str(&options)?,
                None => serde_json::Value::Null,
            },
        })
    }

    fn constructor(&self, scheme: &str) -> Result<StoreConstructor> {
        self.schemes
            .get(scheme)
            .copied()
            .ok_or_else(|| NotochordError::not_found("URI scheme", scheme))
    }
}
