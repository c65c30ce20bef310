//! Key to identity mappings shared between writers.
//!
//! A coherence collection hands out one integer identity per key and never
//! changes it afterwards, so independent writers agree on identities without
//! coordinating through the relational store.

use crate::error::{NotochordError, Result};
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};

/// One named key to identity mapping.
pub trait CoherenceCollection: Send + Sync {
    fn name(&self) -> &str;

    fn exists(&self, key: &str) -> Result<bool>;

    fn get(&self, key: &str) -> Result<Option<i64>>;

    /// Map `key` to `ident`, replacing any previous identity.
    fn set(&self, key: &str, ident: i64) -> Result<()>;

    /// Map `key` to `ident` unless it is already mapped. Returns whether the
    /// mapping was written.
    fn set_if_absent(&self, key: &str, ident: i64) -> Result<bool>;

    fn delete(&self, key: &str) -> Result<()>;

    /// Last identity handed out by [`CoherenceCollection::next`].
    fn current(&self) -> Result<i64>;

    /// Reserve a fresh identity.
    fn next(&self) -> Result<i64>;

    /// Identity of `key`, allocating one on first use.
    fn get_or_generate(&self, key: &str) -> Result<i64> {
        if let Some(ident) = self.get(key)? {
            return Ok(ident);
        }
        let ident = self.next()?;
        if self.set_if_absent(key, ident)? {
            return Ok(ident);
        }
        // Lost the race; the winner's identity is authoritative.
        self.get(key)?
            .ok_or_else(|| NotochordError::not_found("Coherence key", key))
    }
}

/// A set of named collections.
pub trait CoherenceStore: Send + Sync {
    /// Create the collection if missing.
    fn create_collection(&self, name: &str) -> Result<()>;

    fn delete_collection(&self, name: &str) -> Result<()>;

    fn has_collection(&self, name: &str) -> Result<bool>;

    fn get_collection(&self, name: &str) -> Result<Arc<dyn CoherenceCollection>>;
}

fn poisoned() -> NotochordError {
    NotochordError::Other("coherence lock poisoned".to_string())
}

pub struct MemoryCollection {
    name: String,
    idents: Mutex<HashMap<String, i64>>,
    counter: AtomicI64,
}

impl MemoryCollection {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            idents: Mutex::new(HashMap::new()),
            counter: AtomicI64::new(0),
        }
    }
}

impl CoherenceCollection for MemoryCollection {
    fn name(&self) -> &str {
        &self.name
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.idents.lock().map_err(|_| poisoned())?.contains_key(key))
    }

    fn get(&self, key: &str) -> Result<Option<i64>> {
        Ok(self.idents.lock().map_err(|_| poisoned())?.get(key).copied())
    }

    fn set(&self, key: &str, ident: i64) -> Result<()> {
        self.idents
            .lock()
            .map_err(|_| poisoned())?
            .insert(key.to_string(), ident);
        Ok(())
    }

    fn set_if_absent(&self, key: &str, ident: i64) -> Result<bool> {
        let mut idents = self.idents.lock().map_err(|_| poisoned())?;
        if idents.contains_key(key) {
            return Ok(false);
        }
        idents.insert(key.to_string(), ident);
        Ok(true)
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.idents.lock().map_err(|_| poisoned())?.remove(key);
        Ok(())
    }

    fn current(&self) -> Result<i64> {
        Ok(self.counter.load(Ordering::SeqCst))
    }

    fn next(&self) -> Result<i64> {
        Ok(self.counter.fetch_add(1, Ordering::SeqCst) + 1)
    }
}

/// In-process [`CoherenceStore`].
#[derive(Default)]
pub struct MemoryCoherenceStore {
    collections: Mutex<HashMap<String, Arc<MemoryCollection>>>,
}

impl MemoryCoherenceStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl CoherenceStore for MemoryCoherenceStore {
    fn create_collection(&self, name: &str) -> Result<()> {
        self.collections
            .lock()
            .map_err(|_| poisoned())?
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(MemoryCollection::new(name)));
        Ok(())
    }

    fn delete_collection(&self, name: &str) -> Result<()> {
        self.collections.lock().map_err(|_| poisoned())?.remove(name);
        Ok(())
    }

    fn has_collection(&self, name: &str) -> Result<bool> {
        Ok(self
            .collections
            .lock()
            .map_err(|_| poisoned())?
            .contains_key(name))
    }

    fn get_collection(&self, name: &str) -> Result<Arc<dyn CoherenceCollection>> {
        let collections = self.collections.lock().map_err(|_| poisoned())?;
        match collections.get(name) {
            Some(collection) => Ok(collection.clone()),
            None => Err(NotochordError::not_found("Coherence collection", name)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_or_generate_is_stable() {
        let store = MemoryCoherenceStore::new();
        store.create_collection("words").unwrap();
        let words = store.get_collection("words").unwrap();

        let a = words.get_or_generate("alpha").unwrap();
        let b = words.get_or_generate("beta").unwrap();
        assert_ne!(a, b);
        assert_eq!(words.get_or_generate("alpha").unwrap(), a);
        assert_eq!(words.current().unwrap(), 2);

        // A second handle sees the same mapping.
        let again = store.get_collection("words").unwrap();
        assert_eq!(again.get("beta").unwrap(), Some(b));
    }

    #[test]
    fn test_set_if_absent_keeps_first() {
        let store = MemoryCoherenceStore::new();
        store.create_collection("c").unwrap();
        let c = store.get_collection("c").unwrap();

        assert!(c.set_if_absent("k", 10).unwrap());
        assert!(!c.set_if_absent("k", 11).unwrap());
        assert_eq!(c.get("k").unwrap(), Some(10));

        c.set("k", 12).unwrap();
        assert_eq!(c.get("k").unwrap(), Some(12));
        c.delete("k").unwrap();
        assert!(!c.exists("k").unwrap());
    }

    #[test]
    fn test_collection_lifecycle() {
        let store = MemoryCoherenceStore::new();
        assert!(!store.has_collection("x").unwrap());
        assert!(matches!(
            store.get_collection("x"),
            Err(NotochordError::NotFound { .. })
        ));

        store.create_collection("x").unwrap();
        store.create_collection("x").unwrap();
        assert!(store.has_collection("x").unwrap());

        store.delete_collection("x").unwrap();
        assert!(!store.has_collection("x").unwrap());
    }
}
