use super::{ObjectStore, StoreDescriptor};
use crate::error::{NotochordError, Result};
use std::collections::HashMap;
use std::sync::RwLock;

/// Process-local object store, mostly for tests.
pub struct MemoryStore {
    descriptor: StoreDescriptor,
    objects: RwLock<HashMap<String, Vec<u8>>>,
}

impl MemoryStore {
    pub fn new(descriptor: StoreDescriptor) -> Self {
        Self {
            descriptor,
            objects: RwLock::new(HashMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.objects.read().map(|objects| objects.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn poisoned() -> NotochordError {
    NotochordError::Other("memory store lock poisoned".to_string())
}

impl ObjectStore for MemoryStore {
    fn descriptor(&self) -> &StoreDescriptor {
        &self.descriptor
    }

    fn initialize(&self) -> Result<()> {
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.objects.read().map_err(|_| poisoned())?.contains_key(key))
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.objects
            .read()
            .map_err(|_| poisoned())?
            .get(key)
            .cloned()
            .ok_or_else(|| NotochordError::not_found("Object", key))
    }

    fn put(&self, key: &str, content: &[u8]) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| poisoned())?
            .insert(key.to_string(), content.to_vec());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        self.objects
            .write()
            .map_err(|_| poisoned())?
            .remove(key)
            .map(|_| ())
            .ok_or_else(|| NotochordError::not_found("Object", key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_memory_store() {
        let store = MemoryStore::new(StoreDescriptor {
            id: 1,
            name: "mem".to_string(),
            uri: "memory://mem".to_string(),
            options: serde_json::Value::Null,
        });
        assert!(store.is_empty());

        store.put_json("doc", &json!({"text": "a b"})).unwrap();
        assert!(store.exists("doc").unwrap());
        store.post("doc", "n", json!(2)).unwrap();
        assert_eq!(store.get_json("doc").unwrap(), json!({"text": "a b", "n": 2}));

        store.delete("doc").unwrap();
        assert!(!store.exists("doc").unwrap());
        assert!(matches!(store.delete("doc"), Err(NotochordError::NotFound { .. })));
    }
}
