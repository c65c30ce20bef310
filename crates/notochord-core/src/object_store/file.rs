//! Object store on the local file system.
//!
//! Keys are UUIDs. The hex form of a key is split into shard directories
//! according to `directory_layout`, so with the default `[2, 2]` the key
//! `5f0c6d3e-...` lands at `<root>/5f/0c/6d3e...`.

use super::{ObjectStore, StoreDescriptor};
use crate::error::{NotochordError, Result};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Options stored as the descriptor's JSON options.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FileStoreOptions {
    pub directory_layout: Vec<usize>,
    pub compression: Option<String>,
    pub marshal: Option<String>,
}

impl Default for FileStoreOptions {
    fn default() -> Self {
        Self {
            directory_layout: vec![2, 2],
            compression: None,
            marshal: Some("json".to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

impl Compression {
    fn parse(name: Option<&str>) -> Result<Self> {
        match name {
            None | Some("none") => Ok(Compression::None),
            Some("gzip") => Ok(Compression::Gzip),
            Some(other) => {
                warn!("Unsupported compression scheme '{}'", other);
                Err(NotochordError::NotImplemented("compression scheme"))
            }
        }
    }
}

/// How content is checked on the way in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Marshal {
    /// Content must be a JSON document.
    Json,
    /// Bytes are stored as given.
    Raw,
}

impl Marshal {
    fn parse(name: Option<&str>) -> Result<Self> {
        match name {
            Some("json") => Ok(Marshal::Json),
            None | Some("raw") => Ok(Marshal::Raw),
            Some(other) => {
                warn!("Unsupported marshaling scheme '{}'", other);
                Err(NotochordError::NotImplemented("marshaling scheme"))
            }
        }
    }
}

pub struct FileStore {
    descriptor: StoreDescriptor,
    root: PathBuf,
    directory_layout: Vec<usize>,
    compression: Compression,
    marshal: Marshal,
}

impl FileStore {
    pub fn new(descriptor: StoreDescriptor) -> Result<Self> {
        let options: FileStoreOptions = if descriptor.options.is_null() {
            FileStoreOptions::default()
        } else {
            serde_json::from_value(descriptor.options.clone())?
        };

        let root = PathBuf::from(
            descriptor
                .uri
                .strip_prefix("file://")
                .unwrap_or(&descriptor.uri),
        );

        Ok(Self {
            compression: Compression::parse(options.compression.as_deref())?,
            marshal: Marshal::parse(options.marshal.as_deref())?,
            directory_layout: options.directory_layout,
            root,
            descriptor,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Shard directories followed by the file name.
    fn path_parts(&self, key: &str) -> Result<Vec<String>> {
        let hex = uuid::Uuid::parse_str(key)
            .map_err(|e| NotochordError::Validation {
                field: "key".to_string(),
                message: format!("'{}' is not a UUID: {}", key, e),
            })?
            .simple()
            .to_string();

        let mut parts = Vec::with_capacity(self.directory_layout.len() + 1);
        let mut offset = 0;
        for &width in &self.directory_layout {
            let end = (offset + width).min(hex.len());
            parts.push(hex[offset..end].to_string());
            offset = end;
        }
        parts.push(hex[offset..].to_string());
        Ok(parts)
    }

    fn path(&self, key: &str) -> Result<PathBuf> {
        Ok(self.path_parts(key)?.iter().fold(self.root.clone(), |p, part| p.join(part)))
    }

    fn encode(&self, content: &[u8]) -> Result<Vec<u8>> {
        if self.marshal == Marshal::Json {
            serde_json::from_slice::<serde_json::Value>(content)?;
        }
        match self.compression {
            Compression::None => Ok(content.to_vec()),
            Compression::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
                encoder.write_all(content)?;
                Ok(encoder.finish()?)
            }
        }
    }

    fn decode(&self, stored: Vec<u8>) -> Result<Vec<u8>> {
        match self.compression {
            Compression::None => Ok(stored),
            Compression::Gzip => {
                let mut decoded = Vec::new();
                GzDecoder::new(&stored[..]).read_to_end(&mut decoded)?;
                Ok(decoded)
            }
        }
    }
}

impl ObjectStore for FileStore {
    fn descriptor(&self) -> &StoreDescriptor {
        &self.descriptor
    }

    fn initialize(&self) -> Result<()> {
        fs::create_dir_all(&self.root).map_err(|e| NotochordError::io_with_path(e, &self.root))
    }

    fn exists(&self, key: &str) -> Result<bool> {
        Ok(self.path(key)?.is_file())
    }

    fn get(&self, key: &str) -> Result<Vec<u8>> {
        let path = self.path(key)?;
        let stored = fs::read(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => NotochordError::not_found("Object", key),
            _ => NotochordError::io_with_path(e, &path),
        })?;
        self.decode(stored)
    }

    fn put(&self, key: &str, content: &[u8]) -> Result<()> {
        let path = self.path(key)?;
        let encoded = self.encode(content)?;

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| NotochordError::io_with_path(e, parent))?;
        }

        // Write aside, then rename over the target.
        let temp_path = path.with_extension(format!("{}.tmp", std::process::id()));
        {
            let mut file =
                fs::File::create(&temp_path).map_err(|e| NotochordError::io_with_path(e, &temp_path))?;
            file.write_all(&encoded)
                .map_err(|e| NotochordError::io_with_path(e, &temp_path))?;
            file.sync_all()
                .map_err(|e| NotochordError::io_with_path(e, &temp_path))?;
        }
        fs::rename(&temp_path, &path).map_err(|e| NotochordError::io_with_path(e, &path))?;

        debug!("Stored {} bytes at {}", encoded.len(), path.display());
        Ok(())
    }

    fn delete(&self, key: &str) -> Result<()> {
        let parts = self.path_parts(key)?;
        let path = self.path(key)?;
        fs::remove_file(&path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => NotochordError::not_found("Object", key),
            _ => NotochordError::io_with_path(e, &path),
        })?;

        // Prune shard directories that became empty, innermost first.
        for depth in (1..parts.len()).rev() {
            let dir = parts[..depth]
                .iter()
                .fold(self.root.clone(), |p, part| p.join(part));
            if fs::remove_dir(&dir).is_err() {
                break;
            }
        }
        Ok(())
    }
}
