// ABOUTME: File-backed cache storing all entries in a single JSON document
// ABOUTME: Reads tolerate missing or corrupt files by degrading to an empty document
//
// SPDX-License-Identifier: MIT OR Apache-2.0
// Copyright (c) 2025 Palaver Project

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde_json::{Map, Value};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::warn;

use super::CacheStore;
use crate::errors::{ClientError, ClientResult};

/// File-backed cache
///
/// All entries live in one JSON object document so a snapshot write is a
/// single atomic-enough rename-free file write; the write lock serializes
/// read-modify-write cycles within the process.
pub struct FileCache {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl FileCache {
    /// Create a cache backed by the given file path
    ///
    /// The file (and parent directories) are created lazily on first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    /// Path of the backing file
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the whole document, degrading to empty on missing or corrupt files
    async fn load_document(&self) -> Map<String, Value> {
        let raw = match fs::read_to_string(&self.path).await {
            Ok(raw) => raw,
            Err(_) => return Map::new(),
        };

        match serde_json::from_str::<Value>(&raw) {
            Ok(Value::Object(map)) => map,
            Ok(_) | Err(_) => {
                warn!(path = %self.path.display(), "cache file corrupt, starting from empty");
                Map::new()
            }
        }
    }

    /// Persist the whole document
    async fn store_document(&self, document: &Map<String, Value>) -> ClientResult<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| ClientError::cache(format!("create {}: {e}", parent.display())))?;
        }

        let serialized = serde_json::to_string(&Value::Object(document.clone()))?;
        fs::write(&self.path, serialized)
            .await
            .map_err(|e| ClientError::cache(format!("write {}: {e}", self.path.display())))
    }
}

#[async_trait]
impl CacheStore for FileCache {
    async fn get(&self, key: &str) -> ClientResult<Option<Value>> {
        Ok(self.load_document().await.get(key).cloned())
    }

    async fn set(&self, key: &str, value: Value) -> ClientResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load_document().await;
        document.insert(key.to_owned(), value);
        self.store_document(&document).await
    }

    async fn remove(&self, key: &str) -> ClientResult<()> {
        let _guard = self.write_lock.lock().await;
        let mut document = self.load_document().await;
        if document.remove(key).is_some() {
            self.store_document(&document).await?;
        }
        Ok(())
    }
}
