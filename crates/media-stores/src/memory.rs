//! In-memory store

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{StoreError, StoreResult};
use crate::store::{validate_key, Store, StoredObject};

/// In-memory storage for testing and embedding
pub struct MemoryStore {
    files: RwLock<HashMap<String, Bytes>>,
    base_url: String,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_base_url("/memory")
    }

    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        Self {
            files: RwLock::new(HashMap::new()),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    /// Number of stored files
    pub async fn len(&self) -> usize {
        self.files.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.files.read().await.is_empty()
    }

    /// Sorted list of stored keys
    pub async fn keys(&self) -> Vec<String> {
        let files = self.files.read().await;
        let mut keys: Vec<String> = files.keys().cloned().collect();
        keys.sort();
        keys
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn put(&self, key: &str, data: Bytes) -> StoreResult<StoredObject> {
        validate_key(key)?;
        let object = StoredObject::new(key, &data);

        let mut files = self.files.write().await;
        files.insert(key.to_string(), data);

        debug!(key = key, length = object.length, "File stored in memory");
        Ok(object)
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        let mut files = self.files.write().await;
        files.remove(key);
        Ok(())
    }

    async fn open(&self, key: &str) -> StoreResult<Bytes> {
        let files = self.files.read().await;
        files
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(key.to_string()))
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let files = self.files.read().await;
        Ok(files.contains_key(key))
    }

    fn locate(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn name(&self) -> &str {
        "memory"
    }
}
