//! Store capability interface

use async_trait::async_trait;
use bytes::Bytes;
use sha2::{Digest, Sha256};

use crate::error::{StoreError, StoreResult};

/// What a successful `put` produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredObject {
    /// Final key the content is reachable under
    pub key: String,
    /// Bytes written
    pub length: u64,
    /// Hex SHA-256 of the content
    pub digest: String,
}

impl StoredObject {
    pub fn new(key: impl Into<String>, data: &[u8]) -> Self {
        Self {
            key: key.into(),
            length: data.len() as u64,
            digest: content_digest(data),
        }
    }
}

/// Storage backend.
///
/// Implementations must satisfy:
/// - `put` is atomic from the caller's view: a failed write leaves nothing
///   under the final key.
/// - `delete` is idempotent: deleting an absent key succeeds.
/// - `open` fails with [`StoreError::NotFound`] for absent keys.
/// - `locate` performs no I/O and is deterministic for a given configuration.
#[async_trait]
pub trait Store: Send + Sync {
    /// Write `data` under `key` and return the stored object
    async fn put(&self, key: &str, data: Bytes) -> StoreResult<StoredObject>;

    /// Remove `key`; absent keys are not an error
    async fn delete(&self, key: &str) -> StoreResult<()>;

    /// Read the full content stored under `key`
    async fn open(&self, key: &str) -> StoreResult<Bytes>;

    /// Check if key exists
    async fn exists(&self, key: &str) -> StoreResult<bool>;

    /// Public URL or path for `key`
    fn locate(&self, key: &str) -> String;

    /// Release per-scope resources. Called when the owning manager scope ends.
    fn cleanup(&self) {}

    /// Get store name for logging
    fn name(&self) -> &str;
}

/// Reject keys that could escape the store namespace
pub fn validate_key(key: &str) -> StoreResult<()> {
    if key.is_empty()
        || key.split(['/', '\\']).any(|part| part == "..")
        || key.starts_with('/')
        || key.starts_with('\\')
    {
        return Err(StoreError::InvalidKey(key.to_string()));
    }
    Ok(())
}

/// Hex SHA-256 of `data`
pub fn content_digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
