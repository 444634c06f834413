//! Test doubles shared by the unit tests

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use media_stores::{MemoryStore, Store, StoreError, StoreRegistry, StoreResult, StoredObject};
use parking_lot::Mutex;

use crate::manager::{ManagerOptions, StoreManager};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Op {
    Put(String),
    Delete(String),
}

/// Memory store that records every mutating call and can be told to fail
pub struct RecordingStore {
    inner: MemoryStore,
    ops: Mutex<Vec<Op>>,
    fail_on: Mutex<Option<String>>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self {
            inner: MemoryStore::with_base_url("http://static.example.org"),
            ops: Mutex::new(Vec::new()),
            fail_on: Mutex::new(None),
        }
    }

    pub fn ops(&self) -> Vec<Op> {
        self.ops.lock().clone()
    }

    /// Fail any put or delete whose key contains `pattern`
    pub fn fail_on(&self, pattern: impl Into<String>) {
        *self.fail_on.lock() = Some(pattern.into());
    }

    fn check(&self, key: &str) -> StoreResult<()> {
        match self.fail_on.lock().as_deref() {
            Some(pattern) if key.contains(pattern) => Err(StoreError::Backend(format!("refusing {}", key))),
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Store for RecordingStore {
    async fn put(&self, key: &str, data: Bytes) -> StoreResult<StoredObject> {
        self.check(key)?;
        self.ops.lock().push(Op::Put(key.to_string()));
        self.inner.put(key, data).await
    }

    async fn delete(&self, key: &str) -> StoreResult<()> {
        self.check(key)?;
        self.ops.lock().push(Op::Delete(key.to_string()));
        self.inner.delete(key).await
    }

    async fn open(&self, key: &str) -> StoreResult<Bytes> {
        self.inner.open(key).await
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        self.inner.exists(key).await
    }

    fn locate(&self, key: &str) -> String {
        self.inner.locate(key)
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Private registry with one default recording store
pub fn registry() -> (Arc<StoreRegistry>, Arc<RecordingStore>) {
    let registry = Arc::new(StoreRegistry::new());
    let store = Arc::new(RecordingStore::new());
    registry.register_instance("recording", store.clone(), true);
    (registry, store)
}

pub fn manager(registry: &Arc<StoreRegistry>, delete_orphan: bool) -> StoreManager {
    StoreManager::new(
        registry.clone(),
        ManagerOptions {
            delete_orphan,
            max_length: None,
        },
    )
}
