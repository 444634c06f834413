//! Local filesystem store

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

use crate::error::{StoreError, StoreResult};
use crate::store::{validate_key, Store, StoredObject};

/// Store for the local file system.
///
/// Files live under `root`; `locate` joins `base_url` and the key.
pub struct FileSystemStore {
    root: PathBuf,
    base_url: String,
}

impl FileSystemStore {
    pub fn new(root: impl AsRef<Path>, base_url: impl Into<String>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a key to a full path
    fn resolve_path(&self, key: &str) -> StoreResult<PathBuf> {
        validate_key(key)?;
        Ok(self.root.join(key))
    }

    /// Sibling temp path, unique per write so concurrent puts never collide
    fn temp_path(path: &Path) -> PathBuf {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        path.with_file_name(format!(".{}.{}.tmp", name, Uuid::new_v4().simple()))
    }

    async fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = Self::temp_path(path);
        let written = async {
            let mut file = fs::File::create(&temp_path).await?;
            file.write_all(data).await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, path).await
        }
        .await;

        if let Err(e) = written {
            warn!(temp_path = %temp_path.display(), error = %e, "Atomic write failed");
            if let Err(cleanup) = fs::remove_file(&temp_path).await {
                if cleanup.kind() != std::io::ErrorKind::NotFound {
                    warn!(temp_path = %temp_path.display(), error = %cleanup, "Temp file left behind");
                }
            }
            return Err(e);
        }
        Ok(())
    }
}

#[async_trait]
impl Store for FileSystemStore {
    #[instrument(skip(self, data), fields(store = "filesystem", length = data.len()))]
    async fn put(&self, key: &str, data: Bytes) -> StoreResult<StoredObject> {
        let path = self.resolve_path(key)?;

        Self::write_atomic(&path, &data)
            .await
            .map_err(|source| StoreError::Write {
                key: key.to_string(),
                source,
            })?;

        let object = StoredObject::new(key, &data);
        debug!(path = ?path, length = object.length, "File stored");
        Ok(object)
    }

    #[instrument(skip(self), fields(store = "filesystem"))]
    async fn delete(&self, key: &str) -> StoreResult<()> {
        let path = self.resolve_path(key)?;

        match fs::remove_file(&path).await {
            Ok(()) => {
                debug!(path = ?path, "File deleted");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    #[instrument(skip(self), fields(store = "filesystem"))]
    async fn open(&self, key: &str) -> StoreResult<Bytes> {
        let path = self.resolve_path(key)?;

        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                Err(StoreError::NotFound(key.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn exists(&self, key: &str) -> StoreResult<bool> {
        let path = self.resolve_path(key)?;
        Ok(fs::try_exists(&path).await?)
    }

    fn locate(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key)
    }

    fn name(&self) -> &str {
        "filesystem"
    }
}
