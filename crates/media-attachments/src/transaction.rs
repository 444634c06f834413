//! Transaction integration
//!
//! A [`TransactionScope`] ties one [`StoreManager`] to one unit of work. The
//! unit of work commits first; storage is flushed only after it succeeded.

use std::convert::Infallible;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::{AttachmentError, ContextError};
use crate::manager::{CommitReport, StoreManager};

/// The enclosing database transaction or session
#[async_trait]
pub trait UnitOfWork: Send {
    type Error: std::error::Error + Send + Sync + 'static;

    async fn commit(self) -> Result<(), Self::Error>;

    async fn rollback(self) -> Result<(), Self::Error>;
}

/// Unit of work with nothing to commit
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopUnitOfWork;

#[async_trait]
impl UnitOfWork for NoopUnitOfWork {
    type Error = Infallible;

    async fn commit(self) -> Result<(), Infallible> {
        Ok(())
    }

    async fn rollback(self) -> Result<(), Infallible> {
        Ok(())
    }
}

#[cfg(feature = "sqlx")]
#[async_trait]
impl UnitOfWork for sqlx::Transaction<'static, sqlx::Postgres> {
    type Error = sqlx::Error;

    async fn commit(self) -> Result<(), sqlx::Error> {
        sqlx::Transaction::commit(self).await
    }

    async fn rollback(self) -> Result<(), sqlx::Error> {
        sqlx::Transaction::rollback(self).await
    }
}

#[derive(Debug, Error)]
pub enum TransactionError<E: std::error::Error + 'static> {
    /// The unit of work failed; no storage I/O happened
    #[error("Unit of work failed: {0}")]
    UnitOfWork(#[source] E),
    /// The unit of work committed but storage did not
    #[error(transparent)]
    Storage(#[from] AttachmentError),
}

/// One manager bound to one unit of work.
///
/// Dropping the scope without calling [`commit`](Self::commit) or
/// [`rollback`](Self::rollback) discards pending storage work; the unit of
/// work is dropped with it.
pub struct TransactionScope<U: UnitOfWork> {
    manager: StoreManager,
    unit: Option<U>,
}

impl<U: UnitOfWork> TransactionScope<U> {
    pub fn begin(manager: StoreManager, unit: U) -> Result<Self, ContextError> {
        manager.bind()?;
        debug!(manager = %manager.id(), "Transaction scope started");
        Ok(Self {
            manager,
            unit: Some(unit),
        })
    }

    pub fn manager(&self) -> &StoreManager {
        &self.manager
    }

    /// Commit the unit of work, then flush storage. Every store is resolved
    /// first; if one is missing the unit of work is rolled back instead.
    pub async fn commit(mut self) -> Result<CommitReport, TransactionError<U::Error>> {
        let Some(unit) = self.unit.take() else {
            return Err(ContextError::Closed.into());
        };

        if let Err(e) = self.manager.prepare() {
            warn!(manager = %self.manager.id(), error = %e, "Store resolution failed, rolling back unit of work");
            self.manager.discard();
            if let Err(rollback) = unit.rollback().await {
                warn!(manager = %self.manager.id(), error = %rollback, "Unit of work rollback failed");
            }
            return Err(e.into());
        }

        if let Err(e) = unit.commit().await {
            warn!(manager = %self.manager.id(), error = %e, "Unit of work failed, discarding storage work");
            self.manager.discard();
            return Err(TransactionError::UnitOfWork(e));
        }
        Ok(self.manager.commit().await?)
    }

    /// Roll back both sides
    pub async fn rollback(mut self) -> Result<(), TransactionError<U::Error>> {
        self.manager.discard();
        match self.unit.take() {
            Some(unit) => unit.rollback().await.map_err(TransactionError::UnitOfWork),
            None => Ok(()),
        }
    }
}

impl<E: std::error::Error + 'static> From<ContextError> for TransactionError<E> {
    fn from(err: ContextError) -> Self {
        TransactionError::Storage(err.into())
    }
}

impl<U: UnitOfWork> Drop for TransactionScope<U> {
    fn drop(&mut self) {
        if self.unit.is_some() {
            warn!(manager = %self.manager.id(), "Transaction scope dropped without commit or rollback");
            self.manager.discard();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bytes::Bytes;
    use media_stores::Store;
    use parking_lot::Mutex;

    use super::*;
    use crate::manager::{AttachOptions, ScopePhase};
    use crate::testing;
    use crate::types::AttachmentType;

    #[derive(Debug, Error)]
    #[error("database unavailable")]
    struct DatabaseDown;

    struct FailingUnitOfWork;

    #[async_trait]
    impl UnitOfWork for FailingUnitOfWork {
        type Error = DatabaseDown;

        async fn commit(self) -> Result<(), DatabaseDown> {
            Err(DatabaseDown)
        }

        async fn rollback(self) -> Result<(), DatabaseDown> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_commit_flushes_after_unit_of_work() {
        let (registry, store) = testing::registry();
        let manager = testing::manager(&registry, true);
        let tx = TransactionScope::begin(manager.clone(), NoopUnitOfWork).unwrap();

        let a = manager
            .scope(async {
                StoreManager::current()
                    .unwrap()
                    .attach(&AttachmentType::file(), &b"hello"[..], AttachOptions::new())
                    .await
            })
            .await
            .unwrap()
            .unwrap();

        let report = tx.commit().await.unwrap();
        assert_eq!(report.stored, vec![a.path()]);
        assert_eq!(store.open(&a.path()).await.unwrap(), Bytes::from("hello"));
    }

    #[tokio::test]
    async fn test_failed_unit_of_work_skips_storage() {
        let (registry, store) = testing::registry();
        let manager = testing::manager(&registry, true);
        let tx = TransactionScope::begin(manager.clone(), FailingUnitOfWork).unwrap();

        manager
            .attach(&AttachmentType::file(), &b"never"[..], AttachOptions::new())
            .await
            .unwrap();

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, TransactionError::UnitOfWork(DatabaseDown)));
        assert_eq!(manager.phase(), ScopePhase::Closed);
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_rollback_discards() {
        let (registry, store) = testing::registry();
        let manager = testing::manager(&registry, true);
        let tx = TransactionScope::begin(manager.clone(), NoopUnitOfWork).unwrap();

        manager
            .attach(&AttachmentType::file(), &b"aborted"[..], AttachOptions::new())
            .await
            .unwrap();
        tx.rollback().await.unwrap();

        assert_eq!(manager.phase(), ScopePhase::Closed);
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_drop_discards() {
        let (registry, store) = testing::registry();
        let manager = testing::manager(&registry, true);

        {
            let _tx = TransactionScope::begin(manager.clone(), NoopUnitOfWork).unwrap();
            manager
                .attach(&AttachmentType::file(), &b"dropped"[..], AttachOptions::new())
                .await
                .unwrap();
        }

        assert_eq!(manager.phase(), ScopePhase::Closed);
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_manager_binds_once() {
        let (registry, _store) = testing::registry();
        let manager = testing::manager(&registry, true);

        let _tx = TransactionScope::begin(manager.clone(), NoopUnitOfWork).unwrap();
        assert!(matches!(
            TransactionScope::begin(manager.clone(), NoopUnitOfWork),
            Err(ContextError::AlreadyBound)
        ));
    }

    #[tokio::test]
    async fn test_filesystem_replace_scenario() {
        use media_stores::{FileSystemStore, StoreRegistry};

        use crate::descriptor::Attachable;
        use crate::pipeline::fixtures::png;
        use crate::pipeline::ImageAnalyzer;
        use crate::tracking::AttachmentField;

        let dir = tempfile::tempdir().unwrap();
        let registry = Arc::new(StoreRegistry::new());
        registry.register_instance(
            "fs",
            Arc::new(FileSystemStore::new(dir.path(), "http://static.example.org/media")),
            true,
        );
        let avatar = AttachmentType::image().processor(ImageAnalyzer).auto_coercion(true);
        let mut field = AttachmentField::default();

        let first = testing::manager(&registry, true);
        let tx = TransactionScope::begin(first.clone(), NoopUnitOfWork).unwrap();
        field
            .assign(&first, &avatar, Attachable::named(png(32, 32, 10 * 1024), "me.png"))
            .await
            .unwrap();
        tx.commit().await.unwrap();
        let k1 = field.get().cloned().unwrap();
        assert!(dir.path().join(k1.path()).exists());
        assert!(first
            .locate(&k1)
            .unwrap()
            .starts_with(&format!("http://static.example.org/media/images/image-{}-me.png?_ts=", k1.key)));

        let second = testing::manager(&registry, true);
        let tx = TransactionScope::begin(second.clone(), NoopUnitOfWork).unwrap();
        field
            .assign(&second, &avatar, Attachable::named(png(48, 48, 10 * 1024), "me.png"))
            .await
            .unwrap();
        let k2 = field.get().cloned().unwrap();
        tx.commit().await.unwrap();

        assert!(!dir.path().join(k1.path()).exists());
        assert!(dir.path().join(k2.path()).exists());
        assert_eq!(k2.width(), Some(48));
    }

    #[derive(Default)]
    struct TrackedUnitOfWork {
        outcome: Arc<Mutex<Option<&'static str>>>,
    }

    #[async_trait]
    impl UnitOfWork for TrackedUnitOfWork {
        type Error = DatabaseDown;

        async fn commit(self) -> Result<(), DatabaseDown> {
            *self.outcome.lock() = Some("commit");
            Ok(())
        }

        async fn rollback(self) -> Result<(), DatabaseDown> {
            *self.outcome.lock() = Some("rollback");
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_missing_store_rolls_back_unit_of_work() {
        let (registry, store) = testing::registry();
        let manager = testing::manager(&registry, true);
        let unit = TrackedUnitOfWork::default();
        let outcome = unit.outcome.clone();
        let tx = TransactionScope::begin(manager.clone(), unit).unwrap();

        manager
            .attach(&AttachmentType::file(), &b"orphaned store"[..], AttachOptions::new())
            .await
            .unwrap();
        registry.unregister("recording");

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(
            err,
            TransactionError::Storage(AttachmentError::UnknownStore(ref name)) if name == "recording"
        ));
        assert_eq!(*outcome.lock(), Some("rollback"));
        assert_eq!(manager.phase(), ScopePhase::Closed);
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_commit_survives_unregister_after_prepare() {
        let (registry, store) = testing::registry();
        let manager = testing::manager(&registry, true);

        let a = manager
            .attach(&AttachmentType::file(), &b"kept"[..], AttachOptions::new())
            .await
            .unwrap();
        manager.prepare().unwrap();
        registry.unregister("recording");

        let report = manager.commit().await.unwrap();
        assert_eq!(report.stored, vec![a.path()]);
        assert_eq!(store.ops(), vec![testing::Op::Put(a.path())]);
    }

    #[tokio::test]
    async fn test_storage_failure_after_commit() {
        let (registry, store) = testing::registry();
        let manager = testing::manager(&registry, true);
        let tx = TransactionScope::begin(manager.clone(), NoopUnitOfWork).unwrap();

        manager
            .attach(&AttachmentType::file(), &b"x"[..], AttachOptions::new())
            .await
            .unwrap();
        store.fail_on("files/");

        let err = tx.commit().await.unwrap_err();
        assert!(matches!(err, TransactionError::Storage(ref e) if e.is_partial_commit()));
    }
}
