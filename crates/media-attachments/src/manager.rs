//! Store manager
//!
//! A `StoreManager` lives for one unit of work. It collects staged writes
//! and scheduled deletes in memory and applies them to the stores only when
//! [`StoreManager::commit`] runs. A rollback forgets them without touching
//! any store.
//!
//! ```text
//!   Open --commit()--> Committing --> Closed
//!     \--rollback()------------------> Closed
//! ```

use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use media_core::AttachmentsConfig;
use media_stores::{content_digest, Store, StoreRegistry};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use crate::descriptor::{guess_extension, Attachable, DescriptorOptions, StreamDescriptor};
use crate::error::{AttachmentError, AttachmentResult, ContextError, PartialCommit};
use crate::model::{round_to, Attachment, AttachmentKind, ThumbnailRef};
use crate::pipeline::{self, AttachmentInfo, ImageAnalyzer};
use crate::types::AttachmentType;

tokio::task_local! {
    static ACTIVE: StoreManager;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopePhase {
    Open,
    Committing,
    Closed,
}

impl fmt::Display for ScopePhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Open => "open",
            Self::Committing => "committing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ManagerOptions {
    /// Schedule deletion of attachments that lose their last reference
    pub delete_orphan: bool,
    /// Caps every type's maximum length
    pub max_length: Option<u64>,
}

impl From<&AttachmentsConfig> for ManagerOptions {
    fn from(config: &AttachmentsConfig) -> Self {
        Self {
            delete_orphan: config.delete_orphan,
            max_length: config.max_length,
        }
    }
}

/// Per-call options for [`StoreManager::attach`]
#[derive(Debug, Clone, Default)]
pub struct AttachOptions {
    pub content_type: Option<String>,
    pub original_filename: Option<String>,
    pub extension: Option<String>,
    /// Store name; the registry default when `None`
    pub store_id: Option<String>,
    /// Known `(width, height)`, skips the need for an image analyzer
    pub dimension: Option<(u32, u32)>,
    pub extra: Map<String, Value>,
    pub suppress_pre_process: bool,
    pub suppress_validation: bool,
}

impl AttachOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    pub fn original_filename(mut self, filename: impl Into<String>) -> Self {
        self.original_filename = Some(filename.into());
        self
    }

    pub fn store(mut self, store_id: impl Into<String>) -> Self {
        self.store_id = Some(store_id.into());
        self
    }

    pub fn dimension(mut self, width: u32, height: u32) -> Self {
        self.dimension = Some((width, height));
        self
    }
}

/// Store keys written and removed by a successful commit
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommitReport {
    pub stored: Vec<String>,
    pub deleted: Vec<String>,
}

struct PendingPut {
    seq: u64,
    attachment: Attachment,
    data: Bytes,
}

struct PendingDelete {
    seq: u64,
    attachment: Attachment,
}

struct ScopeState {
    phase: ScopePhase,
    bound: bool,
    next_seq: u64,
    pending_puts: HashMap<String, PendingPut>,
    pending_deletes: HashMap<String, PendingDelete>,
    /// Staged content orphaned in this scope, kept until the scope ends so a
    /// later `adopt` can restore it
    reverted: HashMap<String, PendingPut>,
}

impl ScopeState {
    fn ensure_open(&self) -> Result<(), ContextError> {
        match self.phase {
            ScopePhase::Open => Ok(()),
            ScopePhase::Closed => Err(ContextError::Closed),
            phase => Err(ContextError::NotOpen(phase)),
        }
    }

    fn seq(&mut self) -> u64 {
        self.next_seq += 1;
        self.next_seq
    }

    fn schedule_delete(&mut self, attachment: &Attachment) {
        for target in attachment.with_dependents() {
            if let Some(put) = self.pending_puts.remove(&target.key) {
                debug!(key = %target.key, "Staged attachment reverted");
                self.reverted.insert(target.key.clone(), put);
            } else if !self.pending_deletes.contains_key(&target.key) && !self.reverted.contains_key(&target.key) {
                let seq = self.seq();
                self.pending_deletes.insert(
                    target.key.clone(),
                    PendingDelete {
                        seq,
                        attachment: target.clone(),
                    },
                );
                debug!(key = %target.key, "Attachment scheduled for deletion");
            }
        }
    }
}

struct Inner {
    id: Uuid,
    registry: Arc<StoreRegistry>,
    options: ManagerOptions,
    state: Mutex<ScopeState>,
    stores: Mutex<HashMap<String, Arc<dyn Store>>>,
}

/// Transactional coordinator for one unit of work. Cloning shares the scope.
#[derive(Clone)]
pub struct StoreManager {
    inner: Arc<Inner>,
}

impl fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreManager")
            .field("id", &self.inner.id)
            .field("phase", &self.phase())
            .field("options", &self.inner.options)
            .finish()
    }
}

impl StoreManager {
    pub fn new(registry: Arc<StoreRegistry>, options: ManagerOptions) -> Self {
        let id = Uuid::new_v4();
        debug!(manager = %id, delete_orphan = options.delete_orphan, "Store manager opened");
        Self {
            inner: Arc::new(Inner {
                id,
                registry,
                options,
                state: Mutex::new(ScopeState {
                    phase: ScopePhase::Open,
                    bound: false,
                    next_seq: 0,
                    pending_puts: HashMap::new(),
                    pending_deletes: HashMap::new(),
                    reverted: HashMap::new(),
                }),
                stores: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Manager over the process-wide registry
    pub fn from_config(config: &AttachmentsConfig) -> Self {
        Self::new(StoreRegistry::global(), config.into())
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn phase(&self) -> ScopePhase {
        self.inner.state.lock().phase
    }

    pub fn delete_orphan(&self) -> bool {
        self.inner.options.delete_orphan
    }

    /// The manager bound to the current task
    pub fn current() -> Result<StoreManager, ContextError> {
        ACTIVE
            .try_with(|manager| manager.clone())
            .map_err(|_| ContextError::NoActiveManager)
    }

    /// Run `fut` with this manager as the task's active manager. Nested
    /// scopes are rejected.
    pub async fn scope<F: Future>(&self, fut: F) -> Result<F::Output, ContextError> {
        if ACTIVE.try_with(|_| ()).is_ok() {
            return Err(ContextError::NestedScope);
        }
        self.inner.state.lock().ensure_open()?;
        Ok(ACTIVE.scope(self.clone(), fut).await)
    }

    /// Mark the manager as owned by a unit of work
    pub(crate) fn bind(&self) -> Result<(), ContextError> {
        let mut state = self.inner.state.lock();
        state.ensure_open()?;
        if state.bound {
            return Err(ContextError::AlreadyBound);
        }
        state.bound = true;
        Ok(())
    }

    /// Load, process and stage new content
    #[instrument(skip_all, fields(manager = %self.inner.id, kind = %attachment_type.kind()))]
    pub async fn attach(
        &self,
        attachment_type: &AttachmentType,
        source: impl Into<Attachable>,
        options: AttachOptions,
    ) -> AttachmentResult<Attachment> {
        self.inner.state.lock().ensure_open()?;
        let store_id = self.inner.registry.resolve_name(options.store_id.as_deref())?;

        let max_length = match (attachment_type.max(), self.inner.options.max_length) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let explicit_extension = options.extension.is_some();
        let mut descriptor = StreamDescriptor::load(
            source.into(),
            DescriptorOptions {
                content_type: options.content_type,
                original_filename: options.original_filename,
                extension: options.extension,
                max_length,
                min_length: attachment_type.min(),
            },
        )
        .await?;

        let mut info = AttachmentInfo::from_descriptor(&descriptor);
        info.extra = options.extra;
        if let Some((width, height)) = options.dimension {
            info.width = Some(width);
            info.height = Some(height);
        }
        if !options.suppress_pre_process {
            pipeline::run(
                attachment_type.processors(),
                &mut descriptor,
                &mut info,
                options.suppress_validation,
            )?;
        }

        // An analyzer may have corrected the content type
        if !explicit_extension && info.content_type != descriptor.content_type {
            if let Some(ext) = info.content_type.as_deref().and_then(guess_extension) {
                info.extension = Some(ext);
            }
        }

        let data = descriptor.into_data();
        let mut attachment = Attachment::new(attachment_type.kind());
        attachment.content_type = info.content_type;
        attachment.original_filename = info.original_filename;
        attachment.extension = info.extension;
        attachment.length = data.len() as u64;
        attachment.store_id = Some(store_id);
        attachment.reproducible = attachment_type.is_reproducible();
        attachment.digest = Some(content_digest(&data));
        attachment.extra = info.extra;
        if let Some(width) = info.width {
            attachment.extra.insert("width".to_string(), Value::from(width));
        }
        if let Some(height) = info.height {
            attachment.extra.insert("height".to_string(), Value::from(height));
        }

        self.stage(attachment.clone(), data)?;
        info!(
            key = %attachment.key,
            path = %attachment.path(),
            length = attachment.length,
            "Attachment staged"
        );
        Ok(attachment)
    }

    /// Attach a thumbnail of `image` and record it on the image. The image
    /// record itself must be saved by the caller.
    pub async fn attach_thumbnail(
        &self,
        image: &mut Attachment,
        source: impl Into<Attachable>,
        mut options: AttachOptions,
    ) -> AttachmentResult<Attachment> {
        if image.kind != AttachmentKind::Image {
            return Err(AttachmentError::InvalidOperation(format!(
                "{} attachments have no thumbnails",
                image.kind
            )));
        }
        let original_width = image
            .width()
            .filter(|w| *w > 0)
            .ok_or_else(|| AttachmentError::InvalidOperation("image width is unknown".to_string()))?;

        if options.store_id.is_none() {
            options.store_id = image.store_id.clone();
        }
        let mut thumbnail_type = AttachmentType::thumbnail();
        if options.dimension.is_none() {
            thumbnail_type = thumbnail_type.processor(ImageAnalyzer);
        }

        let thumbnail = self.attach(&thumbnail_type, source, options).await?;
        let width = thumbnail.width().unwrap_or_default();
        let height = thumbnail.height().unwrap_or_default();
        image.thumbnails.push(ThumbnailRef {
            width,
            height,
            ratio: round_to(f64::from(width) / f64::from(original_width), 5),
            thumbnail: thumbnail.clone(),
        });
        Ok(thumbnail)
    }

    /// Register content for writing at commit. Cancels a pending delete of
    /// the same key.
    pub fn stage(&self, attachment: Attachment, data: Bytes) -> AttachmentResult<()> {
        let mut state = self.inner.state.lock();
        state.ensure_open()?;
        if state.pending_deletes.remove(&attachment.key).is_some() {
            debug!(key = %attachment.key, "Pending delete cancelled by stage");
        }
        state.reverted.remove(&attachment.key);
        let seq = state.seq();
        state.pending_puts.insert(
            attachment.key.clone(),
            PendingPut {
                seq,
                attachment,
                data,
            },
        );
        Ok(())
    }

    /// An existing attachment is referenced again
    pub fn adopt(&self, attachment: &Attachment) -> AttachmentResult<()> {
        let mut state = self.inner.state.lock();
        state.ensure_open()?;
        for target in attachment.with_dependents() {
            if state.pending_deletes.remove(&target.key).is_some() {
                debug!(key = %target.key, "Pending delete cancelled by adopt");
            } else if let Some(mut put) = state.reverted.remove(&target.key) {
                put.seq = state.seq();
                state.pending_puts.insert(target.key.clone(), put);
                debug!(key = %target.key, "Reverted attachment staged again");
            }
        }
        Ok(())
    }

    /// An attachment lost its last reference. Does nothing unless
    /// `delete_orphan` is enabled.
    pub fn orphan(&self, attachment: &Attachment) -> AttachmentResult<()> {
        let mut state = self.inner.state.lock();
        state.ensure_open()?;
        if self.inner.options.delete_orphan {
            state.schedule_delete(attachment);
        }
        Ok(())
    }

    /// The owning record was deleted
    pub fn record_deleted(&self, attachment: &Attachment) -> AttachmentResult<()> {
        let mut state = self.inner.state.lock();
        state.ensure_open()?;
        state.schedule_delete(attachment);
        Ok(())
    }

    /// Sorted keys waiting to be written
    pub fn pending_puts(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.state.lock().pending_puts.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Sorted keys waiting to be deleted
    pub fn pending_deletes(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.inner.state.lock().pending_deletes.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Store for `store_id` (the default when `None`), cached for the scope
    pub fn store(&self, store_id: Option<&str>) -> AttachmentResult<Arc<dyn Store>> {
        if let Some(id) = store_id {
            if let Some(store) = self.inner.stores.lock().get(id).cloned() {
                return Ok(store);
            }
        }
        let name = self.inner.registry.resolve_name(store_id)?;
        let cached = self.inner.stores.lock().get(&name).cloned();
        if let Some(store) = cached {
            return Ok(store);
        }

        let (name, store) = self.inner.registry.instantiate(Some(&name))?;
        if self.phase() == ScopePhase::Closed {
            return Ok(store);
        }
        Ok(self.inner.stores.lock().entry(name).or_insert(store).clone())
    }

    /// Content of `attachment`, including staged but uncommitted content
    pub async fn open(&self, attachment: &Attachment) -> AttachmentResult<Bytes> {
        let staged = self
            .inner
            .state
            .lock()
            .pending_puts
            .get(&attachment.key)
            .map(|pending| pending.data.clone());
        if let Some(data) = staged {
            return Ok(data);
        }

        let store = self.store(attachment.store_id.as_deref())?;
        Ok(store.open(&attachment.path()).await?)
    }

    /// Public URL of `attachment` with a cache-busting timestamp
    pub fn locate(&self, attachment: &Attachment) -> AttachmentResult<String> {
        let store = self.store(attachment.store_id.as_deref())?;
        Ok(attachment.locate_with(&store.locate(&attachment.path())))
    }

    /// Resolve and cache the store of every pending put and delete, so a
    /// later commit cannot fail on store lookup
    pub(crate) fn prepare(&self) -> AttachmentResult<()> {
        let store_ids: BTreeSet<Option<String>> = {
            let state = self.inner.state.lock();
            state.ensure_open()?;
            state
                .pending_puts
                .values()
                .map(|p| &p.attachment)
                .chain(state.pending_deletes.values().map(|d| &d.attachment))
                .map(|a| a.store_id.clone())
                .collect()
        };
        for store_id in store_ids {
            self.store(store_id.as_deref())?;
        }
        Ok(())
    }

    /// Flush staged writes, then scheduled deletes. Stops at the first
    /// failure; work already flushed stays in storage.
    #[instrument(skip(self), fields(manager = %self.inner.id))]
    pub async fn commit(&self) -> AttachmentResult<CommitReport> {
        let (puts, deletes) = {
            let mut state = self.inner.state.lock();
            state.ensure_open()?;
            state.phase = ScopePhase::Committing;

            let mut puts: Vec<PendingPut> = state.pending_puts.drain().map(|(_, p)| p).collect();
            puts.sort_by_key(|p| p.seq);
            let mut deletes: Vec<PendingDelete> = state.pending_deletes.drain().map(|(_, d)| d).collect();
            deletes.sort_by_key(|d| d.seq);
            state.reverted.clear();
            (puts, deletes)
        };

        let result = self.flush(puts, deletes).await;
        self.close();

        if let Ok(report) = &result {
            info!(
                stored = report.stored.len(),
                deleted = report.deleted.len(),
                "Storage commit finished"
            );
        }
        result
    }

    async fn flush(&self, puts: Vec<PendingPut>, deletes: Vec<PendingDelete>) -> AttachmentResult<CommitReport> {
        // Resolve every store before the first write
        let mut put_targets = Vec::with_capacity(puts.len());
        for put in puts {
            let store = self.store(put.attachment.store_id.as_deref())?;
            put_targets.push((store, put.attachment.path(), put));
        }
        let mut delete_targets = Vec::with_capacity(deletes.len());
        for delete in deletes {
            let store = self.store(delete.attachment.store_id.as_deref())?;
            delete_targets.push((store, delete.attachment.path()));
        }

        let mut report = CommitReport::default();
        for (i, (store, path, put)) in put_targets.iter().enumerate() {
            match store.put(path, put.data.clone()).await {
                Ok(object) => {
                    if object.length != put.attachment.length {
                        warn!(
                            path = %path,
                            expected = put.attachment.length,
                            written = object.length,
                            "Stored length differs from attachment record"
                        );
                    }
                    report.stored.push(path.clone());
                }
                Err(source) => {
                    let remaining = put_targets[i + 1..]
                        .iter()
                        .map(|(_, p, _)| p.clone())
                        .chain(delete_targets.iter().map(|(_, p)| p.clone()))
                        .collect();
                    return Err(partial_commit(report, path.clone(), remaining, source));
                }
            }
        }

        for (i, (store, path)) in delete_targets.iter().enumerate() {
            match store.delete(path).await {
                Ok(()) => report.deleted.push(path.clone()),
                Err(source) => {
                    let remaining = delete_targets[i + 1..].iter().map(|(_, p)| p.clone()).collect();
                    return Err(partial_commit(report, path.clone(), remaining, source));
                }
            }
        }
        Ok(report)
    }

    /// Forget all pending work without store I/O
    pub fn rollback(&self) -> AttachmentResult<()> {
        self.inner.state.lock().ensure_open()?;
        self.discard();
        Ok(())
    }

    /// Close the scope, dropping pending work. No-op once closed.
    pub(crate) fn discard(&self) {
        let (puts, deletes) = {
            let mut state = self.inner.state.lock();
            if state.phase == ScopePhase::Closed {
                return;
            }
            let counts = (state.pending_puts.len(), state.pending_deletes.len());
            state.pending_puts.clear();
            state.pending_deletes.clear();
            state.reverted.clear();
            counts
        };
        debug!(
            manager = %self.inner.id,
            discarded_puts = puts,
            discarded_deletes = deletes,
            "Pending storage work discarded"
        );
        self.close();
    }

    fn close(&self) {
        self.inner.state.lock().phase = ScopePhase::Closed;
        let stores: Vec<Arc<dyn Store>> = self.inner.stores.lock().drain().map(|(_, s)| s).collect();
        for store in stores {
            store.cleanup();
        }
        debug!(manager = %self.inner.id, "Store manager closed");
    }
}

fn partial_commit(
    report: CommitReport,
    failed: String,
    remaining: Vec<String>,
    source: media_stores::StoreError,
) -> AttachmentError {
    error!(
        failed = %failed,
        stored = ?report.stored,
        deleted = ?report.deleted,
        not_attempted = remaining.len(),
        error = %source,
        "Storage commit stopped; flushed work is not undone"
    );
    AttachmentError::PartialCommit(Box::new(PartialCommit {
        stored: report.stored,
        deleted: report.deleted,
        failed,
        remaining,
        source,
    }))
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use media_stores::MemoryStore;
    use proptest::prelude::*;

    use super::*;
    use crate::error::ValidationError;
    use crate::pipeline::fixtures::png;
    use crate::pipeline::ContentTypeValidator;
    use crate::testing::{self, Op};

    fn sample(key: &str) -> Attachment {
        let mut a = Attachment::new(AttachmentKind::File);
        a.key = key.to_string();
        a.store_id = Some("recording".to_string());
        a
    }

    #[tokio::test]
    async fn test_rollback_leaks_nothing() {
        let (registry, store) = testing::registry();
        let manager = testing::manager(&registry, true);

        manager
            .attach(&AttachmentType::file(), Attachable::named(&b"one"[..], "one.txt"), AttachOptions::new())
            .await
            .unwrap();
        manager
            .attach(&AttachmentType::file(), Attachable::named(&b"two"[..], "two.txt"), AttachOptions::new())
            .await
            .unwrap();
        assert_eq!(manager.pending_puts().len(), 2);

        manager.rollback().unwrap();
        assert_eq!(manager.phase(), ScopePhase::Closed);
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_staged_then_orphaned_never_touches_store() {
        let (registry, store) = testing::registry();
        let manager = testing::manager(&registry, true);

        let a = manager
            .attach(&AttachmentType::file(), &b"temporary"[..], AttachOptions::new())
            .await
            .unwrap();
        manager.orphan(&a).unwrap();

        assert!(manager.pending_puts().is_empty());
        assert!(manager.pending_deletes().is_empty());
        assert_eq!(manager.commit().await.unwrap(), CommitReport::default());
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_commit_png_and_locate() {
        let (registry, store) = testing::registry();
        let manager = testing::manager(&registry, true);
        let data = png(64, 48, 10 * 1024);

        let image_type = AttachmentType::image()
            .processor(ImageAnalyzer)
            .processor(ContentTypeValidator::new(["image/png", "image/jpeg"]));
        let a = manager
            .attach(&image_type, Attachable::named(data.clone(), "cat.png"), AttachOptions::new())
            .await
            .unwrap();

        assert_eq!(a.length, 10240);
        assert_eq!(a.content_type.as_deref(), Some("image/png"));
        assert_eq!(a.extension.as_deref(), Some(".png"));
        assert_eq!(a.width(), Some(64));
        assert_eq!(a.store_id.as_deref(), Some("recording"));

        let report = manager.commit().await.unwrap();
        assert_eq!(report.stored, vec![a.path()]);
        assert_eq!(store.ops(), vec![Op::Put(format!("images/image-{}-cat.png", a.key))]);

        let reader = testing::manager(&registry, true);
        assert_eq!(reader.open(&a).await.unwrap(), Bytes::from(data));
        let url = reader.locate(&a).unwrap();
        assert_eq!(url, reader.locate(&a).unwrap());
        assert_eq!(
            url,
            format!(
                "http://static.example.org/images/image-{}-cat.png?_ts={}",
                a.key,
                a.timestamp_param()
            )
        );
    }

    #[tokio::test]
    async fn test_replace_deletes_previous_on_commit() {
        let (registry, store) = testing::registry();

        let first = testing::manager(&registry, true);
        let k1 = first
            .attach(&AttachmentType::file(), &b"version one"[..], AttachOptions::new())
            .await
            .unwrap();
        first.commit().await.unwrap();

        let second = testing::manager(&registry, true);
        let k2 = second
            .attach(&AttachmentType::file(), &b"version two"[..], AttachOptions::new())
            .await
            .unwrap();
        second.orphan(&k1).unwrap();
        let report = second.commit().await.unwrap();

        assert_eq!(report.stored, vec![k2.path()]);
        assert_eq!(report.deleted, vec![k1.path()]);
        assert!(!store.exists(&k1.path()).await.unwrap());
        assert!(store.exists(&k2.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_orphan_ignored_without_delete_orphan() {
        let (registry, store) = testing::registry();
        let manager = testing::manager(&registry, false);

        let a = manager
            .attach(&AttachmentType::file(), &b"kept"[..], AttachOptions::new())
            .await
            .unwrap();
        manager.orphan(&a).unwrap();
        manager.orphan(&sample("old")).unwrap();

        assert_eq!(manager.pending_puts(), vec![a.key.clone()]);
        assert!(manager.pending_deletes().is_empty());
        manager.commit().await.unwrap();
        assert_eq!(store.ops(), vec![Op::Put(a.path())]);
    }

    #[tokio::test]
    async fn test_record_deleted_twice_is_harmless() {
        let (registry, _store) = testing::registry();
        let a = sample("gone");

        for _ in 0..2 {
            let manager = testing::manager(&registry, false);
            manager.record_deleted(&a).unwrap();
            let report = manager.commit().await.unwrap();
            assert_eq!(report.deleted, vec![a.path()]);
        }
    }

    #[tokio::test]
    async fn test_stage_resurrects_pending_delete() {
        let (registry, _store) = testing::registry();
        let manager = testing::manager(&registry, true);
        let a = sample("k");

        manager.orphan(&a).unwrap();
        assert_eq!(manager.pending_deletes(), vec!["k".to_string()]);

        manager.stage(a.clone(), Bytes::from("again")).unwrap();
        assert!(manager.pending_deletes().is_empty());
        assert_eq!(manager.pending_puts(), vec!["k".to_string()]);

        manager.adopt(&a).unwrap();
        assert_eq!(manager.pending_puts(), vec!["k".to_string()]);
    }

    #[tokio::test]
    async fn test_adopt_cancels_pending_delete() {
        let (registry, store) = testing::registry();
        let manager = testing::manager(&registry, true);
        let a = sample("moved");

        manager.orphan(&a).unwrap();
        manager.adopt(&a).unwrap();
        manager.commit().await.unwrap();
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_open_reads_staged_content() {
        let (registry, store) = testing::registry();
        let manager = testing::manager(&registry, true);

        let a = manager
            .attach(&AttachmentType::attachment(), &b"draft"[..], AttachOptions::new())
            .await
            .unwrap();
        assert_eq!(manager.open(&a).await.unwrap(), Bytes::from("draft"));
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_failed_attach_leaves_manager_unchanged() {
        let (registry, _store) = testing::registry();
        let manager = testing::manager(&registry, true);

        let strict = AttachmentType::attachment().processor(ContentTypeValidator::new(["image/png"]));
        let result = manager
            .attach(&strict, Attachable::named(&b"text"[..], "a.txt"), AttachOptions::new())
            .await;
        assert!(matches!(
            result,
            Err(AttachmentError::Validation(ValidationError::ContentType { .. }))
        ));

        let too_small = manager
            .attach(&AttachmentType::image(), png(1, 1, 100), AttachOptions::new())
            .await;
        assert!(matches!(
            too_small,
            Err(AttachmentError::Validation(ValidationError::MinimumLength { .. }))
        ));

        assert!(manager.pending_puts().is_empty());
        assert_eq!(manager.phase(), ScopePhase::Open);
    }

    #[tokio::test]
    async fn test_suppress_validation() {
        let (registry, _store) = testing::registry();
        let manager = testing::manager(&registry, true);

        let strict = AttachmentType::attachment().processor(ContentTypeValidator::new(["image/png"]));
        let options = AttachOptions {
            suppress_validation: true,
            ..AttachOptions::new()
        };
        assert!(manager.attach(&strict, &b"text"[..], options).await.is_ok());
    }

    #[tokio::test]
    async fn test_config_max_length_caps_type() {
        let (registry, _store) = testing::registry();
        let manager = StoreManager::new(
            registry,
            ManagerOptions {
                delete_orphan: true,
                max_length: Some(4),
            },
        );

        let result = manager
            .attach(&AttachmentType::attachment(), &b"12345"[..], AttachOptions::new())
            .await;
        assert!(matches!(
            result,
            Err(AttachmentError::Validation(ValidationError::MaximumLength { max: 4, length: 5 }))
        ));
    }

    #[tokio::test]
    async fn test_missing_default_store() {
        let registry = Arc::new(StoreRegistry::new());
        let manager = testing::manager(&registry, true);

        let result = manager
            .attach(&AttachmentType::attachment(), &b"x"[..], AttachOptions::new())
            .await;
        assert!(matches!(result, Err(AttachmentError::DefaultStore)));

        let unknown = manager
            .attach(&AttachmentType::attachment(), &b"x"[..], AttachOptions::new().store("s3"))
            .await;
        assert!(matches!(unknown, Err(AttachmentError::UnknownStore(name)) if name == "s3"));
    }

    #[tokio::test]
    async fn test_named_store_is_recorded() {
        let (registry, store) = testing::registry();
        let other = Arc::new(MemoryStore::new());
        registry.register_instance("other", other.clone(), false);
        let manager = testing::manager(&registry, true);

        let a = manager
            .attach(&AttachmentType::attachment(), &b"x"[..], AttachOptions::new().store("other"))
            .await
            .unwrap();
        manager.commit().await.unwrap();

        assert_eq!(a.store_id.as_deref(), Some("other"));
        assert!(other.exists(&a.path()).await.unwrap());
        assert!(store.ops().is_empty());
    }

    #[tokio::test]
    async fn test_partial_commit_reports_progress() {
        let (registry, store) = testing::registry();
        let manager = testing::manager(&registry, true);

        let ok = manager
            .attach(&AttachmentType::file(), Attachable::named(&b"a"[..], "ok.txt"), AttachOptions::new())
            .await
            .unwrap();
        let bad = manager
            .attach(&AttachmentType::file(), Attachable::named(&b"b"[..], "bad.txt"), AttachOptions::new())
            .await
            .unwrap();
        let later = manager
            .attach(&AttachmentType::file(), Attachable::named(&b"c"[..], "later.txt"), AttachOptions::new())
            .await
            .unwrap();
        manager.record_deleted(&sample("old")).unwrap();
        store.fail_on("-bad");

        let err = manager.commit().await.unwrap_err();
        assert!(err.is_partial_commit());
        let AttachmentError::PartialCommit(partial) = err else {
            unreachable!()
        };
        assert_eq!(partial.stored, vec![ok.path()]);
        assert_eq!(partial.failed, bad.path());
        assert_eq!(partial.remaining, vec![later.path(), sample("old").path()]);
        assert!(partial.deleted.is_empty());

        assert_eq!(manager.phase(), ScopePhase::Closed);
        assert!(store.exists(&ok.path()).await.unwrap());
        assert!(!store.exists(&later.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_closed_manager_rejects_operations() {
        let (registry, _store) = testing::registry();
        let manager = testing::manager(&registry, true);
        manager.commit().await.unwrap();

        assert!(matches!(
            manager.stage(sample("late"), Bytes::from("x")),
            Err(AttachmentError::Context(ContextError::Closed))
        ));
        assert!(matches!(
            manager.commit().await,
            Err(AttachmentError::Context(ContextError::Closed))
        ));
        assert!(matches!(
            manager.scope(async {}).await,
            Err(ContextError::Closed)
        ));
    }

    #[tokio::test]
    async fn test_scope_binding() {
        let (registry, _store) = testing::registry();
        assert!(matches!(
            StoreManager::current(),
            Err(ContextError::NoActiveManager)
        ));

        let outer = testing::manager(&registry, true);
        let inner = testing::manager(&registry, true);
        let outer_id = outer.id();

        let nested = outer
            .scope(async {
                assert_eq!(StoreManager::current().unwrap().id(), outer_id);
                inner.scope(async {}).await
            })
            .await
            .unwrap();
        assert!(matches!(nested, Err(ContextError::NestedScope)));

        // sequential scopes are fine
        inner.scope(async {}).await.unwrap();
        outer.scope(async {}).await.unwrap();
        assert!(StoreManager::current().is_err());
    }

    #[tokio::test]
    async fn test_thumbnails_follow_image() {
        let (registry, store) = testing::registry();
        let first = testing::manager(&registry, true);

        let mut image = first
            .attach(&AttachmentType::image().processor(ImageAnalyzer), png(200, 100, 8192), AttachOptions::new())
            .await
            .unwrap();
        let thumb = first
            .attach_thumbnail(&mut image, png(50, 25, 256), AttachOptions::new())
            .await
            .unwrap();
        assert_eq!(thumb.kind, AttachmentKind::Thumbnail);
        assert_eq!(image.thumbnails[0].ratio, 0.25);
        assert_eq!(image.get_thumbnail(Some(50), None, None, 2).unwrap().key, thumb.key);
        first.commit().await.unwrap();

        let second = testing::manager(&registry, true);
        second.orphan(&image).unwrap();
        let report = second.commit().await.unwrap();
        assert_eq!(report.deleted, vec![image.path(), thumb.path()]);
        assert!(!store.exists(&image.path()).await.unwrap());
        assert!(!store.exists(&thumb.path()).await.unwrap());
    }

    #[tokio::test]
    async fn test_thumbnail_requires_image() {
        let (registry, _store) = testing::registry();
        let manager = testing::manager(&registry, true);
        let mut file = sample("f");

        let result = manager
            .attach_thumbnail(&mut file, png(1, 1, 64), AttachOptions::new())
            .await;
        assert!(matches!(result, Err(AttachmentError::InvalidOperation(_))));
    }

    #[derive(Debug, Clone)]
    enum Action {
        Stage(u8),
        Orphan(u8),
        Adopt(u8),
        RecordDeleted(u8),
    }

    fn action() -> impl Strategy<Value = Action> {
        prop_oneof![
            (0u8..6).prop_map(Action::Stage),
            (0u8..6).prop_map(Action::Orphan),
            (0u8..6).prop_map(Action::Adopt),
            (0u8..6).prop_map(Action::RecordDeleted),
        ]
    }

    proptest! {
        #[test]
        fn prop_pending_sets_stay_disjoint(
            actions in proptest::collection::vec(action(), 0..64),
            delete_orphan in any::<bool>(),
        ) {
            let (registry, _store) = testing::registry();
            let manager = testing::manager(&registry, delete_orphan);

            for action in actions {
                match action {
                    Action::Stage(k) => manager.stage(sample(&k.to_string()), Bytes::from("x")).unwrap(),
                    Action::Orphan(k) => manager.orphan(&sample(&k.to_string())).unwrap(),
                    Action::Adopt(k) => manager.adopt(&sample(&k.to_string())).unwrap(),
                    Action::RecordDeleted(k) => manager.record_deleted(&sample(&k.to_string())).unwrap(),
                }

                let puts: HashSet<String> = manager.pending_puts().into_iter().collect();
                let deletes: HashSet<String> = manager.pending_deletes().into_iter().collect();
                prop_assert!(puts.is_disjoint(&deletes));
            }
        }
    }
}
