//! # media-attachments
//!
//! File attachments bound to database records, stored through pluggable
//! [`media_stores::Store`] backends and committed together with the
//! enclosing unit of work.
//!
//! ## Flow
//!
//! 1. Open a [`StoreManager`] and bind it to a unit of work with
//!    [`TransactionScope::begin`].
//! 2. [`StoreManager::attach`] loads content, runs the type's pipeline and
//!    stages the bytes in memory.
//! 3. Field changes go through [`on_attachment_changed`] or the tracked
//!    containers, which orphan and adopt attachments.
//! 4. [`TransactionScope::commit`] commits the unit of work, then writes
//!    staged content and deletes orphans. A rollback writes nothing.
//!
//! ## Example
//!
//! ```rust,ignore
//! use media_attachments::{AttachOptions, AttachmentType, NoopUnitOfWork, StoreManager, TransactionScope};
//!
//! let manager = StoreManager::from_config(&config.attachments);
//! let tx = TransactionScope::begin(manager.clone(), NoopUnitOfWork)?;
//! let avatar = manager
//!     .attach(&AttachmentType::image(), "/tmp/avatar.png", AttachOptions::new())
//!     .await?;
//! tx.commit().await?;
//! println!("{}", manager.locate(&avatar)?);
//! ```

pub mod descriptor;
pub mod error;
pub mod manager;
pub mod model;
pub mod pipeline;
pub mod tracking;
pub mod transaction;
pub mod types;

#[cfg(test)]
mod testing;

pub use descriptor::{Attachable, DescriptorOptions, StreamDescriptor};
pub use error::{AttachmentError, AttachmentResult, ContextError, PartialCommit, ProcessError, ValidationError};
pub use manager::{AttachOptions, CommitReport, ManagerOptions, ScopePhase, StoreManager};
pub use model::{Attachment, AttachmentKind, ThumbnailRef};
pub use pipeline::{
    AttachmentInfo, ContentTypeValidator, ImageAnalyzer, ImageValidator, MagicAnalyzer, Processor, Stage,
};
pub use tracking::{
    on_attachment_changed, on_record_deleted, Assignment, AttachmentField, AttachmentList, AttachmentMap,
    AttachmentValue, ChangeSet,
};
pub use transaction::{NoopUnitOfWork, TransactionError, TransactionScope, UnitOfWork};
pub use types::AttachmentType;
