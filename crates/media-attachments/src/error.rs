//! Attachment error taxonomy

use media_stores::{RegistryError, StoreError};
use thiserror::Error;

use crate::manager::ScopePhase;

/// Problems with the active store manager binding
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContextError {
    #[error("Not in store manager context")]
    NoActiveManager,
    #[error("A store manager scope is already active in this context")]
    NestedScope,
    #[error("Store manager is already bound to a unit of work")]
    AlreadyBound,
    #[error("Store manager is closed")]
    Closed,
    #[error("Store manager is {0}, expected open")]
    NotOpen(ScopePhase),
}

/// Content rejected by a validator or by the type's length limits
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Content type is not supported: {found:?}, valid options are: {allowed:?}")]
    ContentType {
        found: Option<String>,
        allowed: Vec<String>,
    },
    #[error("Invalid dimension: {0}")]
    Dimension(String),
    #[error("Invalid aspect ratio: {0}")]
    AspectRatio(String),
    #[error("Cannot store files larger than: {max} bytes, got {length}")]
    MaximumLength { max: u64, length: u64 },
    #[error("Cannot store files smaller than: {min} bytes, got {length}")]
    MinimumLength { min: u64, length: u64 },
}

/// Failure raised by a pipeline stage
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ProcessError {
    #[error("Analyze error: {0}")]
    Analyze(String),
    #[error(transparent)]
    Validation(#[from] ValidationError),
}

/// Commit flush stopped midway. Everything in `stored` and `deleted` has
/// already been applied to storage and is not undone.
#[derive(Debug, Error)]
#[error(
    "Storage commit partially applied: failed on {failed} ({} stored, {} deleted, {} not attempted): {source}",
    .stored.len(),
    .deleted.len(),
    .remaining.len()
)]
pub struct PartialCommit {
    pub stored: Vec<String>,
    pub deleted: Vec<String>,
    pub failed: String,
    pub remaining: Vec<String>,
    #[source]
    pub source: StoreError,
}

/// Attachment errors
#[derive(Debug, Error)]
pub enum AttachmentError {
    #[error(transparent)]
    Context(#[from] ContextError),
    #[error("Storage error: {0}")]
    Store(#[from] StoreError),
    #[error("Analyze error: {0}")]
    Analyze(String),
    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),
    #[error("Default store is not defined")]
    DefaultStore,
    #[error("Store is not registered: {0}")]
    UnknownStore(String),
    #[error("Store factory for {name} failed: {source}")]
    StoreFactory {
        name: String,
        #[source]
        source: StoreError,
    },
    #[error("Cannot coerce value: {0}")]
    Coercion(String),
    #[error("Cannot read {origin}: {message}")]
    Source { origin: String, message: String },
    #[error("Thumbnail is not available: {0}")]
    ThumbnailNotAvailable(String),
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
    #[error(transparent)]
    PartialCommit(Box<PartialCommit>),
}

impl AttachmentError {
    /// True when storage may hold a partially applied commit
    pub fn is_partial_commit(&self) -> bool {
        matches!(self, AttachmentError::PartialCommit(_))
    }
}

impl From<ProcessError> for AttachmentError {
    fn from(err: ProcessError) -> Self {
        match err {
            ProcessError::Analyze(message) => AttachmentError::Analyze(message),
            ProcessError::Validation(e) => AttachmentError::Validation(e),
        }
    }
}

impl From<RegistryError> for AttachmentError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::NoDefault => AttachmentError::DefaultStore,
            RegistryError::Unknown(name) => AttachmentError::UnknownStore(name),
            RegistryError::Factory { name, source } => AttachmentError::StoreFactory { name, source },
        }
    }
}

pub type AttachmentResult<T> = Result<T, AttachmentError>;
