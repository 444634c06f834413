//! # media-stores
//!
//! Storage backends for attached files.
//!
//! ## Features
//!
//! - [`Store`] capability trait (`put`, `delete`, `open`, `locate`)
//! - [`MemoryStore`] for tests and embedding
//! - [`FileSystemStore`] with atomic temp-file + rename writes
//! - [`StoreRegistry`], the process-wide name -> factory table
//!
//! ## Example
//!
//! ```rust,ignore
//! use media_stores::{FileSystemStore, StoreRegistry};
//! use std::sync::Arc;
//!
//! StoreRegistry::global().register_instance(
//!     "fs",
//!     Arc::new(FileSystemStore::new("/srv/media", "https://cdn.example.com/media")),
//!     true,
//! );
//! ```

pub mod error;
pub mod filesystem;
pub mod memory;
pub mod registry;
pub mod store;

pub use error::{StoreError, StoreResult};
pub use filesystem::FileSystemStore;
pub use memory::MemoryStore;
pub use registry::{RegistryError, StoreFactory, StoreRegistry};
pub use store::{content_digest, validate_key, Store, StoredObject};
