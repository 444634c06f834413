//! # media-core
//!
//! Foundational pieces shared by the media-attach crates:
//! - Configuration types and loading
//! - Tracing/logging initialisation
//! - Size units used by attachment limits

pub mod config;
pub mod telemetry;
pub mod units;

pub use config::{AttachmentsConfig, ConfigError, LoggingConfig, MediaConfig, StorageConfig};
pub use telemetry::init_tracing;
pub use units::{human_size, KB, MB};
