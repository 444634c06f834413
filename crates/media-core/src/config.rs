//! Configuration types and loading
//!
//! Values come from three layers, lowest precedence first: built-in defaults,
//! an optional TOML file, and `MEDIA__`-prefixed environment variables
//! (`MEDIA__STORAGE__ROOT_PATH`, `MEDIA__ATTACHMENTS__DELETE_ORPHAN`, ...).

use std::path::Path;

use serde::{Deserialize, Serialize};

/// Main application configuration
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(default)]
pub struct MediaConfig {
    /// Store configuration
    pub storage: StorageConfig,

    /// Attachment lifecycle configuration
    pub attachments: AttachmentsConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Name the filesystem store is registered under
    pub store_name: String,
    /// Directory holding stored files
    pub root_path: String,
    /// Public URL prefix used by `locate`
    pub base_url: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            store_name: "fs".to_string(),
            root_path: "./media".to_string(),
            base_url: "http://localhost:8080/media".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct AttachmentsConfig {
    /// Delete attachments that lose their last reference on commit
    pub delete_orphan: bool,
    /// Upper bound applied on top of per-type limits, in bytes
    pub max_length: Option<u64>,
}

impl Default for AttachmentsConfig {
    fn default() -> Self {
        Self {
            delete_orphan: true,
            max_length: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive, overridden by `RUST_LOG`
    pub filter: String,
    /// Emit JSON lines instead of human-readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: "info,media_attachments=debug,media_stores=debug".to_string(),
            json: false,
        }
    }
}

/// Configuration error
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Environment variable not set: {0}")]
    MissingEnvVar(String),
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },
    #[error("Config file error: {0}")]
    FileError(String),
    #[error("Config source error: {0}")]
    Source(#[from] config::ConfigError),
}

impl MediaConfig {
    /// Load layered configuration: defaults, then `path` (if it exists), then
    /// `MEDIA__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Some(path) = path {
            if !path.exists() {
                return Err(ConfigError::FileError(format!(
                    "{} does not exist",
                    path.display()
                )));
            }
            builder = builder.add_source(config::File::from(path));
        }

        let settings = builder
            .add_source(
                config::Environment::with_prefix("MEDIA")
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(settings.try_deserialize()?)
    }

    /// Load configuration from flat environment variables
    /// (`MEDIA_ROOT_PATH`, `MEDIA_BASE_URL`, ...), reading `.env` first.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let mut config = Self::default();

        if let Ok(name) = std::env::var("MEDIA_STORE_NAME") {
            config.storage.store_name = name;
        }
        if let Ok(path) = std::env::var("MEDIA_ROOT_PATH") {
            config.storage.root_path = path;
        }
        if let Ok(url) = std::env::var("MEDIA_BASE_URL") {
            config.storage.base_url = url;
        }

        if let Ok(v) = std::env::var("MEDIA_DELETE_ORPHAN") {
            config.attachments.delete_orphan = parse_bool(&v);
        }
        if let Ok(v) = std::env::var("MEDIA_MAX_LENGTH") {
            let max = v.parse::<u64>().map_err(|e| ConfigError::InvalidValue {
                key: "MEDIA_MAX_LENGTH".to_string(),
                message: e.to_string(),
            })?;
            config.attachments.max_length = Some(max);
        }

        if let Ok(filter) = std::env::var("MEDIA_LOG") {
            config.logging.filter = filter;
        }
        if let Ok(v) = std::env::var("MEDIA_LOG_JSON") {
            config.logging.json = parse_bool(&v);
        }

        Ok(config)
    }
}

fn parse_bool(v: &str) -> bool {
    matches!(v, "true" | "1" | "yes")
}
