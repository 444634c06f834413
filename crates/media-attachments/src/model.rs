//! Attachment Model
//!
//! The serializable record persisted alongside the owning row. Field names are
//! part of the stored format and must not change.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::{AttachmentError, AttachmentResult};

/// Decides the store directory and filename prefix of an attachment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    #[default]
    Attachment,
    File,
    Image,
    Thumbnail,
}

impl AttachmentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Attachment => "attachment",
            Self::File => "file",
            Self::Image => "image",
            Self::Thumbnail => "thumbnail",
        }
    }

    /// Store directory
    pub fn directory(&self) -> &'static str {
        match self {
            Self::Attachment => "attachments",
            Self::File => "files",
            Self::Image => "images",
            Self::Thumbnail => "thumbnails",
        }
    }

    /// Filename prefix
    pub fn prefix(&self) -> &'static str {
        self.as_str()
    }
}

impl std::fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A thumbnail recorded on an image attachment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThumbnailRef {
    pub width: u32,
    pub height: u32,
    /// Thumbnail width divided by the original width
    pub ratio: f64,
    pub thumbnail: Attachment,
}

/// An attachment record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Unique key (UUID v4)
    pub key: String,
    #[serde(default)]
    pub kind: AttachmentKind,
    /// MIME content type
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_filename: Option<String>,
    /// Extension with its leading dot, e.g. `.png`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extension: Option<String>,
    /// Content length in bytes
    #[serde(default)]
    pub length: u64,
    pub timestamp: DateTime<Utc>,
    /// Store the content lives in, resolved at creation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub store_id: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub reproducible: bool,
    /// Hex SHA-256 of the content
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub digest: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub thumbnails: Vec<ThumbnailRef>,
    /// Free-form metadata such as `width` and `height`
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// URL scheme prefix removed from suffixes
static SCHEME: Lazy<Regex> = Lazy::new(|| Regex::new(r"\w+://").unwrap());

/// Runs of characters that are replaced by `_` in suffixes
static SEPARATORS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[/:.?]+").unwrap());

impl Attachment {
    /// Fresh record with a new key and the current timestamp
    pub fn new(kind: AttachmentKind) -> Self {
        Self {
            key: Uuid::new_v4().to_string(),
            kind,
            content_type: None,
            original_filename: None,
            extension: None,
            length: 0,
            timestamp: Utc::now(),
            store_id: None,
            reproducible: false,
            digest: None,
            thumbnails: Vec::new(),
            extra: Map::new(),
        }
    }

    /// Store-relative path: `{directory}/{filename}`
    pub fn path(&self) -> String {
        format!("{}/{}", self.kind.directory(), self.filename())
    }

    /// `{prefix}-{key}{suffix}{extension}`
    pub fn filename(&self) -> String {
        format!(
            "{}-{}{}{}",
            self.kind.prefix(),
            self.key,
            self.suffix(),
            self.extension.as_deref().unwrap_or("")
        )
    }

    /// `-` plus the sanitized stem of the original filename, or empty
    pub fn suffix(&self) -> String {
        match self.original_filename.as_deref() {
            Some(name) if !name.is_empty() => {
                let (stem, _) = split_extension(name);
                let without_scheme = SCHEME.replace_all(stem, "");
                format!("-{}", SEPARATORS.replace_all(&without_scheme, "_"))
            }
            _ => String::new(),
        }
    }

    /// Timestamp as `<unix-seconds>.<micros>`, used for cache busting
    pub fn timestamp_param(&self) -> String {
        format!(
            "{}.{:06}",
            self.timestamp.timestamp(),
            self.timestamp.timestamp_subsec_micros()
        )
    }

    /// Append the cache-busting timestamp to a store URL
    pub fn locate_with(&self, store_url: &str) -> String {
        format!("{}?_ts={}", store_url, self.timestamp_param())
    }

    pub fn width(&self) -> Option<u32> {
        self.extra_u32("width")
    }

    pub fn height(&self) -> Option<u32> {
        self.extra_u32("height")
    }

    fn extra_u32(&self, name: &str) -> Option<u32> {
        self.extra
            .get(name)
            .and_then(Value::as_u64)
            .and_then(|v| u32::try_from(v).ok())
    }

    /// Find a recorded thumbnail matching any of the criteria. `ratio` is
    /// compared after rounding to `ratio_precision` decimal digits.
    pub fn get_thumbnail(
        &self,
        width: Option<u32>,
        height: Option<u32>,
        ratio: Option<f64>,
        ratio_precision: i32,
    ) -> AttachmentResult<&Attachment> {
        let ratio = ratio.map(|r| round_to(r, ratio_precision));
        self.thumbnails
            .iter()
            .find(|t| {
                width == Some(t.width)
                    || height == Some(t.height)
                    || ratio == Some(round_to(t.ratio, ratio_precision))
            })
            .map(|t| &t.thumbnail)
            .ok_or_else(|| {
                AttachmentError::ThumbnailNotAvailable(format!(
                    "width={:?} height={:?} ratio={:?}",
                    width, height, ratio
                ))
            })
    }

    /// This attachment followed by its thumbnails
    pub fn with_dependents(&self) -> impl Iterator<Item = &Attachment> {
        std::iter::once(self).chain(self.thumbnails.iter().map(|t| &t.thumbnail))
    }
}

pub(crate) fn round_to(value: f64, precision: i32) -> f64 {
    let factor = 10f64.powi(precision);
    (value * factor).round() / factor
}

/// Split `name` into stem and extension (with dot). Leading dots of the last
/// path segment never start an extension.
pub(crate) fn split_extension(name: &str) -> (&str, &str) {
    let base_start = name.rfind('/').map(|i| i + 1).unwrap_or(0);
    let base = &name[base_start..];
    let leading_dots = base.len() - base.trim_start_matches('.').len();
    match base.rfind('.') {
        Some(dot) if dot > leading_dots => {
            let split = base_start + dot;
            (&name[..split], &name[split..])
        }
        _ => (name, ""),
    }
}
