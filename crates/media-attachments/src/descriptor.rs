//! Attachable sources and the loaded content descriptor

use std::path::{Path, PathBuf};

use bytes::{Bytes, BytesMut};
use tokio::io::AsyncReadExt;
use tracing::debug;
use url::Url;

use crate::error::{AttachmentError, AttachmentResult, ValidationError};
use crate::model::split_extension;

/// Something content can be attached from
#[derive(Debug, Clone)]
pub enum Attachable {
    /// In-memory content, optionally with the name it was uploaded under
    Bytes {
        data: Bytes,
        filename: Option<String>,
    },
    /// Local file
    Path(PathBuf),
    /// Remote content fetched over HTTP(S)
    Url(Url),
}

impl Attachable {
    pub fn named(data: impl Into<Bytes>, filename: impl Into<String>) -> Self {
        Self::Bytes {
            data: data.into(),
            filename: Some(filename.into()),
        }
    }

    /// Short description used in errors and logs
    pub fn origin(&self) -> String {
        match self {
            Self::Bytes { filename, .. } => filename.clone().unwrap_or_else(|| "<bytes>".to_string()),
            Self::Path(path) => path.display().to_string(),
            Self::Url(url) => url.to_string(),
        }
    }
}

impl From<Bytes> for Attachable {
    fn from(data: Bytes) -> Self {
        Self::Bytes { data, filename: None }
    }
}

impl From<Vec<u8>> for Attachable {
    fn from(data: Vec<u8>) -> Self {
        Bytes::from(data).into()
    }
}

impl From<&'static [u8]> for Attachable {
    fn from(data: &'static [u8]) -> Self {
        Bytes::from_static(data).into()
    }
}

impl From<PathBuf> for Attachable {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for Attachable {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<Url> for Attachable {
    fn from(url: Url) -> Self {
        Self::Url(url)
    }
}

/// `http`/`https` URLs become [`Attachable::Url`], anything else a path
impl From<&str> for Attachable {
    fn from(s: &str) -> Self {
        match Url::parse(s) {
            Ok(url) if matches!(url.scheme(), "http" | "https") => Self::Url(url),
            _ => Self::Path(PathBuf::from(s)),
        }
    }
}

impl From<String> for Attachable {
    fn from(s: String) -> Self {
        Self::from(s.as_str())
    }
}

/// Hints given alongside a source
#[derive(Debug, Clone, Default)]
pub struct DescriptorOptions {
    pub content_type: Option<String>,
    pub original_filename: Option<String>,
    pub extension: Option<String>,
    pub max_length: Option<u64>,
    pub min_length: Option<u64>,
}

/// Fully loaded content plus what is known about it
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    data: Bytes,
    pub content_type: Option<String>,
    pub original_filename: Option<String>,
    pub extension: Option<String>,
    max_length: Option<u64>,
    min_length: Option<u64>,
}

impl StreamDescriptor {
    /// Read `source` and enforce the length limits. Files and URLs stop
    /// reading as soon as `max_length` is exceeded.
    pub async fn load(source: Attachable, options: DescriptorOptions) -> AttachmentResult<Self> {
        let origin = source.origin();
        let (data, filename, detected_type) = match source {
            Attachable::Bytes { data, filename } => (data, filename, None),
            Attachable::Path(path) => {
                let data = read_path(&path, options.max_length).await?;
                let filename = path.file_name().map(|n| n.to_string_lossy().into_owned());
                (data, filename, None)
            }
            Attachable::Url(url) => {
                let (data, content_type) = fetch(&url, options.max_length).await?;
                (data, Some(url.to_string()), content_type)
            }
        };

        let original_filename = options.original_filename.or(filename);
        let content_type = options
            .content_type
            .or(detected_type)
            .or_else(|| original_filename.as_deref().and_then(guess_type))
            .or_else(|| {
                options
                    .extension
                    .as_deref()
                    .and_then(|ext| guess_type(&format!("a{}", ext)))
            });
        let extension = options
            .extension
            .or_else(|| content_type.as_deref().and_then(guess_extension))
            .or_else(|| {
                original_filename
                    .as_deref()
                    .map(|name| split_extension(name).1)
                    .filter(|ext| !ext.is_empty())
                    .map(str::to_string)
            });

        let descriptor = Self {
            data,
            content_type,
            original_filename,
            extension,
            max_length: options.max_length,
            min_length: options.min_length,
        };
        descriptor.check_length()?;

        debug!(
            origin = %origin,
            length = descriptor.len(),
            content_type = ?descriptor.content_type,
            "Attachable loaded"
        );
        Ok(descriptor)
    }

    pub fn data(&self) -> &Bytes {
        &self.data
    }

    pub fn into_data(self) -> Bytes {
        self.data
    }

    pub fn len(&self) -> u64 {
        self.data.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// First `size` bytes, or all of them if shorter
    pub fn header(&self, size: usize) -> &[u8] {
        &self.data[..size.min(self.data.len())]
    }

    /// Swap in transformed content. Length limits are checked again.
    pub fn replace(&mut self, data: Bytes) -> Result<(), ValidationError> {
        self.data = data;
        self.check_length()
    }

    fn check_length(&self) -> Result<(), ValidationError> {
        let length = self.len();
        if let Some(max) = self.max_length {
            if length > max {
                return Err(ValidationError::MaximumLength { max, length });
            }
        }
        if let Some(min) = self.min_length {
            if length < min {
                return Err(ValidationError::MinimumLength { min, length });
            }
        }
        Ok(())
    }
}

fn source_error(origin: impl ToString, err: impl ToString) -> AttachmentError {
    AttachmentError::Source {
        origin: origin.to_string(),
        message: err.to_string(),
    }
}

fn too_long(max: u64, length: u64) -> AttachmentError {
    ValidationError::MaximumLength { max, length }.into()
}

async fn read_path(path: &Path, max_length: Option<u64>) -> AttachmentResult<Bytes> {
    let origin = path.display();
    let mut file = tokio::fs::File::open(path).await.map_err(|e| source_error(&origin, e))?;
    let Some(max) = max_length else {
        let mut data = Vec::new();
        file.read_to_end(&mut data).await.map_err(|e| source_error(&origin, e))?;
        return Ok(Bytes::from(data));
    };

    let size = file.metadata().await.map_err(|e| source_error(&origin, e))?.len();
    if size > max {
        return Err(too_long(max, size));
    }

    // The file may grow after the metadata check
    let mut data = Vec::with_capacity(size as usize);
    file.take(max + 1)
        .read_to_end(&mut data)
        .await
        .map_err(|e| source_error(&origin, e))?;
    if data.len() as u64 > max {
        return Err(too_long(max, data.len() as u64));
    }
    Ok(Bytes::from(data))
}

async fn fetch(url: &Url, max_length: Option<u64>) -> AttachmentResult<(Bytes, Option<String>)> {
    let mut response = reqwest::get(url.clone())
        .await
        .and_then(|r| r.error_for_status())
        .map_err(|e| source_error(url, e))?;
    let content_type = response
        .headers()
        .get(reqwest::header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.split(';').next().unwrap_or(v).trim().to_string());

    if let (Some(max), Some(declared)) = (max_length, response.content_length()) {
        if declared > max {
            return Err(too_long(max, declared));
        }
    }

    let mut data = BytesMut::new();
    while let Some(chunk) = response.chunk().await.map_err(|e| source_error(url, e))? {
        data.extend_from_slice(&chunk);
        if let Some(max) = max_length {
            if data.len() as u64 > max {
                return Err(too_long(max, data.len() as u64));
            }
        }
    }
    Ok((data.freeze(), content_type))
}

/// Content type for a filename
pub fn guess_type(filename: &str) -> Option<String> {
    mime_guess::from_path(filename).first_raw().map(str::to_string)
}

/// Preferred extension (with dot) for a content type
pub fn guess_extension(content_type: &str) -> Option<String> {
    let preferred = match content_type {
        "image/jpeg" => Some(".jpg"),
        "image/png" => Some(".png"),
        "image/gif" => Some(".gif"),
        "image/webp" => Some(".webp"),
        "image/bmp" => Some(".bmp"),
        "text/plain" => Some(".txt"),
        "application/pdf" => Some(".pdf"),
        "application/zip" => Some(".zip"),
        "application/json" => Some(".json"),
        _ => None,
    };
    if let Some(ext) = preferred {
        return Some(ext.to_string());
    }
    mime_guess::get_mime_extensions_str(content_type)
        .and_then(|exts| exts.first())
        .map(|ext| format!(".{}", ext))
}
