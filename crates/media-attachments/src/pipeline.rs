//! Processing pipeline
//!
//! Content passes through an ordered list of processors before it is staged.
//! Analyzers fill in [`AttachmentInfo`], validators reject content, and
//! transforms may replace the bytes.

use std::collections::BTreeSet;

use serde_json::{Map, Value};
use tracing::debug;

use crate::descriptor::StreamDescriptor;
use crate::error::{ProcessError, ValidationError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Analyze,
    Validate,
    Transform,
}

/// What the pipeline learned about the content
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttachmentInfo {
    pub content_type: Option<String>,
    pub extension: Option<String>,
    pub original_filename: Option<String>,
    pub width: Option<u32>,
    pub height: Option<u32>,
    /// Caller-supplied metadata, stored on the attachment
    pub extra: Map<String, Value>,
}

impl AttachmentInfo {
    pub fn from_descriptor(descriptor: &StreamDescriptor) -> Self {
        Self {
            content_type: descriptor.content_type.clone(),
            extension: descriptor.extension.clone(),
            original_filename: descriptor.original_filename.clone(),
            ..Default::default()
        }
    }
}

pub trait Processor: Send + Sync {
    fn name(&self) -> &'static str;

    fn stage(&self) -> Stage {
        Stage::Transform
    }

    fn process(&self, descriptor: &mut StreamDescriptor, info: &mut AttachmentInfo) -> Result<(), ProcessError>;
}

/// Run `processors` in order. Validators are skipped when
/// `suppress_validation` is set.
pub fn run(
    processors: &[std::sync::Arc<dyn Processor>],
    descriptor: &mut StreamDescriptor,
    info: &mut AttachmentInfo,
    suppress_validation: bool,
) -> Result<(), ProcessError> {
    for processor in processors {
        if suppress_validation && processor.stage() == Stage::Validate {
            debug!(processor = processor.name(), "Validation suppressed");
            continue;
        }
        processor.process(descriptor, info)?;
        debug!(processor = processor.name(), content_type = ?info.content_type, "Processor applied");
    }
    Ok(())
}

/// Identifies content from its leading magic bytes
#[derive(Debug, Clone, Copy, Default)]
pub struct MagicAnalyzer;

impl MagicAnalyzer {
    pub fn sniff(header: &[u8]) -> Option<&'static str> {
        if header.starts_with(b"\x89PNG\r\n\x1a\n") {
            Some("image/png")
        } else if header.starts_with(&[0xFF, 0xD8, 0xFF]) {
            Some("image/jpeg")
        } else if header.starts_with(b"GIF87a") || header.starts_with(b"GIF89a") {
            Some("image/gif")
        } else if header.len() >= 12 && &header[..4] == b"RIFF" && &header[8..12] == b"WEBP" {
            Some("image/webp")
        } else if header.starts_with(b"%PDF-") {
            Some("application/pdf")
        } else if header.starts_with(b"PK\x03\x04") {
            Some("application/zip")
        } else if header.starts_with(b"BM") {
            Some("image/bmp")
        } else {
            None
        }
    }
}

impl Processor for MagicAnalyzer {
    fn name(&self) -> &'static str {
        "magic_analyzer"
    }

    fn stage(&self) -> Stage {
        Stage::Analyze
    }

    fn process(&self, descriptor: &mut StreamDescriptor, info: &mut AttachmentInfo) -> Result<(), ProcessError> {
        let content_type = Self::sniff(descriptor.header(16))
            .ok_or_else(|| ProcessError::Analyze("content type is not recognised".to_string()))?;
        info.content_type = Some(content_type.to_string());
        Ok(())
    }
}

/// Reads the content type and dimensions of PNG, GIF and JPEG images
#[derive(Debug, Clone, Copy, Default)]
pub struct ImageAnalyzer;

impl ImageAnalyzer {
    /// `(content_type, width, height)` from the image header
    pub fn inspect(data: &[u8]) -> Option<(&'static str, u32, u32)> {
        match MagicAnalyzer::sniff(data)? {
            "image/png" => png_dimensions(data).map(|(w, h)| ("image/png", w, h)),
            "image/gif" => gif_dimensions(data).map(|(w, h)| ("image/gif", w, h)),
            "image/jpeg" => jpeg_dimensions(data).map(|(w, h)| ("image/jpeg", w, h)),
            _ => None,
        }
    }
}

impl Processor for ImageAnalyzer {
    fn name(&self) -> &'static str {
        "image_analyzer"
    }

    fn stage(&self) -> Stage {
        Stage::Analyze
    }

    fn process(&self, descriptor: &mut StreamDescriptor, info: &mut AttachmentInfo) -> Result<(), ProcessError> {
        let (content_type, width, height) = Self::inspect(descriptor.data())
            .ok_or_else(|| ProcessError::Analyze("cannot read image header".to_string()))?;
        info.content_type = Some(content_type.to_string());
        info.width = Some(width);
        info.height = Some(height);
        Ok(())
    }
}

fn png_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 24 || &data[12..16] != b"IHDR" {
        return None;
    }
    let width = u32::from_be_bytes(data[16..20].try_into().ok()?);
    let height = u32::from_be_bytes(data[20..24].try_into().ok()?);
    Some((width, height))
}

fn gif_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    if data.len() < 10 {
        return None;
    }
    let width = u16::from_le_bytes([data[6], data[7]]);
    let height = u16::from_le_bytes([data[8], data[9]]);
    Some((width.into(), height.into()))
}

fn jpeg_dimensions(data: &[u8]) -> Option<(u32, u32)> {
    let mut i = 2;
    while i + 3 < data.len() {
        if data[i] != 0xFF {
            return None;
        }
        let marker = data[i + 1];
        match marker {
            // fill byte
            0xFF => {
                i += 1;
                continue;
            }
            // standalone markers carry no length
            0x01 | 0xD0..=0xD9 => {
                i += 2;
                continue;
            }
            // start of frame, except DHT, JPG and DAC
            0xC0..=0xCF if !matches!(marker, 0xC4 | 0xC8 | 0xCC) => {
                if i + 9 > data.len() {
                    return None;
                }
                let height = u16::from_be_bytes([data[i + 5], data[i + 6]]);
                let width = u16::from_be_bytes([data[i + 7], data[i + 8]]);
                return Some((width.into(), height.into()));
            }
            _ => {
                let length = u16::from_be_bytes([data[i + 2], data[i + 3]]) as usize;
                i += 2 + length;
            }
        }
    }
    None
}

/// Accepts only the listed content types
#[derive(Debug, Clone)]
pub struct ContentTypeValidator {
    content_types: BTreeSet<String>,
}

impl ContentTypeValidator {
    pub fn new<I, S>(content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            content_types: content_types.into_iter().map(Into::into).collect(),
        }
    }

    fn check(&self, content_type: Option<&str>) -> Result<(), ValidationError> {
        match content_type {
            Some(ct) if self.content_types.contains(ct) => Ok(()),
            found => Err(ValidationError::ContentType {
                found: found.map(str::to_string),
                allowed: self.content_types.iter().cloned().collect(),
            }),
        }
    }
}

impl Processor for ContentTypeValidator {
    fn name(&self) -> &'static str {
        "content_type_validator"
    }

    fn stage(&self) -> Stage {
        Stage::Validate
    }

    fn process(&self, _descriptor: &mut StreamDescriptor, info: &mut AttachmentInfo) -> Result<(), ProcessError> {
        self.check(info.content_type.as_deref()).map_err(Into::into)
    }
}

/// Image size and shape limits. A zero bound is not checked.
#[derive(Debug, Clone, Default)]
pub struct ImageValidator {
    pub min_width: u32,
    pub min_height: u32,
    pub max_width: u32,
    pub max_height: u32,
    pub min_aspect_ratio: Option<f64>,
    pub max_aspect_ratio: Option<f64>,
    pub content_types: Option<ContentTypeValidator>,
}

impl ImageValidator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn minimum(mut self, width: u32, height: u32) -> Self {
        self.min_width = width;
        self.min_height = height;
        self
    }

    pub fn maximum(mut self, width: u32, height: u32) -> Self {
        self.max_width = width;
        self.max_height = height;
        self
    }

    pub fn aspect_ratio(mut self, min: Option<f64>, max: Option<f64>) -> Self {
        self.min_aspect_ratio = min;
        self.max_aspect_ratio = max;
        self
    }

    pub fn content_types<I, S>(mut self, content_types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.content_types = Some(ContentTypeValidator::new(content_types));
        self
    }

    fn check(&self, info: &AttachmentInfo) -> Result<(), ValidationError> {
        if let Some(validator) = &self.content_types {
            validator.check(info.content_type.as_deref())?;
        }

        let (width, height) = match (info.width, info.height) {
            (Some(w), Some(h)) if w > 0 && h > 0 => (w, h),
            _ => {
                return Err(ValidationError::Dimension(
                    "width and height are not found in analyze result".to_string(),
                ))
            }
        };

        let bounds = [
            (self.min_width, width, "Minimum allowed width", self.min_width > width),
            (self.min_height, height, "Minimum allowed height", self.min_height > height),
            (self.max_width, width, "Maximum allowed width", self.max_width < width),
            (self.max_height, height, "Maximum allowed height", self.max_height < height),
        ];
        for (bound, actual, label, violated) in bounds {
            if bound != 0 && violated {
                return Err(ValidationError::Dimension(format!(
                    "{} is: {}, but the {} is given",
                    label, bound, actual
                )));
            }
        }

        let ratio = f64::from(width) / f64::from(height);
        let too_narrow = self.min_aspect_ratio.is_some_and(|min| min > ratio);
        let too_wide = self.max_aspect_ratio.is_some_and(|max| max < ratio);
        if too_narrow || too_wide {
            return Err(ValidationError::AspectRatio(format!(
                "{} / {} = {}, accepted range: {:?} - {:?}",
                width, height, ratio, self.min_aspect_ratio, self.max_aspect_ratio
            )));
        }
        Ok(())
    }
}

impl Processor for ImageValidator {
    fn name(&self) -> &'static str {
        "image_validator"
    }

    fn stage(&self) -> Stage {
        Stage::Validate
    }

    fn process(&self, _descriptor: &mut StreamDescriptor, info: &mut AttachmentInfo) -> Result<(), ProcessError> {
        self.check(info).map_err(Into::into)
    }
}
