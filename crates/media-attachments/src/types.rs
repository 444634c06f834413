//! Attachment types
//!
//! An [`AttachmentType`] is the per-field configuration: which kind of
//! record it produces, length limits, and the processors content must pass.

use std::fmt;
use std::sync::Arc;

use media_core::{KB, MB};

use crate::model::AttachmentKind;
use crate::pipeline::Processor;

#[derive(Clone)]
pub struct AttachmentType {
    kind: AttachmentKind,
    max_length: Option<u64>,
    min_length: Option<u64>,
    processors: Vec<Arc<dyn Processor>>,
    auto_coercion: bool,
    reproducible: bool,
}

impl AttachmentType {
    fn with_kind(kind: AttachmentKind) -> Self {
        Self {
            kind,
            max_length: None,
            min_length: None,
            processors: Vec::new(),
            auto_coercion: false,
            reproducible: false,
        }
    }

    /// Generic attachment without limits
    pub fn attachment() -> Self {
        Self::with_kind(AttachmentKind::Attachment)
    }

    /// Up to 2 MB
    pub fn file() -> Self {
        Self::with_kind(AttachmentKind::File)
            .max_length(2 * MB)
            .min_length(0)
    }

    /// Between 4 KB and 2 MB
    pub fn image() -> Self {
        Self::with_kind(AttachmentKind::Image)
            .max_length(2 * MB)
            .min_length(4 * KB)
    }

    pub fn thumbnail() -> Self {
        Self::with_kind(AttachmentKind::Thumbnail)
            .max_length(2 * MB)
            .min_length(0)
    }

    pub fn max_length(mut self, max: u64) -> Self {
        self.max_length = Some(max);
        self
    }

    pub fn min_length(mut self, min: u64) -> Self {
        self.min_length = Some(min);
        self
    }

    pub fn without_limits(mut self) -> Self {
        self.max_length = None;
        self.min_length = None;
        self
    }

    pub fn processor(mut self, processor: impl Processor + 'static) -> Self {
        self.processors.push(Arc::new(processor));
        self
    }

    /// Allow raw sources to be assigned to fields of this type
    pub fn auto_coercion(mut self, enabled: bool) -> Self {
        self.auto_coercion = enabled;
        self
    }

    pub fn reproducible(mut self, enabled: bool) -> Self {
        self.reproducible = enabled;
        self
    }

    pub fn kind(&self) -> AttachmentKind {
        self.kind
    }

    pub fn max(&self) -> Option<u64> {
        self.max_length
    }

    pub fn min(&self) -> Option<u64> {
        self.min_length
    }

    pub fn processors(&self) -> &[Arc<dyn Processor>] {
        &self.processors
    }

    pub fn is_auto_coercion(&self) -> bool {
        self.auto_coercion
    }

    pub fn is_reproducible(&self) -> bool {
        self.reproducible
    }
}

impl fmt::Debug for AttachmentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AttachmentType")
            .field("kind", &self.kind)
            .field("max_length", &self.max_length)
            .field("min_length", &self.min_length)
            .field(
                "processors",
                &self.processors.iter().map(|p| p.name()).collect::<Vec<_>>(),
            )
            .field("auto_coercion", &self.auto_coercion)
            .field("reproducible", &self.reproducible)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{ImageAnalyzer, ImageValidator};

    #[test]
    fn test_presets() {
        let file = AttachmentType::file();
        assert_eq!(file.kind(), AttachmentKind::File);
        assert_eq!(file.max(), Some(2 * MB));
        assert_eq!(file.min(), Some(0));

        let image = AttachmentType::image();
        assert_eq!(image.min(), Some(4 * KB));

        let plain = AttachmentType::attachment();
        assert_eq!(plain.max(), None);
        assert!(!plain.is_auto_coercion());
    }

    #[test]
    fn test_builder_keeps_processor_order() {
        let avatar = AttachmentType::image()
            .processor(ImageAnalyzer)
            .processor(ImageValidator::new().maximum(128, 128))
            .auto_coercion(true);

        let names: Vec<_> = avatar.processors().iter().map(|p| p.name()).collect();
        assert_eq!(names, vec!["image_analyzer", "image_validator"]);
        assert!(avatar.is_auto_coercion());
        assert!(format!("{:?}", avatar).contains("image_validator"));
    }
}
