//! Image processors.
//!
//! Processors transform decoded containers after decoding, forming an
//! ordered chain per request. Each processor carries a stable identifier
//! that participates in cache keys, so two processors with the same
//! identifier must be interchangeable.

use crate::container::ImageContainer;
use crate::error::BoxError;
use image::imageops::FilterType;
use std::sync::Arc;

/// Context passed to processors.
#[derive(Debug, Clone, Copy)]
pub struct ProcessingContext {
    /// False while processing a progressive preview; failures on previews
    /// are silently dropped, failures on the final fail the task.
    pub is_final: bool,
}

/// Transforms a decoded image container.
///
/// `Ok(None)` and `Err` both drop a preview; on the final container they
/// fail the task with [`crate::PipelineError::ProcessingFailed`], which
/// carries the underlying error.
pub trait ImageProcessor: Send + Sync + 'static {
    /// Stable identifier used in cache keys.
    fn identifier(&self) -> String;

    /// Applies the transformation.
    fn process(
        &self,
        container: ImageContainer,
        context: &ProcessingContext,
    ) -> Result<Option<ImageContainer>, BoxError>;
}

/// How [`ResizeProcessor`] maps the source into the target box.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResizeMode {
    /// Scale to fit entirely within the target, preserving aspect ratio.
    AspectFit,
    /// Scale to fill the target, cropping overflow.
    AspectFill,
}

/// Built-in resize processor.
#[derive(Debug, Clone)]
pub struct ResizeProcessor {
    width: u32,
    height: u32,
    mode: ResizeMode,
}

impl ResizeProcessor {
    /// Resize to fit within `width`×`height`.
    pub fn fit(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            mode: ResizeMode::AspectFit,
        }
    }

    /// Resize to fill `width`×`height`, cropping overflow.
    pub fn fill(width: u32, height: u32) -> Self {
        Self {
            width,
            height,
            mode: ResizeMode::AspectFill,
        }
    }
}

impl ImageProcessor for ResizeProcessor {
    fn identifier(&self) -> String {
        let mode = match self.mode {
            ResizeMode::AspectFit => "fit",
            ResizeMode::AspectFill => "fill",
        };
        format!("resize:{}x{}:{mode}", self.width, self.height)
    }

    fn process(
        &self,
        container: ImageContainer,
        _context: &ProcessingContext,
    ) -> Result<Option<ImageContainer>, BoxError> {
        let image = match self.mode {
            ResizeMode::AspectFit => {
                container
                    .image
                    .resize(self.width, self.height, FilterType::Triangle)
            }
            ResizeMode::AspectFill => {
                container
                    .image
                    .resize_to_fill(self.width, self.height, FilterType::Triangle)
            }
        };
        Ok(Some(ImageContainer {
            image: Arc::new(image),
            data: None,
            format: container.format,
            is_preview: container.is_preview,
            user_info: container.user_info,
        }))
    }
}
