//! Decoded image containers and responses.

use crate::request::ImageRequest;
use bytes::Bytes;
use image::DynamicImage;
use std::collections::HashMap;
use std::sync::Arc;

/// A decoded image plus the metadata that travelled with it.
///
/// Containers are cheap to clone; the pixel data is reference counted.
/// `is_preview` marks a partially decoded scan produced during progressive
/// decoding; a load emits zero or more previews followed by exactly one
/// non-preview final container.
#[derive(Clone)]
pub struct ImageContainer {
    /// The decoded image.
    pub image: Arc<DynamicImage>,
    /// The original encoded bytes, when the decoder retained them.
    pub data: Option<Bytes>,
    /// The detected image format, when known.
    pub format: Option<image::ImageFormat>,
    /// True for partially decoded progressive scans.
    pub is_preview: bool,
    /// Free-form metadata attached by decoders and processors.
    pub user_info: HashMap<String, String>,
}

impl ImageContainer {
    /// Wraps a decoded image with no extra metadata.
    pub fn new(image: DynamicImage) -> Self {
        Self {
            image: Arc::new(image),
            data: None,
            format: None,
            is_preview: false,
            user_info: HashMap::new(),
        }
    }

    /// Marks this container as a progressive preview.
    pub fn preview(mut self) -> Self {
        self.is_preview = true;
        self
    }

    /// Image width in pixels.
    pub fn width(&self) -> u32 {
        self.image.width()
    }

    /// Image height in pixels.
    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Rough memory cost of this container in bytes, used by the default
    /// memory cache for budgeting.
    pub fn cost(&self) -> usize {
        let pixels = (self.width() as usize) * (self.height() as usize) * 4;
        pixels + self.data.as_ref().map_or(0, |d| d.len())
    }
}

impl std::fmt::Debug for ImageContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageContainer")
            .field("size", &format_args!("{}x{}", self.width(), self.height()))
            .field("format", &self.format)
            .field("is_preview", &self.is_preview)
            .field("data_len", &self.data.as_ref().map(|d| d.len()))
            .finish()
    }
}

/// Which cache tier served a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CacheType {
    /// Served from the in-memory image cache.
    Memory,
    /// Served from the on-disk byte cache.
    Disk,
}

/// The terminal value of an image task.
#[derive(Clone)]
pub struct ImageResponse {
    /// The decoded (and processed) image.
    pub container: ImageContainer,
    /// The request this response answers.
    pub request: ImageRequest,
    /// Transport metadata, when the bytes came from the network.
    pub url_response: Option<crate::loader::UrlResponse>,
    /// The cache tier that served the image, or `None` for a fresh load.
    pub cache_type: Option<CacheType>,
}

impl ImageResponse {
    /// The decoded image.
    pub fn image(&self) -> &DynamicImage {
        &self.container.image
    }
}

impl std::fmt::Debug for ImageResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageResponse")
            .field("container", &self.container)
            .field("cache_type", &self.cache_type)
            .finish()
    }
}
