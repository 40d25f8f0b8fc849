//! Pipeline stage bodies.
//!
//! Each stage runs as the body of a coalesced job: the data fetch executes
//! as a single operation on the data loading queue, while the decode,
//! processing, and root stages run as event-loop tasks that submit their
//! CPU work to the decoding, processing, and decompression queues.

pub(crate) mod decode_image;
pub(crate) mod fetch_data;
pub(crate) mod load_image;
pub(crate) mod process_image;

use crate::container::ImageContainer;
use crate::loader::UrlResponse;
use bytes::Bytes;
use image::DynamicImage;
use std::sync::Arc;

/// Output of the original-data stage.
#[derive(Clone)]
pub(crate) struct LoadedData {
    /// The downloaded (or disk-cached) bytes.
    pub data: Bytes,
    /// Transport metadata, when the bytes came from the loader.
    pub response: Option<UrlResponse>,
}

/// Eagerly expands the container's image into a display-ready RGBA bitmap.
///
/// Runs on the decompression queue so the expansion cost is bounded and
/// never paid on a consumer's thread at render time.
pub(crate) fn decompress(container: ImageContainer) -> ImageContainer {
    if matches!(*container.image, DynamicImage::ImageRgba8(_)) {
        return container;
    }
    let rgba = container.image.to_rgba8();
    ImageContainer {
        image: Arc::new(DynamicImage::ImageRgba8(rgba)),
        ..container
    }
}
