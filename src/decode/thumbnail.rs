//! Thumbnail generation.
//!
//! Thumbnails are produced on the decoding queue directly from the decoded
//! original, so the full-size bitmap never reaches the processing or
//! decompression stages.

use crate::container::ImageContainer;
use crate::request::{ThumbnailContentMode, ThumbnailOptions, ThumbnailSize};
use image::imageops::FilterType;
use image::DynamicImage;
use std::sync::Arc;
use tracing::debug;

/// Downscales a decoded container per the thumbnail options.
///
/// Never upscales: a source that already fits the target is returned
/// unchanged.
pub(crate) fn make_thumbnail(container: ImageContainer, options: &ThumbnailOptions) -> ImageContainer {
    let (width, height) = (container.width(), container.height());
    let resized: Option<DynamicImage> = match options.size {
        ThumbnailSize::MaxPixelSize(max) => {
            if width.max(height) <= max {
                None
            } else {
                Some(container.image.resize(max, max, FilterType::Triangle))
            }
        }
        ThumbnailSize::Flexible {
            width: target_width,
            height: target_height,
            content_mode,
        } => {
            if width <= target_width && height <= target_height {
                None
            } else {
                Some(match content_mode {
                    ThumbnailContentMode::AspectFit => {
                        container
                            .image
                            .resize(target_width, target_height, FilterType::Triangle)
                    }
                    ThumbnailContentMode::AspectFill => container.image.resize_to_fill(
                        target_width,
                        target_height,
                        FilterType::Triangle,
                    ),
                })
            }
        }
    };

    match resized {
        Some(image) => {
            debug!(
                from = format_args!("{}x{}", width, height),
                to = format_args!("{}x{}", image.width(), image.height()),
                "generated thumbnail"
            );
            ImageContainer {
                image: Arc::new(image),
                data: None,
                format: container.format,
                is_preview: container.is_preview,
                user_info: container.user_info,
            }
        }
        None => container,
    }
}
