//! Cache key derivation.
//!
//! Key strings are stable and byte-exact: deduplication and cache
//! compatibility both depend on them. Do not change the formats.

use crate::request::ImageRequest;
use std::fmt::Write;

/// Key for the **original** (unprocessed) bytes in the disk cache: the URL
/// string, or the publisher identifier for custom sources.
pub fn original_data_key(request: &ImageRequest) -> String {
    request.source().cache_id().to_string()
}

/// Key for **processed** bytes in the disk cache: the original key followed
/// by the thumbnail options suffix (when present) and each processor
/// identifier in order.
pub fn processed_data_key(request: &ImageRequest) -> String {
    let mut key = original_data_key(request);
    if let Some(thumbnail) = request.thumbnail_options() {
        key.push_str(&thumbnail.identifier());
    }
    for processor in request.processor_chain() {
        key.push_str(&processor.identifier());
    }
    key
}

/// Key for a decoded container in the memory cache: the processed key plus
/// the scale override, when one is present.
pub fn image_cache_key(request: &ImageRequest) -> String {
    let mut key = processed_data_key(request);
    if let Some(scale) = request.scale_override() {
        let _ = write!(key, "#scale={scale}");
    }
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::ResizeProcessor;
    use crate::request::ThumbnailOptions;
    use std::sync::Arc;
    use url::Url;

    const URL: &str = "https://example.com/image.jpeg";

    fn request() -> ImageRequest {
        ImageRequest::new(Url::parse(URL).unwrap())
    }

    #[test]
    fn test_original_key_is_the_url() {
        assert_eq!(original_data_key(&request()), URL);
    }

    #[test]
    fn test_original_key_ignores_processors_and_thumbnail() {
        let request = request()
            .processors(vec![Arc::new(ResizeProcessor::fit(10, 10))])
            .thumbnail(ThumbnailOptions::with_max_pixel_size(400));
        assert_eq!(original_data_key(&request), URL);
    }

    #[test]
    fn test_processed_key_appends_processor_identifiers_in_order() {
        let request = request().processors(vec![
            Arc::new(ResizeProcessor::fit(10, 10)),
            Arc::new(ResizeProcessor::fill(5, 5)),
        ]);
        assert_eq!(
            processed_data_key(&request),
            format!("{URL}resize:10x10:fitresize:5x5:fill")
        );
    }

    #[test]
    fn test_processed_key_without_processors_equals_original() {
        assert_eq!(processed_data_key(&request()), original_data_key(&request()));
    }

    #[test]
    fn test_thumbnail_key_suffix() {
        let request = request().thumbnail(ThumbnailOptions::with_max_pixel_size(400));
        assert_eq!(
            processed_data_key(&request),
            format!("{URL}com.github/kean/nuke/thumbnail?maxPixelSize=400,options=truetruetruetrue")
        );
    }

    #[test]
    fn test_image_key_includes_scale() {
        let request = request().scale(2.0);
        assert_eq!(image_cache_key(&request), format!("{URL}#scale=2"));
    }

    #[test]
    fn test_image_key_equals_processed_key_without_scale() {
        let request = request().processors(vec![Arc::new(ResizeProcessor::fit(10, 10))]);
        assert_eq!(image_cache_key(&request), processed_data_key(&request));
    }
}
