//! Public cache facade.
//!
//! Direct read/write access to both cache tiers using the same keys and
//! option gates the pipeline itself applies, so callers can pre-warm,
//! inspect, or invalidate entries without going through a load.

use super::key;
use super::traits::{DataCache, ImageCache};
use crate::container::ImageContainer;
use crate::decode::{DecoderRegistry, DecodingContext};
use crate::encode::ImageEncoder;
use crate::request::ImageRequest;
use bytes::Bytes;
use std::sync::Arc;
use tracing::warn;

/// Which cache tiers an operation touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Caches {
    pub memory: bool,
    pub disk: bool,
}

impl Caches {
    /// Both tiers.
    pub fn all() -> Self {
        Self {
            memory: true,
            disk: true,
        }
    }

    /// Memory tier only.
    pub fn memory() -> Self {
        Self {
            memory: true,
            disk: false,
        }
    }

    /// Disk tier only.
    pub fn disk() -> Self {
        Self {
            memory: false,
            disk: true,
        }
    }
}

/// Facade over the configured cache tiers.
///
/// Obtained from [`crate::ImagePipeline::cache`]. All operations honour the
/// request's option gates; reads against a missing tier simply miss and
/// writes are dropped.
#[derive(Clone)]
pub struct PipelineCache {
    image_cache: Option<Arc<dyn ImageCache>>,
    data_cache: Option<Arc<dyn DataCache>>,
    decoders: DecoderRegistry,
    encoder: Arc<dyn ImageEncoder>,
    store_previews: bool,
}

impl PipelineCache {
    pub(crate) fn new(
        image_cache: Option<Arc<dyn ImageCache>>,
        data_cache: Option<Arc<dyn DataCache>>,
        decoders: DecoderRegistry,
        encoder: Arc<dyn ImageEncoder>,
        store_previews: bool,
    ) -> Self {
        Self {
            image_cache,
            data_cache,
            decoders,
            encoder,
            store_previews,
        }
    }

    /// The memory cache key for a request.
    pub fn make_image_cache_key(&self, request: &ImageRequest) -> String {
        key::image_cache_key(request)
    }

    /// The disk cache key for a request (processed form).
    pub fn make_data_cache_key(&self, request: &ImageRequest) -> String {
        key::processed_data_key(request)
    }

    /// Looks up the decoded image for a request in the selected tiers.
    ///
    /// Memory is consulted first. A disk hit is decoded synchronously
    /// through the decoder registry.
    pub fn cached_image(&self, request: &ImageRequest, caches: Caches) -> Option<ImageContainer> {
        let options = request.request_options();
        if caches.memory && options.memory_reads_allowed() {
            if let Some(cache) = &self.image_cache {
                if let Some(container) = cache.get(&self.make_image_cache_key(request)) {
                    return Some(container);
                }
            }
        }
        if caches.disk && options.disk_reads_allowed() {
            if let Some(data) = self.cached_data(request) {
                return self.decode_cached_data(Bytes::from(data));
            }
        }
        None
    }

    /// Stores a decoded image into the selected tiers.
    ///
    /// Preview containers are only written to memory when the pipeline
    /// stores previews; they are never written to disk.
    pub fn store_cached_image(
        &self,
        container: &ImageContainer,
        request: &ImageRequest,
        caches: Caches,
    ) {
        let options = request.request_options();
        if caches.memory && options.memory_writes_allowed() {
            if !container.is_preview || self.store_previews {
                if let Some(cache) = &self.image_cache {
                    cache.put(&self.make_image_cache_key(request), container.clone());
                }
            }
        }
        if caches.disk && options.disk_writes_allowed() && !container.is_preview {
            match self.encoder.encode(container) {
                Ok(data) => self.store_cached_data(&data, request),
                Err(error) => warn!(%error, "failed to encode image for disk cache"),
            }
        }
    }

    /// Looks up the raw bytes for a request in the disk cache.
    pub fn cached_data(&self, request: &ImageRequest) -> Option<Vec<u8>> {
        if !request.request_options().disk_reads_allowed() {
            return None;
        }
        self.data_cache
            .as_ref()?
            .get(&self.make_data_cache_key(request))
    }

    /// Stores raw bytes for a request in the disk cache.
    pub fn store_cached_data(&self, data: &[u8], request: &ImageRequest) {
        if !request.request_options().disk_writes_allowed() {
            return;
        }
        if let Some(cache) = &self.data_cache {
            cache.put(&self.make_data_cache_key(request), data);
        }
    }

    /// Removes the decoded image for a request from the selected tiers.
    pub fn remove_cached_image(&self, request: &ImageRequest, caches: Caches) {
        if caches.memory {
            if let Some(cache) = &self.image_cache {
                cache.remove(&self.make_image_cache_key(request));
            }
        }
        if caches.disk {
            self.remove_cached_data(request);
        }
    }

    /// Removes the raw bytes for a request from the disk cache.
    pub fn remove_cached_data(&self, request: &ImageRequest) {
        if let Some(cache) = &self.data_cache {
            cache.remove(&self.make_data_cache_key(request));
        }
    }

    /// True when any selected tier holds an entry for the request.
    pub fn contains_cached_image(&self, request: &ImageRequest, caches: Caches) -> bool {
        if caches.memory {
            if let Some(cache) = &self.image_cache {
                if cache.contains(&self.make_image_cache_key(request)) {
                    return true;
                }
            }
        }
        caches.disk && self.contains_cached_data(request)
    }

    /// True when the disk cache holds bytes for the request.
    pub fn contains_cached_data(&self, request: &ImageRequest) -> bool {
        self.data_cache
            .as_ref()
            .is_some_and(|cache| cache.contains(&self.make_data_cache_key(request)))
    }

    /// Clears both tiers.
    pub fn remove_all(&self) {
        if let Some(cache) = &self.image_cache {
            cache.remove_all();
        }
        if let Some(cache) = &self.data_cache {
            cache.remove_all();
        }
    }

    fn decode_cached_data(&self, data: Bytes) -> Option<ImageContainer> {
        let context = DecodingContext {
            data: data.clone(),
            response: None,
            is_completed: true,
        };
        let mut decoder = self.decoders.make_decoder(&context)?;
        match decoder.decode(&data, true) {
            Ok(container) => container,
            Err(error) => {
                warn!(%error, "failed to decode disk-cached image");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{InMemoryDataCache, InMemoryImageCache};
    use crate::encode::DefaultImageEncoder;
    use crate::request::RequestOptions;
    use image::DynamicImage;
    use url::Url;

    fn facade(store_previews: bool) -> (PipelineCache, Arc<InMemoryImageCache>, Arc<InMemoryDataCache>) {
        let image_cache = Arc::new(InMemoryImageCache::new());
        let data_cache = Arc::new(InMemoryDataCache::new());
        let facade = PipelineCache::new(
            Some(image_cache.clone()),
            Some(data_cache.clone()),
            DecoderRegistry::new(),
            Arc::new(DefaultImageEncoder::new()),
            store_previews,
        );
        (facade, image_cache, data_cache)
    }

    fn request() -> ImageRequest {
        ImageRequest::new(Url::parse("https://example.com/cat.png").unwrap())
    }

    fn container() -> ImageContainer {
        ImageContainer::new(DynamicImage::ImageRgba8(image::RgbaImage::new(6, 6)))
    }

    #[test]
    fn test_store_and_lookup_memory() {
        let (facade, _, _) = facade(false);
        facade.store_cached_image(&container(), &request(), Caches::memory());

        let hit = facade.cached_image(&request(), Caches::memory()).unwrap();
        assert_eq!(hit.width(), 6);
        assert!(facade.contains_cached_image(&request(), Caches::memory()));
    }

    #[test]
    fn test_disk_hit_is_decoded() {
        let (facade, _, _) = facade(false);
        facade.store_cached_image(&container(), &request(), Caches::disk());

        assert!(facade.contains_cached_data(&request()));
        let hit = facade.cached_image(&request(), Caches::disk()).unwrap();
        assert_eq!((hit.width(), hit.height()), (6, 6));
    }

    #[test]
    fn test_previews_not_stored_by_default() {
        let (facade, image_cache, data_cache) = facade(false);
        facade.store_cached_image(&container().preview(), &request(), Caches::all());

        assert_eq!(image_cache.entry_count(), 0);
        assert_eq!(data_cache.entry_count(), 0);
    }

    #[test]
    fn test_previews_stored_in_memory_when_enabled() {
        let (facade, image_cache, data_cache) = facade(true);
        facade.store_cached_image(&container().preview(), &request(), Caches::all());

        assert_eq!(image_cache.entry_count(), 1);
        // Previews never reach the disk tier.
        assert_eq!(data_cache.entry_count(), 0);
    }

    #[test]
    fn test_option_gates_suppress_reads() {
        let (facade, _, _) = facade(false);
        facade.store_cached_image(&container(), &request(), Caches::all());

        let gated = request().options(RequestOptions {
            reload_ignoring_cached_data: true,
            ..Default::default()
        });
        assert!(facade.cached_image(&gated, Caches::all()).is_none());
        assert!(facade.cached_data(&gated).is_none());
    }

    #[test]
    fn test_option_gates_suppress_writes() {
        let (facade, image_cache, data_cache) = facade(false);
        let gated = request().options(RequestOptions {
            disable_memory_cache_writes: true,
            disable_disk_cache_writes: true,
            ..Default::default()
        });
        facade.store_cached_image(&container(), &gated, Caches::all());

        assert_eq!(image_cache.entry_count(), 0);
        assert_eq!(data_cache.entry_count(), 0);
    }

    #[test]
    fn test_remove_all_clears_both_tiers() {
        let (facade, image_cache, data_cache) = facade(false);
        facade.store_cached_image(&container(), &request(), Caches::all());
        assert!(image_cache.entry_count() > 0);
        assert!(data_cache.entry_count() > 0);

        facade.remove_all();
        assert_eq!(image_cache.entry_count(), 0);
        assert_eq!(data_cache.entry_count(), 0);
    }

    #[test]
    fn test_data_round_trip() {
        let (facade, _, _) = facade(false);
        facade.store_cached_data(b"raw-bytes", &request());
        assert_eq!(facade.cached_data(&request()).as_deref(), Some(&b"raw-bytes"[..]));

        facade.remove_cached_data(&request());
        assert!(facade.cached_data(&request()).is_none());
    }
}
