//! Pipeline configuration.

use crate::cache::{DataCache, DataCachePolicy, ImageCache, InMemoryImageCache};
use crate::decode::DecoderRegistry;
use crate::encode::{DefaultImageEncoder, ImageEncoder};
use crate::loader::{DataLoader, UnconfiguredDataLoader};
use std::sync::Arc;
use std::time::Duration;

/// Everything an [`crate::ImagePipeline`] needs: external collaborators,
/// policy switches, and queue concurrency limits.
///
/// All fields are public so a configuration can be built literally and
/// tweaked in place before constructing the pipeline. The configuration is
/// captured at construction; later mutations have no effect on a running
/// pipeline.
#[derive(Clone)]
pub struct PipelineConfiguration {
    /// Fetches raw bytes for URL-based requests.
    pub data_loader: Arc<dyn DataLoader>,
    /// On-disk byte cache. `None` disables the disk tier entirely.
    pub data_cache: Option<Arc<dyn DataCache>>,
    /// In-memory image cache. `None` disables the memory tier entirely.
    pub image_cache: Option<Arc<dyn ImageCache>>,
    /// Decoder factories, tried in order.
    pub decoders: DecoderRegistry,
    /// Encoder used for disk cache write-backs of processed images.
    pub encoder: Arc<dyn ImageEncoder>,
    /// What the disk cache stores after a successful load.
    pub data_cache_policy: DataCachePolicy,
    /// Decode growing byte prefixes and emit previews.
    pub is_progressive_decoding_enabled: bool,
    /// Write preview containers to the memory cache.
    pub is_storing_previews_in_memory_cache: bool,
    /// Minimum interval between preview decodes. Zero decodes every scan.
    pub progressive_decoding_interval: Duration,
    /// Retain partial downloads and resume them with HTTP range requests.
    pub is_resumable_data_enabled: bool,
    /// Eagerly expand the final image to a display-ready bitmap.
    pub is_decompression_enabled: bool,
    /// Smooth loader fetch starts through a token bucket.
    pub is_rate_limiter_enabled: bool,
    /// Share work between requests with equivalent keys.
    pub is_task_coalescing_enabled: bool,
    /// Concurrent operations on the data loading queue.
    pub data_loading_concurrency: usize,
    /// Concurrent operations on the image decoding queue.
    pub image_decoding_concurrency: usize,
    /// Concurrent operations on the image processing queue.
    pub image_processing_concurrency: usize,
    /// Concurrent operations on the decompression queue.
    pub image_decompressing_concurrency: usize,
    /// Encode disk write-backs synchronously on the publishing task.
    /// Deterministic ordering for tests; keep off in production.
    pub debug_is_sync_image_encoding: bool,
}

impl PipelineConfiguration {
    /// Configuration with the given loader and defaults for everything
    /// else: an in-memory image cache, no disk cache, the default decoder
    /// and PNG encoder, `Automatic` storage policy, progressive decoding
    /// off, resumable data on, decompression on, rate limiting on,
    /// coalescing on.
    pub fn new(data_loader: Arc<dyn DataLoader>) -> Self {
        Self {
            data_loader,
            data_cache: None,
            image_cache: Some(Arc::new(InMemoryImageCache::new())),
            decoders: DecoderRegistry::new(),
            encoder: Arc::new(DefaultImageEncoder::new()),
            data_cache_policy: DataCachePolicy::Automatic,
            is_progressive_decoding_enabled: false,
            is_storing_previews_in_memory_cache: false,
            progressive_decoding_interval: Duration::ZERO,
            is_resumable_data_enabled: true,
            is_decompression_enabled: true,
            is_rate_limiter_enabled: true,
            is_task_coalescing_enabled: true,
            data_loading_concurrency: 6,
            image_decoding_concurrency: 1,
            image_processing_concurrency: 2,
            image_decompressing_concurrency: 2,
            debug_is_sync_image_encoding: false,
        }
    }
}

impl Default for PipelineConfiguration {
    fn default() -> Self {
        Self::new(Arc::new(UnconfiguredDataLoader))
    }
}

impl std::fmt::Debug for PipelineConfiguration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PipelineConfiguration")
            .field("data_cache", &self.data_cache.is_some())
            .field("image_cache", &self.image_cache.is_some())
            .field("data_cache_policy", &self.data_cache_policy)
            .field(
                "is_progressive_decoding_enabled",
                &self.is_progressive_decoding_enabled,
            )
            .field("is_task_coalescing_enabled", &self.is_task_coalescing_enabled)
            .field("data_loading_concurrency", &self.data_loading_concurrency)
            .finish()
    }
}
