//! Image request model.
//!
//! An [`ImageRequest`] is an immutable description of an image to load: the
//! data source, an ordered processor chain, a scheduling priority, cache
//! policy options, and optional thumbnail/scale hints. Requests are cheap to
//! clone; processors and custom data publishers are reference counted.

use crate::error::BoxError;
use crate::process::ImageProcessor;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// Priority level for task scheduling.
///
/// Work queues dispatch higher priorities first. A coalesced job runs at the
/// maximum priority over all of its subscribers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum TaskPriority {
    VeryLow,
    Low,
    #[default]
    Normal,
    High,
    VeryHigh,
}

/// Per-request cache and scheduling gates.
///
/// All gates default to off. Reads and writes honour the corresponding
/// gates uniformly across the memory and disk tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct RequestOptions {
    /// Skip memory cache lookups.
    pub disable_memory_cache_reads: bool,
    /// Skip memory cache write-backs.
    pub disable_memory_cache_writes: bool,
    /// Skip disk cache lookups.
    pub disable_disk_cache_reads: bool,
    /// Skip disk cache write-backs.
    pub disable_disk_cache_writes: bool,
    /// Suppress every cache read and always hit the loader.
    pub reload_ignoring_cached_data: bool,
    /// Fail with `DataMissingInCache` instead of loading on a cache miss.
    pub return_cache_data_dont_load: bool,
    /// Skip the decompression stage for this request.
    pub skip_decompression: bool,
    /// Bypass the data loading queue (and the rate limiter) entirely.
    pub skip_data_loading_queue: bool,
}

impl RequestOptions {
    /// True when memory cache lookups are permitted.
    pub(crate) fn memory_reads_allowed(&self) -> bool {
        !self.disable_memory_cache_reads && !self.reload_ignoring_cached_data
    }

    /// True when memory cache write-backs are permitted.
    pub(crate) fn memory_writes_allowed(&self) -> bool {
        !self.disable_memory_cache_writes
    }

    /// True when disk cache lookups are permitted.
    pub(crate) fn disk_reads_allowed(&self) -> bool {
        !self.disable_disk_cache_reads && !self.reload_ignoring_cached_data
    }

    /// True when disk cache write-backs are permitted.
    pub(crate) fn disk_writes_allowed(&self) -> bool {
        !self.disable_disk_cache_writes
    }

    /// Options relevant to coalescing the original data fetch.
    pub(crate) fn data_stage_mask(&self) -> u16 {
        let mut mask = 0;
        if self.disable_disk_cache_reads {
            mask |= 1 << 0;
        }
        if self.disable_disk_cache_writes {
            mask |= 1 << 1;
        }
        if self.reload_ignoring_cached_data {
            mask |= 1 << 2;
        }
        if self.return_cache_data_dont_load {
            mask |= 1 << 3;
        }
        if self.skip_data_loading_queue {
            mask |= 1 << 4;
        }
        mask
    }

    /// Options relevant to coalescing decode, processing, and root stages.
    pub(crate) fn image_stage_mask(&self) -> u16 {
        let mut mask = self.data_stage_mask();
        if self.disable_memory_cache_reads {
            mask |= 1 << 5;
        }
        if self.disable_memory_cache_writes {
            mask |= 1 << 6;
        }
        if self.skip_decompression {
            mask |= 1 << 7;
        }
        mask
    }
}

/// How a flexible-size thumbnail maps the source into the target box.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThumbnailContentMode {
    /// Scale to fit entirely within the target size.
    AspectFit,
    /// Scale to fill the target size, cropping overflow.
    AspectFill,
}

impl ThumbnailContentMode {
    fn key_fragment(&self) -> &'static str {
        match self {
            Self::AspectFit => ".aspectFit",
            Self::AspectFill => ".aspectFill",
        }
    }
}

/// Target size for thumbnail generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ThumbnailSize {
    /// Fit the longest side within the given pixel count.
    MaxPixelSize(u32),
    /// Fit or fill an explicit width/height box.
    Flexible {
        width: u32,
        height: u32,
        content_mode: ThumbnailContentMode,
    },
}

/// Options for generating a thumbnail during decoding.
///
/// Thumbnails are produced on the decoding queue and skip the
/// decompression stage. The cache key suffix produced by [`Self::identifier`]
/// is stable and byte-exact; changing it would orphan previously cached
/// entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThumbnailOptions {
    /// Requested target size.
    pub size: ThumbnailSize,
    /// Generate from the full image even when an embedded thumbnail exists.
    pub create_thumbnail_from_image_always: bool,
    /// Generate from the full image when no embedded thumbnail exists.
    pub create_thumbnail_from_image_if_absent: bool,
    /// Apply source orientation while generating.
    pub create_thumbnail_with_transform: bool,
    /// Eagerly decode the generated thumbnail.
    pub should_cache_immediately: bool,
}

impl ThumbnailOptions {
    /// Creates options targeting a maximum pixel size for the longest side.
    pub fn with_max_pixel_size(size: u32) -> Self {
        Self {
            size: ThumbnailSize::MaxPixelSize(size),
            create_thumbnail_from_image_always: true,
            create_thumbnail_from_image_if_absent: true,
            create_thumbnail_with_transform: true,
            should_cache_immediately: true,
        }
    }

    /// Creates options targeting an explicit width/height box.
    pub fn with_size(width: u32, height: u32, content_mode: ThumbnailContentMode) -> Self {
        Self {
            size: ThumbnailSize::Flexible {
                width,
                height,
                content_mode,
            },
            create_thumbnail_from_image_always: true,
            create_thumbnail_from_image_if_absent: true,
            create_thumbnail_with_transform: true,
            should_cache_immediately: true,
        }
    }

    /// Stable cache key suffix for this set of options.
    pub fn identifier(&self) -> String {
        let size = match self.size {
            ThumbnailSize::MaxPixelSize(d) => format!("maxPixelSize={d},"),
            ThumbnailSize::Flexible {
                width,
                height,
                content_mode,
            } => format!(
                "width={width},height={height},contentMode={},",
                content_mode.key_fragment()
            ),
        };
        format!(
            "com.github/kean/nuke/thumbnail?{size}options={}{}{}{}",
            self.create_thumbnail_from_image_always,
            self.create_thumbnail_from_image_if_absent,
            self.create_thumbnail_with_transform,
            self.should_cache_immediately,
        )
    }
}

/// A URL request with additional transport hints.
#[derive(Debug, Clone)]
pub struct UrlRequest {
    /// The resource URL.
    pub url: Url,
    /// Extra headers sent with the request.
    pub headers: Vec<(String, String)>,
    /// Optional per-request timeout, forwarded to the data loader.
    pub timeout: Option<Duration>,
}

impl UrlRequest {
    /// Creates a request for the given URL with no extra headers.
    pub fn new(url: Url) -> Self {
        Self {
            url,
            headers: Vec::new(),
            timeout: None,
        }
    }
}

/// A user-supplied data source: an opaque identifier plus a byte stream
/// factory.
///
/// Covers both one-shot producers (see [`DataPublisher::from_bytes`] and
/// [`DataPublisher::from_future`]) and reactive publishers that emit data in
/// chunks, enabling progressive decoding of custom sources.
#[derive(Clone)]
pub struct DataPublisher {
    id: String,
    make_stream: Arc<dyn Fn() -> BoxStream<'static, Result<Bytes, BoxError>> + Send + Sync>,
}

impl DataPublisher {
    /// Creates a publisher from a stream factory.
    ///
    /// The factory is invoked once per (non-coalesced) load.
    pub fn new<F>(id: impl Into<String>, make_stream: F) -> Self
    where
        F: Fn() -> BoxStream<'static, Result<Bytes, BoxError>> + Send + Sync + 'static,
    {
        Self {
            id: id.into(),
            make_stream: Arc::new(make_stream),
        }
    }

    /// Creates a publisher that yields a fixed byte buffer.
    pub fn from_bytes(id: impl Into<String>, data: Bytes) -> Self {
        Self::new(id, move || {
            futures::stream::once(futures::future::ready(Ok(data.clone()))).boxed()
        })
    }

    /// Creates a publisher backed by a one-shot future.
    pub fn from_future<F, Fut>(id: impl Into<String>, make_future: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: std::future::Future<Output = Result<Bytes, BoxError>> + Send + 'static,
    {
        Self::new(id, move || {
            futures::stream::once(make_future()).boxed()
        })
    }

    /// The opaque identifier used for cache keying.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Opens a fresh byte stream.
    pub(crate) fn open(&self) -> BoxStream<'static, Result<Bytes, BoxError>> {
        (self.make_stream)()
    }
}

impl std::fmt::Debug for DataPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataPublisher").field("id", &self.id).finish()
    }
}

/// Where the image bytes come from.
#[derive(Debug, Clone)]
pub enum ImageSource {
    /// A plain URL, loaded through the configured data loader.
    Url(Url),
    /// A URL request carrying headers and transport hints.
    UrlRequest(UrlRequest),
    /// A user-supplied data publisher.
    Publisher(DataPublisher),
}

impl ImageSource {
    /// The string identity used for cache keys: the URL string, or the
    /// publisher's opaque identifier.
    pub fn cache_id(&self) -> &str {
        match self {
            Self::Url(url) => url.as_str(),
            Self::UrlRequest(request) => request.url.as_str(),
            Self::Publisher(publisher) => publisher.id(),
        }
    }

    /// The URL, when this source has one.
    pub fn url(&self) -> Option<&Url> {
        match self {
            Self::Url(url) => Some(url),
            Self::UrlRequest(request) => Some(&request.url),
            Self::Publisher(_) => None,
        }
    }
}

/// An immutable description of an image to load.
#[derive(Clone)]
pub struct ImageRequest {
    source: ImageSource,
    processors: Vec<Arc<dyn ImageProcessor>>,
    priority: TaskPriority,
    options: RequestOptions,
    thumbnail: Option<ThumbnailOptions>,
    scale: Option<f32>,
}

impl ImageRequest {
    /// Creates a request for the given URL.
    pub fn new(url: Url) -> Self {
        Self::with_source(ImageSource::Url(url))
    }

    /// Creates a request from an arbitrary source.
    pub fn with_source(source: ImageSource) -> Self {
        Self {
            source,
            processors: Vec::new(),
            priority: TaskPriority::default(),
            options: RequestOptions::default(),
            thumbnail: None,
            scale: None,
        }
    }

    /// Creates a request backed by a custom data publisher.
    pub fn with_publisher(publisher: DataPublisher) -> Self {
        Self::with_source(ImageSource::Publisher(publisher))
    }

    /// Sets the processor chain, applied in order after decoding.
    pub fn processors(mut self, processors: Vec<Arc<dyn ImageProcessor>>) -> Self {
        self.processors = processors;
        self
    }

    /// Sets the scheduling priority.
    pub fn priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the cache/scheduling option gates.
    pub fn options(mut self, options: RequestOptions) -> Self {
        self.options = options;
        self
    }

    /// Requests thumbnail generation during decoding.
    pub fn thumbnail(mut self, thumbnail: ThumbnailOptions) -> Self {
        self.thumbnail = Some(thumbnail);
        self
    }

    /// Overrides the display scale recorded in the image cache key.
    pub fn scale(mut self, scale: f32) -> Self {
        self.scale = Some(scale);
        self
    }

    /// The data source.
    pub fn source(&self) -> &ImageSource {
        &self.source
    }

    /// The processor chain.
    pub fn processor_chain(&self) -> &[Arc<dyn ImageProcessor>] {
        &self.processors
    }

    /// The scheduling priority this request was created with.
    pub fn task_priority(&self) -> TaskPriority {
        self.priority
    }

    /// The option gates.
    pub fn request_options(&self) -> &RequestOptions {
        &self.options
    }

    /// The thumbnail hint, if any.
    pub fn thumbnail_options(&self) -> Option<&ThumbnailOptions> {
        self.thumbnail.as_ref()
    }

    /// The scale override, if any.
    pub fn scale_override(&self) -> Option<f32> {
        self.scale
    }

    /// True when the source points at a local resource (`file:` or `data:`
    /// URL). Bytes from local resources are never written back to the disk
    /// cache unless a processor re-encoded them.
    pub(crate) fn is_local_resource(&self) -> bool {
        match self.source.url() {
            Some(url) => matches!(url.scheme(), "file" | "data"),
            None => false,
        }
    }

    /// Returns a copy of this request truncated to the first `count`
    /// processors. Used to key and probe intermediate links of the chain.
    pub(crate) fn truncated(&self, count: usize) -> Self {
        let mut request = self.clone();
        request.processors.truncate(count);
        request
    }

    /// Returns a copy with extra headers appended, promoting a plain URL
    /// source to a full URL request. Used to inject `Range`/`If-Range`
    /// headers when resuming an interrupted download. No-op for publisher
    /// sources.
    pub(crate) fn with_extra_headers(&self, headers: Vec<(String, String)>) -> Self {
        let mut request = self.clone();
        request.source = match request.source {
            ImageSource::Url(url) => {
                let mut url_request = UrlRequest::new(url);
                url_request.headers = headers;
                ImageSource::UrlRequest(url_request)
            }
            ImageSource::UrlRequest(mut url_request) => {
                url_request.headers.extend(headers);
                ImageSource::UrlRequest(url_request)
            }
            source @ ImageSource::Publisher(_) => source,
        };
        request
    }
}

impl std::fmt::Debug for ImageRequest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageRequest")
            .field("source", &self.source)
            .field(
                "processors",
                &self
                    .processors
                    .iter()
                    .map(|p| p.identifier())
                    .collect::<Vec<_>>(),
            )
            .field("priority", &self.priority)
            .field("options", &self.options)
            .field("thumbnail", &self.thumbnail)
            .field("scale", &self.scale)
            .finish()
    }
}
