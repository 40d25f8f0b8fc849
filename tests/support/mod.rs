//! Shared fixtures for integration tests: a scriptable data loader,
//! counting processors and encoders, and a progressive test decoder.

#![allow(dead_code)]

use bytes::Bytes;
use pixelpipe::decode::{DecodingContext, ImageDecoder};
use pixelpipe::encode::{DefaultImageEncoder, ImageEncoder};
use pixelpipe::DecodeError;
use pixelpipe::loader::{DataChunk, DataLoader, DataStream, UrlResponse};
use pixelpipe::process::{ImageProcessor, ProcessingContext};
use pixelpipe::{ImageContainer, ImageRequest};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

pub const TEST_URL: &str = "https://example.com/image.png";

/// PNG-encoded solid image of the given size.
pub fn png_bytes(width: u32, height: u32) -> Bytes {
    let image = image::DynamicImage::ImageRgba8(image::RgbaImage::from_pixel(
        width,
        height,
        image::Rgba([120, 90, 60, 255]),
    ));
    let mut cursor = std::io::Cursor::new(Vec::new());
    image
        .write_to(&mut cursor, image::ImageFormat::Png)
        .unwrap();
    Bytes::from(cursor.into_inner())
}

pub fn test_url() -> url::Url {
    url::Url::parse(TEST_URL).unwrap()
}

/// One scripted loader output.
#[derive(Clone)]
pub enum LoadItem {
    /// Transport metadata (sent before the body).
    Response(UrlResponse),
    /// A chunk of body bytes.
    Chunk(Bytes),
    /// Pause before the next item; lets previews drain deterministically.
    Delay(Duration),
    /// Terminate the stream with an error.
    Error(String),
}

/// Scriptable loader: per-URL item lists, a start gate for "suspended
/// loader" scenarios, and counters the coalescing tests assert on.
pub struct TestDataLoader {
    items: Mutex<HashMap<String, Vec<LoadItem>>>,
    requests: Mutex<Vec<ImageRequest>>,
    started: AtomicUsize,
    gate: Arc<Semaphore>,
}

impl TestDataLoader {
    /// Loader whose fetches start immediately.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
            gate: Arc::new(Semaphore::new(10_000)),
        })
    }

    /// Loader whose fetches block until [`Self::resume`].
    pub fn suspended() -> Arc<Self> {
        Arc::new(Self {
            items: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            started: AtomicUsize::new(0),
            gate: Arc::new(Semaphore::new(0)),
        })
    }

    /// Releases every suspended (and future) fetch.
    pub fn resume(&self) {
        self.gate.add_permits(10_000);
    }

    /// Scripts a simple 200 response with one body chunk.
    pub fn set(&self, url: &str, data: Bytes) {
        self.set_items(
            url,
            vec![
                LoadItem::Response(UrlResponse::ok(url)),
                LoadItem::Chunk(data),
            ],
        );
    }

    /// Scripts an explicit item list for a URL.
    pub fn set_items(&self, url: &str, items: Vec<LoadItem>) {
        self.items.lock().unwrap().insert(url.to_string(), items);
    }

    /// Number of fetches the pipeline started.
    pub fn fetch_count(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Requests observed, in order.
    pub fn requests(&self) -> Vec<ImageRequest> {
        self.requests.lock().unwrap().clone()
    }
}

impl DataLoader for TestDataLoader {
    fn load(&self, request: &ImageRequest, _token: CancellationToken) -> DataStream {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.requests.lock().unwrap().push(request.clone());
        let items = self
            .items
            .lock()
            .unwrap()
            .get(request.source().cache_id())
            .cloned()
            .unwrap_or_else(|| vec![LoadItem::Error("no scripted response".into())]);
        let gate = Arc::clone(&self.gate);

        Box::pin(futures::stream::unfold(
            (items.into_iter(), gate, true),
            |(mut items, gate, first)| async move {
                if first {
                    gate.acquire().await.unwrap().forget();
                }
                loop {
                    return match items.next()? {
                        LoadItem::Delay(duration) => {
                            tokio::time::sleep(duration).await;
                            continue;
                        }
                        LoadItem::Response(response) => Some((
                            Ok(DataChunk::with_response(Bytes::new(), response)),
                            (items, gate, false),
                        )),
                        LoadItem::Chunk(data) => {
                            Some((Ok(DataChunk::bytes(data)), (items, gate, false)))
                        }
                        LoadItem::Error(message) => {
                            Some((Err(message.into()), (items, gate, false)))
                        }
                    };
                }
            },
        ))
    }
}

/// Pass-through processor counting final applications.
pub struct CountingProcessor {
    id: String,
    calls: Arc<AtomicUsize>,
}

impl CountingProcessor {
    pub fn new(id: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageProcessor for CountingProcessor {
    fn identifier(&self) -> String {
        self.id.clone()
    }

    fn process(
        &self,
        container: ImageContainer,
        _context: &ProcessingContext,
    ) -> Result<Option<ImageContainer>, pixelpipe::BoxError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(Some(container))
    }
}

/// Processor that always fails with a fixed error message.
pub struct FailingProcessor {
    id: String,
    message: String,
}

impl FailingProcessor {
    pub fn new(id: &str, message: &str) -> Arc<Self> {
        Arc::new(Self {
            id: id.to_string(),
            message: message.to_string(),
        })
    }
}

impl ImageProcessor for FailingProcessor {
    fn identifier(&self) -> String {
        self.id.clone()
    }

    fn process(
        &self,
        _container: ImageContainer,
        _context: &ProcessingContext,
    ) -> Result<Option<ImageContainer>, pixelpipe::BoxError> {
        Err(self.message.clone().into())
    }
}

/// Encoder wrapper counting invocations.
pub struct CountingEncoder {
    inner: DefaultImageEncoder,
    calls: Arc<AtomicUsize>,
}

impl CountingEncoder {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: DefaultImageEncoder::new(),
            calls: Arc::new(AtomicUsize::new(0)),
        })
    }

    pub fn call_count(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl ImageEncoder for CountingEncoder {
    fn encode(&self, container: &ImageContainer) -> Result<Bytes, pixelpipe::EncodeError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.encode(container)
    }
}

/// Progressive decoder that yields a preview for every partial scan and a
/// final image for the complete data. Ignores the actual byte content.
pub struct ScanDecoder;

impl ScanDecoder {
    pub fn factory(
        _context: &DecodingContext,
    ) -> Option<Box<dyn ImageDecoder>> {
        Some(Box::new(ScanDecoder))
    }
}

impl ImageDecoder for ScanDecoder {
    fn name(&self) -> &str {
        "scan"
    }

    fn decode(&mut self, data: &Bytes, is_final: bool) -> Result<Option<ImageContainer>, DecodeError> {
        if data.is_empty() {
            return Err(DecodeError::new("no data"));
        }
        let image = image::DynamicImage::ImageRgba8(image::RgbaImage::new(8, 8));
        let mut container = ImageContainer::new(image);
        container.is_preview = !is_final;
        Ok(Some(container))
    }

    fn is_progressive(&self) -> bool {
        true
    }
}
