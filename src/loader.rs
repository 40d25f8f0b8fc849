//! Data loader abstraction.
//!
//! The on-wire HTTP client is an external collaborator: the pipeline only
//! depends on the [`DataLoader`] trait, which streams chunks of bytes plus
//! transport metadata. Keeping the transport behind a trait lets
//! applications plug in their own client and lets tests script responses,
//! while the chunked shape lets progressive decoding observe partial
//! bodies.

use crate::error::BoxError;
use crate::request::ImageRequest;
use bytes::Bytes;
use futures::stream::BoxStream;
use tokio_util::sync::CancellationToken;

/// Transport metadata for a loaded resource.
#[derive(Debug, Clone)]
pub struct UrlResponse {
    /// The final URL the bytes came from.
    pub url: String,
    /// HTTP status code (or 200 for non-HTTP sources).
    pub status_code: u16,
    /// Response headers as received.
    pub headers: Vec<(String, String)>,
    /// `Content-Length`, when the server advertised one.
    pub expected_content_length: Option<u64>,
}

impl UrlResponse {
    /// Creates a successful response with no headers.
    pub fn ok(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            status_code: 200,
            headers: Vec::new(),
            expected_content_length: None,
        }
    }

    /// Case-insensitive header lookup returning the first match.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// One unit of loader output: a chunk of body bytes, with the transport
/// metadata attached to the first chunk that carries it.
#[derive(Debug, Clone)]
pub struct DataChunk {
    /// Body bytes. May be empty on a metadata-only chunk.
    pub data: Bytes,
    /// Transport metadata, typically present on the first chunk only.
    pub response: Option<UrlResponse>,
}

impl DataChunk {
    /// A chunk of body bytes with no metadata.
    pub fn bytes(data: Bytes) -> Self {
        Self {
            data,
            response: None,
        }
    }

    /// A chunk carrying transport metadata.
    pub fn with_response(data: Bytes, response: UrlResponse) -> Self {
        Self {
            data,
            response: Some(response),
        }
    }
}

/// Stream of loader output. Ends after the last chunk on success; yields an
/// error item and then ends on failure.
pub type DataStream = BoxStream<'static, Result<DataChunk, BoxError>>;

/// Fetches raw image data for a request.
///
/// Implementations are expected to observe the cancellation token and to
/// honour extra headers supplied on the request (the pipeline injects
/// `Range`/`If-Range` headers when resuming an interrupted download).
/// Chunk boundaries carry no meaning; they need not align with decoder
/// scans. Errors are surfaced to subscribers verbatim inside
/// [`crate::PipelineError::DataLoadingFailed`].
pub trait DataLoader: Send + Sync + 'static {
    /// Starts loading data for the request.
    fn load(&self, request: &ImageRequest, token: CancellationToken) -> DataStream;
}

/// A loader that fails every request. Used as the default when no loader is
/// configured; tests and applications inject a real implementation.
#[derive(Debug, Clone, Default)]
pub struct UnconfiguredDataLoader;

impl DataLoader for UnconfiguredDataLoader {
    fn load(&self, request: &ImageRequest, _token: CancellationToken) -> DataStream {
        let id = request.source().cache_id().to_string();
        Box::pin(futures::stream::once(async move {
            Err(format!("no data loader configured (requested {id})").into())
        }))
    }
}
