//! Image decoding.
//!
//! Decoders are external collaborators chosen by a [`DecoderRegistry`] that
//! dispatches on the partially downloaded bytes and transport metadata. A
//! decoder may be stateful: during progressive decoding it is invoked
//! repeatedly on growing byte prefixes and may keep per-scan state between
//! calls.

mod default;
mod thumbnail;

pub use default::DefaultImageDecoder;
pub(crate) use thumbnail::make_thumbnail;

use crate::container::ImageContainer;
use crate::error::DecodeError;
use crate::loader::UrlResponse;
use bytes::Bytes;
use std::sync::Arc;

/// What the registry dispatches on when choosing a decoder.
#[derive(Debug, Clone)]
pub struct DecodingContext {
    /// The bytes downloaded so far (all of them when `is_completed`).
    pub data: Bytes,
    /// Transport metadata, when the bytes came from the network.
    pub response: Option<UrlResponse>,
    /// True when the download has finished.
    pub is_completed: bool,
}

/// Decodes encoded bytes into an [`ImageContainer`].
///
/// `decode` is called with `is_final = false` on growing prefixes during
/// progressive decoding; returning `Ok(None)` skips a scan that cannot be
/// decoded yet. With `is_final = true` the decoder must either produce the
/// final container or report an error.
pub trait ImageDecoder: Send {
    /// A short name used in error reporting.
    fn name(&self) -> &str;

    /// Decodes the given bytes.
    fn decode(&mut self, data: &Bytes, is_final: bool) -> Result<Option<ImageContainer>, DecodeError>;

    /// True when this decoder can produce previews from partial data.
    fn is_progressive(&self) -> bool {
        false
    }
}

/// Factory producing a decoder for a decoding context, or `None` when the
/// data is not recognised.
pub type MakeDecoder = Arc<dyn Fn(&DecodingContext) -> Option<Box<dyn ImageDecoder>> + Send + Sync>;

/// Ordered collection of decoder factories.
///
/// The first factory that returns a decoder wins. The default registry
/// recognises everything the `image` crate can sniff.
#[derive(Clone)]
pub struct DecoderRegistry {
    factories: Vec<MakeDecoder>,
}

impl DecoderRegistry {
    /// A registry with only the default decoder.
    pub fn new() -> Self {
        Self {
            factories: vec![Arc::new(|context: &DecodingContext| {
                DefaultImageDecoder::for_context(context)
                    .map(|decoder| Box::new(decoder) as Box<dyn ImageDecoder>)
            })],
        }
    }

    /// An empty registry that never produces a decoder.
    pub fn empty() -> Self {
        Self {
            factories: Vec::new(),
        }
    }

    /// Registers a factory ahead of the existing ones.
    pub fn register(&mut self, factory: MakeDecoder) {
        self.factories.insert(0, factory);
    }

    /// Chooses a decoder for the context.
    pub fn make_decoder(&self, context: &DecodingContext) -> Option<Box<dyn ImageDecoder>> {
        self.factories.iter().find_map(|factory| factory(context))
    }
}

impl Default for DecoderRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for DecoderRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecoderRegistry")
            .field("factories", &self.factories.len())
            .finish()
    }
}
