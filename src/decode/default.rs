//! Default decoder backed by the `image` crate.

use super::{DecodingContext, ImageDecoder};
use crate::container::ImageContainer;
use crate::error::DecodeError;
use bytes::Bytes;
use image::ImageFormat;
use tracing::trace;

/// Decoder for every format the `image` crate can sniff and parse.
///
/// Partial decodes are attempted opportunistically: a prefix that happens to
/// parse (e.g. a truncated baseline image with enough scanlines) yields a
/// preview; anything else is skipped without error.
pub struct DefaultImageDecoder {
    format: ImageFormat,
}

impl DefaultImageDecoder {
    /// Returns a decoder when the context's bytes sniff as a known format.
    pub fn for_context(context: &DecodingContext) -> Option<Self> {
        let format = image::guess_format(&context.data).ok()?;
        Some(Self { format })
    }

    /// The sniffed format.
    pub fn format(&self) -> ImageFormat {
        self.format
    }
}

impl ImageDecoder for DefaultImageDecoder {
    fn name(&self) -> &str {
        "default"
    }

    fn decode(&mut self, data: &Bytes, is_final: bool) -> Result<Option<ImageContainer>, DecodeError> {
        match image::load_from_memory_with_format(data, self.format) {
            Ok(image) => {
                let mut container = ImageContainer::new(image);
                container.format = Some(self.format);
                container.is_preview = !is_final;
                if is_final {
                    container.data = Some(data.clone());
                }
                Ok(Some(container))
            }
            Err(error) if is_final => Err(DecodeError::with_source(
                format!("failed to decode {:?} image", self.format),
                Box::new(error),
            )),
            Err(error) => {
                trace!(format = ?self.format, %error, "partial decode not yet possible");
                Ok(None)
            }
        }
    }
}
