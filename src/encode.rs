//! Image encoding for disk cache write-backs.

use crate::container::ImageContainer;
use crate::error::EncodeError;
use bytes::Bytes;
use image::ImageFormat;

/// Encodes a processed container back into bytes for the disk cache.
pub trait ImageEncoder: Send + Sync + 'static {
    /// Encodes the container. Called off the pipeline's event loops; may be
    /// CPU-intensive.
    fn encode(&self, container: &ImageContainer) -> Result<Bytes, EncodeError>;
}

/// Default encoder backed by the `image` crate.
///
/// Encodes to PNG unless constructed with another format. PNG keeps the
/// write path dependency-free of quality settings and round-trips every
/// pixel type the pipeline produces.
#[derive(Debug, Clone)]
pub struct DefaultImageEncoder {
    format: ImageFormat,
}

impl DefaultImageEncoder {
    /// PNG encoder.
    pub fn new() -> Self {
        Self {
            format: ImageFormat::Png,
        }
    }

    /// Encoder for an explicit output format.
    pub fn with_format(format: ImageFormat) -> Self {
        Self { format }
    }
}

impl Default for DefaultImageEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl ImageEncoder for DefaultImageEncoder {
    fn encode(&self, container: &ImageContainer) -> Result<Bytes, EncodeError> {
        let mut cursor = std::io::Cursor::new(Vec::new());
        container
            .image
            .write_to(&mut cursor, self.format)
            .map_err(|error| EncodeError::new(format!("{:?} encoding failed: {error}", self.format)))?;
        Ok(Bytes::from(cursor.into_inner()))
    }
}
