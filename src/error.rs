//! Error types surfaced by the pipeline.
//!
//! Errors are categorized by the stage that produced them. A failure in a
//! dependency job propagates unchanged through every dependent, so the
//! variant a subscriber observes always names the stage that actually
//! failed. All variants are cheaply cloneable because a terminal result is
//! memoised on its job and fanned out to every subscriber.

use crate::decode::DecodingContext;
use crate::process::ProcessingContext;
use std::sync::Arc;
use thiserror::Error;

/// Boxed error type accepted from external collaborators (data loaders,
/// decoders, processors).
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors that can terminate an image or data task.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// `return_cache_data_dont_load` was set and the lookup missed.
    #[error("data is missing in the cache")]
    DataMissingInCache,

    /// The data loader failed. The underlying error is surfaced verbatim.
    #[error("data loading failed: {0}")]
    DataLoadingFailed(#[source] Arc<dyn std::error::Error + Send + Sync>),

    /// The load completed but produced zero bytes.
    #[error("data is empty")]
    DataIsEmpty,

    /// No registered decoder factory accepted the downloaded data.
    #[error("no decoder is registered for the downloaded data")]
    DecoderNotRegistered {
        /// The context the registry was asked to dispatch on.
        context: DecodingContext,
    },

    /// A decoder accepted the data but failed to produce a final image.
    #[error("decoding failed using {decoder}: {source}")]
    DecodingFailed {
        /// Name of the decoder that failed.
        decoder: String,
        /// The context the decoder was invoked with.
        context: DecodingContext,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// A processor failed on the final (non-preview) container.
    #[error("processing failed using processor {processor}: {source}")]
    ProcessingFailed {
        /// Identifier of the processor that failed.
        processor: String,
        /// The context the processor was invoked with.
        context: ProcessingContext,
        #[source]
        source: Arc<dyn std::error::Error + Send + Sync>,
    },

    /// The pipeline was invalidated; no further work will ever run on it.
    #[error("the pipeline is invalidated")]
    PipelineInvalidated,

    /// The task was cancelled before it produced a result.
    #[error("the task was cancelled")]
    Cancelled,
}

impl PipelineError {
    /// Wraps an external loader error.
    pub(crate) fn data_loading(error: BoxError) -> Self {
        Self::DataLoadingFailed(Arc::from(error))
    }

    /// Returns true for the cancellation error kind.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

/// Error produced by an [`crate::decode::ImageDecoder`] on a final decode.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct DecodeError {
    message: String,
    #[source]
    source: Option<BoxError>,
}

impl DecodeError {
    /// Creates a decode error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a decode error wrapping an underlying error.
    pub fn with_source(message: impl Into<String>, source: BoxError) -> Self {
        Self {
            message: message.into(),
            source: Some(source),
        }
    }
}

/// Error produced by an [`crate::encode::ImageEncoder`].
#[derive(Debug, Error)]
#[error("{message}")]
pub struct EncodeError {
    message: String,
}

impl EncodeError {
    /// Creates an encode error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        assert_eq!(
            format!("{}", PipelineError::DataMissingInCache),
            "data is missing in the cache"
        );
        assert_eq!(format!("{}", PipelineError::Cancelled), "the task was cancelled");
        assert_eq!(
            format!("{}", PipelineError::PipelineInvalidated),
            "the pipeline is invalidated"
        );
    }

    #[test]
    fn test_error_is_cloneable() {
        let err = PipelineError::data_loading("connection reset".into());
        let clone = err.clone();
        assert!(format!("{}", clone).contains("connection reset"));
    }

    #[test]
    fn test_is_cancelled() {
        assert!(PipelineError::Cancelled.is_cancelled());
        assert!(!PipelineError::DataIsEmpty.is_cancelled());
    }

    #[test]
    fn test_decode_error_source_chain() {
        let inner: crate::error::BoxError = "truncated scan".into();
        let err = DecodeError::with_source("bad jpeg", inner);
        assert_eq!(format!("{}", err), "bad jpeg");
        assert!(std::error::Error::source(&err).is_some());
    }
}
