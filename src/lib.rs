//! pixelpipe - a client-side image loading pipeline.
//!
//! Given a description of an image to fetch (URL or custom data source,
//! optional processors, optional thumbnail hints), the pipeline produces a
//! decoded, optionally post-processed image while minimising duplicate work
//! and honouring a layered cache: an in-memory image cache, an on-disk byte
//! cache, and the network behind them.
//!
//! # High-Level API
//!
//! ```ignore
//! use pixelpipe::{ImagePipeline, ImageRequest, PipelineConfiguration};
//! use std::sync::Arc;
//! use url::Url;
//!
//! let pipeline = ImagePipeline::new(PipelineConfiguration::new(my_loader));
//!
//! let mut task = pipeline.image_task(ImageRequest::new(
//!     Url::parse("https://example.com/image.jpeg")?,
//! ));
//! let response = task.response().await?;
//! ```
//!
//! Concurrent requests for equivalent work share a single fetch, decode,
//! and processing chain; every subscriber keeps independent cancellation
//! and priority. See [`ImageRequest`] for the request model and
//! [`PipelineConfiguration`] for policies, queues, and collaborators.

pub mod cache;
pub mod decode;
pub mod encode;
pub mod loader;
pub mod process;

mod container;
mod error;
mod pipeline;
mod request;

pub use container::{CacheType, ImageContainer, ImageResponse};
pub use error::{BoxError, DecodeError, EncodeError, PipelineError};
pub use pipeline::{
    DataResponse, DataTask, DataTaskProgress, ImagePipeline, ImageTask, PipelineConfiguration,
    TaskEvent, TaskEvents, TaskPreviews, TaskProgress, TaskProgressStream,
};
pub use request::{
    DataPublisher, ImageRequest, ImageSource, RequestOptions, TaskPriority, ThumbnailContentMode,
    ThumbnailOptions, ThumbnailSize, UrlRequest,
};
