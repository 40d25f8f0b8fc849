//! The image loading pipeline.
//!
//! [`ImagePipeline`] coordinates five stages against four bounded work
//! queues:
//!
//! ```text
//! image_task ──► memory cache ──► root image job ──► processing chain
//!                (sync hit)            │                    │
//!                                      │              decode job ──► data job ──► loader
//!                                      ▼                                 │
//!                               disk cache (processed)             disk cache (original)
//! ```
//!
//! Requests with equivalent keys share one job per stage; subscribers keep
//! their own priority and cancellation. See [`crate::ImageRequest`] for the
//! request model and [`PipelineConfiguration`] for the knobs.

mod config;
mod coordinator;
mod job;
mod queue;
mod rate_limiter;
mod resumable;
mod stages;
mod task;

pub use config::PipelineConfiguration;
pub use job::TaskProgress;
pub use task::{
    DataResponse, DataTask, DataTaskProgress, ImageTask, TaskEvent, TaskEvents, TaskPreviews,
    TaskProgressStream,
};

use crate::cache::{image_cache_key, PipelineCache};
use crate::container::{CacheType, ImageResponse};
use crate::error::PipelineError;
use crate::loader::DataLoader;
use crate::request::ImageRequest;
use coordinator::Coordinator;
use queue::WorkQueue;
use rate_limiter::RateLimiter;
use resumable::ResumableDataStore;
use std::sync::Arc;
use tokio::runtime::Handle;
use tracing::info;

/// Shared state behind every pipeline handle and running job body.
pub(crate) struct PipelineServices {
    pub config: PipelineConfiguration,
    pub cache: PipelineCache,
    pub coordinator: Coordinator,
    pub data_queue: WorkQueue,
    pub decode_queue: WorkQueue,
    pub process_queue: WorkQueue,
    pub decompress_queue: WorkQueue,
    pub rate_limiter: RateLimiter,
    pub resumable: ResumableDataStore,
    pub runtime: Handle,
}

/// The pipeline entry point.
///
/// Cheap to clone; all clones share the same caches, queues, and job
/// registry. Must be constructed from within a Tokio runtime.
#[derive(Clone)]
pub struct ImagePipeline {
    services: Arc<PipelineServices>,
}

impl ImagePipeline {
    /// Creates a pipeline from a configuration.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn new(configuration: PipelineConfiguration) -> Self {
        let runtime = Handle::current();
        let cache = PipelineCache::new(
            configuration.image_cache.clone(),
            configuration.data_cache.clone(),
            configuration.decoders.clone(),
            Arc::clone(&configuration.encoder),
            configuration.is_storing_previews_in_memory_cache,
        );
        info!(config = ?configuration, "creating image pipeline");
        let services = Arc::new(PipelineServices {
            cache,
            coordinator: Coordinator::new(),
            data_queue: WorkQueue::new(
                "data-loading",
                configuration.data_loading_concurrency,
                runtime.clone(),
            ),
            decode_queue: WorkQueue::new(
                "image-decoding",
                configuration.image_decoding_concurrency,
                runtime.clone(),
            ),
            process_queue: WorkQueue::new(
                "image-processing",
                configuration.image_processing_concurrency,
                runtime.clone(),
            ),
            decompress_queue: WorkQueue::new(
                "image-decompressing",
                configuration.image_decompressing_concurrency,
                runtime.clone(),
            ),
            rate_limiter: RateLimiter::with_defaults(),
            resumable: ResumableDataStore::new(),
            config: configuration,
            runtime,
        });
        Self { services }
    }

    /// Creates a pipeline with default configuration around a loader.
    pub fn with_loader(loader: Arc<dyn DataLoader>) -> Self {
        Self::new(PipelineConfiguration::new(loader))
    }

    /// The configuration this pipeline was built with.
    pub fn configuration(&self) -> &PipelineConfiguration {
        &self.services.config
    }

    /// Direct access to both cache tiers.
    pub fn cache(&self) -> &PipelineCache {
        &self.services.cache
    }

    /// Starts (or joins) an image load for the request.
    ///
    /// A non-preview memory cache hit completes synchronously with
    /// `cache_type = Memory` without touching any queue.
    pub fn image_task(&self, request: ImageRequest) -> ImageTask {
        let priority = request.task_priority();
        if self.services.coordinator.is_invalidated() {
            return ImageTask::prebaked(Err(PipelineError::PipelineInvalidated), priority);
        }
        if request.request_options().memory_reads_allowed() {
            if let Some(cache) = &self.services.config.image_cache {
                if let Some(container) = cache.get(&image_cache_key(&request)) {
                    if !container.is_preview {
                        let response = ImageResponse {
                            container,
                            request: request.clone(),
                            url_response: None,
                            cache_type: Some(CacheType::Memory),
                        };
                        return ImageTask::prebaked(Ok(response), priority);
                    }
                }
            }
        }
        match self.services.attach_image_job(&request, priority) {
            Some(attachment) => ImageTask::attached(attachment, priority),
            None => ImageTask::prebaked(Err(PipelineError::PipelineInvalidated), priority),
        }
    }

    /// Starts (or joins) a raw data load for the request. Yields the
    /// original bytes regardless of the request's processors.
    pub fn data_task(&self, request: ImageRequest) -> DataTask {
        let priority = request.task_priority();
        match self.services.attach_data_job(&request, priority) {
            Some(attachment) => DataTask::attached(attachment, priority),
            None => DataTask::prebaked(Err(PipelineError::PipelineInvalidated), priority),
        }
    }

    /// Irreversibly shuts the pipeline down: every live job fails with
    /// [`PipelineError::PipelineInvalidated`], as does every subsequent
    /// task.
    pub fn invalidate(&self) {
        info!("invalidating image pipeline");
        let (image_jobs, data_jobs) = self.services.coordinator.drain_for_invalidation();
        for job in image_jobs {
            job.abort_with(PipelineError::PipelineInvalidated);
        }
        for job in data_jobs {
            job.abort_with(PipelineError::PipelineInvalidated);
        }
    }

    /// Number of live coalesced jobs, for diagnostics.
    pub fn live_job_count(&self) -> usize {
        self.services.coordinator.live_job_count()
    }
}

impl std::fmt::Debug for ImagePipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImagePipeline")
            .field("live_jobs", &self.live_job_count())
            .field("invalidated", &self.services.coordinator.is_invalidated())
            .finish()
    }
}
