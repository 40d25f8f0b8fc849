//! Root image stage.
//!
//! Owns the per-request cache orchestration: a disk probe at the terminal
//! processed key when the policy could have written one, preview
//! write-backs to the memory cache, decompression of the final container,
//! the memory write-back, and the encoded disk write-back prescribed by
//! the data cache policy.

use crate::cache::{image_cache_key, processed_data_key};
use crate::container::{CacheType, ImageContainer, ImageResponse};
use crate::decode::DecodingContext;
use crate::error::PipelineError;
use crate::loader::UrlResponse;
use crate::pipeline::job::{Job, JobEvent};
use crate::pipeline::PipelineServices;
use crate::request::ImageRequest;
use bytes::Bytes;
use std::sync::{Arc, Weak};
use tracing::warn;

pub(crate) async fn run(
    services: Weak<PipelineServices>,
    job: Arc<Job<ImageResponse>>,
    request: ImageRequest,
) {
    let Some(services) = services.upgrade() else {
        job.publish(JobEvent::Finished(Err(PipelineError::Cancelled)));
        return;
    };
    let token = job.cancellation_token();
    if token.is_cancelled() {
        return;
    }
    let options = *request.request_options();
    let policy = services.config.data_cache_policy;
    let has_processors = !request.processor_chain().is_empty();

    // The disk cache may hold the fully processed image. Only the terminal
    // key is probed; intermediate processor prefixes never reach disk.
    if options.disk_reads_allowed() && policy.may_contain_encoded(has_processors) {
        if let Some(cache) = services.config.data_cache.clone() {
            let key = processed_data_key(&request);
            let cached = tokio::task::spawn_blocking(move || cache.get(&key))
                .await
                .ok()
                .flatten();
            if let Some(data) = cached {
                let registry = services.config.decoders.clone();
                let bytes = Bytes::from(data);
                let (handle, rx) = services.decode_queue.submit(job.current_priority(), async move {
                    let context = DecodingContext {
                        data: bytes.clone(),
                        response: None,
                        is_completed: true,
                    };
                    let mut decoder = registry.make_decoder(&context)?;
                    decoder.decode(&bytes, true).unwrap_or(None)
                });
                job.set_operation(handle);
                let decoded = tokio::select! {
                    _ = token.cancelled() => return,
                    result = rx => result,
                };
                match decoded {
                    Ok(Some(container)) => {
                        finalize(&services, &job, &request, container, None, Some(CacheType::Disk), false)
                            .await;
                        return;
                    }
                    Ok(None) => {
                        warn!(key = %processed_data_key(&request), "disk-cached image failed to decode, reloading");
                    }
                    Err(_) => return,
                }
            }
        }
    }

    let upstream = if has_processors {
        services.attach_process_job(&request, job.current_priority())
    } else {
        services.attach_decode_job(&request, job.current_priority())
    };
    let Some(upstream) = upstream else {
        job.publish(JobEvent::Finished(Err(PipelineError::PipelineInvalidated)));
        return;
    };
    let mut events = upstream.events;
    job.set_dependency(upstream.subscription);

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            event = events.recv() => match event {
                Some(JobEvent::Progress(progress)) => {
                    job.publish(JobEvent::Progress(progress));
                }
                Some(JobEvent::Intermediate(preview)) => {
                    if services.config.is_storing_previews_in_memory_cache
                        && options.memory_writes_allowed()
                    {
                        if let Some(cache) = &services.config.image_cache {
                            cache.put(&image_cache_key(&request), preview.container.clone());
                        }
                    }
                    job.publish(JobEvent::Intermediate(ImageResponse {
                        container: preview.container,
                        request: request.clone(),
                        url_response: preview.url_response,
                        cache_type: None,
                    }));
                }
                Some(JobEvent::Finished(Ok(response))) => {
                    finalize(
                        &services,
                        &job,
                        &request,
                        response.container,
                        response.url_response,
                        response.cache_type,
                        true,
                    )
                    .await;
                    return;
                }
                Some(JobEvent::Finished(Err(error))) => {
                    job.publish(JobEvent::Finished(Err(error)));
                    return;
                }
                None => {
                    job.publish(JobEvent::Finished(Err(PipelineError::Cancelled)));
                    return;
                }
            }
        }
    }
}

/// Decompresses, writes caches, and publishes the final response.
async fn finalize(
    services: &Arc<PipelineServices>,
    job: &Arc<Job<ImageResponse>>,
    request: &ImageRequest,
    container: ImageContainer,
    url_response: Option<UrlResponse>,
    cache_type: Option<CacheType>,
    allow_disk_write: bool,
) {
    let token = job.cancellation_token();
    let options = *request.request_options();
    let mut container = container;
    container.is_preview = false;

    // Thumbnails are already small and skip decompression by contract.
    let skip_decompression = !services.config.is_decompression_enabled
        || options.skip_decompression
        || request.thumbnail_options().is_some();
    if !skip_decompression {
        let input = container.clone();
        let (handle, rx) = services
            .decompress_queue
            .submit(job.current_priority(), async move { super::decompress(input) });
        job.set_operation(handle);
        container = tokio::select! {
            _ = token.cancelled() => return,
            result = rx => match result {
                Ok(container) => container,
                Err(_) => return,
            },
        };
    }

    if options.memory_writes_allowed() {
        if let Some(cache) = &services.config.image_cache {
            cache.put(&image_cache_key(request), container.clone());
        }
    }

    let has_processors = !request.processor_chain().is_empty();
    if allow_disk_write
        && options.disk_writes_allowed()
        && services
            .config
            .data_cache_policy
            .should_store_encoded(has_processors)
        && (!request.is_local_resource() || has_processors)
    {
        if let Some(cache) = services.config.data_cache.clone() {
            let encoder = Arc::clone(&services.config.encoder);
            let key = processed_data_key(request);
            let input = container.clone();
            let encode_and_store = move || match encoder.encode(&input) {
                Ok(bytes) => cache.put(&key, &bytes),
                Err(error) => warn!(%error, "failed to encode image for disk cache"),
            };
            if services.config.debug_is_sync_image_encoding {
                encode_and_store();
            } else {
                services.runtime.spawn_blocking(encode_and_store);
            }
        }
    }

    job.publish(JobEvent::Finished(Ok(ImageResponse {
        container,
        request: request.clone(),
        url_response,
        cache_type,
    })));
}
