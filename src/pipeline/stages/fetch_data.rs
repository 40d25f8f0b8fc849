//! Original data fetch stage.
//!
//! Produces the raw bytes for a request: from the disk cache when allowed,
//! otherwise from the data loader (or the request's own publisher). The
//! whole body runs as one operation on the data loading queue so the
//! queue's concurrency limit bounds simultaneous fetches; requests with
//! `skip_data_loading_queue` bypass both the queue and the rate limiter.

use super::LoadedData;
use crate::cache::original_data_key;
use crate::error::PipelineError;
use crate::loader::{DataChunk, DataStream};
use crate::pipeline::job::{Job, JobEvent, TaskProgress};
use crate::pipeline::resumable::ResumableData;
use crate::pipeline::PipelineServices;
use crate::request::{ImageRequest, ImageSource};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::sync::{Arc, Weak};
use tracing::{debug, warn};

/// Spawns the fetch body, queued or direct per the request options.
pub(crate) fn spawn(
    services: &Arc<PipelineServices>,
    job: Arc<Job<LoadedData>>,
    request: ImageRequest,
) {
    let skip_queue = request.request_options().skip_data_loading_queue;
    let body = run(Arc::downgrade(services), Arc::clone(&job), request);
    if skip_queue {
        services.runtime.spawn(body);
    } else {
        let handle = services
            .data_queue
            .enqueue(job.current_priority(), body);
        job.set_operation(handle);
    }
}

async fn run(services: Weak<PipelineServices>, job: Arc<Job<LoadedData>>, request: ImageRequest) {
    let Some(services) = services.upgrade() else {
        job.publish(JobEvent::Finished(Err(PipelineError::Cancelled)));
        return;
    };
    let token = job.cancellation_token();
    if token.is_cancelled() {
        return;
    }

    let options = *request.request_options();
    let key = original_data_key(&request);

    // Disk cache first.
    if options.disk_reads_allowed() {
        if let Some(cache) = services.config.data_cache.clone() {
            let lookup_key = key.clone();
            let cached = tokio::task::spawn_blocking(move || cache.get(&lookup_key))
                .await
                .ok()
                .flatten();
            if let Some(data) = cached {
                debug!(key = %key, bytes = data.len(), "original data served from disk cache");
                job.publish(JobEvent::Finished(Ok(LoadedData {
                    data: Bytes::from(data),
                    response: None,
                })));
                return;
            }
        }
    }
    if options.return_cache_data_dont_load {
        job.publish(JobEvent::Finished(Err(PipelineError::DataMissingInCache)));
        return;
    }

    if services.config.is_rate_limiter_enabled && !options.skip_data_loading_queue {
        tokio::select! {
            _ = token.cancelled() => return,
            _ = services.rate_limiter.acquire() => {}
        }
    }

    // Resume an interrupted download when we kept its tail state.
    let mut resumed: Option<ResumableData> = None;
    let mut effective_request = request.clone();
    if services.config.is_resumable_data_enabled {
        if let Some(entry) = services.resumable.take(&key) {
            effective_request = request.with_extra_headers(entry.resuming_headers());
            resumed = Some(entry);
        }
    }

    let mut stream: DataStream = match request.source() {
        ImageSource::Publisher(publisher) => {
            let inner = publisher.open();
            Box::pin(inner.map(|item| item.map(DataChunk::bytes)))
        }
        _ => services
            .config
            .data_loader
            .load(&effective_request, token.child_token()),
    };

    let progressive = services.config.is_progressive_decoding_enabled;
    let mut buffer = BytesMut::new();
    let mut url_response = None;
    let mut resumed_offset: u64 = 0;

    loop {
        tokio::select! {
            _ = token.cancelled() => return,
            item = stream.next() => match item {
                Some(Ok(chunk)) => {
                    if let Some(response) = chunk.response {
                        if url_response.is_none() {
                            if let Some(entry) = resumed.take() {
                                // Splice the retained prefix only when the
                                // server honoured the range request.
                                if response.status_code == 206 {
                                    debug!(key = %key, resumed_bytes = entry.data.len(), "resuming interrupted download");
                                    resumed_offset = entry.data.len() as u64;
                                    buffer.extend_from_slice(&entry.data);
                                }
                            }
                            url_response = Some(response);
                        }
                    }
                    if !chunk.data.is_empty() {
                        buffer.extend_from_slice(&chunk.data);
                        let total = url_response
                            .as_ref()
                            .and_then(|r: &crate::loader::UrlResponse| r.expected_content_length)
                            .map(|length| length + resumed_offset);
                        job.publish(JobEvent::Progress(TaskProgress {
                            completed: buffer.len() as u64,
                            total,
                        }));
                        if progressive {
                            job.publish(JobEvent::Intermediate(LoadedData {
                                data: Bytes::copy_from_slice(&buffer),
                                response: url_response.clone(),
                            }));
                        }
                    }
                }
                Some(Err(error)) => {
                    if services.config.is_resumable_data_enabled {
                        if let Some(entry) =
                            ResumableData::from_interrupted(url_response.as_ref(), &buffer)
                        {
                            services.resumable.insert(key.clone(), entry);
                        }
                    }
                    warn!(key = %key, %error, "data loading failed");
                    job.publish(JobEvent::Finished(Err(PipelineError::data_loading(error))));
                    return;
                }
                None => break,
            }
        }
    }

    if buffer.is_empty() {
        job.publish(JobEvent::Finished(Err(PipelineError::DataIsEmpty)));
        return;
    }
    let data = buffer.freeze();

    // Write the original bytes back to the disk cache when the policy asks
    // for it. Local resources are never written; their bytes are already at
    // hand.
    let policy = services.config.data_cache_policy;
    let has_processors = !request.processor_chain().is_empty();
    if options.disk_writes_allowed()
        && policy.should_store_original(has_processors)
        && !request.is_local_resource()
    {
        if let Some(cache) = &services.config.data_cache {
            cache.put(&key, &data);
        }
    }

    job.publish(JobEvent::Finished(Ok(LoadedData {
        data,
        response: url_response,
    })));
}
