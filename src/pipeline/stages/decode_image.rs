//! Decode stage.
//!
//! Consumes the original-data job's events and produces decoded containers.
//! The event loop runs as a plain task; every decode executes as an
//! operation on the decoding queue. Progressive decoding keeps at most one
//! preview decode in flight, newer partial data replaces older partials
//! waiting for a slot, and a failed partial decode is skipped silently.
//! Thumbnail generation happens here, on the decoding queue, from the
//! decoded original.

use super::LoadedData;
use crate::container::{ImageContainer, ImageResponse};
use crate::decode::{make_thumbnail, DecoderRegistry, DecodingContext, ImageDecoder};
use crate::error::{DecodeError, PipelineError};
use crate::pipeline::job::{Job, JobEvent};
use crate::pipeline::PipelineServices;
use crate::request::{ImageRequest, ThumbnailOptions};
use std::pin::Pin;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

/// Outcome of a preview decode operation: the decoder travels through the
/// operation and back so scan state survives between decodes.
type PreviewOutcome = (Option<Box<dyn ImageDecoder>>, Option<ImageContainer>, bool);

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

    // A previous request with no processors may have left the decoded
    // original in the memory cache; reuse it instead of fetching.
    if request.request_options().memory_reads_allowed() {
        if let Some(cache) = &services.config.image_cache {
            if let Some(container) = cache.get(&crate::cache::image_cache_key(&request)) {
                if !container.is_preview {
                    job.publish(JobEvent::Finished(Ok(ImageResponse {
                        container,
                        request: request.clone(),
                        url_response: None,
                        cache_type: Some(crate::container::CacheType::Memory),
                    })));
                    return;
                }
            }
        }
    }

    let upstream = services.attach_data_job(&request, job.current_priority());
    let Some(upstream) = upstream else {
        job.publish(JobEvent::Finished(Err(PipelineError::PipelineInvalidated)));
        return;
    };
    let mut events = upstream.events;
    job.set_dependency(upstream.subscription);

    let progressive_enabled = services.config.is_progressive_decoding_enabled;
    let interval = services.config.progressive_decoding_interval;
    let registry = services.config.decoders.clone();
    let thumbnail = request.thumbnail_options().copied();

    let mut decoder: Option<Box<dyn ImageDecoder>> = None;
    let mut progressive_supported = true;
    let mut pending: Option<oneshot::Receiver<PreviewOutcome>> = None;
    let mut latest: Option<LoadedData> = None;
    let mut throttle: Option<Pin<Box<tokio::time::Sleep>>> = None;
    let mut last_preview_decode: Option<tokio::time::Instant> = None;
    let mut final_data: Option<LoadedData> = None;
    let mut latest_response = None;

    let final_rx = 'events: loop {
        tokio::select! {
            _ = token.cancelled() => return,
            outcome = async { pending.as_mut().expect("pending preview checked").await },
                if pending.is_some() =>
            {
                pending = None;
                if let Ok((returned, preview, still_progressive)) = outcome {
                    decoder = returned;
                    if !still_progressive {
                        progressive_supported = false;
                        latest = None;
                    }
                    if let Some(container) = preview {
                        job.publish(JobEvent::Intermediate(ImageResponse {
                            container,
                            request: request.clone(),
                            url_response: latest_response.clone(),
                            cache_type: None,
                        }));
                    }
                }
                if let Some(data) = final_data.take() {
                    break 'events submit_final(
                        &services,
                        &job,
                        registry.clone(),
                        decoder.take(),
                        data,
                        thumbnail,
                    );
                }
                if progressive_supported {
                    if let Some(partial) = latest.take() {
                        last_preview_decode = Some(tokio::time::Instant::now());
                        pending = Some(submit_preview(
                            &services,
                            &job,
                            registry.clone(),
                            decoder.take(),
                            partial,
                        ));
                    }
                }
            }
            _ = async { throttle.as_mut().expect("throttle checked").as_mut().await },
                if throttle.is_some() =>
            {
                throttle = None;
                if pending.is_none() && progressive_supported {
                    if let Some(partial) = latest.take() {
                        last_preview_decode = Some(tokio::time::Instant::now());
                        pending = Some(submit_preview(
                            &services,
                            &job,
                            registry.clone(),
                            decoder.take(),
                            partial,
                        ));
                    }
                }
            }
            event = events.recv() => match event {
                Some(JobEvent::Progress(progress)) => {
                    job.publish(JobEvent::Progress(progress));
                }
                Some(JobEvent::Intermediate(partial)) => {
                    if partial.response.is_some() {
                        latest_response = partial.response.clone();
                    }
                    if !progressive_enabled || !progressive_supported {
                        continue;
                    }
                    if pending.is_some() {
                        // One preview decode at a time; newest partial wins.
                        latest = Some(partial);
                    } else {
                        let now = tokio::time::Instant::now();
                        let ready = last_preview_decode
                            .map_or(true, |last| now.duration_since(last) >= interval);
                        if ready {
                            last_preview_decode = Some(now);
                            pending = Some(submit_preview(
                                &services,
                                &job,
                                registry.clone(),
                                decoder.take(),
                                partial,
                            ));
                        } else {
                            latest = Some(partial);
                            if throttle.is_none() {
                                let wake = last_preview_decode.expect("interval implies a decode")
                                    + interval;
                                throttle = Some(Box::pin(tokio::time::sleep_until(wake)));
                            }
                        }
                    }
                }
                Some(JobEvent::Finished(Ok(data))) => {
                    if data.response.is_some() {
                        latest_response = data.response.clone();
                    }
                    if pending.is_some() {
                        // Let the in-flight preview return the decoder first.
                        final_data = Some(data);
                    } else {
                        break 'events submit_final(
                            &services,
                            &job,
                            registry.clone(),
                            decoder.take(),
                            data,
                            thumbnail,
                        );
                    }
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
    };

    tokio::select! {
        _ = token.cancelled() => {}
        result = final_rx => match result {
            Ok(Ok(container)) => {
                job.publish(JobEvent::Finished(Ok(ImageResponse {
                    container,
                    request,
                    url_response: latest_response,
                    cache_type: None,
                })));
            }
            Ok(Err(error)) => job.publish(JobEvent::Finished(Err(error))),
            Err(_) => {}
        }
    }
}

fn submit_preview(
    services: &Arc<PipelineServices>,
    job: &Arc<Job<ImageResponse>>,
    registry: DecoderRegistry,
    decoder: Option<Box<dyn ImageDecoder>>,
    partial: LoadedData,
) -> oneshot::Receiver<PreviewOutcome> {
    let (handle, rx) = services.decode_queue.submit(job.current_priority(), async move {
        let context = DecodingContext {
            data: partial.data.clone(),
            response: partial.response.clone(),
            is_completed: false,
        };
        let mut decoder = match decoder.or_else(|| registry.make_decoder(&context)) {
            Some(decoder) => decoder,
            // The format may not be sniffable yet; retry on the next chunk.
            None => return (None, None, true),
        };
        if !decoder.is_progressive() {
            return (Some(decoder), None, false);
        }
        let preview = decoder.decode(&partial.data, false).unwrap_or(None);
        let preview = preview.map(|mut container| {
            container.is_preview = true;
            container
        });
        (Some(decoder), preview, true)
    });
    job.set_operation(handle);
    rx
}

fn submit_final(
    services: &Arc<PipelineServices>,
    job: &Arc<Job<ImageResponse>>,
    registry: DecoderRegistry,
    decoder: Option<Box<dyn ImageDecoder>>,
    data: LoadedData,
    thumbnail: Option<ThumbnailOptions>,
) -> oneshot::Receiver<Result<ImageContainer, PipelineError>> {
    let (handle, rx) = services.decode_queue.submit(job.current_priority(), async move {
        let context = DecodingContext {
            data: data.data.clone(),
            response: data.response.clone(),
            is_completed: true,
        };
        let mut decoder = match decoder.or_else(|| registry.make_decoder(&context)) {
            Some(decoder) => decoder,
            None => return Err(PipelineError::DecoderNotRegistered { context }),
        };
        let name = decoder.name().to_string();
        match decoder.decode(&data.data, true) {
            Ok(Some(mut container)) => {
                container.is_preview = false;
                if let Some(thumbnail) = thumbnail {
                    container = make_thumbnail(container, &thumbnail);
                }
                Ok(container)
            }
            Ok(None) => Err(PipelineError::DecodingFailed {
                decoder: name,
                context,
                source: Arc::new(DecodeError::new("decoder produced no image for the final data")),
            }),
            Err(error) => Err(PipelineError::DecodingFailed {
                decoder: name,
                context,
                source: Arc::new(error),
            }),
        }
    });
    job.set_operation(handle);
    rx
}
