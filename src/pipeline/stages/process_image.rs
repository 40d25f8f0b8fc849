//! Processing stage.
//!
//! One job per `(source, processor-prefix)` pair: the job for prefix `k`
//! applies processor `k` to the output of the prefix `k-1` job (or the
//! decode job when `k = 1`). Before attaching its dependency the job
//! probes the memory cache at its own prefix key, so an already-cached
//! intermediate short-circuits the rest of the chain. Previews are
//! processed one at a time with newest-wins coalescing, keeping preview
//! order stable relative to the final.

use crate::container::{CacheType, ImageResponse};
use crate::error::{BoxError, PipelineError};
use crate::pipeline::job::{Job, JobEvent};
use crate::pipeline::PipelineServices;
use crate::process::{ImageProcessor, ProcessingContext};
use crate::request::ImageRequest;
use std::sync::{Arc, Weak};
use tokio::sync::oneshot;

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

    // Reuse an already-cached result for this exact prefix.
    if options.memory_reads_allowed() {
        if let Some(cache) = &services.config.image_cache {
            if let Some(container) = cache.get(&crate::cache::image_cache_key(&request)) {
                if !container.is_preview {
                    job.publish(JobEvent::Finished(Ok(ImageResponse {
                        container,
                        request: request.clone(),
                        url_response: None,
                        cache_type: Some(CacheType::Memory),
                    })));
                    return;
                }
            }
        }
    }

    let chain = request.processor_chain();
    let count = chain.len();
    let processor = Arc::clone(&chain[count - 1]);

    let upstream = if count > 1 {
        services.attach_process_job(&request.truncated(count - 1), job.current_priority())
    } else {
        services.attach_decode_job(&request, job.current_priority())
    };
    let Some(upstream) = upstream else {
        job.publish(JobEvent::Finished(Err(PipelineError::PipelineInvalidated)));
        return;
    };
    let mut events = upstream.events;
    job.set_dependency(upstream.subscription);

    let mut pending: Option<oneshot::Receiver<Option<ImageResponse>>> = None;
    let mut latest: Option<ImageResponse> = None;
    let mut final_input: Option<ImageResponse> = None;

    let final_rx = 'events: loop {
        tokio::select! {
            _ = token.cancelled() => return,
            outcome = async { pending.as_mut().expect("pending preview checked").await },
                if pending.is_some() =>
            {
                pending = None;
                if let Ok(Some(processed)) = outcome {
                    job.publish(JobEvent::Intermediate(processed));
                }
                if let Some(input) = final_input.take() {
                    break 'events submit_final(&services, &job, Arc::clone(&processor), input);
                }
                if let Some(preview) = latest.take() {
                    pending = Some(submit_preview(&services, &job, Arc::clone(&processor), preview));
                }
            }
            event = events.recv() => match event {
                Some(JobEvent::Progress(progress)) => {
                    job.publish(JobEvent::Progress(progress));
                }
                Some(JobEvent::Intermediate(preview)) => {
                    if pending.is_some() {
                        // One preview at a time; the newest wins.
                        latest = Some(preview);
                    } else {
                        pending = Some(submit_preview(&services, &job, Arc::clone(&processor), preview));
                    }
                }
                Some(JobEvent::Finished(Ok(response))) => {
                    if pending.is_some() {
                        final_input = Some(response);
                    } else {
                        break 'events submit_final(&services, &job, Arc::clone(&processor), response);
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
        result = final_rx => {
            if let Ok(result) = result {
                job.publish(JobEvent::Finished(result));
            }
        }
    }
}

fn submit_preview(
    services: &Arc<PipelineServices>,
    job: &Arc<Job<ImageResponse>>,
    processor: Arc<dyn ImageProcessor>,
    input: ImageResponse,
) -> oneshot::Receiver<Option<ImageResponse>> {
    let (handle, rx) = services.process_queue.submit(job.current_priority(), async move {
        let context = ProcessingContext { is_final: false };
        // A processor refusing or failing a preview just drops that preview.
        let processed = processor
            .process(input.container.clone(), &context)
            .unwrap_or(None);
        processed.map(|mut processed| {
            processed.is_preview = true;
            ImageResponse {
                container: processed,
                ..input
            }
        })
    });
    job.set_operation(handle);
    rx
}

fn submit_final(
    services: &Arc<PipelineServices>,
    job: &Arc<Job<ImageResponse>>,
    processor: Arc<dyn ImageProcessor>,
    input: ImageResponse,
) -> oneshot::Receiver<Result<ImageResponse, PipelineError>> {
    let (handle, rx) = services.process_queue.submit(job.current_priority(), async move {
        let context = ProcessingContext { is_final: true };
        match processor.process(input.container.clone(), &context) {
            Ok(Some(mut processed)) => {
                processed.is_preview = false;
                Ok(ImageResponse {
                    container: processed,
                    ..input
                })
            }
            Ok(None) => Err(PipelineError::ProcessingFailed {
                processor: processor.identifier(),
                context,
                source: Arc::from(BoxError::from(
                    "processor produced no image for the final container",
                )),
            }),
            Err(error) => Err(PipelineError::ProcessingFailed {
                processor: processor.identifier(),
                context,
                source: Arc::from(error),
            }),
        }
    });
    job.set_operation(handle);
    rx
}
