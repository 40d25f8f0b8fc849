//! End-to-end pipeline scenarios: coalescing, deduplicated processing,
//! progressive previews, cancellation, cache-only loads, resumable
//! downloads, and invalidation.
//!
//! All tests run on a current-thread runtime: nothing executes until the
//! first await, so subscribing to event views right after creating a task
//! observes every event.

mod support;

use futures::StreamExt;
use pixelpipe::cache::Caches;
use pixelpipe::{
    CacheType, ImagePipeline, ImageRequest, ImageSource, PipelineConfiguration, PipelineError,
    RequestOptions, TaskEvent,
};
use std::sync::Arc;
use std::time::Duration;
use support::{png_bytes, test_url, LoadItem, ScanDecoder, TestDataLoader, TEST_URL};

fn pipeline_with(loader: &Arc<TestDataLoader>) -> ImagePipeline {
    let config = PipelineConfiguration::new(loader.clone());
    ImagePipeline::new(config)
}

#[tokio::test]
async fn test_identical_requests_coalesce_into_one_fetch() {
    let loader = TestDataLoader::suspended();
    loader.set(TEST_URL, png_bytes(16, 16));
    let pipeline = pipeline_with(&loader);

    let mut first = pipeline.image_task(ImageRequest::new(test_url()));
    let mut second = pipeline.image_task(ImageRequest::new(test_url()));
    loader.resume();

    let response_a = first.response().await.unwrap();
    let response_b = second.response().await.unwrap();

    assert_eq!(loader.fetch_count(), 1, "coalesced requests share one fetch");
    // Both subscribers observe the same decoded pixels.
    assert!(Arc::ptr_eq(&response_a.container.image, &response_b.container.image));
}

#[tokio::test]
async fn test_processor_prefixes_are_deduplicated() {
    let loader = TestDataLoader::suspended();
    loader.set(TEST_URL, png_bytes(16, 16));
    let pipeline = pipeline_with(&loader);

    let p1 = support::CountingProcessor::new("p1");
    let p2 = support::CountingProcessor::new("p2");

    let mut short_chain = pipeline.image_task(
        ImageRequest::new(test_url()).processors(vec![p1.clone()]),
    );
    let mut long_chain = pipeline.image_task(
        ImageRequest::new(test_url()).processors(vec![p1.clone(), p2.clone()]),
    );
    loader.resume();

    short_chain.response().await.unwrap();
    long_chain.response().await.unwrap();

    assert_eq!(loader.fetch_count(), 1);
    assert_eq!(p1.call_count(), 1, "shared prefix processed once");
    assert_eq!(p2.call_count(), 1);
}

#[tokio::test]
async fn test_progressive_decoding_emits_previews_then_final() {
    let loader = TestDataLoader::new();
    loader.set_items(
        TEST_URL,
        vec![
            LoadItem::Response(pixelpipe::loader::UrlResponse::ok(TEST_URL)),
            // The scripted decoder ignores byte content; each chunk is a
            // preview-capable scan.
            LoadItem::Chunk(bytes::Bytes::from_static(b"scan-1")),
            LoadItem::Delay(Duration::from_millis(100)),
            LoadItem::Chunk(bytes::Bytes::from_static(b"scan-2")),
            LoadItem::Delay(Duration::from_millis(100)),
        ],
    );
    let mut config = PipelineConfiguration::new(loader.clone());
    config.is_progressive_decoding_enabled = true;
    config.decoders.register(Arc::new(ScanDecoder::factory));
    let pipeline = ImagePipeline::new(config);

    let task = pipeline.image_task(ImageRequest::new(test_url()));
    let events: Vec<TaskEvent> = task.events().collect().await;

    let previews: Vec<_> = events
        .iter()
        .filter_map(|event| match event {
            TaskEvent::Preview(response) => Some(response),
            _ => None,
        })
        .collect();
    assert_eq!(previews.len(), 2, "one preview per partial scan");
    assert!(previews.iter().all(|p| p.container.is_preview));

    match events.last() {
        Some(TaskEvent::Finished(Ok(response))) => {
            assert!(!response.container.is_preview);
        }
        other => panic!("expected a successful terminal event, got {other:?}"),
    }

    // The memory cache ends with the final, not a preview.
    let cached = pipeline
        .cache()
        .cached_image(&ImageRequest::new(test_url()), Caches::memory())
        .expect("final image cached");
    assert!(!cached.is_preview);
}

#[tokio::test]
async fn test_cancelling_one_coalesced_subscriber_keeps_the_other_alive() {
    let loader = TestDataLoader::suspended();
    loader.set(TEST_URL, png_bytes(16, 16));
    let pipeline = pipeline_with(&loader);

    let mut first = pipeline.image_task(ImageRequest::new(test_url()));
    let mut second = pipeline.image_task(ImageRequest::new(test_url()));

    first.cancel();
    loader.resume();

    assert!(matches!(
        first.response().await,
        Err(PipelineError::Cancelled)
    ));
    let response = second.response().await.unwrap();
    assert_eq!((response.container.width(), response.container.height()), (16, 16));
    assert_eq!(loader.fetch_count(), 1, "the surviving subscriber keeps the fetch");
}

#[tokio::test]
async fn test_cancelling_the_last_subscriber_cancels_the_work() {
    let loader = TestDataLoader::suspended();
    loader.set(TEST_URL, png_bytes(16, 16));
    let pipeline = pipeline_with(&loader);

    let mut task = pipeline.image_task(ImageRequest::new(test_url()));
    task.cancel();
    assert!(matches!(task.response().await, Err(PipelineError::Cancelled)));
    assert_eq!(loader.fetch_count(), 0, "cancelled before the fetch started");

    // A fresh request gets fresh work.
    loader.resume();
    let mut retry = pipeline.image_task(ImageRequest::new(test_url()));
    retry.response().await.unwrap();
    assert_eq!(loader.fetch_count(), 1);
}

#[tokio::test]
async fn test_cancelled_event_stream_ends_without_a_terminal() {
    let loader = TestDataLoader::suspended();
    loader.set(TEST_URL, png_bytes(16, 16));
    let pipeline = pipeline_with(&loader);

    let task = pipeline.image_task(ImageRequest::new(test_url()));
    let events = task.events();
    task.cancel();

    let collected: Vec<TaskEvent> = events.collect().await;
    assert!(
        !collected
            .iter()
            .any(|event| matches!(event, TaskEvent::Finished(_))),
        "cancelled streams must not emit Finished"
    );
}

#[tokio::test]
async fn test_return_cache_data_dont_load_fails_without_cached_data() {
    let loader = TestDataLoader::new();
    loader.set(TEST_URL, png_bytes(16, 16));
    let pipeline = pipeline_with(&loader);

    let request = ImageRequest::new(test_url()).options(RequestOptions {
        return_cache_data_dont_load: true,
        ..Default::default()
    });
    let mut task = pipeline.image_task(request);

    assert!(matches!(
        task.response().await,
        Err(PipelineError::DataMissingInCache)
    ));
    assert_eq!(loader.fetch_count(), 0);
}

#[tokio::test]
async fn test_memory_cache_fast_path() {
    let loader = TestDataLoader::new();
    loader.set(TEST_URL, png_bytes(16, 16));
    let pipeline = pipeline_with(&loader);

    let mut first = pipeline.image_task(ImageRequest::new(test_url()));
    let response = first.response().await.unwrap();
    assert_eq!(response.cache_type, None);

    let mut second = pipeline.image_task(ImageRequest::new(test_url()));
    let response = second.response().await.unwrap();
    assert_eq!(response.cache_type, Some(CacheType::Memory));
    assert_eq!(loader.fetch_count(), 1);
}

#[tokio::test]
async fn test_reload_ignoring_cached_data_always_fetches() {
    let loader = TestDataLoader::new();
    loader.set(TEST_URL, png_bytes(16, 16));
    let pipeline = pipeline_with(&loader);

    pipeline
        .image_task(ImageRequest::new(test_url()))
        .response()
        .await
        .unwrap();

    let request = ImageRequest::new(test_url()).options(RequestOptions {
        reload_ignoring_cached_data: true,
        ..Default::default()
    });
    let response = pipeline.image_task(request).response().await.unwrap();
    assert_eq!(response.cache_type, None);
    assert_eq!(loader.fetch_count(), 2);
}

#[tokio::test]
async fn test_coalescing_disabled_runs_independent_fetches() {
    let loader = TestDataLoader::suspended();
    loader.set(TEST_URL, png_bytes(16, 16));
    let mut config = PipelineConfiguration::new(loader.clone());
    config.is_task_coalescing_enabled = false;
    let pipeline = ImagePipeline::new(config);

    let mut first = pipeline.image_task(ImageRequest::new(test_url()));
    let mut second = pipeline.image_task(ImageRequest::new(test_url()));
    loader.resume();

    first.response().await.unwrap();
    second.response().await.unwrap();
    assert_eq!(loader.fetch_count(), 2);
}

#[tokio::test]
async fn test_loader_error_surfaces_verbatim() {
    let loader = TestDataLoader::new();
    loader.set_items(
        TEST_URL,
        vec![
            LoadItem::Response(pixelpipe::loader::UrlResponse::ok(TEST_URL)),
            LoadItem::Error("connection reset by peer".into()),
        ],
    );
    let pipeline = pipeline_with(&loader);

    let error = pipeline
        .image_task(ImageRequest::new(test_url()))
        .response()
        .await
        .unwrap_err();
    match error {
        PipelineError::DataLoadingFailed(source) => {
            assert_eq!(source.to_string(), "connection reset by peer");
        }
        other => panic!("expected DataLoadingFailed, got {other}"),
    }
}

#[tokio::test]
async fn test_failing_processor_surfaces_processing_failed() {
    let loader = TestDataLoader::new();
    loader.set(TEST_URL, png_bytes(16, 16));
    let pipeline = pipeline_with(&loader);

    let broken = support::FailingProcessor::new("broken", "kernel must be odd-sized");
    let error = pipeline
        .image_task(ImageRequest::new(test_url()).processors(vec![broken]))
        .response()
        .await
        .unwrap_err();
    match error {
        PipelineError::ProcessingFailed {
            processor,
            context,
            source,
        } => {
            assert_eq!(processor, "broken");
            assert!(context.is_final);
            assert_eq!(source.to_string(), "kernel must be odd-sized");
        }
        other => panic!("expected ProcessingFailed, got {other}"),
    }
}

#[tokio::test]
async fn test_unrecognised_bytes_fail_with_decoder_not_registered() {
    let loader = TestDataLoader::new();
    loader.set(TEST_URL, bytes::Bytes::from_static(b"not an image at all"));
    let pipeline = pipeline_with(&loader);

    let error = pipeline
        .image_task(ImageRequest::new(test_url()))
        .response()
        .await
        .unwrap_err();
    match error {
        PipelineError::DecoderNotRegistered { context } => {
            assert!(context.is_completed);
            assert_eq!(context.data.as_ref(), b"not an image at all");
        }
        other => panic!("expected DecoderNotRegistered, got {other}"),
    }
}

#[tokio::test]
async fn test_truncated_image_fails_with_decoding_failed() {
    let loader = TestDataLoader::new();
    // A valid PNG signature with the rest of the file missing: sniffable,
    // but undecodable.
    loader.set(TEST_URL, png_bytes(16, 16).slice(0..20));
    let pipeline = pipeline_with(&loader);

    let error = pipeline
        .image_task(ImageRequest::new(test_url()))
        .response()
        .await
        .unwrap_err();
    match error {
        PipelineError::DecodingFailed { decoder, context, .. } => {
            assert_eq!(decoder, "default");
            assert!(context.is_completed);
        }
        other => panic!("expected DecodingFailed, got {other}"),
    }
}

#[tokio::test]
async fn test_empty_body_fails_with_data_is_empty() {
    let loader = TestDataLoader::new();
    loader.set_items(
        TEST_URL,
        vec![LoadItem::Response(pixelpipe::loader::UrlResponse::ok(TEST_URL))],
    );
    let pipeline = pipeline_with(&loader);

    let error = pipeline
        .image_task(ImageRequest::new(test_url()))
        .response()
        .await
        .unwrap_err();
    assert!(matches!(error, PipelineError::DataIsEmpty));
}

#[tokio::test]
async fn test_interrupted_download_resumes_with_range_headers() {
    let full = png_bytes(24, 24);
    let half = full.len() / 2;

    let loader = TestDataLoader::new();
    let mut interrupted = pixelpipe::loader::UrlResponse::ok(TEST_URL);
    interrupted.headers = vec![
        ("Accept-Ranges".into(), "bytes".into()),
        ("ETag".into(), "\"v1\"".into()),
    ];
    interrupted.expected_content_length = Some(full.len() as u64);
    loader.set_items(
        TEST_URL,
        vec![
            LoadItem::Response(interrupted),
            LoadItem::Chunk(full.slice(0..half)),
            LoadItem::Error("connection dropped".into()),
        ],
    );
    let pipeline = pipeline_with(&loader);

    let error = pipeline
        .image_task(ImageRequest::new(test_url()))
        .response()
        .await
        .unwrap_err();
    assert!(matches!(error, PipelineError::DataLoadingFailed(_)));

    // Second attempt: the server honours the range request.
    let mut resumed = pixelpipe::loader::UrlResponse::ok(TEST_URL);
    resumed.status_code = 206;
    resumed.expected_content_length = Some((full.len() - half) as u64);
    loader.set_items(
        TEST_URL,
        vec![
            LoadItem::Response(resumed),
            LoadItem::Chunk(full.slice(half..)),
        ],
    );

    let response = pipeline
        .image_task(ImageRequest::new(test_url()))
        .response()
        .await
        .unwrap();
    assert_eq!(
        (response.container.width(), response.container.height()),
        (24, 24),
        "spliced bytes decode to the full image"
    );
    assert_eq!(loader.fetch_count(), 2);

    // The resuming request carried the validator headers.
    let second_request = &loader.requests()[1];
    match second_request.source() {
        ImageSource::UrlRequest(url_request) => {
            let range = url_request
                .headers
                .iter()
                .find(|(name, _)| name == "Range")
                .map(|(_, value)| value.as_str());
            assert_eq!(range, Some(format!("bytes={half}-").as_str()));
            let if_range = url_request
                .headers
                .iter()
                .find(|(name, _)| name == "If-Range")
                .map(|(_, value)| value.as_str());
            assert_eq!(if_range, Some("\"v1\""));
        }
        other => panic!("expected a URL request with headers, got {other:?}"),
    }
}

#[tokio::test]
async fn test_invalidate_fails_live_and_future_tasks() {
    let loader = TestDataLoader::suspended();
    loader.set(TEST_URL, png_bytes(16, 16));
    let pipeline = pipeline_with(&loader);

    let mut live = pipeline.image_task(ImageRequest::new(test_url()));
    pipeline.invalidate();

    assert!(matches!(
        live.response().await,
        Err(PipelineError::PipelineInvalidated)
    ));

    let mut late = pipeline.image_task(ImageRequest::new(test_url()));
    assert!(matches!(
        late.response().await,
        Err(PipelineError::PipelineInvalidated)
    ));
    assert_eq!(pipeline.live_job_count(), 0);
}

#[tokio::test]
async fn test_data_task_returns_original_bytes() {
    let data = png_bytes(16, 16);
    let loader = TestDataLoader::new();
    loader.set(TEST_URL, data.clone());
    let pipeline = pipeline_with(&loader);

    let mut task = pipeline.data_task(ImageRequest::new(test_url()));
    let response = task.response().await.unwrap();
    assert_eq!(response.data, data);
    assert_eq!(response.url_response.unwrap().status_code, 200);
}

#[tokio::test]
async fn test_progress_reports_content_length() {
    let data = png_bytes(16, 16);
    let mut response = pixelpipe::loader::UrlResponse::ok(TEST_URL);
    response.expected_content_length = Some(data.len() as u64);

    let loader = TestDataLoader::new();
    loader.set_items(
        TEST_URL,
        vec![LoadItem::Response(response), LoadItem::Chunk(data.clone())],
    );
    let pipeline = pipeline_with(&loader);

    let task = pipeline.data_task(ImageRequest::new(test_url()));
    let updates: Vec<_> = task.progress().collect().await;

    assert!(!updates.is_empty());
    let last = updates.last().unwrap();
    assert_eq!(last.completed, data.len() as u64);
    assert_eq!(last.total, Some(data.len() as u64));
    // Progress is monotonically non-decreasing.
    assert!(updates.windows(2).all(|w| w[0].completed <= w[1].completed));
}

#[tokio::test]
async fn test_publisher_source_loads_without_the_loader() {
    let loader = TestDataLoader::new();
    let pipeline = pipeline_with(&loader);

    let publisher = pixelpipe::DataPublisher::from_bytes("custom-image-1", png_bytes(10, 10));
    let mut task = pipeline.image_task(ImageRequest::with_publisher(publisher));

    let response = task.response().await.unwrap();
    assert_eq!((response.container.width(), response.container.height()), (10, 10));
    assert_eq!(loader.fetch_count(), 0);
}
