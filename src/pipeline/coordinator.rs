//! Job registry and attachment.
//!
//! The coordinator owns one registry per stage, all behind a single mutex:
//! original-data fetches, decodes, per-prefix processing links, and root
//! image loads. Attaching computes the stage key, reuses a live job when
//! one exists (coalescing), or creates the job, registers its removal hook,
//! and lets the caller spawn its body. Jobs remove themselves from the
//! registry when they reach a terminal state.

use crate::container::ImageResponse;
use crate::pipeline::job::{Job, JobEvent, JobSubscription};
use crate::pipeline::stages::{self, LoadedData};
use crate::pipeline::PipelineServices;
use crate::request::{ImageRequest, TaskPriority};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

/// Coalescing key: a stage-specific cache key string plus the mask of
/// options that affect the stage's behaviour. Requests that differ in
/// either never share work. The nonce is zero unless task coalescing is
/// disabled, in which case every attach gets a unique key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct JobKey {
    key: String,
    options_mask: u16,
    nonce: u64,
}

impl JobKey {
    fn new(key: String, options_mask: u16) -> Self {
        Self {
            key,
            options_mask,
            nonce: 0,
        }
    }
}

/// Registry state guarded by the coordinator mutex.
pub(crate) struct CoordinatorState {
    pub invalidated: bool,
    image_jobs: HashMap<JobKey, Arc<Job<ImageResponse>>>,
    process_jobs: HashMap<JobKey, Arc<Job<ImageResponse>>>,
    decode_jobs: HashMap<JobKey, Arc<Job<ImageResponse>>>,
    data_jobs: HashMap<JobKey, Arc<Job<LoadedData>>>,
    next_nonce: u64,
}

/// Owner of the registries.
pub(crate) struct Coordinator {
    pub(crate) state: Mutex<CoordinatorState>,
}

impl Coordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(CoordinatorState {
                invalidated: false,
                image_jobs: HashMap::new(),
                process_jobs: HashMap::new(),
                decode_jobs: HashMap::new(),
                data_jobs: HashMap::new(),
                next_nonce: 0,
            }),
        }
    }

    pub fn is_invalidated(&self) -> bool {
        self.state.lock().unwrap().invalidated
    }

    /// Marks the coordinator invalidated and drains every live job so the
    /// caller can fail them outside the lock.
    pub fn drain_for_invalidation(
        &self,
    ) -> (Vec<Arc<Job<ImageResponse>>>, Vec<Arc<Job<LoadedData>>>) {
        let mut state = self.state.lock().unwrap();
        state.invalidated = true;
        let mut image_jobs: Vec<_> = state.image_jobs.drain().map(|(_, job)| job).collect();
        image_jobs.extend(state.process_jobs.drain().map(|(_, job)| job));
        image_jobs.extend(state.decode_jobs.drain().map(|(_, job)| job));
        let data_jobs = state.data_jobs.drain().map(|(_, job)| job).collect();
        (image_jobs, data_jobs)
    }

    /// Number of live jobs across all registries.
    pub fn live_job_count(&self) -> usize {
        let state = self.state.lock().unwrap();
        state.image_jobs.len()
            + state.process_jobs.len()
            + state.decode_jobs.len()
            + state.data_jobs.len()
    }
}

/// A successful attachment: the (possibly shared) job, this subscriber's
/// guard, and its event receiver.
pub(crate) struct Attachment<T> {
    pub job: Arc<Job<T>>,
    pub subscription: JobSubscription,
    pub events: mpsc::UnboundedReceiver<JobEvent<T>>,
}

type MapSelector<T> = for<'a> fn(&'a mut CoordinatorState) -> &'a mut HashMap<JobKey, Arc<Job<T>>>;

/// Registry lookup-or-create shared by every stage. Returns `None` when
/// the pipeline is invalidated; the boolean is true when a new job was
/// created and its body still needs to be spawned.
fn attach_in<T: Clone + Send + 'static>(
    services: &Arc<PipelineServices>,
    select: MapSelector<T>,
    label: &'static str,
    mut key: JobKey,
    priority: TaskPriority,
) -> Option<(Attachment<T>, bool)> {
    let mut state = services.coordinator.state.lock().unwrap();
    if state.invalidated {
        return None;
    }
    if !services.config.is_task_coalescing_enabled {
        state.next_nonce += 1;
        key.nonce = state.next_nonce;
    }

    if let Some(existing) = select(&mut state).get(&key) {
        let existing = Arc::clone(existing);
        if let Some((subscription, events)) = existing.subscribe(priority) {
            debug!(job = label, "coalesced onto existing job");
            return Some((
                Attachment {
                    job: existing,
                    subscription,
                    events,
                },
                false,
            ));
        }
        // The job was cancelled but not yet removed; replace it below.
    }

    let job = Job::new(label, priority);
    let (subscription, events) = job
        .subscribe(priority)
        .expect("a fresh job accepts subscribers");
    select(&mut state).insert(key.clone(), Arc::clone(&job));

    let weak_services = Arc::downgrade(services);
    let weak_job = Arc::downgrade(&job);
    job.set_on_terminate(move || {
        if let Some(services) = weak_services.upgrade() {
            let mut state = services.coordinator.state.lock().unwrap();
            let map = select(&mut state);
            // Only remove the entry if it is still ours: a cancelled job
            // may already have been replaced under the same key.
            if map
                .get(&key)
                .is_some_and(|current| Arc::as_ptr(current) == weak_job.as_ptr())
            {
                map.remove(&key);
            }
        }
    });

    Some((
        Attachment {
            job,
            subscription,
            events,
        },
        true,
    ))
}

impl PipelineServices {
    /// Attaches to (or creates) the root image job for a request.
    pub(crate) fn attach_image_job(
        self: &Arc<Self>,
        request: &ImageRequest,
        priority: TaskPriority,
    ) -> Option<Attachment<ImageResponse>> {
        let key = JobKey::new(
            crate::cache::image_cache_key(request),
            request.request_options().image_stage_mask(),
        );
        let (attachment, created) =
            attach_in(self, |state| &mut state.image_jobs, "load-image", key, priority)?;
        if created {
            self.runtime.spawn(stages::load_image::run(
                Arc::downgrade(self),
                Arc::clone(&attachment.job),
                request.clone(),
            ));
        }
        Some(attachment)
    }

    /// Attaches to (or creates) the processing job for the request's full
    /// processor chain. The request must carry at least one processor.
    pub(crate) fn attach_process_job(
        self: &Arc<Self>,
        request: &ImageRequest,
        priority: TaskPriority,
    ) -> Option<Attachment<ImageResponse>> {
        debug_assert!(!request.processor_chain().is_empty());
        let key = JobKey::new(
            crate::cache::image_cache_key(request),
            request.request_options().image_stage_mask(),
        );
        let (attachment, created) = attach_in(
            self,
            |state| &mut state.process_jobs,
            "process-image",
            key,
            priority,
        )?;
        if created {
            self.runtime.spawn(stages::process_image::run(
                Arc::downgrade(self),
                Arc::clone(&attachment.job),
                request.clone(),
            ));
        }
        Some(attachment)
    }

    /// Attaches to (or creates) the decode job for a request (processor
    /// chain ignored).
    pub(crate) fn attach_decode_job(
        self: &Arc<Self>,
        request: &ImageRequest,
        priority: TaskPriority,
    ) -> Option<Attachment<ImageResponse>> {
        let request = request.truncated(0);
        let key = JobKey::new(
            crate::cache::image_cache_key(&request),
            request.request_options().image_stage_mask(),
        );
        let (attachment, created) = attach_in(
            self,
            |state| &mut state.decode_jobs,
            "decode-image",
            key,
            priority,
        )?;
        if created {
            self.runtime.spawn(stages::decode_image::run(
                Arc::downgrade(self),
                Arc::clone(&attachment.job),
                request,
            ));
        }
        Some(attachment)
    }

    /// Attaches to (or creates) the original-data fetch job for a request.
    pub(crate) fn attach_data_job(
        self: &Arc<Self>,
        request: &ImageRequest,
        priority: TaskPriority,
    ) -> Option<Attachment<LoadedData>> {
        let key = JobKey::new(
            crate::cache::original_data_key(request),
            request.request_options().data_stage_mask(),
        );
        let (attachment, created) = attach_in(
            self,
            |state| &mut state.data_jobs,
            "fetch-original-data",
            key,
            priority,
        )?;
        if created {
            stages::fetch_data::spawn(self, Arc::clone(&attachment.job), request.clone());
        }
        Some(attachment)
    }
}
