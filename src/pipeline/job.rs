//! Coalesced units of work.
//!
//! A [`Job`] is a reference-counted unit of pipeline work shared by every
//! subscriber whose request coalesces to the same key. Dependent jobs
//! subscribe to their dependencies exactly like public task handles do, so
//! one mechanism drives event fan-out, retention, priority propagation, and
//! cancellation cascade:
//!
//! - a job runs at the maximum priority over its subscribers, recomputed
//!   recursively through its dependency subscription on every change;
//! - a job whose last subscriber detaches cancels its queue operation,
//!   cancels its token, detaches from its dependency (cascading when that
//!   dependency loses its last subscriber too), and removes itself from the
//!   registry;
//! - a terminal event is memoised so subscribers attaching between
//!   completion and registry removal receive a synthetic replay.
//!
//! Events per subscriber are strictly ordered: zero or more `Progress`,
//! zero or more `Intermediate`, then exactly one `Finished`.

use crate::error::PipelineError;
use crate::pipeline::queue::OperationHandle;
use crate::request::TaskPriority;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Identifier of a subscriber within one job.
pub(crate) type SubscriberId = u64;

/// Download progress: bytes received and the expected total, when known.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskProgress {
    /// Bytes received so far.
    pub completed: u64,
    /// Expected total from `Content-Length`, when the server sent one.
    pub total: Option<u64>,
}

/// An event emitted by a job to its subscribers.
#[derive(Clone)]
pub(crate) enum JobEvent<T> {
    /// Download progress (monotonically non-decreasing per job).
    Progress(TaskProgress),
    /// An intermediate value: partial bytes or a preview container.
    Intermediate(T),
    /// The terminal result. Emitted exactly once.
    Finished(Result<T, PipelineError>),
}

/// Type-erased job surface used by subscription guards, which must hold
/// jobs of any value type.
pub(crate) trait AnyJob: Send + Sync {
    /// Updates one subscriber's priority and recomputes the job priority.
    fn update_subscriber_priority(&self, id: SubscriberId, priority: TaskPriority);

    /// Detaches one subscriber. Cancels the job when it was the last one.
    fn unsubscribe(&self, id: SubscriberId);
}

/// Guard representing one attached subscriber. Dropping it detaches.
pub(crate) struct JobSubscription {
    job: Arc<dyn AnyJob>,
    id: SubscriberId,
}

impl JobSubscription {
    /// The subscriber id within the job.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Updates this subscriber's priority.
    pub fn set_priority(&self, priority: TaskPriority) {
        self.job.update_subscriber_priority(self.id, priority);
    }
}

impl Drop for JobSubscription {
    fn drop(&mut self) {
        self.job.unsubscribe(self.id);
    }
}

struct Subscriber<T> {
    priority: TaskPriority,
    sender: mpsc::UnboundedSender<JobEvent<T>>,
}

enum JobState<T> {
    Running,
    Finished(Result<T, PipelineError>),
}

struct JobInner<T> {
    subscribers: HashMap<SubscriberId, Subscriber<T>>,
    next_id: SubscriberId,
    priority: TaskPriority,
    state: JobState<T>,
    operation: Option<OperationHandle>,
    dependency: Option<JobSubscription>,
    on_terminate: Option<Box<dyn FnOnce() + Send>>,
}

/// A coalesced unit of work producing values of type `T`.
pub(crate) struct Job<T> {
    label: &'static str,
    cancel: CancellationToken,
    inner: Mutex<JobInner<T>>,
}

impl<T: Clone + Send + 'static> Job<T> {
    /// Creates a job in the running state with an initial priority.
    pub fn new(label: &'static str, priority: TaskPriority) -> Arc<Self> {
        Arc::new(Self {
            label,
            cancel: CancellationToken::new(),
            inner: Mutex::new(JobInner {
                subscribers: HashMap::new(),
                next_id: 0,
                priority,
                state: JobState::Running,
                operation: None,
                dependency: None,
                on_terminate: None,
            }),
        })
    }

    /// Attaches a subscriber at the given priority.
    ///
    /// Returns the guard plus the event receiver, or `None` when the job
    /// was already cancelled (the caller should create a fresh job). A
    /// subscriber attaching after a success/failure terminal receives a
    /// replay of the terminal event only.
    pub fn subscribe(
        self: &Arc<Self>,
        priority: TaskPriority,
    ) -> Option<(JobSubscription, mpsc::UnboundedReceiver<JobEvent<T>>)> {
        let mut inner = self.inner.lock().unwrap();
        let id = inner.next_id;
        inner.next_id += 1;

        match &inner.state {
            JobState::Finished(result) => {
                if matches!(result, Err(PipelineError::Cancelled)) {
                    return None;
                }
                let (tx, rx) = mpsc::unbounded_channel();
                let _ = tx.send(JobEvent::Finished(result.clone()));
                // The sender is dropped; the receiver drains the replay.
                Some((
                    JobSubscription {
                        job: self.clone(),
                        id,
                    },
                    rx,
                ))
            }
            JobState::Running => {
                let (tx, rx) = mpsc::unbounded_channel();
                inner.subscribers.insert(
                    id,
                    Subscriber {
                        priority,
                        sender: tx,
                    },
                );
                self.recompute_priority(&mut inner);
                Some((
                    JobSubscription {
                        job: self.clone(),
                        id,
                    },
                    rx,
                ))
            }
        }
    }

    /// Delivers an event to every subscriber.
    ///
    /// A `Finished` event memoises the result, releases the dependency
    /// subscription and queue operation, and runs the registry removal
    /// hook. Events published after the terminal are ignored.
    pub fn publish(&self, event: JobEvent<T>) {
        let mut on_terminate = None;
        let mut dependency = None;
        let mut operation = None;
        {
            let mut inner = self.inner.lock().unwrap();
            if matches!(inner.state, JobState::Finished(_)) {
                return;
            }
            match &event {
                JobEvent::Finished(result) => {
                    trace!(job = self.label, ok = result.is_ok(), "job finished");
                    inner.state = JobState::Finished(result.clone());
                    for subscriber in inner.subscribers.values() {
                        let _ = subscriber.sender.send(event.clone());
                    }
                    inner.subscribers.clear();
                    on_terminate = inner.on_terminate.take();
                    dependency = inner.dependency.take();
                    operation = inner.operation.take();
                }
                _ => {
                    for subscriber in inner.subscribers.values() {
                        let _ = subscriber.sender.send(event.clone());
                    }
                }
            }
        }
        // Terminal bookkeeping runs outside the job lock: the dependency
        // guard locks the upstream job and the removal hook locks the
        // registry.
        if let Some(operation) = operation {
            operation.cancel();
        }
        drop(dependency);
        if let Some(on_terminate) = on_terminate {
            on_terminate();
        }
    }

    /// Fails the job and cancels its token, stopping the running body.
    pub fn abort_with(&self, error: PipelineError) {
        self.publish(JobEvent::Finished(Err(error)));
        self.cancel.cancel();
    }

    /// Registers the job's current work-queue operation so priority
    /// changes and cancellation reach the queue.
    pub fn set_operation(&self, handle: OperationHandle) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, JobState::Finished(_)) || self.cancel.is_cancelled() {
            drop(inner);
            handle.cancel();
            return;
        }
        handle.set_priority(inner.priority);
        inner.operation = Some(handle);
    }

    /// Stores the subscription to this job's dependency, syncing its
    /// priority. Dropped (detaching upstream) when this job terminates.
    pub fn set_dependency(&self, subscription: JobSubscription) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, JobState::Finished(_)) || self.cancel.is_cancelled() {
            drop(inner);
            drop(subscription);
            return;
        }
        subscription.set_priority(inner.priority);
        inner.dependency = Some(subscription);
    }

    /// Registers the registry-removal hook, run once on termination.
    pub fn set_on_terminate(&self, hook: impl FnOnce() + Send + 'static) {
        let mut inner = self.inner.lock().unwrap();
        if matches!(inner.state, JobState::Finished(_)) {
            drop(inner);
            hook();
            return;
        }
        inner.on_terminate = Some(Box::new(hook));
    }

    /// The job's current (max-over-subscribers) priority.
    pub fn current_priority(&self) -> TaskPriority {
        self.inner.lock().unwrap().priority
    }

    /// Token cancelled when the job is cancelled or aborted.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Recomputes the job priority and pushes changes to the queue
    /// operation and up the dependency chain. Called under the job lock;
    /// the chain is acyclic and always traversed dependent-to-dependency,
    /// so the nested upstream lock cannot deadlock.
    fn recompute_priority(&self, inner: &mut JobInner<T>) {
        let highest = inner
            .subscribers
            .values()
            .map(|subscriber| subscriber.priority)
            .max()
            .unwrap_or(inner.priority);
        if highest != inner.priority {
            inner.priority = highest;
            if let Some(operation) = &inner.operation {
                operation.set_priority(highest);
            }
            if let Some(dependency) = &inner.dependency {
                dependency.set_priority(highest);
            }
        }
    }
}

impl<T: Clone + Send + 'static> AnyJob for Job<T> {
    fn update_subscriber_priority(&self, id: SubscriberId, priority: TaskPriority) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(subscriber) = inner.subscribers.get_mut(&id) {
            if subscriber.priority != priority {
                subscriber.priority = priority;
                self.recompute_priority(&mut inner);
            }
        }
    }

    fn unsubscribe(&self, id: SubscriberId) {
        let mut on_terminate = None;
        let mut dependency = None;
        let mut operation = None;
        let mut cancelled = false;
        {
            let mut inner = self.inner.lock().unwrap();
            if inner.subscribers.remove(&id).is_none() {
                return;
            }
            if inner.subscribers.is_empty() && matches!(inner.state, JobState::Running) {
                trace!(job = self.label, "last subscriber detached, cancelling");
                inner.state = JobState::Finished(Err(PipelineError::Cancelled));
                on_terminate = inner.on_terminate.take();
                dependency = inner.dependency.take();
                operation = inner.operation.take();
                cancelled = true;
            } else {
                self.recompute_priority(&mut inner);
            }
        }
        if cancelled {
            self.cancel.cancel();
            if let Some(operation) = operation {
                operation.cancel();
            }
            drop(dependency);
            if let Some(on_terminate) = on_terminate {
                on_terminate();
            }
        }
    }
}
