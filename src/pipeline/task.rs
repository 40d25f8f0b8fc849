//! Public task handles.
//!
//! [`ImageTask`] and [`DataTask`] are the handles returned by the pipeline
//! entry points. Each handle owns one subscriber on its coalesced job plus
//! any number of view subscriptions (event/progress/preview streams), all
//! carrying the handle's priority and all detached together on
//! cancellation. Cancelling one handle never affects sibling handles
//! coalesced onto the same job.

use crate::container::{ImageContainer, ImageResponse};
use crate::error::PipelineError;
use crate::loader::UrlResponse;
use crate::pipeline::coordinator::Attachment;
use crate::pipeline::job::{AnyJob, Job, JobEvent, JobSubscription, SubscriberId, TaskProgress};
use crate::pipeline::stages::LoadedData;
use crate::request::TaskPriority;
use bytes::Bytes;
use futures::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::mpsc;

/// An event observed by an image task subscriber.
#[derive(Debug, Clone)]
pub enum TaskEvent {
    /// Download progress.
    Progress(TaskProgress),
    /// A progressive preview (`container.is_preview == true`).
    Preview(ImageResponse),
    /// The terminal result. Always the last event of a stream that was not
    /// cancelled.
    Finished(Result<ImageResponse, PipelineError>),
}

/// Handle state shared between a task and its views.
struct TaskCore<T: Clone + Send + 'static> {
    job: Option<Arc<Job<T>>>,
    primary: Mutex<Option<JobSubscription>>,
    view_ids: Mutex<Vec<SubscriberId>>,
    priority: Mutex<TaskPriority>,
    prebaked: Option<Result<T, PipelineError>>,
    cancelled: AtomicBool,
}

impl<T: Clone + Send + 'static> TaskCore<T> {
    fn attached(attachment: Attachment<T>, priority: TaskPriority) -> (Arc<Self>, mpsc::UnboundedReceiver<JobEvent<T>>) {
        let core = Arc::new(Self {
            job: Some(attachment.job),
            primary: Mutex::new(Some(attachment.subscription)),
            view_ids: Mutex::new(Vec::new()),
            priority: Mutex::new(priority),
            prebaked: None,
            cancelled: AtomicBool::new(false),
        });
        (core, attachment.events)
    }

    fn prebaked(result: Result<T, PipelineError>, priority: TaskPriority) -> (Arc<Self>, mpsc::UnboundedReceiver<JobEvent<T>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(JobEvent::Finished(result.clone()));
        let core = Arc::new(Self {
            job: None,
            primary: Mutex::new(None),
            view_ids: Mutex::new(Vec::new()),
            priority: Mutex::new(priority),
            prebaked: Some(result),
            cancelled: AtomicBool::new(false),
        });
        (core, rx)
    }

    fn set_priority(&self, priority: TaskPriority) {
        *self.priority.lock().unwrap() = priority;
        if let Some(primary) = self.primary.lock().unwrap().as_ref() {
            primary.set_priority(priority);
        }
        if let Some(job) = &self.job {
            for id in self.view_ids.lock().unwrap().iter() {
                job.update_subscriber_priority(*id, priority);
            }
        }
    }

    fn cancel(&self) {
        if self.cancelled.swap(true, Ordering::SeqCst) {
            return;
        }
        drop(self.primary.lock().unwrap().take());
        if let Some(job) = &self.job {
            let ids: Vec<_> = self.view_ids.lock().unwrap().drain(..).collect();
            for id in ids {
                job.unsubscribe(id);
            }
        }
    }

    /// Opens a fresh subscription for a view stream. Returns a closed
    /// receiver when the task is cancelled.
    fn subscribe_view(&self) -> View<T> {
        if self.cancelled.load(Ordering::SeqCst) {
            return View::closed();
        }
        match &self.job {
            Some(job) => match job.subscribe(*self.priority.lock().unwrap()) {
                Some((subscription, events)) => {
                    self.view_ids.lock().unwrap().push(subscription.id());
                    View {
                        _subscription: Some(subscription),
                        receiver: Some(events),
                    }
                }
                None => View::closed(),
            },
            None => {
                let (tx, rx) = mpsc::unbounded_channel();
                if let Some(result) = &self.prebaked {
                    let _ = tx.send(JobEvent::Finished(result.clone()));
                }
                View {
                    _subscription: None,
                    receiver: Some(rx),
                }
            }
        }
    }
}

/// One view subscription: the guard keeps the subscriber attached for the
/// stream's lifetime; dropping the stream detaches it.
struct View<T> {
    _subscription: Option<JobSubscription>,
    receiver: Option<mpsc::UnboundedReceiver<JobEvent<T>>>,
}

impl<T> View<T> {
    fn closed() -> Self {
        Self {
            _subscription: None,
            receiver: None,
        }
    }
}

fn poll_view<T: Clone>(
    view: &mut View<T>,
    done: &mut bool,
    cx: &mut Context<'_>,
) -> Poll<Option<JobEvent<T>>> {
    if *done {
        return Poll::Ready(None);
    }
    let Some(receiver) = view.receiver.as_mut() else {
        return Poll::Ready(None);
    };
    match receiver.poll_recv(cx) {
        Poll::Ready(Some(event)) => {
            if matches!(event, JobEvent::Finished(_)) {
                *done = true;
            }
            Poll::Ready(Some(event))
        }
        Poll::Ready(None) => {
            *done = true;
            Poll::Ready(None)
        }
        Poll::Pending => Poll::Pending,
    }
}

/// Handle to an in-flight (or already satisfied) image load.
///
/// Dropping the handle detaches its subscribers; when they were the job's
/// last, the underlying work is cancelled.
pub struct ImageTask {
    core: Arc<TaskCore<ImageResponse>>,
    events: mpsc::UnboundedReceiver<JobEvent<ImageResponse>>,
    terminal: Option<Result<ImageResponse, PipelineError>>,
}

impl ImageTask {
    pub(crate) fn attached(attachment: Attachment<ImageResponse>, priority: TaskPriority) -> Self {
        let (core, events) = TaskCore::attached(attachment, priority);
        Self {
            core,
            events,
            terminal: None,
        }
    }

    pub(crate) fn prebaked(result: Result<ImageResponse, PipelineError>, priority: TaskPriority) -> Self {
        let (core, events) = TaskCore::prebaked(result, priority);
        Self {
            core,
            events,
            terminal: None,
        }
    }

    /// Updates the priority of this subscriber (and, transitively, of the
    /// coalesced job when this subscriber defines its maximum).
    pub fn set_priority(&self, priority: TaskPriority) {
        self.core.set_priority(priority);
    }

    /// Cancels this subscriber. Sibling tasks coalesced onto the same job
    /// are unaffected; pending awaits fail with
    /// [`PipelineError::Cancelled`] and event streams end without a
    /// `Finished` event.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    /// Awaits the terminal response, skipping progress and previews.
    pub async fn response(&mut self) -> Result<ImageResponse, PipelineError> {
        if let Some(result) = &self.terminal {
            return result.clone();
        }
        loop {
            match self.events.recv().await {
                Some(JobEvent::Finished(result)) => {
                    self.terminal = Some(result.clone());
                    return result;
                }
                Some(_) => continue,
                None => {
                    let result = Err(PipelineError::Cancelled);
                    self.terminal = Some(result.clone());
                    return result;
                }
            }
        }
    }

    /// Awaits the final image container.
    pub async fn image(&mut self) -> Result<ImageContainer, PipelineError> {
        Ok(self.response().await?.container)
    }

    /// A fresh stream of all task events. Views are independent: each call
    /// attaches a new subscriber, and a view opened after completion
    /// replays the terminal event.
    pub fn events(&self) -> TaskEvents {
        TaskEvents {
            view: self.core.subscribe_view(),
            done: false,
        }
    }

    /// A fresh stream of progress updates, ending at the terminal event.
    pub fn progress(&self) -> TaskProgressStream {
        TaskProgressStream {
            view: self.core.subscribe_view(),
            done: false,
        }
    }

    /// A fresh stream of progressive previews, ending at the terminal
    /// event.
    pub fn previews(&self) -> TaskPreviews {
        TaskPreviews {
            view: self.core.subscribe_view(),
            done: false,
        }
    }
}

impl std::fmt::Debug for ImageTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ImageTask")
            .field("cancelled", &self.core.cancelled.load(Ordering::SeqCst))
            .field("settled", &self.terminal.is_some())
            .finish()
    }
}

/// Stream of [`TaskEvent`]s for one image task view.
pub struct TaskEvents {
    view: View<ImageResponse>,
    done: bool,
}

impl Stream for TaskEvents {
    type Item = TaskEvent;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        match poll_view(&mut this.view, &mut this.done, cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(match event {
                JobEvent::Progress(progress) => TaskEvent::Progress(progress),
                JobEvent::Intermediate(response) => TaskEvent::Preview(response),
                JobEvent::Finished(result) => TaskEvent::Finished(result),
            })),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Stream of progress updates for one image task view.
pub struct TaskProgressStream {
    view: View<ImageResponse>,
    done: bool,
}

impl Stream for TaskProgressStream {
    type Item = TaskProgress;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match poll_view(&mut this.view, &mut this.done, cx) {
                Poll::Ready(Some(JobEvent::Progress(progress))) => {
                    return Poll::Ready(Some(progress))
                }
                Poll::Ready(Some(JobEvent::Finished(_))) | Poll::Ready(None) => {
                    return Poll::Ready(None)
                }
                Poll::Ready(Some(_)) => continue,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Stream of progressive previews for one image task view.
pub struct TaskPreviews {
    view: View<ImageResponse>,
    done: bool,
}

impl Stream for TaskPreviews {
    type Item = ImageResponse;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match poll_view(&mut this.view, &mut this.done, cx) {
                Poll::Ready(Some(JobEvent::Intermediate(response))) => {
                    return Poll::Ready(Some(response))
                }
                Poll::Ready(Some(JobEvent::Finished(_))) | Poll::Ready(None) => {
                    return Poll::Ready(None)
                }
                Poll::Ready(Some(_)) => continue,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// The terminal value of a data task.
#[derive(Debug, Clone)]
pub struct DataResponse {
    /// The loaded bytes.
    pub data: Bytes,
    /// Transport metadata, when the bytes came from the network.
    pub url_response: Option<UrlResponse>,
}

/// Handle to an in-flight raw data load.
pub struct DataTask {
    core: Arc<TaskCore<LoadedData>>,
    events: mpsc::UnboundedReceiver<JobEvent<LoadedData>>,
    terminal: Option<Result<DataResponse, PipelineError>>,
}

impl DataTask {
    pub(crate) fn attached(attachment: Attachment<LoadedData>, priority: TaskPriority) -> Self {
        let (core, events) = TaskCore::attached(attachment, priority);
        Self {
            core,
            events,
            terminal: None,
        }
    }

    pub(crate) fn prebaked(result: Result<LoadedData, PipelineError>, priority: TaskPriority) -> Self {
        let (core, events) = TaskCore::prebaked(result, priority);
        Self {
            core,
            events,
            terminal: None,
        }
    }

    /// Updates the priority of this subscriber.
    pub fn set_priority(&self, priority: TaskPriority) {
        self.core.set_priority(priority);
    }

    /// Cancels this subscriber.
    pub fn cancel(&self) {
        self.core.cancel();
    }

    /// Awaits the loaded bytes.
    pub async fn response(&mut self) -> Result<DataResponse, PipelineError> {
        if let Some(result) = &self.terminal {
            return result.clone();
        }
        loop {
            match self.events.recv().await {
                Some(JobEvent::Finished(result)) => {
                    let result = result.map(|loaded| DataResponse {
                        data: loaded.data,
                        url_response: loaded.response,
                    });
                    self.terminal = Some(result.clone());
                    return result;
                }
                Some(_) => continue,
                None => {
                    let result = Err(PipelineError::Cancelled);
                    self.terminal = Some(result.clone());
                    return result;
                }
            }
        }
    }

    /// A fresh stream of progress updates, ending at the terminal event.
    pub fn progress(&self) -> DataTaskProgress {
        DataTaskProgress {
            view: self.core.subscribe_view(),
            done: false,
        }
    }
}

impl std::fmt::Debug for DataTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTask")
            .field("cancelled", &self.core.cancelled.load(Ordering::SeqCst))
            .field("settled", &self.terminal.is_some())
            .finish()
    }
}

/// Stream of progress updates for one data task view.
pub struct DataTaskProgress {
    view: View<LoadedData>,
    done: bool,
}

impl Stream for DataTaskProgress {
    type Item = TaskProgress;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        loop {
            match poll_view(&mut this.view, &mut this.done, cx) {
                Poll::Ready(Some(JobEvent::Progress(progress))) => {
                    return Poll::Ready(Some(progress))
                }
                Poll::Ready(Some(JobEvent::Finished(_))) | Poll::Ready(None) => {
                    return Poll::Ready(None)
                }
                Poll::Ready(Some(_)) => continue,
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}
