//! Bounded, priority-aware work queues.
//!
//! Each pipeline stage owns a queue with a fixed concurrency limit. Pending
//! operations are dispatched highest-priority first (FIFO within a
//! priority); an operation's priority can be raised or lowered while it is
//! still pending and the change is honoured at the next dispatch. Cancelled
//! pending operations are dropped without running.

use crate::request::TaskPriority;
use futures::future::BoxFuture;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tracing::trace;

/// A concurrency-bounded queue of prioritised operations.
pub(crate) struct WorkQueue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    label: &'static str,
    runtime: Handle,
    state: Mutex<QueueState>,
}

struct QueueState {
    max_concurrency: usize,
    running: usize,
    pending: Vec<Arc<Operation>>,
    next_seq: u64,
}

struct Operation {
    seq: u64,
    priority: AtomicU8,
    cancelled: AtomicBool,
    future: Mutex<Option<BoxFuture<'static, ()>>>,
}

impl WorkQueue {
    /// Creates a queue dispatching at most `max_concurrency` operations at
    /// once on the given runtime.
    pub fn new(label: &'static str, max_concurrency: usize, runtime: Handle) -> Self {
        assert!(max_concurrency > 0, "max_concurrency must be > 0");
        Self {
            inner: Arc::new(QueueInner {
                label,
                runtime,
                state: Mutex::new(QueueState {
                    max_concurrency,
                    running: 0,
                    pending: Vec::new(),
                    next_seq: 0,
                }),
            }),
        }
    }

    /// Enqueues an operation and returns a handle for priority updates and
    /// cancellation.
    pub fn enqueue<F>(&self, priority: TaskPriority, future: F) -> OperationHandle
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let op = {
            let mut state = self.inner.state.lock().unwrap();
            let op = Arc::new(Operation {
                seq: state.next_seq,
                priority: AtomicU8::new(priority as u8),
                cancelled: AtomicBool::new(false),
                future: Mutex::new(Some(Box::pin(future))),
            });
            state.next_seq += 1;
            state.pending.push(Arc::clone(&op));
            op
        };
        Self::pump(&self.inner);
        OperationHandle {
            queue: Arc::downgrade(&self.inner),
            op,
        }
    }

    /// Enqueues an operation whose result is delivered through a oneshot
    /// channel. The receiver errors if the operation is cancelled before it
    /// runs.
    pub fn submit<T, F>(&self, priority: TaskPriority, future: F) -> (OperationHandle, oneshot::Receiver<T>)
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let handle = self.enqueue(priority, async move {
            let _ = tx.send(future.await);
        });
        (handle, rx)
    }

    /// Number of pending (not yet dispatched) operations.
    #[cfg(test)]
    pub fn pending_count(&self) -> usize {
        self.inner.state.lock().unwrap().pending.len()
    }

    /// Dispatches pending operations while slots are free.
    fn pump(inner: &Arc<QueueInner>) {
        loop {
            let op = {
                let mut state = inner.state.lock().unwrap();
                state
                    .pending
                    .retain(|op| !op.cancelled.load(Ordering::Relaxed));
                if state.running >= state.max_concurrency {
                    return;
                }
                // Highest priority wins; FIFO within a priority level.
                let best = state
                    .pending
                    .iter()
                    .enumerate()
                    .max_by_key(|(_, op)| {
                        (op.priority.load(Ordering::Relaxed), std::cmp::Reverse(op.seq))
                    })
                    .map(|(index, _)| index);
                let Some(index) = best else { return };
                state.running += 1;
                state.pending.remove(index)
            };

            let future = op.future.lock().unwrap().take();
            let Some(future) = future else {
                inner.state.lock().unwrap().running -= 1;
                continue;
            };

            trace!(queue = inner.label, seq = op.seq, "dispatching operation");
            let inner_for_task = Arc::clone(inner);
            inner.runtime.spawn(async move {
                future.await;
                inner_for_task.state.lock().unwrap().running -= 1;
                WorkQueue::pump(&inner_for_task);
            });
        }
    }
}

/// Handle to an enqueued operation.
#[derive(Clone)]
pub(crate) struct OperationHandle {
    queue: Weak<QueueInner>,
    op: Arc<Operation>,
}

impl OperationHandle {
    /// Updates the operation's scheduling priority. Takes effect at the
    /// next dispatch when the operation is still pending.
    pub fn set_priority(&self, priority: TaskPriority) {
        self.op.priority.store(priority as u8, Ordering::Relaxed);
    }

    /// Cancels the operation. A pending operation never runs and its future
    /// is dropped immediately; a running operation is unaffected (the
    /// owning job's cancellation token stops it).
    pub fn cancel(&self) {
        self.op.cancelled.store(true, Ordering::Relaxed);
        *self.op.future.lock().unwrap() = None;
        if let Some(queue) = self.queue.upgrade() {
            let mut state = queue.state.lock().unwrap();
            state.pending.retain(|op| !Arc::ptr_eq(op, &self.op));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    fn queue(concurrency: usize) -> WorkQueue {
        WorkQueue::new("test", concurrency, Handle::current())
    }

    #[tokio::test]
    async fn test_runs_enqueued_operation() {
        let queue = queue(1);
        let (tx, rx) = oneshot::channel();
        queue.enqueue(TaskPriority::Normal, async move {
            let _ = tx.send(42);
        });
        assert_eq!(rx.await.unwrap(), 42);
    }

    #[tokio::test]
    async fn test_submit_returns_value() {
        let queue = queue(2);
        let (_handle, rx) = queue.submit(TaskPriority::Normal, async { "done" });
        assert_eq!(rx.await.unwrap(), "done");
    }

    #[tokio::test]
    async fn test_concurrency_limit_is_respected() {
        let queue = Arc::new(queue(2));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let gate = Arc::new(Semaphore::new(0));

        let mut receivers = Vec::new();
        for _ in 0..6 {
            let in_flight = Arc::clone(&in_flight);
            let peak = Arc::clone(&peak);
            let gate = Arc::clone(&gate);
            let (_handle, rx) = queue.submit(TaskPriority::Normal, async move {
                let current = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(current, Ordering::SeqCst);
                let _permit = gate.acquire().await.unwrap();
                in_flight.fetch_sub(1, Ordering::SeqCst);
            });
            receivers.push(rx);
        }

        tokio::time::sleep(Duration::from_millis(50)).await;
        gate.add_permits(6);
        for rx in receivers {
            rx.await.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 2, "peak concurrency exceeded limit");
    }

    #[tokio::test]
    async fn test_higher_priority_dispatches_first() {
        let queue = queue(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));

        // Occupy the single slot so the next two operations stay pending.
        let blocker_gate = Arc::clone(&gate);
        let (_blocker, blocker_rx) = queue.submit(TaskPriority::Normal, async move {
            let _permit = blocker_gate.acquire().await.unwrap();
        });

        let order_low = Arc::clone(&order);
        queue.enqueue(TaskPriority::Low, async move {
            order_low.lock().unwrap().push("low");
        });
        let order_high = Arc::clone(&order);
        queue.enqueue(TaskPriority::High, async move {
            order_high.lock().unwrap().push("high");
        });

        gate.add_permits(1);
        blocker_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*order.lock().unwrap(), vec!["high", "low"]);
    }

    #[tokio::test]
    async fn test_priority_change_reorders_pending() {
        let queue = queue(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));

        let blocker_gate = Arc::clone(&gate);
        let (_blocker, blocker_rx) = queue.submit(TaskPriority::Normal, async move {
            let _permit = blocker_gate.acquire().await.unwrap();
        });

        let order_a = Arc::clone(&order);
        let handle_a = queue.enqueue(TaskPriority::Low, async move {
            order_a.lock().unwrap().push("a");
        });
        let order_b = Arc::clone(&order);
        queue.enqueue(TaskPriority::Normal, async move {
            order_b.lock().unwrap().push("b");
        });

        // Raise "a" above "b" while both are pending.
        handle_a.set_priority(TaskPriority::VeryHigh);

        gate.add_permits(1);
        blocker_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*order.lock().unwrap(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_cancelled_pending_operation_never_runs() {
        let queue = queue(1);
        let ran = Arc::new(AtomicBool::new(false));
        let gate = Arc::new(Semaphore::new(0));

        let blocker_gate = Arc::clone(&gate);
        let (_blocker, blocker_rx) = queue.submit(TaskPriority::Normal, async move {
            let _permit = blocker_gate.acquire().await.unwrap();
        });

        let ran_flag = Arc::clone(&ran);
        let handle = queue.enqueue(TaskPriority::Normal, async move {
            ran_flag.store(true, Ordering::SeqCst);
        });
        handle.cancel();
        assert_eq!(queue.pending_count(), 0);

        gate.add_permits(1);
        blocker_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_cancelled_submit_errors_the_receiver() {
        let queue = queue(1);
        let gate = Arc::new(Semaphore::new(0));

        let blocker_gate = Arc::clone(&gate);
        let (_blocker, _blocker_rx) = queue.submit(TaskPriority::Normal, async move {
            let _permit = blocker_gate.acquire().await.unwrap();
        });

        let (handle, rx) = queue.submit(TaskPriority::Normal, async { 1 });
        handle.cancel();
        assert!(rx.await.is_err());
        gate.add_permits(1);
    }

    #[tokio::test]
    async fn test_fifo_within_equal_priority() {
        let queue = queue(1);
        let order = Arc::new(Mutex::new(Vec::new()));
        let gate = Arc::new(Semaphore::new(0));

        let blocker_gate = Arc::clone(&gate);
        let (_blocker, blocker_rx) = queue.submit(TaskPriority::Normal, async move {
            let _permit = blocker_gate.acquire().await.unwrap();
        });

        for name in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            queue.enqueue(TaskPriority::Normal, async move {
                order.lock().unwrap().push(name);
            });
        }

        gate.add_permits(1);
        blocker_rx.await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*order.lock().unwrap(), vec!["first", "second", "third"]);
    }
}
