//! Concurrency-bounded task dispatcher.
//!
//! Accepted webhook events are processed in the background so the HTTP
//! caller is acknowledged immediately. At most `max_concurrent` tasks run at
//! once; the rest wait in a FIFO queue. When a task finishes, its worker
//! picks up the next queued task directly, so a freed slot is reused without
//! a scheduling round-trip.
//!
//! Every task runs inside its own spawned future. An error or a panic in one
//! task is logged with the task's event kind and reported through its
//! [`TaskHandle`]; siblings and the dispatcher itself are unaffected.

use serde::Serialize;
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{oneshot, Notify};
use tracing::{debug, error, warn};

use crate::errors::BridgeError;
use crate::observability::metrics;

/// Boxed unit of background work.
pub type TaskFuture = Pin<Box<dyn Future<Output = Result<(), BridgeError>> + Send + 'static>>;

/// Log a progress line every this many started tasks.
const PROGRESS_LOG_INTERVAL: u64 = 100;

/// Diagnostic context carried with each task.
#[derive(Debug, Clone)]
pub struct TaskContext {
    /// Event kind label, used in logs and metrics.
    pub event_kind: String,
    /// Webhook timestamp header of the originating request.
    pub timestamp: String,
}

#[derive(Debug, Error, Clone, PartialEq)]
pub enum TaskError {
    #[error("Task queue is full ({0} pending)")]
    QueueFull(usize),

    #[error("Task failed: {0}")]
    Failed(String),

    #[error("Task panicked")]
    Panicked,

    #[error("Task was dropped before completion")]
    Dropped,
}

/// Resolves to the outcome of a submitted task.
#[derive(Debug)]
pub struct TaskHandle {
    rx: oneshot::Receiver<Result<(), TaskError>>,
}

impl Future for TaskHandle {
    type Output = Result<(), TaskError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(TaskError::Dropped)))
    }
}

/// Snapshot of dispatcher load.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct DispatcherStatus {
    pub queue_length: usize,
    pub running_tasks: usize,
    pub processed_count: u64,
    pub max_concurrent: usize,
    /// 0 means unbounded.
    pub max_queue_length: usize,
}

struct QueuedTask {
    context: TaskContext,
    future: TaskFuture,
    respond_to: oneshot::Sender<Result<(), TaskError>>,
    enqueued_at: Instant,
}

#[derive(Default)]
struct DispatchState {
    queue: VecDeque<QueuedTask>,
    running: usize,
    processed: u64,
}

struct Inner {
    max_concurrent: usize,
    max_queue_length: usize,
    state: Mutex<DispatchState>,
    idle: Notify,
}

/// FIFO dispatcher with a hard parallelism ceiling.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("status", &self.status())
            .finish()
    }
}

impl Dispatcher {
    /// `max_concurrent` is clamped to at least 1. A `max_queue_length` of 0
    /// leaves the backlog unbounded.
    pub fn new(max_concurrent: usize, max_queue_length: usize) -> Self {
        Self {
            inner: Arc::new(Inner {
                max_concurrent: max_concurrent.max(1),
                max_queue_length,
                state: Mutex::new(DispatchState::default()),
                idle: Notify::new(),
            }),
        }
    }

    /// Submit a task. It starts immediately if a slot is free, otherwise it
    /// waits behind everything submitted earlier.
    ///
    /// Must be called from within a Tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `TaskError::QueueFull` when the backlog limit is reached.
    pub fn add_task<F>(&self, context: TaskContext, task: F) -> Result<TaskHandle, TaskError>
    where
        F: Future<Output = Result<(), BridgeError>> + Send + 'static,
    {
        let (respond_to, rx) = oneshot::channel();
        let queued = QueuedTask {
            context,
            future: Box::pin(task),
            respond_to,
            enqueued_at: Instant::now(),
        };

        let (to_start, queue_length, running) = {
            let mut state = self.lock_state();
            if state.running < self.inner.max_concurrent {
                state.running += 1;
                state.processed += 1;
                log_progress(&state);
                (Some(queued), state.queue.len(), state.running)
            } else {
                if self.inner.max_queue_length > 0
                    && state.queue.len() >= self.inner.max_queue_length
                {
                    let pending = state.queue.len();
                    drop(state);
                    warn!(
                        target: "bridge.dispatcher",
                        event_kind = %queued.context.event_kind,
                        pending = pending,
                        "Rejecting task, queue is full"
                    );
                    metrics::record_task_rejected(&queued.context.event_kind);
                    return Err(TaskError::QueueFull(pending));
                }
                state.queue.push_back(queued);
                (None, state.queue.len(), state.running)
            }
        };

        metrics::set_dispatcher_load(queue_length, running);

        if let Some(task) = to_start {
            self.spawn_worker(task);
        }

        Ok(TaskHandle { rx })
    }

    /// Current queue and slot usage.
    pub fn status(&self) -> DispatcherStatus {
        let state = self.lock_state();
        DispatcherStatus {
            queue_length: state.queue.len(),
            running_tasks: state.running,
            processed_count: state.processed,
            max_concurrent: self.inner.max_concurrent,
            max_queue_length: self.inner.max_queue_length,
        }
    }

    /// Wait until nothing is queued or running.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.inner.idle.notified();
            {
                let state = self.lock_state();
                if state.running == 0 && state.queue.is_empty() {
                    return;
                }
            }
            notified.await;
        }
    }

    fn spawn_worker(&self, first: QueuedTask) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let mut current = first;
            loop {
                run_task(current).await;
                match dispatcher.finish_and_next() {
                    Some(next) => current = next,
                    None => break,
                }
            }
        });
    }

    /// Release the finished task's slot, or hand it to the next queued task.
    fn finish_and_next(&self) -> Option<QueuedTask> {
        let (next, queue_length, running) = {
            let mut state = self.lock_state();
            match state.queue.pop_front() {
                Some(next) => {
                    state.processed += 1;
                    log_progress(&state);
                    (Some(next), state.queue.len(), state.running)
                }
                None => {
                    state.running = state.running.saturating_sub(1);
                    (None, 0, state.running)
                }
            }
        };

        metrics::set_dispatcher_load(queue_length, running);
        if next.is_none() && running == 0 {
            self.inner.idle.notify_waiters();
        }
        next
    }

    fn lock_state(&self) -> MutexGuard<'_, DispatchState> {
        match self.inner.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn log_progress(state: &DispatchState) {
    if state.processed % PROGRESS_LOG_INTERVAL == 0 {
        debug!(
            target: "bridge.dispatcher",
            processed = state.processed,
            queue_length = state.queue.len(),
            "Dispatcher progress"
        );
    }
}

async fn run_task(task: QueuedTask) {
    let QueuedTask {
        context,
        future,
        respond_to,
        enqueued_at,
    } = task;

    let started = Instant::now();
    let waited = started.duration_since(enqueued_at);

    // Nested spawn so a panic is caught as a JoinError instead of killing the worker
    let outcome = match tokio::spawn(future).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => {
            error!(
                target: "bridge.dispatcher",
                event_kind = %context.event_kind,
                timestamp = %context.timestamp,
                error = %e,
                "Task execution failed"
            );
            Err(TaskError::Failed(e.to_string()))
        }
        Err(join_error) if join_error.is_panic() => {
            error!(
                target: "bridge.dispatcher",
                event_kind = %context.event_kind,
                timestamp = %context.timestamp,
                "Task panicked"
            );
            Err(TaskError::Panicked)
        }
        Err(join_error) => {
            error!(
                target: "bridge.dispatcher",
                event_kind = %context.event_kind,
                error = %join_error,
                "Task was cancelled"
            );
            Err(TaskError::Dropped)
        }
    };

    let status = match &outcome {
        Ok(()) => "success",
        Err(TaskError::Panicked) => "panic",
        Err(_) => "error",
    };
    metrics::record_task(&context.event_kind, status, waited, started.elapsed());

    // The submitter may have stopped listening
    let _ = respond_to.send(outcome);
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn ctx(kind: &str) -> TaskContext {
        TaskContext {
            event_kind: kind.to_string(),
            timestamp: "1700000000".to_string(),
        }
    }

    #[tokio::test]
    async fn test_single_task_completes() {
        let dispatcher = Dispatcher::new(2, 0);
        let handle = dispatcher
            .add_task(ctx("meeting.created"), async { Ok(()) })
            .unwrap();

        assert_eq!(handle.await, Ok(()));
        dispatcher.wait_idle().await;

        let status = dispatcher.status();
        assert_eq!(status.processed_count, 1);
        assert_eq!(status.running_tasks, 0);
        assert_eq!(status.queue_length, 0);
    }

    #[tokio::test]
    async fn test_never_exceeds_max_concurrent() {
        let dispatcher = Dispatcher::new(3, 0);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..20)
            .map(|_| {
                let running = Arc::clone(&running);
                let peak = Arc::clone(&peak);
                dispatcher
                    .add_task(ctx("meeting.updated"), async move {
                        let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                        peak.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(5)).await;
                        running.fetch_sub(1, Ordering::SeqCst);
                        Ok(())
                    })
                    .unwrap()
            })
            .collect();

        assert!(dispatcher.status().running_tasks <= 3);

        for handle in handles {
            assert_eq!(handle.await, Ok(()));
        }
        dispatcher.wait_idle().await;

        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert!(peak.load(Ordering::SeqCst) >= 1);
        let status = dispatcher.status();
        assert_eq!(status.queue_length, 0);
        assert_eq!(status.running_tasks, 0);
        assert_eq!(status.processed_count, 20);
    }

    #[tokio::test]
    async fn test_fifo_start_order() {
        let dispatcher = Dispatcher::new(1, 0);
        let order = Arc::new(Mutex::new(Vec::new()));

        let handles: Vec<_> = (0..6)
            .map(|i| {
                let order = Arc::clone(&order);
                dispatcher
                    .add_task(ctx("meeting.created"), async move {
                        order.lock().unwrap().push(i);
                        tokio::task::yield_now().await;
                        Ok(())
                    })
                    .unwrap()
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4, 5]);
    }

    #[tokio::test]
    async fn test_failed_task_does_not_block_siblings() {
        let dispatcher = Dispatcher::new(1, 0);

        let failing = dispatcher
            .add_task(ctx("meeting.canceled"), async {
                Err(BridgeError::Downstream("status 500".into()))
            })
            .unwrap();
        let healthy = dispatcher
            .add_task(ctx("meeting.end"), async { Ok(()) })
            .unwrap();

        assert!(matches!(failing.await, Err(TaskError::Failed(msg)) if msg.contains("status 500")));
        assert_eq!(healthy.await, Ok(()));
    }

    #[tokio::test]
    #[allow(clippy::panic)]
    async fn test_panicking_task_is_isolated() {
        let dispatcher = Dispatcher::new(1, 0);

        let panicking = dispatcher
            .add_task(ctx("recording.completed"), async {
                panic!("handler bug");
            })
            .unwrap();
        let healthy = dispatcher
            .add_task(ctx("meeting.created"), async { Ok(()) })
            .unwrap();

        assert_eq!(panicking.await, Err(TaskError::Panicked));
        assert_eq!(healthy.await, Ok(()));

        dispatcher.wait_idle().await;
        assert_eq!(dispatcher.status().running_tasks, 0);
    }

    #[tokio::test]
    async fn test_queue_limit_rejects_when_full() {
        let dispatcher = Dispatcher::new(1, 2);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = dispatcher
            .add_task(ctx("meeting.created"), async move {
                let _ = release_rx.await;
                Ok(())
            })
            .unwrap();
        let queued_a = dispatcher
            .add_task(ctx("meeting.created"), async { Ok(()) })
            .unwrap();
        let queued_b = dispatcher
            .add_task(ctx("meeting.created"), async { Ok(()) })
            .unwrap();

        let status = dispatcher.status();
        assert_eq!(status.running_tasks, 1);
        assert_eq!(status.queue_length, 2);

        let rejected = dispatcher.add_task(ctx("meeting.created"), async { Ok(()) });
        assert_eq!(rejected.unwrap_err(), TaskError::QueueFull(2));

        release_tx.send(()).unwrap();
        assert_eq!(blocker.await, Ok(()));
        assert_eq!(queued_a.await, Ok(()));
        assert_eq!(queued_b.await, Ok(()));
    }

    #[tokio::test]
    async fn test_unbounded_queue_accepts_backlog() {
        let dispatcher = Dispatcher::new(1, 0);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let blocker = dispatcher
            .add_task(ctx("meeting.created"), async move {
                let _ = release_rx.await;
                Ok(())
            })
            .unwrap();
        let backlog: Vec<_> = (0..50)
            .map(|_| {
                dispatcher
                    .add_task(ctx("meeting.updated"), async { Ok(()) })
                    .unwrap()
            })
            .collect();

        assert_eq!(dispatcher.status().queue_length, 50);

        release_tx.send(()).unwrap();
        blocker.await.unwrap();
        for handle in backlog {
            handle.await.unwrap();
        }
        dispatcher.wait_idle().await;
        assert_eq!(dispatcher.status().processed_count, 51);
    }

    #[tokio::test]
    async fn test_dropped_handle_does_not_stop_task() {
        let dispatcher = Dispatcher::new(1, 0);
        let ran = Arc::new(AtomicUsize::new(0));
        let ran_clone = Arc::clone(&ran);

        drop(
            dispatcher
                .add_task(ctx("meeting.end"), async move {
                    ran_clone.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })
                .unwrap(),
        );

        dispatcher.wait_idle().await;
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_zero_max_concurrent_clamped() {
        let dispatcher = Dispatcher::new(0, 0);
        assert_eq!(dispatcher.status().max_concurrent, 1);
    }
}
