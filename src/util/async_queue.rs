use std::collections::VecDeque;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use futures::future::BoxFuture;
use futures::FutureExt;

use crate::error::{cancelled, internal_error, FirestoreResult};
use crate::platform::runtime;
use crate::settings::StreamSettings;
use crate::util::backoff::ExponentialBackoff;
use crate::util::lock;

pub type QueueFuture<'a, T> = BoxFuture<'a, T>;

type Job = Box<dyn FnOnce() -> QueueFuture<'static, ()> + Send>;
type RetryableJob = Arc<dyn Fn() -> QueueFuture<'static, FirestoreResult<()>> + Send + Sync>;

/// Identifies the kind of a delayed operation so tests can fast-forward it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TimerId {
    /// Matches every timer in [`AsyncQueue::run_delayed_operations_early`].
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    ListenStreamHealthCheck,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    WriteStreamHealthCheck,
    OnlineStateTimeout,
    AsyncQueueRetry,
}

struct DelayedEntry {
    id: u64,
    timer_id: TimerId,
    target_time: Instant,
    job: Job,
}

struct QueueState {
    shutting_down: bool,
    delayed: Vec<DelayedEntry>,
    retryable: VecDeque<RetryableJob>,
    retry_backoff: ExponentialBackoff,
}

struct AsyncQueueInner {
    sender: Sender<Job>,
    state: Mutex<QueueState>,
    next_delayed_id: AtomicU64,
}

impl AsyncQueueInner {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        lock(&self.state)
    }

    fn push(&self, job: Job, bypass_shutdown: bool) -> FirestoreResult<()> {
        if !bypass_shutdown && self.state().shutting_down {
            return Err(cancelled("the async queue is shutting down"));
        }
        self.sender
            .try_send(job)
            .map_err(|_| cancelled("the async queue has been shut down"))
    }

    fn fire_delayed(&self, id: u64) {
        let job = {
            let mut state = self.state();
            state
                .delayed
                .iter()
                .position(|entry| entry.id == id)
                .map(|index| state.delayed.remove(index).job)
        };
        if let Some(job) = job {
            if let Err(err) = self.push(job, false) {
                log::debug!("dropping delayed operation: {err}");
            }
        }
    }

    fn remove_delayed(&self, id: u64) -> bool {
        let mut state = self.state();
        let before = state.delayed.len();
        state.delayed.retain(|entry| entry.id != id);
        before != state.delayed.len()
    }
}

/// Single-consumer serial executor.
///
/// Every operation that touches client state runs on this queue, one at a
/// time, in the order it was enqueued. Stream I/O happens elsewhere and
/// re-dispatches its results here.
#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<AsyncQueueInner>,
}

impl fmt::Debug for AsyncQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state();
        f.debug_struct("AsyncQueue")
            .field("shutting_down", &state.shutting_down)
            .field("delayed_operations", &state.delayed.len())
            .field("retryable_operations", &state.retryable.len())
            .finish()
    }
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncQueue {
    pub fn new() -> Self {
        Self::with_retry_backoff(&StreamSettings::default())
    }

    pub fn with_retry_backoff(settings: &StreamSettings) -> Self {
        let (sender, receiver) = async_channel::unbounded();
        let inner = Arc::new(AsyncQueueInner {
            sender,
            state: Mutex::new(QueueState {
                shutting_down: false,
                delayed: Vec::new(),
                retryable: VecDeque::new(),
                retry_backoff: ExponentialBackoff::from_settings(settings),
            }),
            next_delayed_id: AtomicU64::new(1),
        });
        Self::start_worker(receiver);
        Self { inner }
    }

    fn start_worker(receiver: Receiver<Job>) {
        runtime::spawn_detached(async move {
            while let Ok(job) = receiver.recv().await {
                job().await;
            }
            log::debug!("async queue worker stopped");
        });
    }

    pub fn is_shutting_down(&self) -> bool {
        self.inner.state().shutting_down
    }

    /// Enqueues `op` and resolves with its result once it has run.
    ///
    /// Must not be awaited from inside another queue operation.
    pub fn enqueue<F, Fut, T>(&self, op: F) -> impl Future<Output = FirestoreResult<T>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let pushed = self.inner.push(
            Box::new(move || {
                async move {
                    let _ = tx.send(op().await);
                }
                .boxed()
            }),
            false,
        );
        async move {
            pushed?;
            rx.await
                .map_err(|_| cancelled("operation was dropped by the async queue"))?
        }
    }

    pub fn enqueue_and_forget<F, Fut>(&self, op: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        if let Err(err) = self.inner.push(Box::new(move || op().boxed()), false) {
            log::debug!("operation not enqueued: {err}");
        }
    }

    /// Marks the queue as shutting down and runs `op` as the last accepted operation.
    ///
    /// Pending delayed operations are cancelled and later enqueues fail.
    pub fn enqueue_and_initiate_shutdown<F, Fut>(
        &self,
        op: F,
    ) -> impl Future<Output = FirestoreResult<()>> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let already_shutting_down = {
            let mut state = self.inner.state();
            let previous = state.shutting_down;
            state.shutting_down = true;
            state.delayed.clear();
            state.retryable.clear();
            previous
        };

        let (tx, rx) = oneshot::channel();
        let pushed = if already_shutting_down {
            Ok(())
        } else {
            let pushed = self.inner.push(
                Box::new(move || {
                    async move {
                        op().await;
                        let _ = tx.send(());
                    }
                    .boxed()
                }),
                true,
            );
            self.inner.sender.close();
            pushed
        };

        async move {
            pushed?;
            if already_shutting_down {
                return Ok(());
            }
            rx.await
                .map_err(|_| cancelled("shutdown operation was dropped by the async queue"))
        }
    }

    /// Schedules `op` to be enqueued after `delay`.
    pub fn enqueue_after_delay<F, Fut>(&self, timer_id: TimerId, delay: Duration, op: F) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let id = self.inner.next_delayed_id.fetch_add(1, Ordering::SeqCst);
        let operation = DelayedOperation {
            queue: Arc::downgrade(&self.inner),
            id,
            timer_id,
        };

        {
            let mut state = self.inner.state();
            if state.shutting_down {
                return operation;
            }
            state.delayed.push(DelayedEntry {
                id,
                timer_id,
                target_time: Instant::now() + delay,
                job: Box::new(move || op().boxed()),
            });
        }

        let queue = Arc::downgrade(&self.inner);
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            if let Some(inner) = queue.upgrade() {
                inner.fire_delayed(id);
            }
        });
        operation
    }

    /// Enqueues an operation that is retried with backoff while it fails with
    /// a storage transaction error.
    ///
    /// Retryable operations run in FIFO order relative to each other: a later
    /// one waits until every earlier one has completed. Ordinary operations
    /// keep flowing while a retryable operation is backing off.
    pub fn enqueue_retryable<F, Fut>(&self, op: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = FirestoreResult<()>> + Send + 'static,
    {
        let job: RetryableJob = Arc::new(move || op().boxed());
        let is_head = {
            let mut state = self.inner.state();
            if state.shutting_down {
                return;
            }
            state.retryable.push_back(job);
            state.retryable.len() == 1
        };
        if is_head {
            self.run_retryable_head();
        }
    }

    fn run_retryable_head(&self) {
        let queue = self.clone();
        self.enqueue_and_forget(move || async move {
            let head = queue.inner.state().retryable.front().cloned();
            let Some(op) = head else {
                return;
            };
            match op().await {
                Err(err) if err.is_storage_transaction_error() => {
                    let delay = queue.inner.state().retry_backoff.next_delay();
                    log::debug!("retrying operation after storage failure in {delay:?}: {err}");
                    let retry_queue = queue.clone();
                    let _ = queue.enqueue_after_delay(TimerId::AsyncQueueRetry, delay, move || async move {
                        retry_queue.run_retryable_head();
                    });
                }
                result => {
                    if let Err(err) = result {
                        log::error!("retryable operation failed with a permanent error: {err}");
                    }
                    let has_more = {
                        let mut state = queue.inner.state();
                        state.retry_backoff.reset();
                        state.retryable.pop_front();
                        !state.retryable.is_empty()
                    };
                    if has_more {
                        queue.run_retryable_head();
                    }
                }
            }
        });
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .state()
            .delayed
            .iter()
            .any(|entry| timer_id == TimerId::All || entry.timer_id == timer_id)
    }

    /// Runs delayed operations now, in target-time order, up to and including
    /// the first one registered under `last_timer_id`, then waits for them.
    pub async fn run_delayed_operations_early(&self, last_timer_id: TimerId) -> FirestoreResult<()> {
        let jobs = {
            let mut state = self.inner.state();
            state.delayed.sort_by_key(|entry| entry.target_time);
            let count = if last_timer_id == TimerId::All {
                state.delayed.len()
            } else {
                match state
                    .delayed
                    .iter()
                    .position(|entry| entry.timer_id == last_timer_id)
                {
                    Some(index) => index + 1,
                    None => {
                        return Err(internal_error(format!(
                            "no delayed operation registered for {last_timer_id:?}"
                        )))
                    }
                }
            };
            state.delayed.drain(..count).map(|entry| entry.job).collect::<Vec<_>>()
        };

        for job in jobs {
            self.inner.push(job, false)?;
        }
        self.enqueue(|| async { Ok(()) }).await
    }
}

/// Handle to an operation scheduled with [`AsyncQueue::enqueue_after_delay`].
pub struct DelayedOperation {
    queue: Weak<AsyncQueueInner>,
    id: u64,
    timer_id: TimerId,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.timer_id
    }

    /// Cancels the operation if it has not been enqueued yet.
    pub fn cancel(&self) -> bool {
        match self.queue.upgrade() {
            Some(inner) => inner.remove_delayed(self.id),
            None => false,
        }
    }
}

impl fmt::Debug for DelayedOperation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("id", &self.id)
            .field("timer_id", &self.timer_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{invalid_argument, storage_transaction_error};
    use std::sync::atomic::AtomicUsize;

    fn fast_retry_settings() -> StreamSettings {
        StreamSettings {
            initial_backoff: Duration::from_millis(1),
            max_backoff: Duration::from_millis(5),
            backoff_jitter: 0.0,
            ..StreamSettings::default()
        }
    }

    #[tokio::test]
    async fn runs_operations_in_fifo_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let log = Arc::clone(&log);
            queue.enqueue_and_forget(move || async move {
                log.lock().unwrap().push(i);
            });
        }
        let result = queue.enqueue(|| async { Ok(42) }).await.unwrap();
        assert_eq!(result, 42);
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn propagates_operation_errors() {
        let queue = AsyncQueue::new();
        let err = queue
            .enqueue(|| async { Err::<(), _>(invalid_argument("bad")) })
            .await
            .unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
    }

    #[tokio::test]
    async fn cancelled_delayed_operation_never_runs() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);
        let op = queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_millis(10), move || async move {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        assert!(queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        assert!(op.cancel());
        assert!(!queue.contains_delayed_operation(TimerId::ListenStreamIdle));
        runtime::sleep(Duration::from_millis(30)).await;
        queue.enqueue(|| async { Ok(()) }).await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn delayed_operation_runs_after_delay() {
        let queue = AsyncQueue::new();
        let (tx, rx) = oneshot::channel();
        let _op = queue.enqueue_after_delay(TimerId::OnlineStateTimeout, Duration::from_millis(5), move || async move {
            let _ = tx.send(());
        });
        rx.await.unwrap();
        assert!(!queue.contains_delayed_operation(TimerId::OnlineStateTimeout));
    }

    #[tokio::test]
    async fn run_delayed_operations_early_respects_target_time_and_stops_at_timer() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (timer, delay) in [
            (TimerId::WriteStreamIdle, 300),
            (TimerId::ListenStreamIdle, 100),
            (TimerId::OnlineStateTimeout, 200),
        ] {
            let log = Arc::clone(&log);
            let _ = queue.enqueue_after_delay(timer, Duration::from_secs(delay), move || async move {
                log.lock().unwrap().push(timer);
            });
        }

        queue
            .run_delayed_operations_early(TimerId::OnlineStateTimeout)
            .await
            .unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec![TimerId::ListenStreamIdle, TimerId::OnlineStateTimeout]
        );
        assert!(queue.contains_delayed_operation(TimerId::WriteStreamIdle));
    }

    #[tokio::test]
    async fn shutdown_cancels_timers_and_rejects_new_work() {
        let queue = AsyncQueue::new();
        let _ = queue.enqueue_after_delay(TimerId::ListenStreamIdle, Duration::from_secs(60), || async {});
        queue.enqueue_and_initiate_shutdown(|| async {}).await.unwrap();
        assert!(queue.is_shutting_down());
        assert!(!queue.contains_delayed_operation(TimerId::All));
        assert!(queue.enqueue(|| async { Ok(()) }).await.is_err());
    }

    #[tokio::test]
    async fn retryable_operations_retry_storage_failures_in_order() {
        let queue = AsyncQueue::with_retry_backoff(&fast_retry_settings());
        let attempts = Arc::new(AtomicUsize::new(0));
        let log = Arc::new(Mutex::new(Vec::new()));

        {
            let attempts = Arc::clone(&attempts);
            let log = Arc::clone(&log);
            queue.enqueue_retryable(move || {
                let attempts = Arc::clone(&attempts);
                let log = Arc::clone(&log);
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) < 2 {
                        return Err(storage_transaction_error("disk busy"));
                    }
                    log.lock().unwrap().push("first");
                    Ok(())
                }
            });
        }
        {
            let log = Arc::clone(&log);
            queue.enqueue_retryable(move || {
                let log = Arc::clone(&log);
                async move {
                    log.lock().unwrap().push("second");
                    Ok(())
                }
            });
        }
        {
            let log = Arc::clone(&log);
            queue
                .enqueue(move || async move {
                    log.lock().unwrap().push("normal");
                    Ok(())
                })
                .await
                .unwrap();
        }

        for _ in 0..100 {
            if log.lock().unwrap().len() == 3 {
                break;
            }
            runtime::sleep(Duration::from_millis(5)).await;
        }

        let entries = log.lock().unwrap().clone();
        assert_eq!(entries, vec!["normal", "first", "second"]);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }
}
