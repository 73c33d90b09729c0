//! Serialized execution of client operations.
//!
//! Every operation that touches local state runs on one [`AsyncQueue`], one
//! at a time and in enqueue order. Timers (stream backoff, idle timeouts,
//! garbage collection) are scheduled as delayed operations that land on the
//! same queue when they fire, so tests can fast-forward them with
//! [`AsyncQueue::run_all_delayed_operations_until`].

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_channel::{Receiver, Sender};
use futures::channel::oneshot;
use futures::FutureExt;

use crate::firestore::error::{failed_precondition, internal_error, FirestoreError, FirestoreResult};
use crate::platform::runtime;
use crate::util::backoff::{BackoffSettings, ExponentialBackoff};

#[cfg(not(target_arch = "wasm32"))]
pub type QueueFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
#[cfg(target_arch = "wasm32")]
pub type QueueFuture<T> = Pin<Box<dyn Future<Output = T> + 'static>>;

type DelayedFn = Box<dyn FnOnce() -> QueueFuture<()> + Send>;

/// Identifies the kind of a delayed operation so tests can run timers
/// selectively.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TimerId {
    /// Sentinel matching every timer in `run_all_delayed_operations_until`.
    All,
    ListenStreamIdle,
    ListenStreamConnectionBackoff,
    WriteStreamIdle,
    WriteStreamConnectionBackoff,
    OnlineStateTimeout,
    GarbageCollection,
    AsyncQueueRetry,
}

pub fn terminated_error() -> FirestoreError {
    failed_precondition("The client has already been terminated.")
}

#[cfg(not(target_arch = "wasm32"))]
fn box_queue_future<F, T>(future: F) -> QueueFuture<T>
where
    F: Future<Output = T> + Send + 'static,
{
    future.boxed()
}

#[cfg(target_arch = "wasm32")]
fn box_queue_future<F, T>(future: F) -> QueueFuture<T>
where
    F: Future<Output = T> + Send + 'static,
{
    future.boxed_local()
}

struct DelayedEntry {
    id: u64,
    timer_id: TimerId,
    target_time: Instant,
    fired: AtomicBool,
    op: Mutex<Option<DelayedFn>>,
}

struct QueueInner {
    jobs: Sender<QueueFuture<()>>,
    restricted: AtomicBool,
    delayed: Mutex<Vec<Arc<DelayedEntry>>>,
    next_delayed_id: AtomicU64,
    retry_lock: async_lock::Mutex<()>,
}

#[derive(Clone)]
pub struct AsyncQueue {
    inner: Arc<QueueInner>,
}

impl Default for AsyncQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl AsyncQueue {
    pub fn new() -> Self {
        let (jobs, receiver) = async_channel::unbounded();
        let queue = Self {
            inner: Arc::new(QueueInner {
                jobs,
                restricted: AtomicBool::new(false),
                delayed: Mutex::new(Vec::new()),
                next_delayed_id: AtomicU64::new(0),
                retry_lock: async_lock::Mutex::new(()),
            }),
        };
        start_worker(receiver);
        queue
    }

    /// True once `enqueue_and_initiate_shutdown` was called.
    pub fn is_shutting_down(&self) -> bool {
        self.inner.restricted.load(Ordering::SeqCst)
    }

    /// Runs `op` after every previously enqueued operation and returns its
    /// result. Fails with `FailedPrecondition` once the queue is restricted.
    pub async fn enqueue<T, F>(&self, op: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.is_shutting_down() {
            return Err(terminated_error());
        }
        self.enqueue_even_while_restricted(op).await
    }

    pub fn enqueue_and_forget<F>(&self, op: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        if self.is_shutting_down() {
            log::debug!("AsyncQueue: dropping operation enqueued after shutdown");
            return;
        }
        if self.inner.jobs.try_send(box_queue_future(op)).is_err() {
            log::warn!("AsyncQueue: worker stopped, operation dropped");
        }
    }

    /// Puts the queue into restricted mode and runs `op`. Later calls to
    /// `enqueue` are rejected while already scheduled timers still fire.
    pub async fn enqueue_and_initiate_shutdown<T, F>(&self, op: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.inner.restricted.swap(true, Ordering::SeqCst) {
            return Err(terminated_error());
        }
        self.enqueue_even_while_restricted(op).await
    }

    pub async fn enqueue_even_while_restricted<T, F>(&self, op: F) -> FirestoreResult<T>
    where
        F: Future<Output = FirestoreResult<T>> + Send + 'static,
        T: Send + 'static,
    {
        let (sender, receiver) = oneshot::channel();
        let job = box_queue_future(async move {
            let result = op.await;
            let _ = sender.send(result);
        });
        self.inner
            .jobs
            .send(job)
            .await
            .map_err(|_| internal_error("AsyncQueue worker stopped"))?;
        receiver
            .await
            .map_err(|_| internal_error("AsyncQueue operation was dropped"))?
    }

    /// Schedules `op` to be enqueued after `delay`.
    pub fn enqueue_after_delay<F, Fut>(
        &self,
        timer_id: TimerId,
        delay: Duration,
        op: F,
    ) -> DelayedOperation
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let entry = Arc::new(DelayedEntry {
            id: self.inner.next_delayed_id.fetch_add(1, Ordering::SeqCst),
            timer_id,
            target_time: Instant::now() + delay,
            fired: AtomicBool::new(false),
            op: Mutex::new(Some(Box::new(move || box_queue_future(op())))),
        });
        if let Ok(mut delayed) = self.inner.delayed.lock() {
            delayed.push(Arc::clone(&entry));
        }

        let queue = self.clone();
        let timer_entry = Arc::clone(&entry);
        runtime::spawn_detached(async move {
            runtime::sleep(delay).await;
            queue.fire(&timer_entry).await;
        });

        DelayedOperation {
            queue: self.clone(),
            entry,
        }
    }

    pub fn contains_delayed_operation(&self, timer_id: TimerId) -> bool {
        self.inner
            .delayed
            .lock()
            .map(|delayed| delayed.iter().any(|entry| entry.timer_id == timer_id))
            .unwrap_or(false)
    }

    /// Waits for every operation enqueued so far.
    pub async fn drain(&self) {
        let _ = self
            .enqueue_even_while_restricted(async { Ok(()) })
            .await;
    }

    /// Runs pending delayed operations in target-time order, up to and
    /// including the first one scheduled for `last_timer_id`.
    pub async fn run_all_delayed_operations_until(&self, last_timer_id: TimerId) {
        self.drain().await;
        let mut pending: Vec<Arc<DelayedEntry>> = match self.inner.delayed.lock() {
            Ok(delayed) => delayed.clone(),
            Err(_) => return,
        };
        pending.sort_by_key(|entry| (entry.target_time, entry.id));
        for entry in pending {
            let is_last = last_timer_id != TimerId::All && entry.timer_id == last_timer_id;
            self.fire(&entry).await;
            if is_last {
                break;
            }
        }
    }

    /// Runs `op` on the queue, retrying transient failures with backoff.
    /// Retryable operations run one after another.
    pub fn enqueue_retryable<F>(&self, op: F)
    where
        F: Fn() -> QueueFuture<FirestoreResult<()>> + Send + Sync + 'static,
    {
        let queue = self.clone();
        runtime::spawn_detached(async move {
            let _guard = queue.inner.retry_lock.lock().await;
            let mut backoff =
                ExponentialBackoff::new(BackoffSettings::default(), TimerId::AsyncQueueRetry);
            loop {
                match queue.enqueue(op()).await {
                    Ok(()) => break,
                    Err(err) if !err.is_permanent() && !queue.is_shutting_down() => {
                        log::debug!("AsyncQueue: retrying operation after error: {err}");
                        backoff.wait(&queue).await;
                    }
                    Err(err) => {
                        log::warn!("AsyncQueue: retryable operation failed: {err}");
                        break;
                    }
                }
            }
        });
    }

    async fn fire(&self, entry: &Arc<DelayedEntry>) {
        if entry.fired.swap(true, Ordering::SeqCst) {
            return;
        }
        self.forget(entry);
        let op = entry.op.lock().ok().and_then(|mut op| op.take());
        if let Some(op) = op {
            let _ = self
                .enqueue_even_while_restricted(async move {
                    op().await;
                    Ok(())
                })
                .await;
        }
    }

    fn forget(&self, entry: &DelayedEntry) {
        if let Ok(mut delayed) = self.inner.delayed.lock() {
            delayed.retain(|candidate| candidate.id != entry.id);
        }
    }
}

fn start_worker(receiver: Receiver<QueueFuture<()>>) {
    runtime::spawn_detached(async move {
        while let Ok(job) = receiver.recv().await {
            job.await;
        }
    });
}

/// Handle to a scheduled operation.
pub struct DelayedOperation {
    queue: AsyncQueue,
    entry: Arc<DelayedEntry>,
}

impl DelayedOperation {
    pub fn timer_id(&self) -> TimerId {
        self.entry.timer_id
    }

    /// Prevents the operation from running if it has not fired yet.
    pub fn cancel(&self) {
        if !self.entry.fired.swap(true, Ordering::SeqCst) {
            self.queue.forget(&self.entry);
            if let Ok(mut op) = self.entry.op.lock() {
                op.take();
            }
        }
    }

    /// Runs the operation now instead of waiting for its delay.
    pub async fn skip_delay(&self) {
        self.queue.fire(&self.entry).await;
    }
}

impl std::fmt::Debug for DelayedOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DelayedOperation")
            .field("timer_id", &self.entry.timer_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::error::unavailable;
    use std::sync::atomic::AtomicUsize;

    #[tokio::test]
    async fn operations_run_in_enqueue_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for index in 0..5 {
            let log = Arc::clone(&log);
            queue.enqueue_and_forget(async move {
                runtime::sleep(Duration::from_millis(5 - index)).await;
                log.lock().unwrap().push(index);
            });
        }
        queue.drain().await;
        assert_eq!(*log.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn enqueue_returns_the_operation_result() {
        let queue = AsyncQueue::new();
        let value = queue.enqueue(async { Ok(21 * 2) }).await.unwrap();
        assert_eq!(value, 42);
    }

    #[tokio::test]
    async fn skipping_delays_runs_timers_in_order() {
        let queue = AsyncQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));
        for (timer, delay) in [
            (TimerId::GarbageCollection, 60_000),
            (TimerId::ListenStreamConnectionBackoff, 1_000),
            (TimerId::OnlineStateTimeout, 10_000),
        ] {
            let log = Arc::clone(&log);
            queue.enqueue_after_delay(timer, Duration::from_millis(delay), move || async move {
                log.lock().unwrap().push(timer);
            });
        }

        queue
            .run_all_delayed_operations_until(TimerId::OnlineStateTimeout)
            .await;
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                TimerId::ListenStreamConnectionBackoff,
                TimerId::OnlineStateTimeout
            ]
        );
        assert!(queue.contains_delayed_operation(TimerId::GarbageCollection));
    }

    #[tokio::test]
    async fn cancelled_operations_never_run() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        let operation = queue.enqueue_after_delay(
            TimerId::WriteStreamIdle,
            Duration::from_millis(10),
            move || async move {
                flag.store(true, Ordering::SeqCst);
            },
        );
        operation.cancel();
        queue.run_all_delayed_operations_until(TimerId::All).await;
        assert!(!ran.load(Ordering::SeqCst));
        assert!(!queue.contains_delayed_operation(TimerId::WriteStreamIdle));
    }

    #[tokio::test]
    async fn restricted_mode_rejects_new_work_but_fires_timers() {
        let queue = AsyncQueue::new();
        let ran = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&ran);
        queue.enqueue_after_delay(
            TimerId::GarbageCollection,
            Duration::from_secs(300),
            move || async move {
                flag.store(true, Ordering::SeqCst);
            },
        );

        queue
            .enqueue_and_initiate_shutdown(async { Ok(()) })
            .await
            .unwrap();
        let err = queue.enqueue(async { Ok(()) }).await.unwrap_err();
        assert_eq!(err.message(), "The client has already been terminated.");

        queue.run_all_delayed_operations_until(TimerId::All).await;
        assert!(ran.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn retryable_operations_retry_transient_errors() {
        let queue = AsyncQueue::new();
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&attempts);
        queue.enqueue_retryable(move || {
            let counter = Arc::clone(&counter);
            Box::pin(async move {
                if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(unavailable("offline"))
                } else {
                    Ok(())
                }
            })
        });

        for _ in 0..50 {
            if attempts.load(Ordering::SeqCst) >= 2 {
                break;
            }
            queue.run_all_delayed_operations_until(TimerId::All).await;
            runtime::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}
