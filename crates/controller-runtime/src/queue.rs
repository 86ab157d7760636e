//! Deduplicating, rate-limited work queue.
//!
//! The queue tracks three sets per item:
//! - *pending*: waiting in FIFO order to be handed to a worker
//! - *dirty*: needs processing (pending, or re-added while in flight)
//! - *processing*: currently held by a worker
//!
//! An item is in `pending` at most once, and an item that is re-added while
//! a worker holds it is only re-queued when that worker calls [`WorkQueue::done`].
//! Together this guarantees that a key is never processed by two workers at
//! the same time and that bursts of enqueues collapse into one attempt.

use crate::background::panic_message;
use crate::backoff::RetryBackoff;
use crate::config::QueueConfig;
use crate::metrics::QueueMetrics;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, trace, warn};

/// Item types a [`WorkQueue`] can hold.
pub trait QueueKey: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

impl<T> QueueKey for T where T: Clone + Eq + Hash + fmt::Display + Send + Sync + 'static {}

/// A deduplicating retry queue drained by one or more workers.
///
/// Cloning yields another handle to the same queue.
pub struct WorkQueue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    name: String,
    state: Mutex<State<T>>,
    notify: Notify,
    /// Cancelled on shutdown; pending delayed re-adds listen to it.
    closed: CancellationToken,
    backoff: RetryBackoff,
    max_requeues: Option<u32>,
    metrics: Option<QueueMetrics>,
}

struct State<T> {
    pending: VecDeque<T>,
    dirty: HashSet<T>,
    processing: HashSet<T>,
    failures: HashMap<T, u32>,
    shutting_down: bool,
}

impl<T> Clone for WorkQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T> fmt::Debug for WorkQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkQueue")
            .field("name", &self.shared.name)
            .finish_non_exhaustive()
    }
}

impl<T: QueueKey> WorkQueue<T> {
    /// Create an empty queue.
    pub fn new(name: impl Into<String>, config: &QueueConfig) -> Self {
        let name = name.into();
        let metrics = config.metrics.as_ref().map(|m| m.for_queue(&name));
        Self {
            shared: Arc::new(Shared {
                name,
                state: Mutex::new(State {
                    pending: VecDeque::new(),
                    dirty: HashSet::new(),
                    processing: HashSet::new(),
                    failures: HashMap::new(),
                    shutting_down: false,
                }),
                notify: Notify::new(),
                closed: CancellationToken::new(),
                backoff: config.retry_backoff(),
                max_requeues: config.max_requeues,
                metrics,
            }),
        }
    }

    /// Queue name, used in logs and metric labels.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Add an item. Collapses with an identical item that is already pending.
    pub fn add(&self, item: T) {
        let mut state = self.shared.state.lock();
        if state.shutting_down {
            return;
        }
        if !state.dirty.insert(item.clone()) {
            trace!(queue = %self.shared.name, key = %item, "already pending");
            return;
        }
        if state.processing.contains(&item) {
            // Re-queued by done() once the current attempt finishes
            return;
        }
        state.pending.push_back(item);
        self.shared.record_depth(&state);
        drop(state);
        self.shared.notify.notify_one();
    }

    /// Add an item once `delay` has elapsed, unless the queue shuts down first.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn add_after(&self, item: T, delay: Duration) {
        if self.is_shutting_down() {
            return;
        }
        if delay.is_zero() {
            self.add(item);
            return;
        }
        let queue = self.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = queue.shared.closed.cancelled() => {}
                () = tokio::time::sleep(delay) => queue.add(item),
            }
        });
    }

    /// Re-add a failed item after its backoff delay and bump its retry count.
    ///
    /// Returns the delay that was applied.
    pub fn add_rate_limited(&self, item: T) -> Duration {
        let delay = {
            let mut state = self.shared.state.lock();
            let count = state.failures.entry(item.clone()).or_insert(0);
            let delay = self.shared.backoff.delay_for(*count);
            *count = count.saturating_add(1);
            delay
        };
        self.add_after(item, delay);
        delay
    }

    /// Reset the retry count of an item.
    pub fn forget(&self, item: &T) {
        self.shared.state.lock().failures.remove(item);
    }

    /// How many times an item has been re-added after a failure.
    #[must_use]
    pub fn num_requeues(&self, item: &T) -> u32 {
        self.shared
            .state
            .lock()
            .failures
            .get(item)
            .copied()
            .unwrap_or(0)
    }

    /// Number of items waiting to be handed to a worker.
    #[must_use]
    pub fn len(&self) -> usize {
        self.shared.state.lock().pending.len()
    }

    /// Whether no item is waiting.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether [`WorkQueue::shut_down`] has been called.
    #[must_use]
    pub fn is_shutting_down(&self) -> bool {
        self.shared.state.lock().shutting_down
    }

    /// Stop handing out items, drop pending retries and wake idle workers.
    pub fn shut_down(&self) {
        self.shared.state.lock().shutting_down = true;
        self.shared.closed.cancel();
        self.shared.notify.notify_waiters();
    }

    /// Wait for the next item. Returns `None` once the queue is shut down.
    ///
    /// The caller owns the item until it calls [`WorkQueue::done`].
    pub async fn get(&self) -> Option<T> {
        loop {
            // Registered before inspecting state so no wakeup is missed
            let notified = self.shared.notify.notified();
            {
                let mut state = self.shared.state.lock();
                if state.shutting_down {
                    return None;
                }
                if let Some(item) = state.pending.pop_front() {
                    state.dirty.remove(&item);
                    state.processing.insert(item.clone());
                    self.shared.record_depth(&state);
                    return Some(item);
                }
            }
            notified.await;
        }
    }

    /// Release an item obtained from [`WorkQueue::get`].
    ///
    /// If the item was re-added while in flight it becomes pending again.
    pub fn done(&self, item: &T) {
        let mut state = self.shared.state.lock();
        state.processing.remove(item);
        if state.dirty.contains(item) {
            state.pending.push_back(item.clone());
            self.shared.record_depth(&state);
            drop(state);
            self.shared.notify.notify_one();
        }
    }

    /// Spawn `workers` tasks draining the queue with `handler`.
    ///
    /// The queue shuts down when `shutdown` fires. Workers finish the item in
    /// hand and then exit; a running handler is never interrupted.
    pub fn spawn_workers<H, Fut>(
        &self,
        tasks: &TaskTracker,
        shutdown: &CancellationToken,
        workers: usize,
        handler: H,
    ) where
        H: Fn(T) -> Fut + Clone + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let queue = self.clone();
        let token = shutdown.clone();
        tasks.spawn(async move {
            token.cancelled().await;
            queue.shut_down();
        });

        for worker in 0..workers {
            let queue = self.clone();
            let handler = handler.clone();
            tasks.spawn(async move { queue.worker_loop(worker, handler).await });
        }
    }

    async fn worker_loop<H, Fut>(self, worker: usize, handler: H)
    where
        H: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        debug!(queue = %self.shared.name, worker, "Worker started");
        while let Some(item) = self.get().await {
            self.process(item, &handler).await;
        }
        debug!(queue = %self.shared.name, worker, "Worker stopped");
    }

    async fn process<H, Fut>(&self, item: T, handler: &H)
    where
        H: Fn(T) -> Fut,
        Fut: Future<Output = anyhow::Result<()>>,
    {
        let attempt = AssertUnwindSafe(async { handler(item.clone()).await })
            .catch_unwind()
            .await;
        let result = match attempt {
            Ok(result) => result,
            Err(panic) => Err(anyhow::anyhow!("handler panicked: {}", panic_message(&*panic))),
        };

        match result {
            Ok(()) => {
                self.forget(&item);
                if let Some(metrics) = &self.shared.metrics {
                    metrics.succeeded.inc();
                }
                trace!(queue = %self.shared.name, key = %item, "Reconciled");
            }
            Err(err) => self.requeue_failed(&item, &err),
        }
        self.done(&item);
    }

    fn requeue_failed(&self, item: &T, err: &anyhow::Error) {
        if let Some(metrics) = &self.shared.metrics {
            metrics.failed.inc();
        }

        let retries = self.num_requeues(item);
        if self.shared.max_requeues.is_some_and(|max| retries >= max) {
            error!(
                queue = %self.shared.name,
                key = %item,
                retries,
                error = %err,
                "Dropping key after exhausting retries"
            );
            self.forget(item);
            if let Some(metrics) = &self.shared.metrics {
                metrics.dropped.inc();
            }
            return;
        }

        let delay = self.add_rate_limited(item.clone());
        if let Some(metrics) = &self.shared.metrics {
            metrics.retries.inc();
        }
        warn!(
            queue = %self.shared.name,
            key = %item,
            retries = retries.saturating_add(1),
            delay = ?delay,
            error = %err,
            "Reconciliation failed, requeueing"
        );
    }
}

impl<T> Shared<T> {
    fn record_depth(&self, state: &State<T>) {
        if let Some(metrics) = &self.metrics {
            metrics
                .depth
                .set(i64::try_from(state.pending.len()).unwrap_or(i64::MAX));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::sync::mpsc;

    fn queue(config: &QueueConfig) -> WorkQueue<String> {
        WorkQueue::new("test", config)
    }

    #[tokio::test]
    async fn test_duplicate_adds_collapse() {
        let q = queue(&QueueConfig::default());
        q.add("ns/foo".to_string());
        q.add("ns/foo".to_string());
        assert_eq!(q.len(), 1);

        let item = q.get().await.unwrap();
        assert_eq!(item, "ns/foo");
        q.done(&item);
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_processing_is_deferred_until_done() {
        let q = queue(&QueueConfig::default());
        q.add("a".to_string());
        let item = q.get().await.unwrap();

        q.add("a".to_string());
        q.add("a".to_string());
        // Not handed out again while in flight
        assert!(q.is_empty());

        q.done(&item);
        assert_eq!(q.len(), 1);
        assert_eq!(q.get().await.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_fifo_across_keys() {
        let q = queue(&QueueConfig::default());
        q.add("a".to_string());
        q.add("b".to_string());
        q.add("a".to_string());
        assert_eq!(q.get().await.as_deref(), Some("a"));
        assert_eq!(q.get().await.as_deref(), Some("b"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_delays_grow_and_forget_resets() {
        let q = queue(&QueueConfig::default());
        let key = "ns/foo".to_string();

        assert_eq!(q.add_rate_limited(key.clone()), Duration::from_millis(5));
        assert_eq!(q.add_rate_limited(key.clone()), Duration::from_millis(10));
        assert_eq!(q.num_requeues(&key), 2);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(q.len(), 1);

        q.forget(&key);
        assert_eq!(q.num_requeues(&key), 0);
    }

    #[tokio::test]
    async fn test_shut_down_wakes_waiters_and_rejects_adds() {
        let q = queue(&QueueConfig::default());
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.get().await })
        };
        tokio::task::yield_now().await;

        q.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        q.add("late".to_string());
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn test_pending_items_not_handed_out_after_shut_down() {
        let q = queue(&QueueConfig::default());
        q.add("a".to_string());
        q.shut_down();
        assert_eq!(q.get().await, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failing_handler_retries_then_succeeds() {
        let q = queue(&QueueConfig::default().workers(1));
        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));

        let handler = {
            let q = q.clone();
            let attempts = Arc::clone(&attempts);
            move |key: String| {
                let observed = q.num_requeues(&key);
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                async move {
                    if attempt < 3 {
                        anyhow::bail!("transient failure {attempt}");
                    }
                    tx.send(observed).unwrap();
                    anyhow::Ok(())
                }
            }
        };
        q.spawn_workers(&tasks, &shutdown, 1, handler);
        q.add("ns/foo".to_string());

        let observed = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(observed, 3);
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
        assert_eq!(q.num_requeues(&"ns/foo".to_string()), 0);

        shutdown.cancel();
        tasks.close();
        tasks.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_key_dropped_after_max_requeues() {
        let q = queue(&QueueConfig::default().max_requeues(Some(2)));
        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let attempts = Arc::new(AtomicUsize::new(0));

        let handler = {
            let attempts = Arc::clone(&attempts);
            move |_key: String| {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err::<(), _>(anyhow::anyhow!("permanent failure")) }
            }
        };
        q.spawn_workers(&tasks, &shutdown, 1, handler);
        q.add("ns/bad".to_string());

        tokio::time::sleep(Duration::from_secs(5)).await;
        // Initial attempt plus two retries
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
        assert_eq!(q.num_requeues(&"ns/bad".to_string()), 0);
        assert!(q.is_empty());

        shutdown.cancel();
        tasks.close();
        tasks.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_handler_panic_is_retried() {
        let q = queue(&QueueConfig::default());
        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let attempts = Arc::new(AtomicUsize::new(0));

        let handler = {
            let attempts = Arc::clone(&attempts);
            move |key: String| {
                let attempt = attempts.fetch_add(1, Ordering::SeqCst);
                let tx = tx.clone();
                async move {
                    assert!(attempt > 0, "first attempt blows up");
                    tx.send(key).unwrap();
                    anyhow::Ok(())
                }
            }
        };
        q.spawn_workers(&tasks, &shutdown, 2, handler);
        q.add("ns/foo".to_string());

        let key = tokio::time::timeout(Duration::from_secs(10), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(key, "ns/foo");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        tasks.close();
        tasks.wait().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_same_key_never_processed_concurrently() {
        let q = queue(&QueueConfig::default());
        let tasks = TaskTracker::new();
        let shutdown = CancellationToken::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let attempts = Arc::new(AtomicUsize::new(0));

        let handler = {
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            let attempts = Arc::clone(&attempts);
            move |_key: String| {
                let in_flight = Arc::clone(&in_flight);
                let max_in_flight = Arc::clone(&max_in_flight);
                let attempts = Arc::clone(&attempts);
                async move {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    attempts.fetch_add(1, Ordering::SeqCst);
                    anyhow::Ok(())
                }
            }
        };
        q.spawn_workers(&tasks, &shutdown, 4, handler);

        q.add("ns/foo".to_string());
        tokio::time::sleep(Duration::from_millis(10)).await;
        for _ in 0..5 {
            q.add("ns/foo".to_string());
        }
        tokio::time::sleep(Duration::from_secs(1)).await;

        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
        // The first attempt plus one merged follow-up
        assert_eq!(attempts.load(Ordering::SeqCst), 2);

        shutdown.cancel();
        tasks.close();
        tasks.wait().await;
    }
}
