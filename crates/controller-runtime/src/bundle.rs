//! Watched resource bundles.
//!
//! A [`WatchedResource`] ties together everything the runtime keeps per kind:
//! the cache mirror and the change stream feeding it, a read view over the
//! cache, and the work queue of keys to reconcile. Bundles are built cold and
//! brought up in two steps by the operator: [`ManagedResource::start`] begins
//! streaming, [`ManagedResource::start_queue`] begins reconciling once every
//! cache has synced.

use crate::cache::CacheMirror;
use crate::config::QueueConfig;
use crate::error::OperatorError;
use crate::kind::{KindId, Object, ObjectKey};
use crate::queue::WorkQueue;
use crate::view::{ListFilter, ReadView};
use async_trait::async_trait;
use futures::StreamExt;
use kube::Api;
use kube_runtime::watcher;
use kube_runtime::WatchStreamExt;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

pub use crate::cache::EventStream;

/// Reconciliation handler for one kind.
///
/// Called with the key of an object that changed. The object may have been
/// deleted in the meantime; handlers look it up in the read view and must be
/// idempotent.
#[async_trait]
pub trait Reconcile: Send + Sync {
    /// Drive the object identified by `key` towards its desired state.
    async fn reconcile(&self, key: &ObjectKey) -> anyhow::Result<()>;
}

#[async_trait]
impl<R: Reconcile + ?Sized> Reconcile for Arc<R> {
    async fn reconcile(&self, key: &ObjectKey) -> anyhow::Result<()> {
        (**self).reconcile(key).await
    }
}

/// [`Reconcile`] implementation backed by an async closure.
pub struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> Reconcile for HandlerFn<F>
where
    F: Fn(ObjectKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    async fn reconcile(&self, key: &ObjectKey) -> anyhow::Result<()> {
        (self.0)(key.clone()).await
    }
}

/// Wrap an async closure as a reconciliation handler.
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(ObjectKey) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    HandlerFn(f)
}

/// Cache mirror, read view and work queue of one kind.
pub struct WatchedResource<K: Object> {
    kind: KindId,
    view: ReadView<K>,
    queue: WorkQueue<ObjectKey>,
    workers: usize,
    synced: watch::Receiver<bool>,
    /// Mirror and stream until `start` hands them to the consumer task.
    cold: Mutex<Option<(CacheMirror<K>, EventStream<K>)>>,
    queue_started: AtomicBool,
}

impl<K: Object> fmt::Debug for WatchedResource<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WatchedResource")
            .field("kind", &self.kind)
            .field("synced", &*self.synced.borrow())
            .field("queued", &self.queue.len())
            .finish_non_exhaustive()
    }
}

impl<K: Object> WatchedResource<K> {
    /// Build a cold bundle fed by `source`.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidConfig`] if `queue` is invalid.
    pub fn new(source: EventStream<K>, queue: &QueueConfig) -> Result<Arc<Self>, OperatorError> {
        queue.validate()?;
        let kind = KindId::of::<K>();
        let cache = CacheMirror::new(kind.clone());
        Ok(Arc::new(Self {
            view: ReadView::new(kind.clone(), cache.store()),
            queue: WorkQueue::new(kind.as_str(), queue),
            workers: queue.workers,
            synced: cache.synced(),
            cold: Mutex::new(Some((cache, source))),
            queue_started: AtomicBool::new(false),
            kind,
        }))
    }

    /// Build a cold bundle watching `api`.
    ///
    /// The watch retries with the watcher's default backoff; transient
    /// errors are logged by the consumer.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidConfig`] if `queue` is invalid.
    pub fn from_api(
        api: Api<K>,
        config: watcher::Config,
        queue: &QueueConfig,
    ) -> Result<Arc<Self>, OperatorError> {
        Self::new(watcher(api, config).default_backoff().boxed(), queue)
    }

    /// Kind of this bundle.
    #[must_use]
    pub fn kind(&self) -> &KindId {
        &self.kind
    }

    /// Read view over the cache.
    #[must_use]
    pub fn view(&self) -> &ReadView<K> {
        &self.view
    }

    /// The work queue.
    #[must_use]
    pub fn queue(&self) -> &WorkQueue<ObjectKey> {
        &self.queue
    }

    /// Enqueue `key` for reconciliation.
    pub fn enqueue(&self, key: ObjectKey) {
        self.queue.add(key);
    }

    /// Enqueue the key of every cached object. Returns how many were queued.
    pub fn resync(&self) -> usize {
        let keys: Vec<_> = self
            .view
            .list(&ListFilter::all())
            .iter()
            .filter_map(|obj| ObjectKey::from_object(obj.as_ref()))
            .collect();
        let queued = keys.len();
        for key in keys {
            self.queue.add(key);
        }
        queued
    }

    /// Whether the cache has received its first complete snapshot.
    #[must_use]
    pub fn is_synced(&self) -> bool {
        *self.synced.borrow()
    }

    /// Spawn the change-stream consumer. Returns immediately.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::AlreadyStarted`] on a second call.
    pub fn start(&self, tasks: &TaskTracker, shutdown: &CancellationToken) -> Result<(), OperatorError> {
        let (cache, source) = self
            .cold
            .lock()
            .take()
            .ok_or_else(|| OperatorError::AlreadyStarted(self.kind.clone()))?;
        tasks.spawn(cache.consume(source, self.queue.clone(), shutdown.clone()));
        Ok(())
    }

    /// Wait until the cache has synced.
    ///
    /// Returns `false` if `shutdown` fires first or the change stream ends
    /// before delivering a snapshot.
    pub async fn wait_synced(&self, shutdown: &CancellationToken) -> bool {
        let mut synced = self.synced.clone();
        tokio::select! {
            synced = async move { synced.wait_for(|synced| *synced).await.is_ok() } => synced,
            () = shutdown.cancelled() => false,
        }
    }

    /// Spawn the queue workers with `handler`.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::NotSynced`] before the cache has synced and
    /// [`OperatorError::AlreadyStarted`] on a second call.
    pub fn start_queue(
        &self,
        tasks: &TaskTracker,
        shutdown: &CancellationToken,
        handler: Arc<dyn Reconcile>,
    ) -> Result<(), OperatorError> {
        if !self.is_synced() {
            return Err(OperatorError::NotSynced(self.kind.clone()));
        }
        if self.queue_started.swap(true, Ordering::SeqCst) {
            return Err(OperatorError::AlreadyStarted(self.kind.clone()));
        }

        info!(kind = %self.kind, workers = self.workers, pending = self.queue.len(), "Starting workers");
        self.queue
            .spawn_workers(tasks, shutdown, self.workers, move |key: ObjectKey| {
                let handler = Arc::clone(&handler);
                async move { handler.reconcile(&key).await }
            });
        Ok(())
    }

    /// Type-erased bundle that only keeps the cache current, for kinds other
    /// handlers read but nothing reconciles. Queued keys are drained without
    /// any work.
    pub fn cache_only(self: Arc<Self>) -> Arc<dyn ManagedResource> {
        self.bind(handler_fn(|_key: ObjectKey| async { anyhow::Ok(()) }))
    }

    /// Attach the reconciliation handler, producing the type-erased bundle
    /// the operator manages.
    pub fn bind<R: Reconcile + 'static>(self: Arc<Self>, handler: R) -> Arc<dyn ManagedResource> {
        Arc::new(Bound {
            resource: self,
            handler: Arc::new(handler),
        })
    }
}

/// A bundle together with its handler, as driven by the operator.
#[async_trait]
pub trait ManagedResource: Send + Sync {
    /// Kind of the bundle.
    fn kind(&self) -> &KindId;

    /// Start the change stream.
    fn start(&self, tasks: &TaskTracker, shutdown: &CancellationToken) -> Result<(), OperatorError>;

    /// Wait for the cache to sync; `false` if `shutdown` fires first.
    async fn wait_synced(&self, shutdown: &CancellationToken) -> bool;

    /// Whether the cache has synced.
    fn is_synced(&self) -> bool;

    /// Start draining the queue with the bound handler.
    fn start_queue(&self, tasks: &TaskTracker, shutdown: &CancellationToken) -> Result<(), OperatorError>;

    /// Re-enqueue every cached object.
    fn resync(&self) -> usize;

    /// The bundle as [`Any`], for typed access through `downcast`.
    fn as_any(&self) -> &dyn Any;
}

impl dyn ManagedResource {
    /// The typed bundle, if this one watches `K`.
    pub fn downcast<K: Object>(&self) -> Option<Arc<WatchedResource<K>>> {
        self.as_any()
            .downcast_ref::<Bound<K>>()
            .map(|bound| Arc::clone(&bound.resource))
    }
}

struct Bound<K: Object> {
    resource: Arc<WatchedResource<K>>,
    handler: Arc<dyn Reconcile>,
}

#[async_trait]
impl<K: Object> ManagedResource for Bound<K> {
    fn kind(&self) -> &KindId {
        self.resource.kind()
    }

    fn start(&self, tasks: &TaskTracker, shutdown: &CancellationToken) -> Result<(), OperatorError> {
        self.resource.start(tasks, shutdown)
    }

    async fn wait_synced(&self, shutdown: &CancellationToken) -> bool {
        self.resource.wait_synced(shutdown).await
    }

    fn is_synced(&self) -> bool {
        self.resource.is_synced()
    }

    fn start_queue(&self, tasks: &TaskTracker, shutdown: &CancellationToken) -> Result<(), OperatorError> {
        self.resource
            .start_queue(tasks, shutdown, Arc::clone(&self.handler))
    }

    fn resync(&self) -> usize {
        self.resource.resync()
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
