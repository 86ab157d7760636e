//! Cache mirror: a local copy of one kind, fed by its change stream.
//!
//! The mirror owns the only writer to its reflector store. Readers get a
//! [`Store`] handle through [`CacheMirror::store`] and never mutate it.

use crate::kind::{KindId, Object, ObjectKey};
use crate::queue::WorkQueue;
use futures::StreamExt;
use futures::stream::BoxStream;
use kube::Resource;
use kube_runtime::reflector::store::Writer;
use kube_runtime::reflector::Store;
use kube_runtime::watcher;
use std::collections::BTreeSet;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

/// Change events for one kind, as produced by `kube_runtime::watcher`.
pub type EventStream<K> = BoxStream<'static, Result<watcher::Event<K>, watcher::Error>>;

/// Local mirror of one resource kind.
pub struct CacheMirror<K: Object> {
    kind: KindId,
    writer: Writer<K>,
    synced: watch::Sender<bool>,
    /// Keys stored when the current (re-)list began.
    before_relist: BTreeSet<ObjectKey>,
    /// Keys delivered by the current (re-)list so far.
    relisted: Vec<ObjectKey>,
}

impl<K: Object> CacheMirror<K> {
    /// Create an empty, unsynced mirror.
    #[must_use]
    pub fn new(kind: KindId) -> Self {
        let (synced, _) = watch::channel(false);
        Self {
            kind,
            writer: Writer::default(),
            synced,
            before_relist: BTreeSet::new(),
            relisted: Vec::new(),
        }
    }

    /// Kind mirrored by this cache.
    #[must_use]
    pub fn kind(&self) -> &KindId {
        &self.kind
    }

    /// Read handle onto the mirrored objects.
    #[must_use]
    pub fn store(&self) -> Store<K> {
        self.writer.as_reader()
    }

    /// Receiver that turns `true` once the first complete snapshot arrived.
    #[must_use]
    pub fn synced(&self) -> watch::Receiver<bool> {
        self.synced.subscribe()
    }

    /// Apply one change event and return the keys that need reconciling.
    ///
    /// The store is updated before any key is returned, so a handler always
    /// observes the revision that triggered it (or a later one).
    pub fn apply(&mut self, event: &watcher::Event<K>) -> Vec<ObjectKey> {
        self.writer.apply_watcher_event(event);

        match event {
            watcher::Event::Apply(obj) => {
                trace!(kind = %self.kind, name = ?obj.meta().name, "Object applied");
                ObjectKey::from_object(obj).into_iter().collect()
            }
            watcher::Event::Delete(obj) => {
                debug!(kind = %self.kind, name = ?obj.meta().name, "Object deleted");
                ObjectKey::from_object(obj).into_iter().collect()
            }
            watcher::Event::Init => {
                debug!(kind = %self.kind, "Listing");
                // The writer keeps serving the old snapshot until InitDone
                self.before_relist = self
                    .store()
                    .state()
                    .iter()
                    .filter_map(|obj| ObjectKey::from_object(&**obj))
                    .collect();
                self.relisted.clear();
                Vec::new()
            }
            watcher::Event::InitApply(obj) => {
                if let Some(key) = ObjectKey::from_object(obj) {
                    self.relisted.push(key);
                }
                Vec::new()
            }
            watcher::Event::InitDone => self.finish_relist(),
        }
    }

    fn finish_relist(&mut self) -> Vec<ObjectKey> {
        let mut keys = std::mem::take(&mut self.relisted);
        let seen: BTreeSet<&ObjectKey> = keys.iter().collect();
        let vanished: Vec<ObjectKey> = self
            .before_relist
            .iter()
            .filter(|key| !seen.contains(key))
            .cloned()
            .collect();
        self.before_relist.clear();

        if !vanished.is_empty() {
            debug!(kind = %self.kind, count = vanished.len(), "Objects vanished across re-list");
        }
        keys.extend(vanished);

        let first = self.synced.send_if_modified(|synced| {
            let changed = !*synced;
            *synced = true;
            changed
        });
        if first {
            info!(kind = %self.kind, objects = keys.len(), "Cache synced");
        } else {
            debug!(kind = %self.kind, objects = keys.len(), "Re-list complete");
        }
        keys
    }

    /// Drain `events` into the mirror until the stream ends or `shutdown` fires,
    /// enqueueing every affected key on `queue`.
    pub async fn consume(
        mut self,
        mut events: EventStream<K>,
        queue: WorkQueue<ObjectKey>,
        shutdown: CancellationToken,
    ) {
        info!(kind = %self.kind, "Starting change stream");
        loop {
            let next = tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                next = events.next() => next,
            };

            match next {
                Some(Ok(event)) => {
                    for key in self.apply(&event) {
                        queue.add(key);
                    }
                }
                Some(Err(err)) => {
                    warn!(kind = %self.kind, error = %err, "Change stream error");
                }
                None => {
                    warn!(kind = %self.kind, "Change stream ended");
                    break;
                }
            }
        }
        debug!(kind = %self.kind, "Change stream stopped");
    }
}
