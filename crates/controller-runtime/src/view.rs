//! Read-only access to a cache mirror.

use crate::error::NotFound;
use crate::kind::{KindId, Object, ObjectKey};
use kube_runtime::reflector::Store;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

/// Selects objects by namespace and label equality.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListFilter {
    /// Restrict to one namespace; `None` matches every namespace.
    pub namespace: Option<String>,
    /// Labels that must all be present with the given values.
    pub labels: BTreeMap<String, String>,
}

impl ListFilter {
    /// Match every object.
    #[must_use]
    pub fn all() -> Self {
        Self::default()
    }

    /// Match objects in `namespace` only.
    #[must_use]
    pub fn in_namespace(namespace: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            labels: BTreeMap::new(),
        }
    }

    /// Additionally require `key=value`.
    #[must_use]
    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }

    /// Whether `obj` passes the filter.
    pub fn matches<K: kube::Resource>(&self, obj: &K) -> bool {
        let meta = obj.meta();
        if let Some(namespace) = &self.namespace {
            if meta.namespace.as_ref() != Some(namespace) {
                return false;
            }
        }
        self.labels.iter().all(|(key, value)| {
            meta.labels
                .as_ref()
                .and_then(|labels| labels.get(key))
                .is_some_and(|v| v == value)
        })
    }
}

/// Read-only accessor over one cache mirror. Never contacts the API server.
pub struct ReadView<K: Object> {
    kind: KindId,
    store: Store<K>,
}

impl<K: Object> Clone for ReadView<K> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind.clone(),
            store: self.store.clone(),
        }
    }
}

impl<K: Object> fmt::Debug for ReadView<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadView")
            .field("kind", &self.kind)
            .field("len", &self.len())
            .finish()
    }
}

impl<K: Object> ReadView<K> {
    /// Wrap a reflector store.
    #[must_use]
    pub fn new(kind: KindId, store: Store<K>) -> Self {
        Self { kind, store }
    }

    /// Kind served by this view.
    #[must_use]
    pub fn kind(&self) -> &KindId {
        &self.kind
    }

    /// Objects matching `filter`, ordered by key.
    #[must_use]
    pub fn list(&self, filter: &ListFilter) -> Vec<Arc<K>> {
        let mut objects: Vec<(ObjectKey, Arc<K>)> = self
            .store
            .state()
            .into_iter()
            .filter(|obj| filter.matches(obj.as_ref()))
            .filter_map(|obj| ObjectKey::from_object(obj.as_ref()).map(|key| (key, obj)))
            .collect();
        objects.sort_by(|(a, _), (b, _)| a.cmp(b));
        objects.into_iter().map(|(_, obj)| obj).collect()
    }

    /// Look up one object.
    ///
    /// # Errors
    ///
    /// Returns [`NotFound`] when the cache holds no object under `key`.
    pub fn get(&self, key: &ObjectKey) -> Result<Arc<K>, NotFound> {
        self.store.get(&key.to_ref()).ok_or_else(|| NotFound {
            kind: self.kind.clone(),
            key: key.clone(),
        })
    }

    /// Number of cached objects.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether the cache is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheMirror;
    use k8s_openapi::api::core::v1::ConfigMap;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use kube_runtime::watcher;

    fn config_map(namespace: &str, name: &str, app: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                namespace: Some(namespace.to_string()),
                name: Some(name.to_string()),
                labels: Some(BTreeMap::from([("app".to_string(), app.to_string())])),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn populated() -> (CacheMirror<ConfigMap>, ReadView<ConfigMap>) {
        let kind = KindId::of::<ConfigMap>();
        let mut cache = CacheMirror::new(kind.clone());
        cache.apply(&watcher::Event::Init);
        cache.apply(&watcher::Event::InitApply(config_map("b", "web", "web")));
        cache.apply(&watcher::Event::InitApply(config_map("a", "web", "web")));
        cache.apply(&watcher::Event::InitApply(config_map("a", "db", "db")));
        cache.apply(&watcher::Event::InitDone);
        let view = ReadView::new(kind, cache.store());
        (cache, view)
    }

    fn names(objects: &[Arc<ConfigMap>]) -> Vec<String> {
        objects
            .iter()
            .filter_map(|obj| ObjectKey::from_object(obj.as_ref()))
            .map(|key| key.to_string())
            .collect()
    }

    #[test]
    fn test_list_is_ordered_by_key() {
        let (_cache, view) = populated();
        assert_eq!(names(&view.list(&ListFilter::all())), ["a/db", "a/web", "b/web"]);
        assert_eq!(view.len(), 3);
    }

    #[test]
    fn test_list_filters_by_namespace_and_label() {
        let (_cache, view) = populated();
        assert_eq!(names(&view.list(&ListFilter::in_namespace("a"))), ["a/db", "a/web"]);
        assert_eq!(
            names(&view.list(&ListFilter::all().with_label("app", "web"))),
            ["a/web", "b/web"]
        );
        assert!(view
            .list(&ListFilter::in_namespace("b").with_label("app", "db"))
            .is_empty());
    }

    #[test]
    fn test_get_hit_and_miss() {
        let (_cache, view) = populated();
        let hit = view.get(&ObjectKey::namespaced("a", "db")).unwrap();
        assert_eq!(hit.metadata.name.as_deref(), Some("db"));

        let missing = ObjectKey::namespaced("c", "web");
        let err = view.get(&missing).unwrap_err();
        assert_eq!(err.key, missing);
        assert_eq!(err.kind, KindId::of::<ConfigMap>());
    }
}
