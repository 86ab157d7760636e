//! Resource kinds and object keys.
//!
//! A [`KindId`] names one watched kind within an operator. A
//! [`KindDefinition`] additionally carries the schema of a custom kind that
//! must be registered before anything is watched. [`ObjectKey`] is the
//! identity of a single object and the item type of every work queue.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{CustomResourceExt, Resource};
use serde::de::DeserializeOwned;
use std::fmt;

/// Object types that can be mirrored, listed and reconciled.
///
/// Every generated `k8s-openapi` type and every `#[derive(CustomResource)]`
/// type satisfies this bound.
pub trait Object:
    Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static
{
}

impl<K> Object for K where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + fmt::Debug + Send + Sync + 'static
{
}

/// Identifier of a watched kind, e.g. `Ingress.networking.k8s.io`.
///
/// Core-group kinds are identified by their bare kind name (`Service`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct KindId(String);

impl KindId {
    /// Create an identifier from an arbitrary string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Derive the identifier of a statically typed kind.
    #[must_use]
    pub fn of<K: Resource<DynamicType = ()>>() -> Self {
        let kind = K::kind(&());
        let group = K::group(&());
        if group.is_empty() {
            Self(kind.into_owned())
        } else {
            Self(format!("{kind}.{group}"))
        }
    }

    /// The identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for KindId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for KindId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Declaration of a custom kind that must exist remotely before watching.
///
/// The embedded CRD is opaque to the runtime; only the registrar reads it.
#[derive(Debug, Clone)]
pub struct KindDefinition {
    /// Identifier of the kind this definition registers.
    pub id: KindId,
    /// Full CRD name (`plural.group`).
    pub name: String,
    /// Schema reference handed to the registry.
    pub crd: CustomResourceDefinition,
}

impl KindDefinition {
    /// Build the definition of a `#[derive(CustomResource)]` type.
    #[must_use]
    pub fn of<K>() -> Self
    where
        K: CustomResourceExt + Resource<DynamicType = ()>,
    {
        Self {
            id: KindId::of::<K>(),
            name: K::crd_name().to_string(),
            crd: K::crd(),
        }
    }
}

/// Identity of one object: `namespace/name`, or `name` for cluster-scoped kinds.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ObjectKey {
    /// Namespace, `None` for cluster-scoped objects.
    pub namespace: Option<String>,
    /// Object name.
    pub name: String,
}

impl ObjectKey {
    /// Key of a namespaced object.
    pub fn namespaced(namespace: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            namespace: Some(namespace.into()),
            name: name.into(),
        }
    }

    /// Key of a cluster-scoped object.
    pub fn cluster(name: impl Into<String>) -> Self {
        Self {
            namespace: None,
            name: name.into(),
        }
    }

    /// Key of an object, `None` when the object has no name yet.
    pub fn from_object<K: Resource>(obj: &K) -> Option<Self> {
        let meta = obj.meta();
        meta.name.as_ref().map(|name| Self {
            namespace: meta.namespace.clone(),
            name: name.clone(),
        })
    }

    /// Parse `namespace/name` or `name`.
    #[must_use]
    pub fn parse(key: &str) -> Self {
        match key.split_once('/') {
            Some((namespace, name)) => Self::namespaced(namespace, name),
            None => Self::cluster(key),
        }
    }

    /// Reflector reference used to look the key up in a store.
    pub(crate) fn to_ref<K: Object>(&self) -> kube_runtime::reflector::ObjectRef<K> {
        let obj_ref = kube_runtime::reflector::ObjectRef::new(&self.name);
        match &self.namespace {
            Some(ns) => obj_ref.within(ns),
            None => obj_ref,
        }
    }
}

impl fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{ns}/{}", self.name),
            None => f.write_str(&self.name),
        }
    }
}
