//! Reconcilers for the kinds ingresses and certificates depend on.
//!
//! A change to a dependency never touches the dependency itself; it queues
//! the ingresses (and certificates) that reference it so they are
//! validated again.

use crate::context::Context;
use async_trait::async_trait;
use controller_runtime::{ListFilter, ObjectKey, Reconcile};
use crds::ingress_for_offshoot;
use kube::ResourceExt;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// The dependency kind a [`DependencyReconciler`] handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dependency {
    /// Backend of an ingress
    Service,
    /// Endpoints of an ingress backend, named after the Service
    Endpoints,
    /// TLS secret of an ingress or certificate
    Secret,
    /// Extra proxy configuration named by an ingress annotation
    ConfigMap,
    /// Proxy Deployment serving an ingress
    Deployment,
    /// Namespace holding ingresses
    Namespace,
    /// Scrapes the stats endpoint of ingresses in its namespace
    ServiceMonitor,
}

impl fmt::Display for Dependency {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

pub struct DependencyReconciler {
    ctx: Arc<Context>,
    dependency: Dependency,
}

impl DependencyReconciler {
    pub fn new(ctx: Arc<Context>, dependency: Dependency) -> Self {
        Self { ctx, dependency }
    }

    fn enqueue_certificates(&self, namespace: &str, secret: &str) -> anyhow::Result<usize> {
        let certificates = self.ctx.certificates.get()?;
        let mut queued = 0;
        for cert in certificates.view().list(&ListFilter::in_namespace(namespace)) {
            if cert.spec.secret_name != secret {
                continue;
            }
            if let Some(key) = ObjectKey::from_object(cert.as_ref()) {
                certificates.enqueue(key);
                queued += 1;
            }
        }
        Ok(queued)
    }
}

#[async_trait]
impl Reconcile for DependencyReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> anyhow::Result<()> {
        let name = key.name.as_str();

        // Namespaces are cluster-scoped and hold the ingresses themselves
        if self.dependency == Dependency::Namespace {
            let queued = self.ctx.enqueue_ingresses(name, |_| true)?;
            debug!(namespace = %name, queued, "Namespace changed");
            return Ok(());
        }

        let Some(namespace) = key.namespace.as_deref() else {
            debug!(dependency = %self.dependency, key = %key, "Ignoring cluster-scoped key");
            return Ok(());
        };

        let queued = match self.dependency {
            Dependency::Service | Dependency::Endpoints => {
                self.ctx.enqueue_ingresses(namespace, |ingress| ingress.uses_service(name))?
            }
            Dependency::Secret => {
                self.ctx.enqueue_ingresses(namespace, |ingress| ingress.uses_secret(name))?
                    + self.enqueue_certificates(namespace, name)?
            }
            Dependency::ConfigMap => self
                .ctx
                .enqueue_ingresses(namespace, |ingress| ingress.config_map() == Some(name))?,
            Dependency::Deployment => match ingress_for_offshoot(name) {
                Some(owner) => self
                    .ctx
                    .enqueue_ingresses(namespace, |ingress| ingress.name_any() == owner)?,
                None => 0,
            },
            Dependency::ServiceMonitor => self
                .ctx
                .enqueue_ingresses(namespace, |ingress| ingress.stats_enabled())?,
            Dependency::Namespace => 0,
        };

        debug!(dependency = %self.dependency, key = %key, queued, "Dependency changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{Harness, Objects};
    use crate::fixtures::{certificate, gantry_ingress, native_ingress};
    use crds::{CONFIG_ANNOTATION, STATS_ANNOTATION};
    use std::collections::BTreeMap;

    fn objects() -> Objects {
        let mut annotated = gantry_ingress("shop", "annotated", "db");
        annotated.metadata.annotations = Some(BTreeMap::from([
            (CONFIG_ANNOTATION.to_string(), "proxy-config".to_string()),
            (STATS_ANNOTATION.to_string(), "true".to_string()),
        ]));
        Objects {
            ingresses: vec![
                gantry_ingress("shop", "web", "api"),
                annotated,
                gantry_ingress("blog", "posts", "api"),
            ],
            native_ingresses: vec![native_ingress("shop", "legacy", Some("gantry"), "api")],
            certificates: vec![certificate("shop", "web", "web-tls", None)],
            ..Default::default()
        }
    }

    async fn reconcile(harness: &Harness, dependency: Dependency, key: ObjectKey) {
        DependencyReconciler::new(harness.ctx.clone(), dependency)
            .reconcile(&key)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_service_change_queues_its_ingresses() {
        let harness = Harness::new(objects()).await;

        reconcile(&harness, Dependency::Service, ObjectKey::namespaced("shop", "api")).await;
        assert_eq!(harness.drain(&harness.ctx.ingresses).await, ["shop/web"]);
        assert_eq!(harness.drain(&harness.ctx.native_ingresses).await, ["shop/legacy"]);

        reconcile(&harness, Dependency::Endpoints, ObjectKey::namespaced("shop", "db")).await;
        assert_eq!(harness.drain(&harness.ctx.ingresses).await, ["shop/annotated"]);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_secret_change_queues_ingresses_and_certificates() {
        let harness = Harness::new(objects()).await;

        reconcile(&harness, Dependency::Secret, ObjectKey::namespaced("shop", "web-tls")).await;
        assert_eq!(harness.drain(&harness.ctx.ingresses).await, ["shop/web"]);
        assert_eq!(harness.drain(&harness.ctx.certificates).await, ["shop/web"]);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_annotation_driven_dependencies() {
        let harness = Harness::new(objects()).await;

        reconcile(&harness, Dependency::ConfigMap, ObjectKey::namespaced("shop", "proxy-config")).await;
        assert_eq!(harness.drain(&harness.ctx.ingresses).await, ["shop/annotated"]);

        reconcile(&harness, Dependency::ServiceMonitor, ObjectKey::namespaced("shop", "anything")).await;
        assert_eq!(harness.drain(&harness.ctx.ingresses).await, ["shop/annotated"]);

        reconcile(&harness, Dependency::Deployment, ObjectKey::namespaced("shop", "gantry-web")).await;
        assert_eq!(harness.drain(&harness.ctx.ingresses).await, ["shop/web"]);

        reconcile(&harness, Dependency::Deployment, ObjectKey::namespaced("shop", "unrelated")).await;
        assert!(harness.drain(&harness.ctx.ingresses).await.is_empty());

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_namespace_change_queues_every_ingress_in_it() {
        let harness = Harness::new(objects()).await;

        reconcile(&harness, Dependency::Namespace, ObjectKey::cluster("blog")).await;
        assert_eq!(harness.drain(&harness.ctx.ingresses).await, ["blog/posts"]);
        assert!(harness.drain(&harness.ctx.native_ingresses).await.is_empty());

        harness.stop().await;
    }
}
