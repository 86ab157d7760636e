//! Ingress validation.
//!
//! Gantry ingresses and native ingresses of our class are checked the same
//! way: every backend must name an existing Service and every TLS section an
//! existing Secret. The outcome is reported as an event on the ingress.
//! Missing dependencies are not retried; the dependency reconcilers requeue
//! the ingress once the Service or Secret shows up.

use crate::context::Context;
use async_trait::async_trait;
use controller_runtime::events::{actions, reasons};
use controller_runtime::{ObjectKey, Reconcile};
use crds::{ConversionError, Ingress};
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

pub struct IngressReconciler {
    ctx: Arc<Context>,
}

impl IngressReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconcile for IngressReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> anyhow::Result<()> {
        let Ok(ingress) = self.ctx.ingresses.get()?.view().get(key) else {
            debug!(key = %key, "Ingress deleted");
            return Ok(());
        };
        validate(&self.ctx, &ingress, ingress.object_ref(&())).await
    }
}

pub struct NativeIngressReconciler {
    ctx: Arc<Context>,
}

impl NativeIngressReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconcile for NativeIngressReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> anyhow::Result<()> {
        let Ok(native) = self.ctx.native_ingresses.get()?.view().get(key) else {
            debug!(key = %key, "Native ingress deleted");
            return Ok(());
        };
        let reference = native.object_ref(&());

        match Ingress::from_native(&native, &self.ctx.ingress_class) {
            Ok(ingress) => validate(&self.ctx, &ingress, reference).await,
            Err(ConversionError::ClassMismatch { found, .. }) => {
                debug!(key = %key, class = ?found, "Ingress of another class, ignoring");
                Ok(())
            }
            Err(err) => {
                warn!(key = %key, error = %err, "Cannot convert native ingress");
                self.ctx
                    .events
                    .publish(
                        &reference,
                        EventType::Warning,
                        reasons::INVALID,
                        actions::VALIDATE,
                        Some(err.to_string()),
                    )
                    .await;
                Ok(())
            }
        }
    }
}

async fn validate(ctx: &Context, ingress: &Ingress, reference: ObjectReference) -> anyhow::Result<()> {
    let namespace = ingress.namespace().unwrap_or_default();
    let services = ctx.services.get()?.view();
    let secrets = ctx.secrets.get()?.view();

    let missing_services: BTreeSet<&str> = ingress
        .backends()
        .into_iter()
        .map(|backend| backend.service_name.as_str())
        .filter(|name| services.get(&ObjectKey::namespaced(&namespace, *name)).is_err())
        .collect();
    let missing_secrets: BTreeSet<&str> = ingress
        .tls_secrets()
        .into_iter()
        .filter(|name| secrets.get(&ObjectKey::namespaced(&namespace, *name)).is_err())
        .collect();

    if !missing_services.is_empty() {
        let note = format!("services not found: {}", join(&missing_services));
        warn!(ingress = %ingress.name_any(), namespace = %namespace, "{}", note);
        ctx.events
            .publish(
                &reference,
                EventType::Warning,
                reasons::BACKEND_MISSING,
                actions::VALIDATE,
                Some(note),
            )
            .await;
    }
    if !missing_secrets.is_empty() {
        let note = format!("TLS secrets not found: {}", join(&missing_secrets));
        warn!(ingress = %ingress.name_any(), namespace = %namespace, "{}", note);
        ctx.events
            .publish(
                &reference,
                EventType::Warning,
                reasons::SECRET_MISSING,
                actions::VALIDATE,
                Some(note),
            )
            .await;
    }

    if missing_services.is_empty() && missing_secrets.is_empty() {
        info!(
            ingress = %ingress.name_any(),
            namespace = %namespace,
            backends = ingress.backends().len(),
            converted = ingress.is_converted(),
            "Ingress configured"
        );
        ctx.events
            .publish(
                &reference,
                EventType::Normal,
                reasons::SYNCED,
                actions::RECONCILE,
                None,
            )
            .await;
    }
    Ok(())
}

fn join(names: &BTreeSet<&str>) -> String {
    names.iter().copied().collect::<Vec<_>>().join(", ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::{Harness, Objects};
    use crate::fixtures::{gantry_ingress, native_ingress, secret, service};
    use controller_runtime::mock::RecordedEvent;

    #[tokio::test]
    async fn test_ingress_with_resolved_dependencies_is_synced() {
        let harness = Harness::new(Objects {
            ingresses: vec![gantry_ingress("shop", "web", "api")],
            services: vec![service("shop", "api")],
            secrets: vec![secret("shop", "web-tls")],
            ..Default::default()
        })
        .await;

        IngressReconciler::new(harness.ctx.clone())
            .reconcile(&ObjectKey::namespaced("shop", "web"))
            .await
            .unwrap();
        assert_eq!(
            harness.events.events(),
            [RecordedEvent {
                object: "shop/web".to_string(),
                type_: "Normal".to_string(),
                reason: reasons::SYNCED.to_string(),
                action: actions::RECONCILE.to_string(),
                note: None,
            }]
        );

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_missing_dependencies_are_reported_not_retried() {
        let harness = Harness::new(Objects {
            ingresses: vec![gantry_ingress("shop", "web", "api")],
            services: vec![service("other", "api")],
            ..Default::default()
        })
        .await;

        let result = IngressReconciler::new(harness.ctx.clone())
            .reconcile(&ObjectKey::namespaced("shop", "web"))
            .await;
        assert!(result.is_ok());

        let events = harness.events.events();
        assert_eq!(
            harness.events.reasons(),
            [reasons::BACKEND_MISSING, reasons::SECRET_MISSING]
        );
        assert_eq!(events[0].note.as_deref(), Some("services not found: api"));
        assert_eq!(events[1].note.as_deref(), Some("TLS secrets not found: web-tls"));
        assert!(events.iter().all(|e| e.type_ == "Warning"));

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_deleted_ingress_is_a_no_op() {
        let harness = Harness::new(Objects::default()).await;

        IngressReconciler::new(harness.ctx.clone())
            .reconcile(&ObjectKey::namespaced("shop", "gone"))
            .await
            .unwrap();
        assert!(harness.events.events().is_empty());

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_native_ingress_of_our_class_is_validated() {
        let harness = Harness::new(Objects {
            native_ingresses: vec![
                native_ingress("shop", "mine", Some("gantry"), "api"),
                native_ingress("shop", "theirs", Some("nginx"), "missing"),
            ],
            services: vec![service("shop", "api")],
            ..Default::default()
        })
        .await;
        let reconciler = NativeIngressReconciler::new(harness.ctx.clone());

        reconciler
            .reconcile(&ObjectKey::namespaced("shop", "theirs"))
            .await
            .unwrap();
        assert!(harness.events.events().is_empty());

        reconciler
            .reconcile(&ObjectKey::namespaced("shop", "mine"))
            .await
            .unwrap();
        assert_eq!(harness.events.reasons(), [reasons::SYNCED]);
        assert_eq!(harness.events.events()[0].object, "shop/mine");

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_unconvertible_native_ingress_is_invalid() {
        let mut broken = native_ingress("shop", "broken", Some("gantry"), "api");
        if let Some(spec) = broken.spec.as_mut() {
            if let Some(backend) = spec.default_backend.as_mut() {
                backend.service = None;
            }
        }
        let harness = Harness::new(Objects {
            native_ingresses: vec![broken],
            ..Default::default()
        })
        .await;

        NativeIngressReconciler::new(harness.ctx.clone())
            .reconcile(&ObjectKey::namespaced("shop", "broken"))
            .await
            .unwrap();
        assert_eq!(harness.events.reasons(), [reasons::INVALID]);

        harness.stop().await;
    }
}
