//! State shared by the reconcilers.
//!
//! Bundles are built by the operator during setup, after the reconcilers
//! holding this context already exist; each factory fills its [`Slot`].

use anyhow::anyhow;
use controller_runtime::{CompositeView, EventSink, KindId, ListFilter, Object, ObjectKey, WatchedResource};
use crds::{Certificate, Ingress};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1 as networking;
use std::sync::{Arc, OnceLock};
use tracing::debug;

/// A bundle built during setup.
pub struct Slot<K: Object>(OnceLock<Arc<WatchedResource<K>>>);

impl<K: Object> Default for Slot<K> {
    fn default() -> Self {
        Self(OnceLock::new())
    }
}

impl<K: Object> Slot<K> {
    /// Store the bundle. Fails if one is already stored.
    pub fn fill(&self, resource: Arc<WatchedResource<K>>) -> anyhow::Result<()> {
        self.0
            .set(resource)
            .map_err(|_| anyhow!("{} bundle built twice", KindId::of::<K>()))
    }

    /// The bundle, once built.
    pub fn get(&self) -> anyhow::Result<&Arc<WatchedResource<K>>> {
        self.0
            .get()
            .ok_or_else(|| anyhow!("{} is not watched yet", KindId::of::<K>()))
    }
}

pub struct Context {
    pub ingresses: Slot<Ingress>,
    pub native_ingresses: Slot<networking::Ingress>,
    pub certificates: Slot<Certificate>,
    pub services: Slot<Service>,
    pub secrets: Slot<Secret>,
    pub events: Arc<dyn EventSink>,
    /// Class of the native ingresses this controller serves
    pub ingress_class: String,
    /// Renewal window for certificates that do not set their own
    pub renew_before_days: u32,
}

impl Context {
    pub fn new(events: Arc<dyn EventSink>, ingress_class: impl Into<String>, renew_before_days: u32) -> Self {
        Self {
            ingresses: Slot::default(),
            native_ingresses: Slot::default(),
            certificates: Slot::default(),
            services: Slot::default(),
            secrets: Slot::default(),
            events,
            ingress_class: ingress_class.into(),
            renew_before_days,
        }
    }

    /// Gantry ingresses in `namespace`, followed by the native ingresses of
    /// our class converted to Gantry ingresses.
    pub fn ingresses_in(&self, namespace: &str) -> anyhow::Result<Vec<Arc<Ingress>>> {
        let class = self.ingress_class.clone();
        let view = CompositeView::new(
            self.ingresses.get()?.view().clone(),
            self.native_ingresses.get()?.view().clone(),
            move |native: &networking::Ingress| Ingress::from_native(native, &class),
        );
        Ok(view.list(&ListFilter::in_namespace(namespace)))
    }

    /// Enqueue every ingress in `namespace` for which `affected` holds, on
    /// the queue of the kind it was read from. Returns how many were queued.
    ///
    /// Native ingresses are matched in their converted form.
    pub fn enqueue_ingresses(
        &self,
        namespace: &str,
        affected: impl Fn(&Ingress) -> bool,
    ) -> anyhow::Result<usize> {
        let custom = self.ingresses.get()?;
        let native = self.native_ingresses.get()?;
        let filter = ListFilter::in_namespace(namespace);

        let mut queued = 0;
        for ingress in custom.view().list(&filter) {
            if !affected(&ingress) {
                continue;
            }
            if let Some(key) = ObjectKey::from_object(ingress.as_ref()) {
                debug!(key = %key, "Enqueueing dependent ingress");
                custom.enqueue(key);
                queued += 1;
            }
        }
        for ingress in native.view().list(&filter) {
            let Ok(converted) = Ingress::from_native(&ingress, &self.ingress_class) else {
                continue;
            };
            if !affected(&converted) {
                continue;
            }
            if let Some(key) = ObjectKey::from_object(ingress.as_ref()) {
                debug!(key = %key, "Enqueueing dependent native ingress");
                native.enqueue(key);
                queued += 1;
            }
        }
        Ok(queued)
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{self, Harness, Objects};
    use super::*;
    use controller_runtime::QueueConfig;
    use crate::fixtures::{gantry_ingress, native_ingress};
    use crds::{NATIVE_ORIGIN, ORIGIN_ANNOTATION};
    use kube::ResourceExt;

    #[test]
    fn test_slot_filled_once() {
        let slot = Slot::<Service>::default();
        assert!(slot.get().is_err());

        let build = || WatchedResource::new(testing::snapshot(Vec::new()), &QueueConfig::default()).unwrap();
        slot.fill(build()).unwrap();
        assert!(slot.get().is_ok());
        assert!(slot.fill(build()).is_err());
    }

    #[tokio::test]
    async fn test_lists_custom_then_converted_native() {
        let harness = Harness::new(Objects {
            ingresses: vec![gantry_ingress("shop", "b", "api")],
            native_ingresses: vec![
                native_ingress("shop", "a", Some("gantry"), "api"),
                native_ingress("shop", "c", Some("nginx"), "api"),
                native_ingress("other", "d", Some("gantry"), "api"),
            ],
            ..Default::default()
        })
        .await;

        let names: Vec<_> = harness
            .ctx
            .ingresses_in("shop")
            .unwrap()
            .iter()
            .map(|i| (i.metadata.name.clone().unwrap(), i.is_converted()))
            .collect();
        assert_eq!(names, [("b".to_string(), false), ("a".to_string(), true)]);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_enqueue_routes_by_source_view() {
        let harness = Harness::new(Objects {
            ingresses: vec![gantry_ingress("shop", "custom", "api"), gantry_ingress("shop", "other", "db")],
            native_ingresses: vec![native_ingress("shop", "native", Some("gantry"), "api")],
            ..Default::default()
        })
        .await;

        let queued = harness
            .ctx
            .enqueue_ingresses("shop", |ingress| ingress.uses_service("api"))
            .unwrap();
        assert_eq!(queued, 2);
        assert_eq!(harness.drain(&harness.ctx.ingresses).await, ["shop/custom"]);
        assert_eq!(harness.drain(&harness.ctx.native_ingresses).await, ["shop/native"]);

        harness.stop().await;
    }

    #[tokio::test]
    async fn test_origin_annotation_on_custom_ingress_keeps_custom_queue() {
        let mut spoofed = gantry_ingress("shop", "spoofed", "api");
        spoofed
            .annotations_mut()
            .insert(ORIGIN_ANNOTATION.to_string(), NATIVE_ORIGIN.to_string());
        assert!(spoofed.is_converted());
        let harness = Harness::new(Objects {
            ingresses: vec![spoofed],
            ..Default::default()
        })
        .await;

        let queued = harness
            .ctx
            .enqueue_ingresses("shop", |ingress| ingress.uses_service("api"))
            .unwrap();
        assert_eq!(queued, 1);
        assert_eq!(harness.drain(&harness.ctx.ingresses).await, ["shop/spoofed"]);
        assert!(harness.drain(&harness.ctx.native_ingresses).await.is_empty());

        harness.stop().await;
    }
}
