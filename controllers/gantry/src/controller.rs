//! Gantry controller wiring.
//!
//! Declares the Gantry kinds for registration, one watched bundle per kind
//! with its reconciler, and the periodic certificate check, then drives the
//! operator lifecycle next to the probe server.

use crate::config::Config;
use crate::context::Context;
use crate::error::ControllerError;
use crate::handlers::{
    certificate_check, CertificateReconciler, Dependency, DependencyReconciler, IngressReconciler,
    NativeIngressReconciler,
};
use crate::probes::{self, ProbeState};
use controller_runtime::registrar::KubeKindRegistry;
use controller_runtime::{
    EventSink, KindDefinition, KindId, KindRegistry, KubeEventSink, ManagedResource, Metrics, Object,
    Operator, OperatorBuilder, OperatorError, QueueConfig, Reconcile, RuntimeConfig, WatchedResource,
};
use crds::{Certificate, Ingress, ServiceMonitor};
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{ConfigMap, Endpoints, Namespace, Secret, Service};
use k8s_openapi::api::networking::v1 as networking;
use kube::{Api, Client, Resource};
use kube_runtime::watcher;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Field manager and event reporter name.
pub const CONTROLLER_NAME: &str = "gantry-controller";

/// Builds the cold bundle of a kind.
pub trait Sources: Send + Sync + 'static {
    /// Bundle for `K`. Namespaced kinds are restricted to the watched
    /// namespace, if any; `cluster_scoped` kinds never are.
    fn resource<K: Object>(
        &self,
        cluster_scoped: bool,
        queue: &QueueConfig,
    ) -> Result<Arc<WatchedResource<K>>, OperatorError>;
}

/// Sources backed by API server watches.
pub struct ApiSources {
    client: Client,
    namespace: Option<String>,
}

impl ApiSources {
    pub fn new(client: Client, namespace: Option<String>) -> Self {
        Self { client, namespace }
    }
}

impl Sources for ApiSources {
    fn resource<K: Object>(
        &self,
        cluster_scoped: bool,
        queue: &QueueConfig,
    ) -> Result<Arc<WatchedResource<K>>, OperatorError> {
        let api = Api::<K>::all(self.client.clone());
        let config = match (&self.namespace, cluster_scoped) {
            (Some(namespace), false) => {
                watcher::Config::default().fields(&format!("metadata.namespace={namespace}"))
            }
            _ => watcher::Config::default(),
        };
        WatchedResource::from_api(api, config, queue)
    }
}

/// Declare every Gantry kind, watch and periodic task on an operator.
pub fn build_operator<S: Sources>(
    config: &Config,
    registry: Arc<dyn KindRegistry>,
    sources: Arc<S>,
    ctx: Arc<Context>,
    metrics: &Metrics,
    service_monitors: bool,
) -> Result<Operator, ControllerError> {
    let queue = QueueConfig::default()
        .workers(config.workers)
        .max_requeues(config.max_requeues)
        .metrics(metrics.clone());
    let runtime = RuntimeConfig::default()
        .cache_sync_timeout(config.cache_sync_timeout)
        .shutdown_grace(config.shutdown_grace)
        .resync_period(config.resync_period);
    let wiring = Wiring { sources, queue };

    let builder = Operator::builder(registry)
        .config(runtime)
        .register(KindDefinition::of::<Ingress>())
        .register(KindDefinition::of::<Certificate>())
        .periodic(certificate_check(Arc::clone(&ctx), config.cert_check_interval)?);

    let builder = wiring.watch::<Ingress, _>(
        builder,
        false,
        {
            let ctx = Arc::clone(&ctx);
            move |resource| ctx.ingresses.fill(resource)
        },
        IngressReconciler::new(Arc::clone(&ctx)),
    );
    let builder = wiring.watch::<networking::Ingress, _>(
        builder,
        false,
        {
            let ctx = Arc::clone(&ctx);
            move |resource| ctx.native_ingresses.fill(resource)
        },
        NativeIngressReconciler::new(Arc::clone(&ctx)),
    );
    let builder = wiring.watch::<Certificate, _>(
        builder,
        false,
        {
            let ctx = Arc::clone(&ctx);
            move |resource| ctx.certificates.fill(resource)
        },
        CertificateReconciler::new(Arc::clone(&ctx)),
    );
    let builder = wiring.watch::<Service, _>(
        builder,
        false,
        {
            let ctx = Arc::clone(&ctx);
            move |resource| ctx.services.fill(resource)
        },
        DependencyReconciler::new(Arc::clone(&ctx), Dependency::Service),
    );
    let builder = wiring.watch::<Secret, _>(
        builder,
        false,
        {
            let ctx = Arc::clone(&ctx);
            move |resource| ctx.secrets.fill(resource)
        },
        DependencyReconciler::new(Arc::clone(&ctx), Dependency::Secret),
    );
    let builder = wiring.dependency::<Endpoints>(builder, false, &ctx, Dependency::Endpoints);
    let builder = wiring.dependency::<ConfigMap>(builder, false, &ctx, Dependency::ConfigMap);
    let builder = wiring.dependency::<Deployment>(builder, false, &ctx, Dependency::Deployment);
    let builder = wiring.dependency::<Namespace>(builder, true, &ctx, Dependency::Namespace);

    let builder = if service_monitors {
        wiring.dependency::<ServiceMonitor>(builder, false, &ctx, Dependency::ServiceMonitor)
    } else {
        builder.watch(KindId::of::<ServiceMonitor>(), || Ok(None))
    };

    Ok(builder.build()?)
}

struct Wiring<S> {
    sources: Arc<S>,
    queue: QueueConfig,
}

impl<S: Sources> Wiring<S> {
    /// Watch `K`, hand the built bundle to `fill`, reconcile with `handler`.
    fn watch<K, R>(
        &self,
        builder: OperatorBuilder,
        cluster_scoped: bool,
        fill: impl FnOnce(Arc<WatchedResource<K>>) -> anyhow::Result<()> + Send + 'static,
        handler: R,
    ) -> OperatorBuilder
    where
        K: Object,
        R: Reconcile + 'static,
    {
        let sources = Arc::clone(&self.sources);
        let queue = self.queue.clone();
        builder.watch(KindId::of::<K>(), move || {
            let resource = sources.resource::<K>(cluster_scoped, &queue)?;
            fill(Arc::clone(&resource))?;
            let managed: Arc<dyn ManagedResource> = resource.bind(handler);
            Ok(Some(managed))
        })
    }

    /// Watch a dependency kind nothing reads directly.
    fn dependency<K: Object>(
        &self,
        builder: OperatorBuilder,
        cluster_scoped: bool,
        ctx: &Arc<Context>,
        dependency: Dependency,
    ) -> OperatorBuilder {
        self.watch::<K, _>(
            builder,
            cluster_scoped,
            |_| Ok(()),
            DependencyReconciler::new(Arc::clone(ctx), dependency),
        )
    }
}

/// Whether the Prometheus operator's ServiceMonitor kind is served.
async fn service_monitors_served(client: &Client) -> bool {
    let api_version = ServiceMonitor::api_version(&());
    match client.list_api_group_resources(&api_version).await {
        Ok(list) => {
            let plural = ServiceMonitor::plural(&());
            list.resources.iter().any(|resource| resource.name == plural)
        }
        Err(e) => {
            info!(api_version = %api_version, error = %e, "ServiceMonitor API not available");
            false
        }
    }
}

pub struct Controller {
    operator: Arc<Operator>,
    metrics: Metrics,
    probe_addr: SocketAddr,
}

impl Controller {
    pub async fn new(config: &Config) -> Result<Self, ControllerError> {
        let client = Client::try_default().await?;
        info!("Connected to Kubernetes cluster");

        let metrics = Metrics::new("gantry")?;
        let events: Arc<dyn EventSink> = Arc::new(KubeEventSink::new(client.clone(), CONTROLLER_NAME));
        let ctx = Arc::new(Context::new(
            events,
            config.ingress_class.clone(),
            config.cert_renew_before_days,
        ));

        let service_monitors = config.enable_service_monitors && service_monitors_served(&client).await;
        info!("ServiceMonitor watch: {}", if service_monitors { "enabled" } else { "disabled" });

        let registry: Arc<dyn KindRegistry> = Arc::new(KubeKindRegistry::new(client.clone(), CONTROLLER_NAME));
        let sources = Arc::new(ApiSources::new(client, config.namespace.clone()));
        let operator = build_operator(config, registry, sources, ctx, &metrics, service_monitors)?;

        Ok(Self {
            operator: Arc::new(operator),
            metrics,
            probe_addr: config.probe_addr,
        })
    }

    /// Register kinds, build the bundles and run until `shutdown` fires.
    ///
    /// The probe server runs for the whole call and is stopped on return.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), ControllerError> {
        let probes = probes::spawn(
            self.probe_addr,
            ProbeState {
                operator: Arc::clone(&self.operator),
                metrics: self.metrics.clone(),
            },
            shutdown.clone(),
        );

        let result = async {
            self.operator.setup().await?;
            info!(kinds = ?self.operator.kinds(), "Starting controller");
            self.operator.run(shutdown.clone()).await
        }
        .await;

        // The operator may have failed before shutdown was requested
        shutdown.cancel();
        if let Err(e) = probes.await {
            warn!(error = %e, "Probe server task failed");
        }

        Ok(result?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::snapshot;
    use crate::fixtures::{gantry_ingress, native_ingress, secret, service};
    use controller_runtime::events::reasons;
    use controller_runtime::mock::{MockKindRegistry, RecordingEventSink};
    use controller_runtime::Phase;
    use parking_lot::Mutex;
    use std::any::Any;
    use std::collections::HashMap;
    use std::time::Duration;

    /// Sources serving a fixed snapshot per kind.
    #[derive(Default)]
    struct Snapshots {
        objects: Mutex<HashMap<KindId, Box<dyn Any + Send>>>,
    }

    impl Snapshots {
        fn with<K: Object>(self, objects: Vec<K>) -> Self {
            self.objects.lock().insert(KindId::of::<K>(), Box::new(objects));
            self
        }
    }

    impl Sources for Snapshots {
        fn resource<K: Object>(
            &self,
            _cluster_scoped: bool,
            queue: &QueueConfig,
        ) -> Result<Arc<WatchedResource<K>>, OperatorError> {
            let objects = self
                .objects
                .lock()
                .remove(&KindId::of::<K>())
                .and_then(|objects| objects.downcast::<Vec<K>>().ok())
                .map(|objects| *objects)
                .unwrap_or_default();
            WatchedResource::new(snapshot(objects), queue)
        }
    }

    fn config() -> Config {
        Config {
            namespace: None,
            workers: 1,
            max_requeues: Some(3),
            cache_sync_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(5),
            resync_period: None,
            cert_check_interval: Duration::from_secs(300),
            cert_renew_before_days: 15,
            enable_service_monitors: false,
            probe_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            ingress_class: "gantry".to_string(),
        }
    }

    #[test]
    fn test_operator_builds_without_duplicate_kinds() {
        let events = Arc::new(RecordingEventSink::new());
        let ctx = Arc::new(Context::new(events, "gantry", 15));
        let operator = build_operator(
            &config(),
            Arc::new(MockKindRegistry::new()),
            Arc::new(Snapshots::default()),
            ctx,
            &Metrics::new("gantry").unwrap(),
            false,
        );
        assert!(operator.is_ok());
    }

    #[tokio::test]
    async fn test_end_to_end_validation_events() {
        let registry = Arc::new(MockKindRegistry::new());
        let events = Arc::new(RecordingEventSink::new());
        let ctx = Arc::new(Context::new(events.clone(), "gantry", 15));
        let sources = Snapshots::default()
            .with(vec![gantry_ingress("shop", "web", "missing")])
            .with(vec![native_ingress("shop", "legacy", Some("gantry"), "api")])
            .with(vec![service("shop", "api")])
            .with(vec![secret("shop", "web-tls")]);

        let operator = Arc::new(
            build_operator(
                &config(),
                registry.clone(),
                Arc::new(sources),
                ctx,
                &Metrics::new("gantry").unwrap(),
                false,
            )
            .unwrap(),
        );
        operator.setup().await.unwrap();
        assert_eq!(
            registry.registered(),
            ["ingresses.gantry.dev", "certificates.gantry.dev"]
        );
        assert!(operator.resource::<ServiceMonitor>().is_none());
        assert!(operator.resource::<Namespace>().is_some());

        let shutdown = CancellationToken::new();
        let run = tokio::spawn({
            let operator = Arc::clone(&operator);
            let shutdown = shutdown.clone();
            async move { operator.run(shutdown).await }
        });
        operator
            .subscribe()
            .wait_for(|phase| *phase == Phase::Running)
            .await
            .unwrap();

        let seen = |object: &str, reason: &str| {
            events
                .events()
                .iter()
                .any(|event| event.object == object && event.reason == reason)
        };
        tokio::time::timeout(Duration::from_secs(5), async {
            while !(seen("shop/web", reasons::BACKEND_MISSING) && seen("shop/legacy", reasons::SYNCED)) {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
        assert!(!seen("shop/web", reasons::SECRET_MISSING));

        shutdown.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(operator.phase(), Phase::Stopped);
    }
}
