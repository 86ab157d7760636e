//! Controller Runtime
//!
//! Orchestration layer for controllers that watch many resource kinds at once.
//!
//! Each watched kind is a [`WatchedResource`]: a cache mirror fed by a change
//! stream, a read-only [`ReadView`] over that cache, and a deduplicating
//! [`WorkQueue`] of object keys drained by a [`Reconcile`] handler. The
//! [`Operator`] owns every bundle and sequences startup:
//!
//! 1. `setup()` ensures custom kinds are registered, then constructs bundles.
//! 2. `run()` starts background tasks and every change stream, waits for all
//!    caches to sync (bounded by a timeout), starts every queue and then
//!    blocks until the shutdown token fires.
//!
//! # Example
//!
//! ```no_run
//! use controller_runtime::{handler_fn, KindId, Operator, QueueConfig, WatchedResource};
//! use controller_runtime::registrar::KubeKindRegistry;
//! use k8s_openapi::api::core::v1::ConfigMap;
//! use kube::{Api, Client};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = Client::try_default().await?;
//! let registry = Arc::new(KubeKindRegistry::new(client.clone(), "example-controller"));
//!
//! let api: Api<ConfigMap> = Api::all(client);
//! let operator = Operator::builder(registry)
//!     .watch(KindId::of::<ConfigMap>(), move || {
//!         let resource = WatchedResource::from_api(api, Default::default(), &QueueConfig::default())?;
//!         let handler = handler_fn(|key| async move {
//!             tracing::info!(%key, "reconciling");
//!             Ok(())
//!         });
//!         Ok(Some(resource.bind(handler)))
//!     })
//!     .build()?;
//!
//! operator.setup().await?;
//! operator.run(CancellationToken::new()).await?;
//! # Ok(())
//! # }
//! ```

pub mod background;
pub mod backoff;
pub mod bundle;
pub mod cache;
pub mod composite;
pub mod config;
pub mod error;
pub mod events;
pub mod kind;
pub mod metrics;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;
pub mod operator;
pub mod queue;
pub mod registrar;
pub mod view;

pub use background::{BackgroundTasks, PeriodicTask};
pub use backoff::RetryBackoff;
pub use bundle::{handler_fn, EventStream, ManagedResource, Reconcile, WatchedResource};
pub use cache::CacheMirror;
pub use composite::CompositeView;
pub use config::{QueueConfig, RuntimeConfig};
pub use error::{NotFound, OperatorError, RegistryError};
pub use events::{EventSink, KubeEventSink, NoopEventSink};
pub use kind::{KindDefinition, KindId, Object, ObjectKey};
pub use metrics::Metrics;
pub use operator::{Operator, OperatorBuilder, Phase};
pub use queue::WorkQueue;
pub use registrar::{KindRegistry, Registrar};
pub use view::{ListFilter, ReadView};
