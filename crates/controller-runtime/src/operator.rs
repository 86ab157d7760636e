//! Operator lifecycle.
//!
//! ```text
//! New --setup--> Registered --setup--> Initialized --run--> Syncing --run--> Running --shutdown--> Stopped
//! ```
//!
//! `setup` registers every custom kind and only then constructs the bundles.
//! `run` starts background tasks and change streams, waits for every cache to
//! sync, starts every queue and blocks until the shutdown token fires. A
//! failed sync stops everything that was started and returns an error without
//! ever reaching `Running`.

use crate::background::{BackgroundTasks, PeriodicTask};
use crate::bundle::{ManagedResource, WatchedResource};
use crate::config::RuntimeConfig;
use crate::error::OperatorError;
use crate::kind::{KindDefinition, KindId, Object};
use crate::registrar::{KindRegistry, Registrar};
use futures::future::join_all;
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Lifecycle phase of an [`Operator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Phase {
    /// Built, nothing registered yet.
    New,
    /// Custom kinds registered.
    Registered,
    /// Bundles constructed, nothing streaming.
    Initialized,
    /// Change streams running, waiting for caches.
    Syncing,
    /// Queues draining.
    Running,
    /// Shut down, or aborted during sync.
    Stopped,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let phase = match self {
            Self::New => "New",
            Self::Registered => "Registered",
            Self::Initialized => "Initialized",
            Self::Syncing => "Syncing",
            Self::Running => "Running",
            Self::Stopped => "Stopped",
        };
        f.write_str(phase)
    }
}

/// Builds a bundle during `setup`. `None` marks an optional component that
/// is absent in this deployment.
type Factory = Box<dyn FnOnce() -> anyhow::Result<Option<Arc<dyn ManagedResource>>> + Send>;

/// Collects kinds, bundle factories and periodic tasks for an [`Operator`].
pub struct OperatorBuilder {
    registry: Arc<dyn KindRegistry>,
    config: RuntimeConfig,
    definitions: Vec<KindDefinition>,
    factories: Vec<(KindId, Factory)>,
    background: BackgroundTasks,
}

impl OperatorBuilder {
    /// Replace the runtime configuration.
    #[must_use]
    pub fn config(mut self, config: RuntimeConfig) -> Self {
        self.config = config;
        self
    }

    /// Declare a custom kind to register during `setup`.
    #[must_use]
    pub fn register(mut self, definition: KindDefinition) -> Self {
        self.definitions.push(definition);
        self
    }

    /// Declare a watched kind.
    ///
    /// `factory` runs once during `setup`, after registration succeeded, and
    /// must return a bundle of kind `kind` (or `None` if the component is not
    /// available).
    #[must_use]
    pub fn watch<F>(mut self, kind: KindId, factory: F) -> Self
    where
        F: FnOnce() -> anyhow::Result<Option<Arc<dyn ManagedResource>>> + Send + 'static,
    {
        self.factories.push((kind, Box::new(factory)));
        self
    }

    /// Add a periodic background task.
    #[must_use]
    pub fn periodic(mut self, task: PeriodicTask) -> Self {
        self.background.add(task);
        self
    }

    /// Validate and build the operator.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::DuplicateKind`] if a kind is declared twice
    /// and [`OperatorError::InvalidConfig`] for an invalid configuration.
    pub fn build(self) -> Result<Operator, OperatorError> {
        self.config.validate()?;

        let mut watched = BTreeSet::new();
        for (kind, _) in &self.factories {
            if !watched.insert(kind) {
                return Err(OperatorError::DuplicateKind(kind.clone()));
            }
        }
        let mut registered = BTreeSet::new();
        for definition in &self.definitions {
            if !registered.insert(&definition.id) {
                return Err(OperatorError::DuplicateKind(definition.id.clone()));
            }
        }

        let (phase, _) = watch::channel(Phase::New);
        Ok(Operator {
            config: self.config,
            registrar: Registrar::new(self.registry),
            background: self.background,
            state: Mutex::new(Bookkeeping {
                definitions: self.definitions,
                factories: self.factories,
                resources: Vec::new(),
                setup_started: false,
                run_started: false,
            }),
            phase,
        })
    }
}

/// Owns every watched resource bundle and sequences startup and shutdown.
pub struct Operator {
    config: RuntimeConfig,
    registrar: Registrar,
    background: BackgroundTasks,
    /// Guards lifecycle bookkeeping only. Never held across an await and
    /// never taken by bundle internals.
    state: Mutex<Bookkeeping>,
    phase: watch::Sender<Phase>,
}

struct Bookkeeping {
    definitions: Vec<KindDefinition>,
    factories: Vec<(KindId, Factory)>,
    resources: Vec<Arc<dyn ManagedResource>>,
    setup_started: bool,
    run_started: bool,
}

impl fmt::Debug for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operator")
            .field("phase", &self.phase())
            .field("kinds", &self.kinds())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Operator {
    /// Start building an operator that registers custom kinds with `registry`.
    #[must_use]
    pub fn builder(registry: Arc<dyn KindRegistry>) -> OperatorBuilder {
        OperatorBuilder {
            registry,
            config: RuntimeConfig::default(),
            definitions: Vec::new(),
            factories: Vec::new(),
            background: BackgroundTasks::new(),
        }
    }

    /// Current phase.
    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.phase.borrow()
    }

    /// Receiver following every phase change.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<Phase> {
        self.phase.subscribe()
    }

    /// Kinds of the constructed bundles, in declaration order.
    #[must_use]
    pub fn kinds(&self) -> Vec<KindId> {
        self.state
            .lock()
            .resources
            .iter()
            .map(|resource| resource.kind().clone())
            .collect()
    }

    /// The constructed bundle watching `K`, if any.
    #[must_use]
    pub fn resource<K: Object>(&self) -> Option<Arc<WatchedResource<K>>> {
        let kind = KindId::of::<K>();
        self.state
            .lock()
            .resources
            .iter()
            .find(|resource| resource.kind() == &kind)
            .and_then(|resource| resource.downcast::<K>())
    }

    /// Register custom kinds, then construct every bundle.
    ///
    /// On a registration failure no factory runs and the operator stays in
    /// [`Phase::New`]; the caller must not call [`Operator::run`].
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::Registration`] if a kind cannot be
    /// registered, [`OperatorError::Construction`] or
    /// [`OperatorError::KindMismatch`] if a factory fails, and
    /// [`OperatorError::InvalidPhase`] if called twice.
    pub async fn setup(&self) -> Result<(), OperatorError> {
        let definitions = {
            let mut state = self.state.lock();
            if state.setup_started {
                return Err(self.invalid_phase("setup"));
            }
            state.setup_started = true;
            state.definitions.clone()
        };

        info!(kinds = definitions.len(), "Registering custom kinds");
        if let Err(e) = self.registrar.ensure_registered(&definitions).await {
            error!(error = %e, "Registration failed, no bundle constructed");
            // Allow a retry from New
            self.state.lock().setup_started = false;
            return Err(e);
        }
        self.set_phase(Phase::Registered);

        let factories = std::mem::take(&mut self.state.lock().factories);
        let mut resources = Vec::with_capacity(factories.len());
        for (kind, factory) in factories {
            let resource = factory().map_err(|e| OperatorError::Construction {
                kind: kind.clone(),
                message: format!("{e:#}"),
            })?;
            match resource {
                Some(resource) if resource.kind() != &kind => {
                    return Err(OperatorError::KindMismatch {
                        declared: kind,
                        actual: resource.kind().clone(),
                    });
                }
                Some(resource) => {
                    info!(kind = %kind, "Constructed watched resource");
                    resources.push(resource);
                }
                None => info!(kind = %kind, "Optional component absent, not watching"),
            }
        }

        self.state.lock().resources = resources;
        self.set_phase(Phase::Initialized);
        Ok(())
    }

    /// Start every subsystem and block until `shutdown` fires.
    ///
    /// Queues start only after every cache synced. `shutdown` is observed by
    /// all change streams, queues and background tasks; after it fires `run`
    /// waits up to the configured grace period for them to finish. With a
    /// resync period set, every cached key is re-enqueued once per period
    /// while running.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::CacheSyncTimeout`] or
    /// [`OperatorError::SyncAborted`] if the caches do not sync, and
    /// [`OperatorError::InvalidPhase`] unless called once after a successful
    /// `setup`.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<(), OperatorError> {
        let resources = {
            let mut state = self.state.lock();
            if self.phase() != Phase::Initialized || state.run_started {
                return Err(self.invalid_phase("run"));
            }
            state.run_started = true;
            state.resources.clone()
        };

        let token = shutdown.child_token();
        let tasks = TaskTracker::new();
        self.set_phase(Phase::Syncing);

        self.background.start(&tasks, &token);
        for resource in &resources {
            if let Err(e) = resource.start(&tasks, &token) {
                self.stop(&token, &tasks).await;
                return Err(e);
            }
        }

        info!(
            kinds = resources.len(),
            timeout = ?self.config.cache_sync_timeout,
            "Waiting for caches to sync"
        );
        let barrier = join_all(resources.iter().map(|resource| resource.wait_synced(&token)));
        let outcome = tokio::time::timeout(self.config.cache_sync_timeout, barrier).await;
        let failure = match outcome {
            Ok(synced) if synced.iter().all(|synced| *synced) => None,
            Ok(_) => Some(OperatorError::SyncAborted {
                kinds: unsynced(&resources),
            }),
            Err(_) => Some(OperatorError::CacheSyncTimeout {
                kinds: unsynced(&resources),
                timeout: self.config.cache_sync_timeout,
            }),
        };
        if let Some(e) = failure {
            error!(error = %e, "Cache sync failed, stopping");
            self.stop(&token, &tasks).await;
            return Err(e);
        }
        info!("All caches synced");

        for resource in &resources {
            if let Err(e) = resource.start_queue(&tasks, &token) {
                self.stop(&token, &tasks).await;
                return Err(e);
            }
        }
        if let Some(period) = self.config.resync_period {
            spawn_resync(&tasks, &token, resources, period);
        }
        self.set_phase(Phase::Running);

        token.cancelled().await;
        info!("Shutdown requested");
        self.stop(&token, &tasks).await;
        Ok(())
    }

    async fn stop(&self, token: &CancellationToken, tasks: &TaskTracker) {
        token.cancel();
        tasks.close();
        if tokio::time::timeout(self.config.shutdown_grace, tasks.wait())
            .await
            .is_err()
        {
            warn!(
                grace = ?self.config.shutdown_grace,
                remaining = tasks.len(),
                "Tasks still running after shutdown grace period"
            );
        }
        self.set_phase(Phase::Stopped);
    }

    fn set_phase(&self, phase: Phase) {
        self.phase.send_replace(phase);
        info!(%phase, "Operator phase changed");
    }

    fn invalid_phase(&self, operation: &'static str) -> OperatorError {
        OperatorError::InvalidPhase {
            operation,
            phase: self.phase(),
        }
    }
}

fn spawn_resync(
    tasks: &TaskTracker,
    shutdown: &CancellationToken,
    resources: Vec<Arc<dyn ManagedResource>>,
    period: Duration,
) {
    let shutdown = shutdown.clone();
    tasks.spawn(async move {
        // The initial sync already queued everything
        let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(period = ?period, "Starting resync");
        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }
            let queued: usize = resources.iter().map(|resource| resource.resync()).sum();
            debug!(queued, "Resync enqueued cached objects");
        }
    });
}

fn unsynced(resources: &[Arc<dyn ManagedResource>]) -> Vec<KindId> {
    resources
        .iter()
        .filter(|resource| !resource.is_synced())
        .map(|resource| resource.kind().clone())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockKindRegistry;
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;

    fn registry() -> Arc<MockKindRegistry> {
        Arc::new(MockKindRegistry::new())
    }

    #[test]
    fn test_duplicate_watch_rejected() {
        let result = Operator::builder(registry())
            .watch(KindId::new("Service"), || Ok(None))
            .watch(KindId::new("Service"), || Ok(None))
            .build();
        assert!(matches!(result, Err(OperatorError::DuplicateKind(kind)) if kind.as_str() == "Service"));
    }

    #[test]
    fn test_duplicate_definition_rejected() {
        let definition = KindDefinition {
            id: KindId::new("Ingress.gantry.dev"),
            name: "ingresses.gantry.dev".to_string(),
            crd: CustomResourceDefinition::default(),
        };
        let result = Operator::builder(registry())
            .register(definition.clone())
            .register(definition)
            .build();
        assert!(matches!(result, Err(OperatorError::DuplicateKind(_))));
    }

    #[tokio::test]
    async fn test_run_before_setup_is_rejected() {
        let operator = Operator::builder(registry()).build().unwrap();
        let err = operator.run(CancellationToken::new()).await.unwrap_err();
        assert!(matches!(
            err,
            OperatorError::InvalidPhase { operation: "run", phase: Phase::New }
        ));
    }

    #[tokio::test]
    async fn test_setup_twice_is_rejected() {
        let operator = Operator::builder(registry()).build().unwrap();
        operator.setup().await.unwrap();
        assert_eq!(operator.phase(), Phase::Initialized);
        assert!(matches!(
            operator.setup().await,
            Err(OperatorError::InvalidPhase { operation: "setup", .. })
        ));
    }

    #[tokio::test]
    async fn test_factory_failure_surfaces_as_construction_error() {
        let operator = Operator::builder(registry())
            .watch(KindId::new("Service"), || Err(anyhow::anyhow!("no client")))
            .build()
            .unwrap();
        let err = operator.setup().await.unwrap_err();
        assert!(matches!(err, OperatorError::Construction { ref kind, .. } if kind.as_str() == "Service"));
        assert_eq!(operator.phase(), Phase::Registered);
    }

    #[tokio::test]
    async fn test_no_bundles_runs_until_shutdown() {
        let operator = Arc::new(Operator::builder(registry()).build().unwrap());
        operator.setup().await.unwrap();

        let shutdown = CancellationToken::new();
        let mut phases = operator.subscribe();
        let run = tokio::spawn({
            let operator = Arc::clone(&operator);
            let shutdown = shutdown.clone();
            async move { operator.run(shutdown).await }
        });

        phases.wait_for(|phase| *phase == Phase::Running).await.unwrap();
        shutdown.cancel();
        run.await.unwrap().unwrap();
        assert_eq!(operator.phase(), Phase::Stopped);
    }

    #[test]
    fn test_phase_display() {
        assert_eq!(Phase::Running.to_string(), "Running");
        assert!(Phase::New < Phase::Stopped);
    }
}
