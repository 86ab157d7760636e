//! Fixed-cadence maintenance tasks.
//!
//! Each [`PeriodicTask`] runs on its own Tokio task. A routine that returns an
//! error or panics is logged and invoked again at the next tick; it never
//! takes down its siblings or the operator.

use crate::error::OperatorError;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

type Routine = Arc<dyn Fn() -> BoxFuture<'static, anyhow::Result<()>> + Send + Sync>;

/// A routine invoked every `interval`, starting immediately.
#[derive(Clone)]
pub struct PeriodicTask {
    name: String,
    interval: Duration,
    routine: Routine,
}

impl fmt::Debug for PeriodicTask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PeriodicTask")
            .field("name", &self.name)
            .field("interval", &self.interval)
            .finish_non_exhaustive()
    }
}

impl PeriodicTask {
    /// Define a task.
    ///
    /// # Errors
    ///
    /// Returns [`OperatorError::InvalidConfig`] for a zero interval.
    pub fn new<F, Fut>(
        name: impl Into<String>,
        interval: Duration,
        routine: F,
    ) -> Result<Self, OperatorError>
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        let name = name.into();
        if interval.is_zero() {
            return Err(OperatorError::InvalidConfig(format!(
                "periodic task {name} needs a non-zero interval"
            )));
        }
        Ok(Self {
            name,
            interval,
            routine: Arc::new(move || routine().boxed()),
        })
    }

    /// Task name, used in logs.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invocation cadence.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        self.interval
    }

    async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        debug!(task = %self.name, interval = ?self.interval, "Periodic task started");

        loop {
            tokio::select! {
                biased;
                () = shutdown.cancelled() => break,
                _ = ticker.tick() => {}
            }

            let routine = Arc::clone(&self.routine);
            match AssertUnwindSafe(async move { routine().await })
                .catch_unwind()
                .await
            {
                Ok(Ok(())) => debug!(task = %self.name, "Periodic task completed"),
                Ok(Err(err)) => warn!(task = %self.name, error = %err, "Periodic task failed"),
                Err(panic) => error!(
                    task = %self.name,
                    panic = %panic_message(&*panic),
                    "Periodic task panicked"
                ),
            }
        }
        debug!(task = %self.name, "Periodic task stopped");
    }
}

/// The set of periodic tasks owned by an operator.
#[derive(Debug, Clone, Default)]
pub struct BackgroundTasks {
    tasks: Vec<PeriodicTask>,
}

impl BackgroundTasks {
    /// Create an empty set.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a task.
    pub fn add(&mut self, task: PeriodicTask) {
        self.tasks.push(task);
    }

    /// Number of tasks.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Whether there are no tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Spawn every task onto `tracker`; each stops when `shutdown` fires.
    pub fn start(&self, tracker: &TaskTracker, shutdown: &CancellationToken) {
        for task in &self.tasks {
            info!(task = %task.name, interval = ?task.interval, "Starting periodic task");
            tracker.spawn(task.clone().run(shutdown.clone()));
        }
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
