//! Prometheus metrics for reconciliation queues.

use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::fmt;

/// Reconciliation metrics shared by every queue of an operator.
///
/// Cloning is cheap; all clones report into the same registry.
#[derive(Clone)]
pub struct Metrics {
    registry: Registry,
    reconciliations: IntCounterVec,
    retries: IntCounterVec,
    dropped: IntCounterVec,
    queue_depth: IntGaugeVec,
}

impl Metrics {
    /// Create and register the metric families under `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if a metric family cannot be registered.
    pub fn new(namespace: &str) -> Result<Self, prometheus::Error> {
        let registry = Registry::new();

        let reconciliations = IntCounterVec::new(
            Opts::new("reconcile_total", "Reconciliation attempts by kind and result")
                .namespace(namespace),
            &["kind", "result"],
        )?;
        let retries = IntCounterVec::new(
            Opts::new("reconcile_retries_total", "Keys requeued after a failed reconciliation")
                .namespace(namespace),
            &["kind"],
        )?;
        let dropped = IntCounterVec::new(
            Opts::new("reconcile_dropped_total", "Keys dropped after exhausting their retries")
                .namespace(namespace),
            &["kind"],
        )?;
        let queue_depth = IntGaugeVec::new(
            Opts::new("workqueue_depth", "Keys waiting in the work queue").namespace(namespace),
            &["kind"],
        )?;

        registry.register(Box::new(reconciliations.clone()))?;
        registry.register(Box::new(retries.clone()))?;
        registry.register(Box::new(dropped.clone()))?;
        registry.register(Box::new(queue_depth.clone()))?;

        Ok(Self {
            registry,
            reconciliations,
            retries,
            dropped,
            queue_depth,
        })
    }

    /// The underlying registry, for callers adding their own families.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Render every family in the Prometheus text exposition format.
    ///
    /// # Errors
    ///
    /// Returns an error if encoding fails.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }

    pub(crate) fn for_queue(&self, kind: &str) -> QueueMetrics {
        QueueMetrics {
            succeeded: self.reconciliations.with_label_values(&[kind, "success"]),
            failed: self.reconciliations.with_label_values(&[kind, "error"]),
            retries: self.retries.with_label_values(&[kind]),
            dropped: self.dropped.with_label_values(&[kind]),
            depth: self.queue_depth.with_label_values(&[kind]),
        }
    }
}

impl fmt::Debug for Metrics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

/// Label-resolved handles for one queue.
#[derive(Clone)]
pub(crate) struct QueueMetrics {
    pub(crate) succeeded: IntCounter,
    pub(crate) failed: IntCounter,
    pub(crate) retries: IntCounter,
    pub(crate) dropped: IntCounter,
    pub(crate) depth: IntGauge,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_metrics_are_encoded() {
        let metrics = Metrics::new("test").unwrap();
        let queue = metrics.for_queue("Ingress");
        queue.succeeded.inc();
        queue.retries.inc_by(2);
        queue.depth.set(3);

        let text = metrics.encode().unwrap();
        assert!(text.contains("test_reconcile_total{kind=\"Ingress\",result=\"success\"} 1"));
        assert!(text.contains("test_reconcile_retries_total{kind=\"Ingress\"} 2"));
        assert!(text.contains("test_workqueue_depth{kind=\"Ingress\"} 3"));
    }
}
