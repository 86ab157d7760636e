//! Human-readable status events.
//!
//! Publishing is fire-and-forget: a failed write is logged and never turns
//! into a reconciliation failure.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::Client;
use tracing::warn;

/// Write-only destination for status events.
#[async_trait]
pub trait EventSink: Send + Sync {
    /// Record an event about `resource_ref`.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Publishes `events.k8s.io` events through a [`Recorder`].
pub struct KubeEventSink {
    recorder: Recorder,
}

impl KubeEventSink {
    /// Create a sink reporting as `controller_name`.
    #[must_use]
    pub fn new(client: Client, controller_name: &str) -> Self {
        let reporter = Reporter {
            controller: controller_name.to_string(),
            instance: std::env::var("POD_NAME").ok(),
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventSink for KubeEventSink {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                object = ?resource_ref.name,
                reason,
                error = %e,
                "Failed to publish event"
            );
        }
    }
}

/// Discards every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopEventSink;

#[async_trait]
impl EventSink for NoopEventSink {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Event reasons (the REASON column of `kubectl get events`).
pub mod reasons {
    /// Desired state accepted and applied
    pub const SYNCED: &str = "Synced";
    /// Object failed validation
    pub const INVALID: &str = "Invalid";
    /// A referenced backend service does not exist
    pub const BACKEND_MISSING: &str = "BackendMissing";
    /// A referenced TLS secret does not exist
    pub const SECRET_MISSING: &str = "SecretMissing";
    /// Certificate is inside its renewal window
    pub const RENEWAL_DUE: &str = "RenewalDue";
    /// Certificate has expired
    pub const EXPIRED: &str = "Expired";
}

/// Event actions.
pub mod actions {
    /// Reconciliation of the object itself
    pub const RECONCILE: &str = "Reconcile";
    /// Validation against dependent objects
    pub const VALIDATE: &str = "Validate";
    /// Certificate validity check
    pub const CHECK_CERTIFICATE: &str = "CheckCertificate";
}
