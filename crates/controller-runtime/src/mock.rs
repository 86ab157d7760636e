//! In-memory collaborators for tests.
//!
//! Enabled with the `test-util` feature.

use crate::error::RegistryError;
use crate::events::EventSink;
use crate::kind::KindDefinition;
use crate::registrar::KindRegistry;
use async_trait::async_trait;
use k8s_openapi::api::core::v1::ObjectReference;
use kube::runtime::events::EventType;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Kind registry that keeps registrations in memory.
#[derive(Debug, Default)]
pub struct MockKindRegistry {
    registered: Mutex<Vec<String>>,
    failing: HashSet<String>,
    calls: AtomicUsize,
}

impl MockKindRegistry {
    /// Registry that accepts every definition.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Reject the definition with CRD name `name`.
    #[must_use]
    pub fn fail_on(mut self, name: impl Into<String>) -> Self {
        self.failing.insert(name.into());
        self
    }

    /// CRD names registered so far, in registration order.
    pub fn registered(&self) -> Vec<String> {
        self.registered.lock().clone()
    }

    /// Number of `ensure` calls, successful or not.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl KindRegistry for MockKindRegistry {
    async fn ensure(&self, definition: &KindDefinition) -> Result<(), RegistryError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&definition.name) {
            return Err(RegistryError::Rejected(format!(
                "{} rejected by mock registry",
                definition.name
            )));
        }
        let mut registered = self.registered.lock();
        if !registered.contains(&definition.name) {
            registered.push(definition.name.clone());
        }
        Ok(())
    }
}

/// An event captured by [`RecordingEventSink`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedEvent {
    /// `namespace/name` of the referenced object.
    pub object: String,
    /// `Normal` or `Warning`.
    pub type_: String,
    /// Event reason.
    pub reason: String,
    /// Event action.
    pub action: String,
    /// Event note.
    pub note: Option<String>,
}

/// Event sink that stores every event for later assertions.
#[derive(Debug, Default)]
pub struct RecordingEventSink {
    events: Mutex<Vec<RecordedEvent>>,
}

impl RecordingEventSink {
    /// Empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Events published so far.
    pub fn events(&self) -> Vec<RecordedEvent> {
        self.events.lock().clone()
    }

    /// Reasons of the events published so far.
    pub fn reasons(&self) -> Vec<String> {
        self.events.lock().iter().map(|e| e.reason.clone()).collect()
    }
}

#[async_trait]
impl EventSink for RecordingEventSink {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let object = match (&resource_ref.namespace, &resource_ref.name) {
            (Some(ns), Some(name)) => format!("{ns}/{name}"),
            (None, Some(name)) => name.clone(),
            _ => String::new(),
        };
        self.events.lock().push(RecordedEvent {
            object,
            type_: format!("{type_:?}"),
            reason: reason.to_string(),
            action: action.to_string(),
            note,
        });
    }
}
