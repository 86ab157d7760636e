//! Runtime error types.
//!
//! Only [`OperatorError::Registration`] and the cache sync failures are fatal
//! to a running operator. Handler and adapter failures are absorbed by the
//! work queue and the composite view respectively and never surface here.

use crate::kind::{KindId, ObjectKey};
use crate::operator::Phase;
use std::time::Duration;
use thiserror::Error;

/// Errors raised by the operator lifecycle.
#[derive(Debug, Error)]
pub enum OperatorError {
    /// A custom kind could not be registered; no bundle was constructed.
    #[error("failed to register {kind}: {source}")]
    Registration {
        /// Kind whose registration failed.
        kind: KindId,
        /// Underlying registry failure.
        #[source]
        source: RegistryError,
    },

    /// One or more caches did not sync before the startup timeout.
    #[error("timed out after {timeout:?} waiting for caches to sync: {}", join_kinds(.kinds))]
    CacheSyncTimeout {
        /// Kinds still unsynced when the timeout elapsed.
        kinds: Vec<KindId>,
        /// The timeout that elapsed.
        timeout: Duration,
    },

    /// Shutdown was requested, or a change stream ended, before every cache synced.
    #[error("cache sync aborted before completion: {}", join_kinds(.kinds))]
    SyncAborted {
        /// Kinds that had not synced yet.
        kinds: Vec<KindId>,
    },

    /// Two bundles were declared for the same kind.
    #[error("kind {0} is watched more than once")]
    DuplicateKind(KindId),

    /// A bundle factory produced a bundle for a different kind than declared.
    #[error("bundle declared as {declared} was built for {actual}")]
    KindMismatch {
        /// Kind the factory was registered under.
        declared: KindId,
        /// Kind of the bundle it returned.
        actual: KindId,
    },

    /// A lifecycle method was called in the wrong phase.
    #[error("cannot {operation} while operator is {phase}")]
    InvalidPhase {
        /// The rejected operation.
        operation: &'static str,
        /// Phase the operator was in.
        phase: Phase,
    },

    /// A change stream or queue was started twice.
    #[error("{0} already started")]
    AlreadyStarted(KindId),

    /// A queue was started before its cache synced.
    #[error("queue for {0} started before its cache synced")]
    NotSynced(KindId),

    /// A bundle factory failed.
    #[error("failed to construct {kind}: {message}")]
    Construction {
        /// Kind being constructed.
        kind: KindId,
        /// Failure description.
        message: String,
    },

    /// Invalid runtime configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Metrics registration failed.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}

/// Errors raised while registering a custom kind remotely.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Kubernetes API error
    #[error("Kubernetes error: {0}")]
    Api(#[from] kube::Error),

    /// The definition was applied but never became established.
    #[error("{name} not established within {timeout:?}")]
    NotEstablished {
        /// CRD name.
        name: String,
        /// How long we waited.
        timeout: Duration,
    },

    /// The registry refused the definition.
    #[error("registration rejected: {0}")]
    Rejected(String),
}

/// Read view miss.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind} {key} not found in cache")]
pub struct NotFound {
    /// Kind that was queried.
    pub kind: KindId,
    /// Key that was missing.
    pub key: ObjectKey,
}

fn join_kinds(kinds: &[KindId]) -> String {
    kinds
        .iter()
        .map(KindId::as_str)
        .collect::<Vec<_>>()
        .join(", ")
}
