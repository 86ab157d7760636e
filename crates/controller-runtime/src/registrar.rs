//! Custom kind registration.
//!
//! Every custom kind an operator watches has to exist on the API server
//! before its change stream starts, otherwise the initial list fails.

use crate::error::{OperatorError, RegistryError};
use crate::kind::KindDefinition;
use async_trait::async_trait;
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::Client;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// Default time to wait for a CRD to become established.
pub const DEFAULT_ESTABLISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Remote registry of custom kinds.
///
/// Implementations must be idempotent: ensuring an already registered kind
/// succeeds without side effects.
#[async_trait]
pub trait KindRegistry: Send + Sync {
    /// Make sure `definition` exists and is usable.
    async fn ensure(&self, definition: &KindDefinition) -> Result<(), RegistryError>;
}

/// Registers CRDs with server-side apply and waits until they are established.
#[derive(Clone)]
pub struct KubeKindRegistry {
    client: Client,
    field_manager: String,
    establish_timeout: Duration,
}

impl KubeKindRegistry {
    /// Create a registry applying CRDs as `field_manager`.
    pub fn new(client: Client, field_manager: impl Into<String>) -> Self {
        Self {
            client,
            field_manager: field_manager.into(),
            establish_timeout: DEFAULT_ESTABLISH_TIMEOUT,
        }
    }

    /// Override how long to wait for the `Established` condition.
    #[must_use]
    pub const fn establish_timeout(mut self, timeout: Duration) -> Self {
        self.establish_timeout = timeout;
        self
    }
}

#[async_trait]
impl KindRegistry for KubeKindRegistry {
    async fn ensure(&self, definition: &KindDefinition) -> Result<(), RegistryError> {
        let crds: Api<CustomResourceDefinition> = Api::all(self.client.clone());
        let params = PatchParams::apply(&self.field_manager).force();

        debug!(crd = %definition.name, "Applying CRD");
        crds.patch(&definition.name, &params, &Patch::Apply(&definition.crd))
            .await?;

        let established = await_condition(crds, &definition.name, conditions::is_crd_established());
        match tokio::time::timeout(self.establish_timeout, established).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(e)) => Err(RegistryError::Rejected(format!(
                "watching {} failed: {e}",
                definition.name
            ))),
            Err(_) => Err(RegistryError::NotEstablished {
                name: definition.name.clone(),
                timeout: self.establish_timeout,
            }),
        }
    }
}

/// Ensures a set of custom kinds exists, all or nothing.
#[derive(Clone)]
pub struct Registrar {
    registry: Arc<dyn KindRegistry>,
}

impl Registrar {
    /// Create a registrar over `registry`.
    #[must_use]
    pub fn new(registry: Arc<dyn KindRegistry>) -> Self {
        Self { registry }
    }

    /// Register `definitions` one after another.
    ///
    /// # Errors
    ///
    /// Stops at the first kind that cannot be registered and returns
    /// [`OperatorError::Registration`] naming it.
    pub async fn ensure_registered(&self, definitions: &[KindDefinition]) -> Result<(), OperatorError> {
        info!(count = definitions.len(), "Ensuring CRD registration");
        for definition in definitions {
            self.registry
                .ensure(definition)
                .await
                .map_err(|source| OperatorError::Registration {
                    kind: definition.id.clone(),
                    source,
                })?;
            info!(kind = %definition.id, crd = %definition.name, "CRD registered");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::KindId;
    use crate::mock::MockKindRegistry;

    fn definition(kind: &str, name: &str) -> KindDefinition {
        KindDefinition {
            id: KindId::new(kind),
            name: name.to_string(),
            crd: CustomResourceDefinition::default(),
        }
    }

    #[tokio::test]
    async fn test_registers_every_kind_in_order() {
        let registry = Arc::new(MockKindRegistry::new());
        let registrar = Registrar::new(registry.clone());
        let definitions = [
            definition("Ingress.gantry.dev", "ingresses.gantry.dev"),
            definition("Certificate.gantry.dev", "certificates.gantry.dev"),
        ];

        registrar.ensure_registered(&definitions).await.unwrap();
        assert_eq!(
            registry.registered(),
            ["ingresses.gantry.dev", "certificates.gantry.dev"]
        );

        // Registering again is a no-op
        registrar.ensure_registered(&definitions).await.unwrap();
        assert_eq!(registry.registered().len(), 2);
        assert_eq!(registry.calls(), 4);
    }

    #[tokio::test]
    async fn test_first_failure_aborts() {
        let registry = Arc::new(MockKindRegistry::new().fail_on("ingresses.gantry.dev"));
        let registrar = Registrar::new(registry.clone());
        let definitions = [
            definition("Ingress.gantry.dev", "ingresses.gantry.dev"),
            definition("Certificate.gantry.dev", "certificates.gantry.dev"),
        ];

        let err = registrar.ensure_registered(&definitions).await.unwrap_err();
        match err {
            OperatorError::Registration { kind, .. } => assert_eq!(kind.as_str(), "Ingress.gantry.dev"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(registry.registered().is_empty());
        assert_eq!(registry.calls(), 1);
    }
}
