//! Native ingress conversion
//!
//! Builds a Gantry [`Ingress`] from a `networking.k8s.io/v1` ingress so that
//! both can be listed and reconciled uniformly.

use crate::ingress::{
    Ingress, IngressBackend, IngressPath, IngressRule, IngressSpec, IngressTls, ServicePort,
};
use k8s_openapi::api::networking::v1 as networking;
use std::collections::BTreeMap;
use thiserror::Error;

/// Annotation recording which API an ingress was converted from.
pub const ORIGIN_ANNOTATION: &str = "gantry.dev/origin";

/// Origin value for ingresses converted from `networking.k8s.io/v1`.
pub const NATIVE_ORIGIN: &str = "networking.k8s.io/v1";

/// Legacy annotation selecting the ingress class.
pub const CLASS_ANNOTATION: &str = "kubernetes.io/ingress.class";

/// Why a native ingress cannot be represented as a Gantry ingress.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConversionError {
    /// The ingress has no name.
    #[error("ingress has no name")]
    MissingName,

    /// The ingress belongs to another controller.
    #[error("ingress class {found:?} does not match {expected}")]
    ClassMismatch {
        /// Class this controller serves.
        expected: String,
        /// Class found on the ingress.
        found: Option<String>,
    },

    /// A backend points at something other than a service.
    #[error("backend without a service is not supported")]
    UnsupportedBackend,

    /// A service backend names no port.
    #[error("backend {0} has no port")]
    MissingPort(String),
}

impl Ingress {
    /// Convert a native ingress of class `class`.
    ///
    /// The result keeps the native metadata and carries
    /// [`ORIGIN_ANNOTATION`] = [`NATIVE_ORIGIN`].
    ///
    /// # Errors
    ///
    /// Returns a [`ConversionError`] when the ingress is unnamed, of another
    /// class, or uses a backend shape Gantry does not support.
    pub fn from_native(native: &networking::Ingress, class: &str) -> Result<Self, ConversionError> {
        let name = native
            .metadata
            .name
            .clone()
            .ok_or(ConversionError::MissingName)?;

        let found = ingress_class(native);
        if found.as_deref() != Some(class) {
            return Err(ConversionError::ClassMismatch {
                expected: class.to_string(),
                found,
            });
        }

        let spec = native.spec.clone().unwrap_or_default();
        let backend = spec.default_backend.as_ref().map(convert_backend).transpose()?;
        let tls = spec
            .tls
            .unwrap_or_default()
            .into_iter()
            .map(|tls| IngressTls {
                hosts: tls.hosts.unwrap_or_default(),
                secret_name: tls.secret_name,
            })
            .collect();
        let rules = spec
            .rules
            .unwrap_or_default()
            .into_iter()
            .map(|rule| {
                let paths = rule
                    .http
                    .map(|http| http.paths)
                    .unwrap_or_default()
                    .iter()
                    .map(|path| {
                        Ok(IngressPath {
                            path: path.path.clone(),
                            backend: convert_backend(&path.backend)?,
                        })
                    })
                    .collect::<Result<Vec<_>, ConversionError>>()?;
                Ok(IngressRule {
                    host: rule.host,
                    paths,
                })
            })
            .collect::<Result<Vec<_>, ConversionError>>()?;

        let mut ingress = Self::new(&name, IngressSpec { backend, tls, rules });
        ingress.metadata = native.metadata.clone();
        ingress
            .metadata
            .annotations
            .get_or_insert_with(BTreeMap::new)
            .insert(ORIGIN_ANNOTATION.to_string(), NATIVE_ORIGIN.to_string());
        Ok(ingress)
    }

    /// Whether this ingress was converted from a native one.
    pub fn is_converted(&self) -> bool {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|annotations| annotations.get(ORIGIN_ANNOTATION))
            .is_some_and(|origin| origin == NATIVE_ORIGIN)
    }
}

/// Class of a native ingress: `spec.ingressClassName`, else the legacy annotation.
pub fn ingress_class(native: &networking::Ingress) -> Option<String> {
    native
        .spec
        .as_ref()
        .and_then(|spec| spec.ingress_class_name.clone())
        .or_else(|| {
            native
                .metadata
                .annotations
                .as_ref()
                .and_then(|annotations| annotations.get(CLASS_ANNOTATION).cloned())
        })
}

fn convert_backend(backend: &networking::IngressBackend) -> Result<IngressBackend, ConversionError> {
    let service = backend
        .service
        .as_ref()
        .ok_or(ConversionError::UnsupportedBackend)?;
    let port = service
        .port
        .as_ref()
        .ok_or_else(|| ConversionError::MissingPort(service.name.clone()))?;
    Ok(IngressBackend {
        service_name: service.name.clone(),
        service_port: ServicePort {
            number: port.number,
            name: port.name.clone(),
        },
    })
}
