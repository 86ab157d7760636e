//! Ingress CRD
//!
//! Gantry's own ingress kind. Native `networking.k8s.io/v1` ingresses of the
//! configured class are converted into it (see [`crate::conversion`]) so the
//! controller can treat both representations alike.

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation naming a ConfigMap with extra proxy configuration.
pub const CONFIG_ANNOTATION: &str = "gantry.dev/config";

/// Annotation enabling the stats endpoint, scraped through a ServiceMonitor.
pub const STATS_ANNOTATION: &str = "gantry.dev/stats";

/// Prefix of the proxy Deployment created for each ingress.
pub const OFFSHOOT_PREFIX: &str = "gantry-";

#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gantry.dev",
    version = "v1beta1",
    kind = "Ingress",
    namespaced,
    status = "IngressStatus",
    shortname = "ging"
)]
#[serde(rename_all = "camelCase")]
pub struct IngressSpec {
    /// Default backend for requests matching no rule
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backend: Option<IngressBackend>,

    /// TLS termination per host set
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tls: Vec<IngressTls>,

    /// Host and path routing rules
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rules: Vec<IngressRule>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressTls {
    /// Hosts covered by the certificate
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub hosts: Vec<String>,

    /// Secret holding the certificate and key
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressRule {
    /// Host this rule applies to; empty matches all hosts
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    /// HTTP paths
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub paths: Vec<IngressPath>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressPath {
    /// Path prefix, "/" when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Where matching requests go
    pub backend: IngressBackend,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressBackend {
    /// Service in the ingress' namespace
    pub service_name: String,

    /// Service port, by number or name
    pub service_port: ServicePort,
}

/// Exactly one of `number` or `name` is expected.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ServicePort {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<i32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngressStatus {
    /// Generation last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Whether every backend and TLS secret resolved
    #[serde(default)]
    pub ready: bool,

    /// Why the ingress is not ready
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Ingress {
    /// Every backend referenced by `spec`: the default backend first, then
    /// rule paths in order.
    pub fn backends(&self) -> Vec<&IngressBackend> {
        self.spec
            .backend
            .iter()
            .chain(
                self.spec
                    .rules
                    .iter()
                    .flat_map(|rule| rule.paths.iter().map(|path| &path.backend)),
            )
            .collect()
    }

    /// Names of the TLS secrets referenced by `spec`.
    pub fn tls_secrets(&self) -> Vec<&str> {
        self.spec
            .tls
            .iter()
            .filter_map(|tls| tls.secret_name.as_deref())
            .collect()
    }

    /// Whether this ingress references service `name`.
    pub fn uses_service(&self, name: &str) -> bool {
        self.backends().iter().any(|backend| backend.service_name == name)
    }

    /// Whether this ingress terminates TLS with secret `name`.
    pub fn uses_secret(&self, name: &str) -> bool {
        self.tls_secrets().contains(&name)
    }

    /// ConfigMap named by [`CONFIG_ANNOTATION`].
    pub fn config_map(&self) -> Option<&str> {
        self.annotations().get(CONFIG_ANNOTATION).map(String::as_str)
    }

    /// Whether [`STATS_ANNOTATION`] is `"true"`.
    pub fn stats_enabled(&self) -> bool {
        self.annotations()
            .get(STATS_ANNOTATION)
            .is_some_and(|value| value == "true")
    }

    /// Name of the proxy Deployment serving this ingress.
    pub fn offshoot_name(&self) -> String {
        format!("{OFFSHOOT_PREFIX}{}", self.name_any())
    }
}

/// Ingress served by the proxy Deployment `deployment`, if it is one.
pub fn ingress_for_offshoot(deployment: &str) -> Option<&str> {
    deployment
        .strip_prefix(OFFSHOOT_PREFIX)
        .filter(|name| !name.is_empty())
}
