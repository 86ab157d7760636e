//! ServiceMonitor (monitoring.coreos.com/v1)
//!
//! Owned by the Prometheus operator, not by Gantry. Only the fields the
//! controller reads are modelled; the kind is never registered by Gantry and
//! is watched only when the group is served.

use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;
use kube::CustomResource;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// API group of the Prometheus operator.
pub const MONITORING_GROUP: &str = "monitoring.coreos.com";

#[derive(CustomResource, Debug, Clone, Default, Serialize, Deserialize)]
#[kube(
    group = "monitoring.coreos.com",
    version = "v1",
    kind = "ServiceMonitor",
    namespaced,
    schema = "disabled"
)]
#[serde(rename_all = "camelCase")]
pub struct ServiceMonitorSpec {
    /// Services scraped by this monitor
    #[serde(default)]
    pub selector: LabelSelector,

    /// Scrape endpoints
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub endpoints: Vec<Endpoint>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Endpoint {
    /// Named service port
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,

    /// HTTP path to scrape
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Scrape interval, e.g. "30s"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub interval: Option<String>,
}

impl ServiceMonitor {
    /// Whether this monitor selects an object carrying `labels`.
    ///
    /// Only `matchLabels` is evaluated; a selector without it matches nothing.
    pub fn selects(&self, labels: &BTreeMap<String, String>) -> bool {
        match &self.spec.selector.match_labels {
            Some(wanted) if !wanted.is_empty() => wanted
                .iter()
                .all(|(key, value)| labels.get(key) == Some(value)),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_selects_by_match_labels() {
        let mut monitor = ServiceMonitor::new("web", ServiceMonitorSpec::default());
        let labels = BTreeMap::from([("app".to_string(), "web".to_string())]);
        assert!(!monitor.selects(&labels));

        monitor.spec.selector.match_labels = Some(labels.clone());
        assert!(monitor.selects(&labels));
        assert!(!monitor.selects(&BTreeMap::new()));
    }
}
