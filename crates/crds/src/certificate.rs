//! Certificate CRD
//!
//! A TLS certificate for a set of domains, stored in a Secret. Issuance is
//! done elsewhere; the controller watches validity and flags certificates
//! that are due for renewal.

use chrono::{DateTime, TimeDelta, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "gantry.dev",
    version = "v1beta1",
    kind = "Certificate",
    namespaced,
    status = "CertificateStatus",
    shortname = "gcert"
)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Domains the certificate must cover; the first is the common name
    pub domains: Vec<String>,

    /// Secret the certificate and key are stored in
    pub secret_name: String,

    /// Renew this many days before expiry (controller default when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(range(max = 3650))]
    pub renew_before_days: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct CertificateStatus {
    /// Expiry of the currently issued certificate
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_after: Option<DateTime<Utc>>,

    /// Last time the certificate was issued or renewed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_issued: Option<DateTime<Utc>>,
}

/// Where a certificate stands relative to its expiry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Validity {
    /// Never issued
    Pending,
    /// Valid and outside the renewal window
    Valid,
    /// Valid but inside the renewal window
    RenewalDue,
    /// Past its expiry
    Expired,
}

impl Certificate {
    /// Classify this certificate at `now`, renewing `default_renew_before_days`
    /// ahead of expiry unless `spec.renewBeforeDays` says otherwise.
    pub fn validity(&self, now: DateTime<Utc>, default_renew_before_days: u32) -> Validity {
        let Some(not_after) = self.status.as_ref().and_then(|s| s.not_after) else {
            return Validity::Pending;
        };
        let renew_before = self
            .spec
            .renew_before_days
            .unwrap_or(default_renew_before_days);

        if not_after <= now {
            return Validity::Expired;
        }
        // A window reaching past the start of time puts any certificate in it
        let renew_at = TimeDelta::try_days(i64::from(renew_before))
            .and_then(|window| not_after.checked_sub_signed(window));
        match renew_at {
            Some(renew_at) if renew_at > now => Validity::Valid,
            _ => Validity::RenewalDue,
        }
    }
}
