//! Certificate expiry checks.

use crate::context::Context;
use async_trait::async_trait;
use chrono::Utc;
use controller_runtime::events::{actions, reasons};
use controller_runtime::{ListFilter, ObjectKey, OperatorError, PeriodicTask, Reconcile};
use crds::Validity;
use kube::runtime::events::EventType;
use kube::{Resource, ResourceExt};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct CertificateReconciler {
    ctx: Arc<Context>,
}

impl CertificateReconciler {
    pub fn new(ctx: Arc<Context>) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Reconcile for CertificateReconciler {
    async fn reconcile(&self, key: &ObjectKey) -> anyhow::Result<()> {
        let Ok(cert) = self.ctx.certificates.get()?.view().get(key) else {
            debug!(key = %key, "Certificate deleted");
            return Ok(());
        };
        let reference = cert.object_ref(&());
        let namespace = cert.namespace().unwrap_or_default();

        let secret = ObjectKey::namespaced(namespace, &cert.spec.secret_name);
        if self.ctx.secrets.get()?.view().get(&secret).is_err() {
            warn!(key = %key, secret = %secret, "Certificate secret not found");
            self.ctx
                .events
                .publish(
                    &reference,
                    EventType::Warning,
                    reasons::SECRET_MISSING,
                    actions::CHECK_CERTIFICATE,
                    Some(format!("secret {} not found", cert.spec.secret_name)),
                )
                .await;
        }

        let not_after = cert.status.as_ref().and_then(|status| status.not_after);
        match cert.validity(Utc::now(), self.ctx.renew_before_days) {
            Validity::Pending => debug!(key = %key, "Certificate not issued yet"),
            Validity::Valid => debug!(key = %key, not_after = ?not_after, "Certificate valid"),
            Validity::RenewalDue => {
                info!(key = %key, not_after = ?not_after, "Certificate due for renewal");
                self.ctx
                    .events
                    .publish(
                        &reference,
                        EventType::Warning,
                        reasons::RENEWAL_DUE,
                        actions::CHECK_CERTIFICATE,
                        not_after.map(|t| format!("expires at {}", t.to_rfc3339())),
                    )
                    .await;
            }
            Validity::Expired => {
                warn!(key = %key, not_after = ?not_after, "Certificate expired");
                self.ctx
                    .events
                    .publish(
                        &reference,
                        EventType::Warning,
                        reasons::EXPIRED,
                        actions::CHECK_CERTIFICATE,
                        not_after.map(|t| format!("expired at {}", t.to_rfc3339())),
                    )
                    .await;
            }
        }
        Ok(())
    }
}

/// Periodic task queueing every certificate, so validity is re-checked even
/// when nothing changes.
pub fn certificate_check(ctx: Arc<Context>, interval: Duration) -> Result<PeriodicTask, OperatorError> {
    PeriodicTask::new("certificate-check", interval, move || {
        let ctx = Arc::clone(&ctx);
        async move {
            let certificates = ctx.certificates.get()?;
            let mut queued = 0;
            for cert in certificates.view().list(&ListFilter::all()) {
                if let Some(key) = ObjectKey::from_object(cert.as_ref()) {
                    certificates.enqueue(key);
                    queued += 1;
                }
            }
            debug!(queued, "Queued certificates for validity check");
            anyhow::Ok(())
        }
    })
}
