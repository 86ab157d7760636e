//! Reconcilers, one per watched kind.

mod certificate;
mod dependents;
mod ingress;

pub use certificate::{certificate_check, CertificateReconciler};
pub use dependents::{Dependency, DependencyReconciler};
pub use ingress::{IngressReconciler, NativeIngressReconciler};
