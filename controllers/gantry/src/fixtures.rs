//! Object builders for tests.

use chrono::{DateTime, Utc};
use crds::{
    Certificate, CertificateSpec, CertificateStatus, Ingress, IngressBackend, IngressPath, IngressRule,
    IngressSpec, IngressTls, ServicePort,
};
use k8s_openapi::api::core::v1::{Secret, Service};
use k8s_openapi::api::networking::v1 as networking;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

pub fn meta(namespace: &str, name: &str) -> ObjectMeta {
    ObjectMeta {
        namespace: Some(namespace.to_string()),
        name: Some(name.to_string()),
        ..Default::default()
    }
}

/// Gantry ingress routing `/` to `service`, terminating TLS with `<name>-tls`.
pub fn gantry_ingress(namespace: &str, name: &str, service: &str) -> Ingress {
    let mut ingress = Ingress::new(
        name,
        IngressSpec {
            backend: None,
            tls: vec![IngressTls {
                hosts: vec![format!("{name}.example.com")],
                secret_name: Some(format!("{name}-tls")),
            }],
            rules: vec![IngressRule {
                host: Some(format!("{name}.example.com")),
                paths: vec![IngressPath {
                    path: Some("/".to_string()),
                    backend: IngressBackend {
                        service_name: service.to_string(),
                        service_port: ServicePort {
                            number: Some(80),
                            name: None,
                        },
                    },
                }],
            }],
        },
    );
    ingress.metadata.namespace = Some(namespace.to_string());
    ingress
}

/// Native ingress of `class` whose default backend is `service`.
pub fn native_ingress(namespace: &str, name: &str, class: Option<&str>, service: &str) -> networking::Ingress {
    networking::Ingress {
        metadata: meta(namespace, name),
        spec: Some(networking::IngressSpec {
            ingress_class_name: class.map(str::to_string),
            default_backend: Some(networking::IngressBackend {
                service: Some(networking::IngressServiceBackend {
                    name: service.to_string(),
                    port: Some(networking::ServiceBackendPort {
                        number: Some(80),
                        name: None,
                    }),
                }),
                resource: None,
            }),
            ..Default::default()
        }),
        ..Default::default()
    }
}

pub fn service(namespace: &str, name: &str) -> Service {
    Service {
        metadata: meta(namespace, name),
        ..Default::default()
    }
}

pub fn secret(namespace: &str, name: &str) -> Secret {
    Secret {
        metadata: meta(namespace, name),
        ..Default::default()
    }
}

pub fn certificate(namespace: &str, name: &str, secret_name: &str, not_after: Option<DateTime<Utc>>) -> Certificate {
    let mut cert = Certificate::new(
        name,
        CertificateSpec {
            domains: vec![format!("{name}.example.com")],
            secret_name: secret_name.to_string(),
            renew_before_days: None,
        },
    );
    cert.metadata.namespace = Some(namespace.to_string());
    cert.status = Some(CertificateStatus {
        not_after,
        last_issued: None,
    });
    cert
}
