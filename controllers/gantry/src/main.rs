//! Gantry Controller
//!
//! Ingress controller built on the multi-kind controller runtime:
//! - Ingress (gantry.dev) and native networking.k8s.io ingresses of our class
//! - Certificate: expiry and renewal checks
//! - Services, Endpoints, Secrets, ConfigMaps, Deployments and Namespaces
//!   the ingresses depend on, plus ServiceMonitors when Prometheus operator
//!   is installed
//!
//! Serves `/healthz`, `/readyz` and `/metrics` on `PROBE_ADDR`.

mod config;
mod context;
mod controller;
mod error;
#[cfg(test)]
mod fixtures;
mod handlers;
mod probes;

use crate::config::Config;
use crate::controller::Controller;
use crate::error::ControllerError;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<(), ControllerError> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    if rustls::crypto::ring::default_provider().install_default().is_err() {
        warn!("A rustls crypto provider was already installed");
    }

    info!("Starting Gantry Controller");

    let config = Config::from_env()?;
    config.log();

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(shutdown.clone()));

    let controller = Controller::new(&config).await?;
    controller.run(shutdown).await?;

    info!("Gantry Controller stopped");
    Ok(())
}

/// Cancel `shutdown` on SIGINT or SIGTERM.
async fn shutdown_on_signal(shutdown: CancellationToken) {
    let interrupt = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Cannot listen for SIGINT");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = interrupt => info!("Received SIGINT, shutting down"),
        () = terminate => info!("Received SIGTERM, shutting down"),
    }
    shutdown.cancel();
}
