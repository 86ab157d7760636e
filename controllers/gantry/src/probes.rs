//! Health, readiness and metrics endpoints.

use crate::error::ControllerError;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use controller_runtime::{Metrics, Operator, Phase};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

#[derive(Clone)]
pub struct ProbeState {
    pub operator: Arc<Operator>,
    pub metrics: Metrics,
}

pub fn router(state: ProbeState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the probe endpoints on `addr` until `shutdown` fires.
pub async fn serve(addr: SocketAddr, state: ProbeState, shutdown: CancellationToken) -> Result<(), ControllerError> {
    let listener = TcpListener::bind(addr).await?;
    info!("Probe server listening on {}", addr);
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await?;
    Ok(())
}

/// Run [`serve`] in the background, logging a failure as soon as it happens.
pub fn spawn(addr: SocketAddr, state: ProbeState, shutdown: CancellationToken) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(e) = serve(addr, state, shutdown).await {
            error!(error = %e, %addr, "Probe server failed");
        }
    })
}

async fn healthz() -> &'static str {
    "ok"
}

/// Ready only while queues are draining.
async fn readyz(State(state): State<ProbeState>) -> (StatusCode, String) {
    match state.operator.phase() {
        Phase::Running => (StatusCode::OK, "ok".to_string()),
        phase => (StatusCode::SERVICE_UNAVAILABLE, phase.to_string()),
    }
}

async fn metrics(State(state): State<ProbeState>) -> Response {
    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            warn!(error = %e, "Failed to encode metrics");
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}
