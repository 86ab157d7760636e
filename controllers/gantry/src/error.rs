//! Error types for the Gantry controller

use controller_runtime::OperatorError;
use kube::Error as KubeError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    #[error("Operator error: {0}")]
    Operator(#[from] OperatorError),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Probe server error: {0}")]
    Server(#[from] std::io::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
}
