//! Error types for the platform client

use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Request failed with status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Deployment failed: {0}")]
    DeploymentFailed(String),

    #[error("Deployment status check timed out after {0:?}")]
    Timeout(Duration),
}
