//! Crate-wide error taxonomy.
//!
//! Every fallible operation in `moltbot` returns through [`Error`], which
//! maps onto the error kinds spec'd for the service (illegal argument,
//! not found, no available model, upstream failures, cancellation and
//! wait-timeout) plus an `Internal` catch-all for ambient failures
//! (config I/O, serialization) that don't belong to the task domain.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("illegal argument: {0}")]
    IllegalArgument(String),

    #[error("task not found: {0}")]
    NotFound(String),

    #[error("no available model for task")]
    NoAvailableModel,

    #[error("transient upstream error: {0}")]
    UpstreamTransient(String),

    #[error("upstream returned {status}: {body}")]
    UpstreamPermanent { status: u16, body: String },

    #[error("task was cancelled")]
    Cancelled,

    #[error("timed out waiting for task")]
    Timeout,

    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl Error {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Error::IllegalArgument(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::NoAvailableModel => StatusCode::SERVICE_UNAVAILABLE,
            Error::UpstreamTransient(_) | Error::UpstreamPermanent { .. } => StatusCode::BAD_GATEWAY,
            Error::Cancelled => StatusCode::CONFLICT,
            Error::Timeout => StatusCode::REQUEST_TIMEOUT,
            Error::Http(_) | Error::Json(_) | Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Http(_) | Error::Json(_) | Error::Internal(_) => {
                tracing::error!(error = %self, "internal error");
            }
            Error::UpstreamTransient(_) | Error::UpstreamPermanent { .. } => {
                tracing::warn!(error = %self, "upstream error");
            }
            _ => {
                tracing::debug!(error = %self, "client error");
            }
        }

        let status = self.status_code();
        let body = json!({ "error": status.canonical_reason().unwrap_or("error"), "message": self.to_string() });
        (status, axum::response::Json(body)).into_response()
    }
}
