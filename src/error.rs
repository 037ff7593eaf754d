//! Request-level errors and their HTTP mapping.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::http::forwarder::ForwardError;
use crate::recording::recorder::RecordError;

/// Failure outcome of a single proxied request.
///
/// Only failures that happen before the client response starts end up here;
/// once streaming has begun, errors terminate the client body instead.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("Upstream unavailable: {0}")]
    UpstreamUnavailable(#[source] ForwardError),

    #[error("Failed to read request body: {0}")]
    RequestBody(#[source] axum::Error),

    #[error("Recorder error: {0}")]
    Recording(#[from] RecordError),
}

impl ProxyError {
    pub fn status(&self) -> StatusCode {
        match self {
            ProxyError::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            ProxyError::RequestBody(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ProxyError::Recording(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let message = match &self {
            ProxyError::UpstreamUnavailable(_) => "Upstream request failed",
            ProxyError::RequestBody(_) => "Request body rejected",
            ProxyError::Recording(_) => "Internal proxy error",
        };
        (self.status(), message).into_response()
    }
}
