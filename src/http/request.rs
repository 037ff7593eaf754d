//! Request handling and transformation.
//!
//! # Responsibilities
//! - Assign a request ID (UUID v4) and echo it on the response
//! - Collect the inbound body and describe the outbound request
//!
//! # Design Decisions
//! - Request ID added as early as possible for tracing
//! - Inbound bodies are collected up front (bounded); LLM request bodies are
//!   small JSON documents and the recording needs them whole anyway

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, HeaderName, Method, Request};
use tower_http::request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer};

use crate::error::ProxyError;

pub const X_REQUEST_ID: &str = "x-request-id";

/// Layer that stamps a fresh `x-request-id` on requests lacking one.
pub fn set_request_id_layer() -> SetRequestIdLayer<MakeRequestUuid> {
    SetRequestIdLayer::new(HeaderName::from_static(X_REQUEST_ID), MakeRequestUuid)
}

/// Layer that copies the request ID onto the response.
pub fn propagate_request_id_layer() -> PropagateRequestIdLayer {
    PropagateRequestIdLayer::new(HeaderName::from_static(X_REQUEST_ID))
}

/// Read the request ID assigned by [`set_request_id_layer`].
pub trait RequestIdExt {
    fn request_id(&self) -> &str;
}

impl RequestIdExt for HeaderMap {
    fn request_id(&self) -> &str {
        self.get(X_REQUEST_ID)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("unknown")
    }
}

impl<B> RequestIdExt for Request<B> {
    fn request_id(&self) -> &str {
        self.headers().request_id()
    }
}

/// Everything the forwarder needs to issue the upstream request.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    /// Path plus query string, starting with `/`.
    pub path_and_query: String,
    pub headers: HeaderMap,
    /// `None` when the inbound request had no body bytes.
    pub body: Option<Bytes>,
}

impl OutboundRequest {
    /// Collect an inbound request, reading at most `max_body_bytes`.
    pub async fn from_inbound(request: Request<Body>, max_body_bytes: usize) -> Result<Self, ProxyError> {
        let (parts, body) = request.into_parts();
        let body = axum::body::to_bytes(body, max_body_bytes)
            .await
            .map_err(ProxyError::RequestBody)?;

        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            method: parts.method,
            path_and_query,
            headers: parts.headers,
            body: (!body.is_empty()).then_some(body),
        })
    }

    pub fn path(&self) -> &str {
        self.path_and_query
            .split_once('?')
            .map_or(self.path_and_query.as_str(), |(path, _)| path)
    }
}
