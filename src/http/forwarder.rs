//! Upstream request forwarding.
//!
//! # Responsibilities
//! - Build exactly one outbound request per inbound request
//! - Strip `Accept-Encoding` so upstream bodies arrive uncompressed
//! - Expose the exchange as an ordered event stream:
//!   `Head`, `BodyPart`*, then exactly one of `Complete` / `Error`
//!
//! # Design Decisions
//! - No retries: one attempt, failures surface as `Error`
//! - The event stream is lazy. The upstream body is read only when the
//!   consumer polls, and dropping the stream drops the connection
//! - One pooled client per process, owned by the proxy service

use axum::body::{Body, BodyDataStream, Bytes};
use axum::http::{header, HeaderMap, HeaderValue, Request, StatusCode, Uri, Version};
use futures_util::stream::{self, BoxStream, StreamExt};
use hyper_util::{
    client::legacy::{connect::HttpConnector, Client, ResponseFuture},
    rt::TokioExecutor,
};
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::http::request::OutboundRequest;
use crate::http::response::strip_hop_by_hop;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("invalid upstream target {0}")]
    InvalidTarget(String),

    #[error("failed to build upstream request: {0}")]
    Build(#[from] axum::http::Error),

    #[error("upstream unreachable: {0}")]
    Connect(#[source] hyper_util::client::legacy::Error),

    #[error("upstream body failed: {0}")]
    Stream(#[source] axum::Error),

    #[error("upstream closed before sending a response head")]
    MissingHead,

    #[error("upstream stream ended without completing")]
    Truncated,
}

/// Status line and headers of the upstream response.
#[derive(Debug, Clone)]
pub struct ResponseHead {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub version: Version,
}

/// One step of an upstream exchange.
#[derive(Debug)]
pub enum UpstreamEvent {
    Head(ResponseHead),
    BodyPart(Bytes),
    Complete,
    Error(ForwardError),
}

/// Ordered upstream events for one request.
pub type UpstreamEvents = BoxStream<'static, UpstreamEvent>;

/// Issues requests against a single upstream base URL.
#[derive(Clone)]
pub struct Forwarder {
    client: Client<HttpConnector, Body>,
    base_url: Url,
}

impl Forwarder {
    pub fn new(base_url: Url, connect_timeout: Duration) -> Self {
        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(connect_timeout));
        connector.set_nodelay(true);

        let client = Client::builder(TokioExecutor::new()).build(connector);
        Self { client, base_url }
    }

    /// `<base-url><path-and-query>`.
    pub fn target_url(&self, path_and_query: &str) -> String {
        let base = self.base_url.as_str().trim_end_matches('/');
        if path_and_query.starts_with('/') {
            format!("{base}{path_and_query}")
        } else {
            format!("{base}/{path_and_query}")
        }
    }

    /// Headers as sent upstream: no `Accept-Encoding`, no hop-by-hop
    /// headers, `Host` pointing at the upstream.
    pub fn outbound_headers(&self, inbound: &HeaderMap, target: &Uri) -> HeaderMap {
        let mut headers = inbound.clone();
        headers.remove(header::ACCEPT_ENCODING);
        strip_hop_by_hop(&mut headers);
        headers.remove(header::HOST);
        if let Some(authority) = target.authority() {
            if let Ok(host) = HeaderValue::from_str(authority.as_str()) {
                headers.insert(header::HOST, host);
            }
        }
        headers
    }

    /// Build the upstream request without sending it.
    pub fn build_request(&self, outbound: &OutboundRequest) -> Result<Request<Body>, ForwardError> {
        let target = self.target_url(&outbound.path_and_query);
        let uri: Uri = target
            .parse()
            .map_err(|_| ForwardError::InvalidTarget(target.clone()))?;
        let headers = self.outbound_headers(&outbound.headers, &uri);

        let mut request = Request::builder().method(outbound.method.clone()).uri(uri);
        if let Some(h) = request.headers_mut() {
            *h = headers;
        }
        let body = match &outbound.body {
            Some(bytes) => Body::from(bytes.clone()),
            None => Body::empty(),
        };
        Ok(request.body(body)?)
    }

    /// Issue the request and stream its events.
    pub fn forward(&self, outbound: &OutboundRequest) -> UpstreamEvents {
        let state = match self.build_request(outbound) {
            Ok(request) => ExchangeState::Connecting(self.client.request(request)),
            Err(e) => ExchangeState::Rejected(e),
        };
        stream::unfold(state, next_event).boxed()
    }
}

enum ExchangeState {
    Connecting(ResponseFuture),
    Rejected(ForwardError),
    Streaming(BodyDataStream),
    Finished,
}

async fn next_event(state: ExchangeState) -> Option<(UpstreamEvent, ExchangeState)> {
    match state {
        ExchangeState::Connecting(pending) => match pending.await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                let head = ResponseHead {
                    status: parts.status,
                    headers: parts.headers,
                    version: parts.version,
                };
                let body = Body::new(body).into_data_stream();
                Some((UpstreamEvent::Head(head), ExchangeState::Streaming(body)))
            }
            Err(e) => Some((UpstreamEvent::Error(ForwardError::Connect(e)), ExchangeState::Finished)),
        },
        ExchangeState::Rejected(e) => Some((UpstreamEvent::Error(e), ExchangeState::Finished)),
        ExchangeState::Streaming(mut body) => loop {
            match body.next().await {
                Some(Ok(bytes)) if bytes.is_empty() => continue,
                Some(Ok(bytes)) => return Some((UpstreamEvent::BodyPart(bytes), ExchangeState::Streaming(body))),
                Some(Err(e)) => {
                    return Some((UpstreamEvent::Error(ForwardError::Stream(e)), ExchangeState::Finished))
                }
                None => return Some((UpstreamEvent::Complete, ExchangeState::Finished)),
            }
        },
        ExchangeState::Finished => None,
    }
}
