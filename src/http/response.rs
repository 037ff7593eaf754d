//! Response handling and transformation.
//!
//! # Responsibilities
//! - Relay upstream status and headers to the client
//! - Strip hop-by-hop headers; the server re-applies its own framing
//!
//! # Design Decisions
//! - `transfer-encoding` is dropped on the way out. A chunked upstream body
//!   is relayed as a stream, which hyper frames again (chunked on HTTP/1.1,
//!   DATA frames on HTTP/2).
//! - `content-length` is kept; buffered bodies are relayed byte-exact.

use axum::body::Body;
use axum::http::{HeaderMap, StatusCode};
use axum::response::Response;

/// Connection-scoped headers that must not be forwarded.
pub const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP.iter().any(|h| h.eq_ignore_ascii_case(name))
}

/// Remove hop-by-hop headers, including any named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let named: Vec<String> = headers
        .get_all("connection")
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|t| t.trim().to_ascii_lowercase())
        .filter(|t| !t.is_empty())
        .collect();
    for name in HOP_BY_HOP.iter().copied().map(str::to_string).chain(named) {
        headers.remove(name.as_str());
    }
}

/// Build the client response for an upstream head and a body.
pub fn relay(status: StatusCode, upstream_headers: &HeaderMap, body: Body) -> Response {
    let mut headers = upstream_headers.clone();
    strip_hop_by_hop(&mut headers);

    let mut response = Response::new(body);
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    #[test]
    fn relay_keeps_end_to_end_headers() {
        let mut upstream = HeaderMap::new();
        upstream.insert("content-type", HeaderValue::from_static("application/x-ndjson"));
        upstream.insert("transfer-encoding", HeaderValue::from_static("chunked"));
        upstream.insert("connection", HeaderValue::from_static("keep-alive, x-private"));
        upstream.insert("x-private", HeaderValue::from_static("1"));
        upstream.append("x-multi", HeaderValue::from_static("a"));
        upstream.append("x-multi", HeaderValue::from_static("b"));

        let response = relay(StatusCode::CREATED, &upstream, Body::empty());
        assert_eq!(response.status(), StatusCode::CREATED);
        let headers = response.headers();
        assert_eq!(headers["content-type"], "application/x-ndjson");
        assert!(headers.get("transfer-encoding").is_none());
        assert!(headers.get("connection").is_none());
        assert!(headers.get("x-private").is_none());
        assert_eq!(headers.get_all("x-multi").iter().count(), 2);
    }

    #[test]
    fn hop_by_hop_is_case_insensitive() {
        assert!(is_hop_by_hop("Transfer-Encoding"));
        assert!(is_hop_by_hop("KEEP-ALIVE"));
        assert!(!is_hop_by_hop("content-length"));
    }
}
