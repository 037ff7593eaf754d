//! HTTP protocol handling subsystem.
//!
//! # Data Flow
//! ```text
//! client request
//!     → server.rs (Axum setup, request ID, tracing)
//!     → service.rs (one ProxyService per process)
//!     → request.rs (collect body, describe outbound request)
//!     → forwarder.rs (single upstream attempt, event stream)
//!     → pipeline.rs (record + relay: chunked or buffered)
//!     → response.rs (hop-by-hop filtering)
//!     → client response
//!
//! replay.rs serves a recorded interaction through the same response path.
//! ```

pub mod forwarder;
pub mod pipeline;
pub mod replay;
pub mod request;
pub mod response;
pub mod server;
pub mod service;

pub use request::{RequestIdExt, X_REQUEST_ID};
pub use server::HttpServer;
pub use service::ProxyService;
