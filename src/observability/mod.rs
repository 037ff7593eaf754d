//! Observability subsystem.
//!
//! # Data Flow
//! ```text
//! All subsystems produce:
//!     → logging.rs (tracing subscriber, env filter)
//!     → metrics.rs (counters, histograms)
//!
//! Request pipeline additionally feeds:
//!     → content_log.rs (request summary, assistant text pulled from
//!       NDJSON / SSE bodies)
//! ```
//!
//! # Design Decisions
//! - Request ID flows through all subsystems via `x-request-id`
//! - Metrics are cheap (atomic increments)
//! - Content logging never affects the proxied response

pub mod content_log;
pub mod logging;
pub mod metrics;
