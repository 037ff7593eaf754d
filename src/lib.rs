//! Recording reverse proxy for local LLM servers (Ollama, OpenAI-compatible).
//!
//! Forwards every request to a single upstream, relays streamed responses
//! chunk by chunk, records each exchange with monotonic timing and can
//! replay recordings at a chosen speed.

pub mod config;
pub mod error;
pub mod http;
pub mod lifecycle;
pub mod observability;
pub mod recording;

pub use config::schema::ProxyConfig;
pub use error::ProxyError;
pub use http::HttpServer;
pub use lifecycle::Shutdown;
