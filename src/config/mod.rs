//! Configuration management subsystem.
//!
//! # Data Flow
//! ```text
//! defaults
//!     → config file (TOML, optional)
//!     → environment overrides (TARGET_URL, PORT, RECORD_TO_DISK, ...)
//!     → validation.rs (semantic checks)
//!     → ProxyConfig (validated, immutable)
//! ```
//!
//! # Design Decisions
//! - Config is immutable once loaded; changes require a restart
//! - All fields have defaults so the proxy runs with no file at all
//! - Validation separates syntactic (serde) from semantic checks

pub mod loader;
pub mod schema;
pub mod validation;

pub use loader::{load, ConfigError};
pub use schema::{
    LimitsConfig, ListenerConfig, ObservabilityConfig, ProxyConfig, RecordingConfig, TimeoutConfig,
    UpstreamConfig,
};
