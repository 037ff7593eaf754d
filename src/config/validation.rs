//! Configuration validation.
//!
//! # Responsibilities
//! - Semantic validation (serde handles syntactic)
//! - Validate value ranges (timeouts > 0, speed factor > 0)
//! - Check addresses and the upstream URL parse
//!
//! # Design Decisions
//! - Returns all validation errors, not just first
//! - Validation is pure function: ProxyConfig → Result<(), Vec<ValidationError>>

use std::net::SocketAddr;
use url::Url;

use crate::config::schema::ProxyConfig;
use crate::recording::replay::SpeedFactor;

/// A single semantic problem in a configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub field: &'static str,
    pub message: String,
}

impl ValidationError {
    fn new(field: &'static str, message: impl Into<String>) -> Self {
        Self {
            field,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Check a configuration, collecting every problem found.
pub fn validate_config(config: &ProxyConfig) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if config.listener.bind_address.parse::<SocketAddr>().is_err() {
        errors.push(ValidationError::new(
            "listener.bind_address",
            format!("'{}' is not a socket address", config.listener.bind_address),
        ));
    }

    match Url::parse(&config.upstream.base_url) {
        Ok(url) if url.scheme() != "http" => errors.push(ValidationError::new(
            "upstream.base_url",
            format!("scheme '{}' is not supported, use http", url.scheme()),
        )),
        Ok(url) if url.host_str().is_none() => {
            errors.push(ValidationError::new("upstream.base_url", "missing host"))
        }
        Ok(_) => {}
        Err(e) => errors.push(ValidationError::new("upstream.base_url", e.to_string())),
    }

    if config.upstream.connect_timeout_secs == 0 {
        errors.push(ValidationError::new("upstream.connect_timeout_secs", "must be > 0"));
    }

    if config.timeouts.request_secs == 0 {
        errors.push(ValidationError::new("timeouts.request_secs", "must be > 0"));
    }

    if config.limits.max_request_body_bytes == 0 {
        errors.push(ValidationError::new("limits.max_request_body_bytes", "must be > 0"));
    }

    if let Err(e) = SpeedFactor::new(config.recording.replay_speed) {
        errors.push(ValidationError::new("recording.replay_speed", e.to_string()));
    }

    if config.observability.metrics_enabled
        && config.observability.metrics_address.parse::<SocketAddr>().is_err()
    {
        errors.push(ValidationError::new(
            "observability.metrics_address",
            format!("'{}' is not a socket address", config.observability.metrics_address),
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
