//! Configuration schema definitions.
//!
//! This module defines the complete configuration structure for the proxy.
//! All types derive Serde traits for deserialization from config files.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;

/// Root configuration for the proxy.
#[derive(Debug, Clone, Deserialize, Serialize, Default)]
#[serde(default)]
pub struct ProxyConfig {
    /// Listener configuration (bind address).
    pub listener: ListenerConfig,

    /// The LLM server requests are forwarded to.
    pub upstream: UpstreamConfig,

    /// Recording and verification replay.
    pub recording: RecordingConfig,

    /// Timeout configuration.
    pub timeouts: TimeoutConfig,

    /// Request size limits.
    pub limits: LimitsConfig,

    /// Observability settings.
    pub observability: ObservabilityConfig,
}

/// Listener configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ListenerConfig {
    /// Bind address (e.g., "0.0.0.0:8080").
    pub bind_address: String,
}

impl ListenerConfig {
    /// Replace the port of `bind_address`, keeping the host.
    pub fn set_port(&mut self, port: u16) {
        self.bind_address = match self.bind_address.parse::<SocketAddr>() {
            Ok(mut addr) => {
                addr.set_port(port);
                addr.to_string()
            }
            Err(_) => {
                let host = self
                    .bind_address
                    .rsplit_once(':')
                    .map_or(self.bind_address.as_str(), |(host, _)| host);
                format!("{host}:{port}")
            }
        };
    }
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0:8080".to_string(),
        }
    }
}

/// Upstream (LLM server) configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL; the inbound path is appended verbatim.
    pub base_url: String,

    /// Connection establishment timeout in seconds.
    pub connect_timeout_secs: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:11434".to_string(),
            connect_timeout_secs: 5,
        }
    }
}

/// Recording configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RecordingConfig {
    /// Write every sealed interaction to disk.
    pub persist: bool,

    /// Where recordings go; defaults to a directory under the system temp dir.
    pub directory: Option<PathBuf>,

    /// Replay every sealed interaction right away and compare it with the
    /// recording.
    pub replay_verify: bool,

    /// Speed factor for verification replays (1.0 = real time).
    pub replay_speed: f64,
}

impl Default for RecordingConfig {
    fn default() -> Self {
        Self {
            persist: false,
            directory: None,
            replay_verify: false,
            replay_speed: 1.0,
        }
    }
}

/// Timeout configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Time allowed to produce the response head, in seconds. Buffered
    /// (non-chunked) responses must complete within it; streamed bodies
    /// are not limited once the head is relayed.
    pub request_secs: u64,

    /// How long open responses may keep streaming after a shutdown signal.
    pub drain_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            request_secs: 600,
            drain_secs: 30,
        }
    }
}

/// Request size limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct LimitsConfig {
    /// Maximum inbound request body in bytes.
    pub max_request_body_bytes: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            max_request_body_bytes: 32 * 1024 * 1024, // 32MB, images in chat requests
        }
    }
}

/// Observability configuration.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,

    /// Enable metrics endpoint.
    pub metrics_enabled: bool,

    /// Metrics endpoint bind address.
    pub metrics_address: String,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            metrics_enabled: false,
            metrics_address: "0.0.0.0:9090".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_local_ollama() {
        let config = ProxyConfig::default();
        assert_eq!(config.listener.bind_address, "0.0.0.0:8080");
        assert_eq!(config.upstream.base_url, "http://localhost:11434");
        assert!(!config.recording.persist);
        assert!(!config.recording.replay_verify);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: ProxyConfig = toml::from_str(
            r#"
            [upstream]
            base_url = "http://gpu-box:11434"

            [recording]
            persist = true
            directory = "/var/lib/llm-recordings"
            "#,
        )
        .unwrap();
        assert_eq!(config.upstream.base_url, "http://gpu-box:11434");
        assert_eq!(config.upstream.connect_timeout_secs, 5);
        assert!(config.recording.persist);
        assert_eq!(config.recording.directory, Some(PathBuf::from("/var/lib/llm-recordings")));
        assert_eq!(config.recording.replay_speed, 1.0);
    }

    #[test]
    fn set_port_keeps_host() {
        let mut listener = ListenerConfig::default();
        listener.set_port(9000);
        assert_eq!(listener.bind_address, "0.0.0.0:9000");

        let mut listener = ListenerConfig {
            bind_address: "localhost:8080".into(),
        };
        listener.set_port(3000);
        assert_eq!(listener.bind_address, "localhost:3000");
    }
}
