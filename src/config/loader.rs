//! Configuration loading from disk and the environment.
//!
//! # Responsibilities
//! - Read and parse the optional TOML file
//! - Layer environment overrides on top (`TARGET_URL`, `PORT`, ...)
//! - Validate the merged result

use std::fs;
use std::path::{Path, PathBuf};

use crate::config::schema::ProxyConfig;
use crate::config::validation::{validate_config, ValidationError};

/// Error type for configuration loading.
#[derive(Debug)]
pub enum ConfigError {
    Io(std::io::Error),
    Parse(toml::de::Error),
    Env { var: &'static str, value: String },
    Validation(Vec<ValidationError>),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Parse(e) => write!(f, "Parse error: {}", e),
            ConfigError::Env { var, value } => write!(f, "Invalid value for {}: '{}'", var, value),
            ConfigError::Validation(errors) => {
                write!(f, "Validation failed: ")?;
                for (i, err) in errors.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", err)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Defaults, then the file (if any), then process environment.
pub fn load(path: Option<&Path>) -> Result<ProxyConfig, ConfigError> {
    load_with(path, |var| std::env::var(var).ok())
}

fn load_with<F>(path: Option<&Path>, lookup: F) -> Result<ProxyConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match path {
        Some(path) => {
            let content = fs::read_to_string(path).map_err(ConfigError::Io)?;
            toml::from_str(&content).map_err(ConfigError::Parse)?
        }
        None => ProxyConfig::default(),
    };

    apply_env_overrides(&mut config, lookup)?;
    validate_config(&config).map_err(ConfigError::Validation)?;

    Ok(config)
}

/// Apply environment overrides using `lookup` to read variables.
pub fn apply_env_overrides<F>(config: &mut ProxyConfig, lookup: F) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(url) = lookup("TARGET_URL") {
        config.upstream.base_url = url;
    }
    if let Some(port) = lookup("PORT") {
        let parsed = port
            .trim()
            .parse::<u16>()
            .map_err(|_| ConfigError::Env { var: "PORT", value: port.clone() })?;
        config.listener.set_port(parsed);
    }
    if let Some(flag) = lookup("RECORD_TO_DISK") {
        config.recording.persist = parse_flag("RECORD_TO_DISK", &flag)?;
    }
    if let Some(flag) = lookup("REPLAY_RECORDING") {
        config.recording.replay_verify = parse_flag("REPLAY_RECORDING", &flag)?;
    }
    if let Some(speed) = lookup("REPLAY_SPEED") {
        config.recording.replay_speed = speed
            .trim()
            .parse::<f64>()
            .map_err(|_| ConfigError::Env { var: "REPLAY_SPEED", value: speed.clone() })?;
    }
    if let Some(dir) = lookup("RECORDING_DIR") {
        config.recording.directory = Some(PathBuf::from(dir));
    }
    if let Some(level) = lookup("LOG_LEVEL") {
        config.observability.log_level = level;
    }
    Ok(())
}

fn parse_flag(var: &'static str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" | "" => Ok(false),
        _ => Err(ConfigError::Env {
            var,
            value: value.to_string(),
        }),
    }
}
