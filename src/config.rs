//! Configuration file management for the exporter.
//!
//! This module handles loading, parsing, and merging configuration from TOML files
//! and command-line arguments, then validating the result into [`Settings`].
//!
//! # Configuration Precedence
//!
//! 1. Default values (lowest priority)
//! 2. Configuration file (cert-expiry-exporter.toml or specified with --config)
//! 3. Command-line arguments (highest priority)
//!
//! # Example Configuration File
//!
//! ```toml
//! targets = ["example.com:443", "example.net:443"]
//! listen_address = ":8080"
//! metrics_path = "/metrics"
//! interval_seconds = 60
//! timeout_seconds = 10
//! stale_after_cycles = 5
//! log_format = "text"
//! ```

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use std::time::Duration;

use crate::Endpoint;

/// File looked up in the working directory when no `--config` is given.
pub const DEFAULT_CONFIG_FILE: &str = "cert-expiry-exporter.toml";

/// Main configuration structure.
///
/// All fields are optional to support partial configuration and merging.
/// Missing values will be filled in by defaults or overridden by CLI arguments.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
pub struct Config {
    /// Endpoints to probe, as `host:port`, `host` or `https://host:port`
    pub targets: Option<Vec<String>>,
    /// Address the exposition endpoint binds to (e.g. ":8080")
    pub listen_address: Option<String>,
    /// HTTP path serving the metrics
    pub metrics_path: Option<String>,
    /// Pause between the end of one probe cycle and the start of the next
    pub interval_seconds: Option<u64>,
    /// Upper bound for connecting and handshaking with one endpoint
    pub timeout_seconds: Option<u64>,
    /// Number of endpoints probed at once; defaults to the number of targets
    pub concurrency: Option<usize>,
    /// Remove a series after this many successful cycles without seeing it
    pub stale_after_cycles: Option<u64>,
    /// Log output format: text or json
    pub log_format: Option<String>,
}

/// Log output format selected by `log_format`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

/// Validated, fully populated configuration.
#[derive(Debug, Clone)]
pub struct Settings {
    pub targets: Vec<Endpoint>,
    pub listen_address: String,
    pub metrics_path: String,
    pub interval: Duration,
    pub timeout: Duration,
    pub concurrency: usize,
    pub stale_after_cycles: Option<u64>,
    pub log_format: LogFormat,
}

impl Config {
    /// Loads configuration from a TOML file.
    ///
    /// # Returns
    ///
    /// * `Ok(Config)` - Successfully parsed configuration
    /// * `Err(ConfigError::Io)` - File could not be read
    /// * `Err(ConfigError::Parse)` - File contains invalid TOML
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            fs::read_to_string(path.as_ref()).map_err(|e| ConfigError::Io(e.to_string()))?;

        let config: Config =
            toml::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))?;

        Ok(config)
    }

    /// Creates a configuration holding the built-in defaults.
    ///
    /// # Default Values
    ///
    /// - `targets`: None (must be provided)
    /// - `listen_address`: ":8080"
    /// - `metrics_path`: "/metrics"
    /// - `interval_seconds`: 60
    /// - `timeout_seconds`: 10
    /// - `concurrency`: None (one worker per target)
    /// - `stale_after_cycles`: None (series are kept forever)
    /// - `log_format`: "text"
    pub fn defaults() -> Self {
        Config {
            targets: None,
            listen_address: Some(":8080".to_string()),
            metrics_path: Some("/metrics".to_string()),
            interval_seconds: Some(60),
            timeout_seconds: Some(10),
            concurrency: None,
            stale_after_cycles: None,
            log_format: Some("text".to_string()),
        }
    }

    /// Merges this configuration with another, prioritizing the other's values.
    ///
    /// For each field, if the `other` config has a value (Some), it overrides
    /// this config's value. If the `other` value is None, keeps the current value.
    pub fn merge_with(mut self, other: Config) -> Self {
        if other.targets.is_some() {
            self.targets = other.targets;
        }
        if other.listen_address.is_some() {
            self.listen_address = other.listen_address;
        }
        if other.metrics_path.is_some() {
            self.metrics_path = other.metrics_path;
        }
        if other.interval_seconds.is_some() {
            self.interval_seconds = other.interval_seconds;
        }
        if other.timeout_seconds.is_some() {
            self.timeout_seconds = other.timeout_seconds;
        }
        if other.concurrency.is_some() {
            self.concurrency = other.concurrency;
        }
        if other.stale_after_cycles.is_some() {
            self.stale_after_cycles = other.stale_after_cycles;
        }
        if other.log_format.is_some() {
            self.log_format = other.log_format;
        }
        self
    }

    /// Validates the merged configuration and fills in derived values.
    pub fn resolve(self) -> Result<Settings, ConfigError> {
        let targets: Vec<Endpoint> = self
            .targets
            .unwrap_or_default()
            .iter()
            .map(|t| Endpoint::new(t))
            .filter(|e| !e.as_str().is_empty())
            .collect();
        if targets.is_empty() {
            return Err(ConfigError::Validation(
                "at least one target must be configured".to_string(),
            ));
        }

        let listen_address = normalize_listen_address(
            self.listen_address.as_deref().unwrap_or(":8080"),
        )?;

        let metrics_path = self.metrics_path.unwrap_or_else(|| "/metrics".to_string());
        validate_metrics_path(&metrics_path)?;

        let interval_seconds = self.interval_seconds.unwrap_or(60);
        if interval_seconds == 0 {
            return Err(ConfigError::Validation(
                "interval_seconds must be greater than zero".to_string(),
            ));
        }
        let timeout_seconds = self.timeout_seconds.unwrap_or(10);
        if timeout_seconds == 0 {
            return Err(ConfigError::Validation(
                "timeout_seconds must be greater than zero".to_string(),
            ));
        }

        let concurrency = match self.concurrency {
            Some(0) => {
                return Err(ConfigError::Validation(
                    "concurrency must be greater than zero".to_string(),
                ))
            }
            Some(n) => n,
            None => targets.len(),
        };

        if self.stale_after_cycles == Some(0) {
            return Err(ConfigError::Validation(
                "stale_after_cycles must be greater than zero".to_string(),
            ));
        }

        let log_format = match self.log_format.as_deref().unwrap_or("text") {
            "text" => LogFormat::Text,
            "json" => LogFormat::Json,
            other => {
                return Err(ConfigError::Validation(format!(
                    "unknown log_format '{}', expected text or json",
                    other
                )))
            }
        };

        Ok(Settings {
            targets,
            listen_address,
            metrics_path,
            interval: Duration::from_secs(interval_seconds),
            timeout: Duration::from_secs(timeout_seconds),
            concurrency,
            stale_after_cycles: self.stale_after_cycles,
            log_format,
        })
    }

    /// Generates an example configuration file in TOML format.
    pub fn example_toml() -> String {
        let example = Config {
            targets: Some(vec![
                "example.com:443".to_string(),
                "example.net:443".to_string(),
                "https://secure.example.com:9443".to_string(),
            ]),
            listen_address: Some(":8080".to_string()),
            metrics_path: Some("/metrics".to_string()),
            interval_seconds: Some(60),
            timeout_seconds: Some(10),
            concurrency: Some(4),
            stale_after_cycles: Some(5),
            log_format: Some("text".to_string()),
        };

        toml::to_string_pretty(&example)
            .unwrap_or_else(|_| "# Error generating example".to_string())
    }
}

/// The metrics path is a literal route: no captures or wildcards.
fn validate_metrics_path(path: &str) -> Result<(), ConfigError> {
    if !path.starts_with('/') {
        return Err(ConfigError::Validation(format!(
            "metrics_path must start with '/': {}",
            path
        )));
    }
    let dynamic = path.split('/').any(|segment| {
        segment.starts_with(':') || segment.starts_with('*') || segment.contains(['{', '}'])
    });
    if dynamic {
        return Err(ConfigError::Validation(format!(
            "metrics_path must be a literal path without ':', '*', '{{' or '}}' segments: {}",
            path
        )));
    }
    Ok(())
}

/// Turns the ":port" shorthand into an all-interfaces IPv6 address (which
/// also accepts IPv4 on dual-stack hosts) and checks that a port is present.
fn normalize_listen_address(address: &str) -> Result<String, ConfigError> {
    let address = address.trim();
    let full = if address.starts_with(':') {
        format!("[::]{}", address)
    } else {
        address.to_string()
    };

    match full.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => Ok(full),
        _ => Err(ConfigError::Validation(format!(
            "listen_address must be host:port or :port, got '{}'",
            address
        ))),
    }
}

/// Errors that can occur during configuration loading and parsing.
#[derive(Debug)]
pub enum ConfigError {
    /// I/O error (file not found, permission denied, etc.)
    Io(String),
    /// TOML parsing error (invalid syntax, type mismatch, etc.)
    Parse(String),
    /// Validation error (missing required fields, invalid values, etc.)
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "IO Error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Parse Error: {}", msg),
            ConfigError::Validation(msg) => write!(f, "Validation Error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}
