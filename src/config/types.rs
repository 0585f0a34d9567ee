//! Configuration types for anylink
//!
//! All durations are expressed in whole seconds in config files; the
//! accessor methods return [`Duration`] values for the rest of the crate.

use std::net::{SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::rules::TargetAuthorizer;

/// Root configuration structure (immutable after startup)
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Config {
    /// WebSocket listen address (e.g., ":8080" or "0.0.0.0:9000")
    #[serde(default = "default_ws_listen")]
    pub ws_listen: String,

    /// QUIC listen address (e.g., ":4242")
    #[serde(default = "default_quic_listen")]
    pub quic_listen: String,

    /// Allow-list entries, evaluated in order. Empty allows all targets.
    #[serde(default)]
    pub allowed_targets: Vec<String>,

    /// Idle read deadline per bridge direction, in seconds
    #[serde(default = "default_read_timeout")]
    pub read_timeout: u64,

    /// Maximum idle connections retained per backend
    #[serde(default = "default_tcp_pool_size")]
    pub tcp_pool_size: usize,

    /// Serve the WebSocket acceptor over TLS using the rotating certificate
    #[serde(default)]
    pub enable_wss: bool,

    /// Self-signed certificate regeneration cadence, in seconds
    #[serde(default = "default_tls_rotation")]
    pub tls_rotation: u64,

    /// QUIC ALPN protocols
    #[serde(default = "default_alpn")]
    pub alpn: Vec<String>,

    /// Require and verify client certificates (mutual TLS)
    #[serde(default)]
    pub client_auth: bool,

    /// PEM-encoded X.509 client CA certificates, required when
    /// `client_auth` is set
    #[serde(default)]
    pub client_cas: Vec<String>,

    /// Logging level: quiet|error|info|debug|trace
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_ws_listen() -> String {
    ":8080".to_string()
}

fn default_quic_listen() -> String {
    ":4242".to_string()
}

fn default_read_timeout() -> u64 {
    60
}

fn default_tcp_pool_size() -> usize {
    16
}

fn default_tls_rotation() -> u64 {
    24 * 60 * 60
}

fn default_alpn() -> Vec<String> {
    vec!["anylink-quic".to_string()]
}

fn default_log_level() -> String {
    "info".to_string()
}

const LOG_LEVELS: [&str; 5] = ["quiet", "error", "info", "debug", "trace"];

impl Config {
    /// Validate the configuration
    ///
    /// Checks listen addresses, pool size, log level, the mutual-TLS
    /// pairing, and compiles the allow-list to surface rule errors at
    /// startup.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        parse_listen_addr(&self.ws_listen)?;
        parse_listen_addr(&self.quic_listen)?;

        if self.tcp_pool_size == 0 {
            return Err(ConfigError::ValidationError(
                "tcp_pool_size must be at least 1".into(),
            ));
        }

        if !LOG_LEVELS.contains(&self.log_level.as_str()) {
            return Err(ConfigError::ValidationError(format!(
                "invalid log_level {:?} (expected one of {})",
                self.log_level,
                LOG_LEVELS.join("|")
            )));
        }

        if self.client_auth && self.client_cas.is_empty() {
            return Err(ConfigError::ValidationError(
                "client_auth requires at least one client_cas entry".into(),
            ));
        }

        if self.alpn.is_empty() {
            return Err(ConfigError::ValidationError(
                "alpn must contain at least one protocol".into(),
            ));
        }

        // Rule compile errors are fatal at startup, not on first request.
        TargetAuthorizer::compile(&self.allowed_targets)
            .map_err(|e| ConfigError::ValidationError(e.to_string()))?;

        Ok(())
    }

    /// Idle read deadline as a [`Duration`]
    #[must_use]
    pub fn read_timeout(&self) -> Duration {
        Duration::from_secs(self.read_timeout)
    }

    /// Certificate rotation cadence as a [`Duration`]
    #[must_use]
    pub fn tls_rotation(&self) -> Duration {
        Duration::from_secs(self.tls_rotation)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ws_listen: default_ws_listen(),
            quic_listen: default_quic_listen(),
            allowed_targets: Vec::new(),
            read_timeout: default_read_timeout(),
            tcp_pool_size: default_tcp_pool_size(),
            enable_wss: false,
            tls_rotation: default_tls_rotation(),
            alpn: default_alpn(),
            client_auth: false,
            client_cas: Vec::new(),
            log_level: default_log_level(),
        }
    }
}

/// Parse a listen address, accepting the `":8080"` shorthand for
/// `"0.0.0.0:8080"`
///
/// # Errors
///
/// Returns [`ConfigError::ValidationError`] if the address has no port or
/// does not resolve.
pub fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ConfigError> {
    if !addr.contains(':') {
        return Err(ConfigError::ValidationError(format!(
            "invalid listen address {addr:?} (must include a port)"
        )));
    }

    let full = if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    };

    if let Ok(sa) = full.parse::<SocketAddr>() {
        return Ok(sa);
    }

    full.to_socket_addrs()
        .map_err(|e| ConfigError::ValidationError(format!("invalid listen address {addr:?}: {e}")))?
        .next()
        .ok_or_else(|| {
            ConfigError::ValidationError(format!("listen address {addr:?} resolved to nothing"))
        })
}
