//! Error types for anylink
//!
//! This module defines the error hierarchy for the gateway. Errors are
//! categorized by subsystem and include recovery hints: per-request and
//! per-stream failures are recoverable and stay confined to their owning
//! task, while configuration and TLS bootstrap failures are fatal at
//! startup.

use std::io;

use thiserror::Error;

/// Top-level error type for anylink
#[derive(Debug, Error)]
pub enum AnylinkError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Allow-list rule compilation errors
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// TCP pool errors
    #[error("Pool error: {0}")]
    Pool(#[from] PoolError),

    /// TLS identity errors
    #[error("TLS error: {0}")]
    Tls(#[from] TlsError),

    /// Acceptor and session errors
    #[error("Server error: {0}")]
    Server(#[from] ServerError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl AnylinkError {
    /// Check if this error is recoverable (the operation can be retried
    /// without operator intervention)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) | Self::Rule(_) => false,
            Self::Pool(e) => e.is_recoverable(),
            Self::Tls(e) => e.is_recoverable(),
            Self::Server(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// YAML/JSON/TOML parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Unrecognized config file extension
    #[error("Unsupported config format: {path} (expected .yaml, .yml, .json or .toml)")]
    UnsupportedFormat { path: String },

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are never recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// Allow-list rule compilation errors
///
/// A compile error on any entry is fatal at startup.
#[derive(Debug, Error)]
pub enum RuleError {
    /// CIDR entry failed to parse
    #[error("Invalid CIDR in allow-list entry {entry:?}: {reason}")]
    InvalidCidr { entry: String, reason: String },

    /// Wildcard pattern failed to compile
    #[error("Invalid wildcard pattern in allow-list entry {entry:?}: {reason}")]
    InvalidPattern { entry: String, reason: String },
}

impl RuleError {
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// TCP pool errors
#[derive(Debug, Error)]
pub enum PoolError {
    /// No backend addresses registered or derivable for the logical target
    #[error("no backends for target {target}")]
    NoBackends { target: String },

    /// Backend dial failed
    #[error("dial {backend} failed: {reason}")]
    DialFailed { backend: String, reason: String },

    /// Backend dial timed out
    #[error("dial {backend} timed out after {timeout_secs}s")]
    DialTimeout { backend: String, timeout_secs: u64 },
}

impl PoolError {
    /// Dial failures are per-request and recoverable
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::NoBackends { .. } => false,
            Self::DialFailed { .. } | Self::DialTimeout { .. } => true,
        }
    }
}

/// Errors raised while resolving a client-supplied target to a pooled
/// TCP connection
#[derive(Debug, Error)]
pub enum ConnectError {
    /// Target denied by the authorizer
    #[error("target not allowed: {target}")]
    Denied { target: String },

    /// Pool could not provide a connection
    #[error(transparent)]
    Pool(#[from] PoolError),
}

impl ConnectError {
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        match self {
            Self::Denied { .. } => true,
            Self::Pool(e) => e.is_recoverable(),
        }
    }
}

/// TLS identity manager errors
#[derive(Debug, Error)]
pub enum TlsError {
    /// Self-signed certificate generation failed
    #[error("certificate generation failed: {0}")]
    Generation(String),

    /// Client CA PEM could not be parsed
    #[error("invalid client CA certificate: {0}")]
    ClientCa(String),

    /// rustls configuration error
    #[error("TLS configuration error: {0}")]
    Crypto(String),
}

impl TlsError {
    /// Rotation failures are retried on the next tick; everything else is
    /// fatal at startup
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::Generation(_))
    }
}

/// Acceptor and session errors
#[derive(Debug, Error)]
pub enum ServerError {
    /// Failed to bind a listener
    #[error("failed to bind {addr}: {reason}")]
    Bind { addr: String, reason: String },

    /// Accept failed
    #[error("accept error: {0}")]
    Accept(String),

    /// Server is shutting down
    #[error("server is shutting down")]
    ShuttingDown,

    /// I/O error
    #[error("server I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ServerError {
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Bind { .. } | Self::ShuttingDown => false,
            Self::Accept(_) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_not_recoverable() {
        let err = ConfigError::ParseError("bad".into());
        assert!(!err.is_recoverable());
        assert!(!AnylinkError::from(err).is_recoverable());
    }

    #[test]
    fn test_dial_errors_recoverable() {
        assert!(PoolError::DialTimeout {
            backend: "10.0.0.1:22".into(),
            timeout_secs: 5,
        }
        .is_recoverable());
        assert!(!PoolError::NoBackends { target: "db".into() }.is_recoverable());
    }

    #[test]
    fn test_connect_error_display() {
        let err = ConnectError::Denied {
            target: "127.0.0.1:22".into(),
        };
        assert_eq!(err.to_string(), "target not allowed: 127.0.0.1:22");
    }

    #[test]
    fn test_rule_error_display() {
        let err = RuleError::InvalidCidr {
            entry: "10.0.0.0/99".into(),
            reason: "prefix length out of range".into(),
        };
        assert!(err.to_string().contains("10.0.0.0/99"));
        assert!(!err.is_recoverable());
    }
}
