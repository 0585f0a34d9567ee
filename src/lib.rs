//! anylink: WebSocket/QUIC to TCP transport gateway
//!
//! This crate bridges client connections arriving over WebSocket (plain
//! or TLS) and QUIC to backend TCP services chosen from an
//! administrator-controlled allow-list, so browsers and web clients can
//! reach services like SSH, Redis, or PostgreSQL through environments
//! that only permit HTTP/WebSocket traffic, and mobile clients can ride
//! QUIC's loss recovery and stream multiplexing.
//!
//! # Architecture
//!
//! ```text
//! WS client ──upgrade──▶ WS acceptor ──┐
//!                                      ├─▶ authorizer ─▶ TCP pool ─▶ bridge ◀──▶ backend
//! QUIC client ──stream──▶ QUIC acceptor┘        (allow-list)  (round-robin)
//! ```
//!
//! Each bridge runs two copy tasks, one per direction. QUIC sessions are
//! tracked in a table and reaped after 30 seconds of inactivity. The TLS
//! identity is self-signed and rotated periodically; both acceptors pick
//! up the new certificate atomically.
//!
//! # Quick start
//!
//! ```no_run
//! use anylink::{Config, Server};
//!
//! # async fn example() -> Result<(), anylink::AnylinkError> {
//! let cfg = Config {
//!     ws_listen: ":8080".into(),
//!     quic_listen: ":4242".into(),
//!     allowed_targets: vec!["127.0.0.1:22".into()],
//!     ..Config::default()
//! };
//!
//! let server = Server::bind(cfg).await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: configuration types and file loading
//! - [`rules`]: target allow-list compilation and evaluation
//! - [`bridge`]: the duplex bridge engine, WS framing, and the TCP pool
//! - [`server`]: acceptors, session table, TLS manager, metrics
//! - [`error`]: error types

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod bridge;
pub mod config;
pub mod error;
pub mod rules;
pub mod server;

// Re-export commonly used types at the crate root
pub use bridge::{
    decode_frame, encode_frame, Bridge, BridgeConfig, BridgeOutcome, BridgeStats, TargetConnector,
    TcpPool, BRIDGE_STREAM_ID,
};
pub use config::{load_config, parse_listen_addr, write_config, Config};
pub use error::{
    AnylinkError, ConfigError, ConnectError, PoolError, RuleError, ServerError, TlsError,
};
pub use rules::{split_host_port, TargetAuthorizer, TargetRule};
pub use server::{
    CertIdentity, MetricsRegistry, Server, Session, SessionTable, StreamMetrics, TlsManager,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
