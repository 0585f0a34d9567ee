//! anylink: WebSocket/QUIC to TCP transport gateway
//!
//! # Usage
//!
//! ```bash
//! # Listen on the defaults (:8080 WS, :4242 QUIC), allow two targets
//! anylink --allow "127.0.0.1:22,10.0.0.1:3306"
//!
//! # Load a config file; CLI flags override file values
//! anylink --config ./anylink.yaml --verbose debug
//!
//! # Run the built-in echo checks and exit
//! anylink --selftest
//! ```

use std::process::ExitCode;
use std::time::Duration;

use anyhow::Result;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use anylink::config::{load_config, Config};
use anylink::server::{selftest, Server};

/// Grace period for in-flight bridges on shutdown
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Command-line arguments
#[derive(Debug, Default)]
struct Args {
    addr: Option<String>,
    quic: Option<String>,
    allow: Option<String>,
    config_path: Option<String>,
    verbose: Option<String>,
    selftest: bool,
}

impl Args {
    fn parse() -> Result<Self, String> {
        let mut parsed = Self::default();
        let mut args = std::env::args().skip(1);

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-a" | "--addr" => {
                    parsed.addr = Some(args.next().ok_or("--addr requires a value")?);
                }
                "--quic" => {
                    parsed.quic = Some(args.next().ok_or("--quic requires a value")?);
                }
                "--allow" => {
                    parsed.allow = Some(args.next().ok_or("--allow requires a value")?);
                }
                "--config" => {
                    parsed.config_path = Some(args.next().ok_or("--config requires a value")?);
                }
                "--verbose" => {
                    parsed.verbose = Some(args.next().ok_or("--verbose requires a value")?);
                }
                "--selftest" => parsed.selftest = true,
                "--version" => {
                    println!("anylink v{}", anylink::VERSION);
                    std::process::exit(0);
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                other => return Err(format!("unknown argument: {other}")),
            }
        }

        Ok(parsed)
    }

    /// Apply CLI overrides on top of the file-loaded config
    fn merge_into(&self, cfg: &mut Config) {
        if let Some(addr) = &self.addr {
            cfg.ws_listen = addr.clone();
        }
        if let Some(quic) = &self.quic {
            cfg.quic_listen = quic.clone();
        }
        if let Some(allow) = &self.allow {
            cfg.allowed_targets = allow
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(ToString::to_string)
                .collect();
        }
        if let Some(verbose) = &self.verbose {
            cfg.log_level = verbose.clone();
        }
    }
}

fn print_help() {
    println!(
        r"anylink v{} - turn any TCP server into a WebSocket/QUIC endpoint.

USAGE:
    anylink [OPTIONS]

OPTIONS:
    -a, --addr <host:port>   WebSocket listen address [default: :8080]
    --quic <host:port>       QUIC listen address [default: :4242]
    --allow <csv>            Comma-separated allow-list (empty allows all)
    --config <path>          YAML/JSON/TOML configuration file
    --verbose <level>        quiet|error|info|debug|trace [default: info]
    --selftest               Run WS+QUIC echo checks and exit
    --version                Print version and exit
    -h, --help               Print this help

EXAMPLES:
    anylink --addr :8080 --allow '127.0.0.1:22,10.0.0.0/8,*.corp.example:443'
    anylink --config /etc/anylink/anylink.yaml

EXIT CODES:
    0  normal termination
    1  runtime failure
    2  configuration error",
        anylink::VERSION
    );
}

/// Initialize logging. `RUST_LOG` takes precedence over the configured
/// level.
fn init_logging(level: &str) {
    let directive = match level {
        "quiet" => "off",
        "error" => "error",
        "debug" => "debug",
        "trace" => "trace",
        _ => "info",
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("anylink={directive}")));

    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_effective_config(args: &Args) -> Result<Config, anylink::ConfigError> {
    let mut cfg = match &args.config_path {
        Some(path) => load_config(path)?,
        None => Config::default(),
    };
    args.merge_into(&mut cfg);
    cfg.validate()?;
    Ok(cfg)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = match Args::parse() {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            print_help();
            return ExitCode::from(2);
        }
    };

    // rustls needs a process-wide crypto provider before any TLS setup.
    let _ = rustls::crypto::ring::default_provider().install_default();

    let cfg = match load_effective_config(&args) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("configuration error: {e}");
            return ExitCode::from(2);
        }
    };

    init_logging(&cfg.log_level);

    if args.selftest {
        return match selftest::run().await {
            Ok(()) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "self-test failed");
                ExitCode::from(1)
            }
        };
    }

    let server = match Server::bind(cfg).await {
        Ok(server) => server,
        Err(e) => {
            error!(error = %e, "failed to start gateway");
            let code = match e {
                anylink::AnylinkError::Config(_) | anylink::AnylinkError::Rule(_) => 2,
                _ => 1,
            };
            return ExitCode::from(code);
        }
    };

    info!(
        ws = %server.ws_addr(),
        quic = %server.quic_addr(),
        "anylink listening (press Ctrl+C to stop)"
    );

    tokio::select! {
        result = server.run() => {
            if let Err(e) = result {
                error!(error = %e, "server error");
                return ExitCode::from(1);
            }
        }
        _ = shutdown_signal() => {
            info!("shutdown signal received");
        }
    }

    server.shutdown(SHUTDOWN_GRACE).await;
    info!("shutdown complete");
    ExitCode::SUCCESS
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to register SIGTERM handler");
        tokio::select! {
            _ = signal::ctrl_c() => {}
            _ = sigterm.recv() => {}
        }
    }

    #[cfg(not(unix))]
    {
        let _ = signal::ctrl_c().await;
    }
}
