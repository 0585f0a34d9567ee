//! Configuration file loading
//!
//! Config files may be YAML, JSON, or TOML, selected by file extension.
//! Keys match the field names of [`Config`].

use std::path::Path;

use tracing::{debug, info};

use super::types::Config;
use crate::error::ConfigError;

/// Load and validate configuration from a file
///
/// The format is selected by extension: `.yaml`/`.yml`, `.json`, `.toml`.
///
/// # Errors
///
/// Returns [`ConfigError`] if the file cannot be read, parsed, or fails
/// validation.
pub fn load_config(path: impl AsRef<Path>) -> Result<Config, ConfigError> {
    let path = path.as_ref();

    debug!("loading configuration from {:?}", path);

    if !path.exists() {
        return Err(ConfigError::FileNotFound {
            path: path.display().to_string(),
        });
    }

    let contents = std::fs::read_to_string(path)?;
    let config = parse_by_extension(path, &contents)?;
    config.validate()?;

    info!(
        allow_rules = config.allowed_targets.len(),
        ws = %config.ws_listen,
        quic = %config.quic_listen,
        "configuration loaded"
    );

    Ok(config)
}

/// Parse configuration from a string, selecting the format by the
/// extension of `path`
///
/// # Errors
///
/// Returns [`ConfigError`] on parse or validation failure.
pub fn load_config_str(path: impl AsRef<Path>, contents: &str) -> Result<Config, ConfigError> {
    let config = parse_by_extension(path.as_ref(), contents)?;
    config.validate()?;
    Ok(config)
}

/// Serialize configuration to a file, selecting the format by extension
///
/// # Errors
///
/// Returns [`ConfigError`] if serialization or the write fails.
pub fn write_config(path: impl AsRef<Path>, config: &Config) -> Result<(), ConfigError> {
    let path = path.as_ref();
    let rendered = match extension(path) {
        Some("yaml" | "yml") => serde_yaml::to_string(config)
            .map_err(|e| ConfigError::ParseError(format!("failed to serialize YAML: {e}")))?,
        Some("json") => serde_json::to_string_pretty(config)
            .map_err(|e| ConfigError::ParseError(format!("failed to serialize JSON: {e}")))?,
        Some("toml") => toml::to_string_pretty(config)
            .map_err(|e| ConfigError::ParseError(format!("failed to serialize TOML: {e}")))?,
        _ => {
            return Err(ConfigError::UnsupportedFormat {
                path: path.display().to_string(),
            })
        }
    };

    std::fs::write(path, rendered)?;
    Ok(())
}

fn parse_by_extension(path: &Path, contents: &str) -> Result<Config, ConfigError> {
    match extension(path) {
        Some("yaml" | "yml") => serde_yaml::from_str(contents)
            .map_err(|e| ConfigError::ParseError(format!("YAML: {e} at {path:?}"))),
        Some("json") => serde_json::from_str(contents)
            .map_err(|e| ConfigError::ParseError(format!("JSON: {e} at {path:?}"))),
        Some("toml") => toml::from_str(contents)
            .map_err(|e| ConfigError::ParseError(format!("TOML: {e} at {path:?}"))),
        _ => Err(ConfigError::UnsupportedFormat {
            path: path.display().to_string(),
        }),
    }
}

fn extension(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str()).map(str::trim)
}
