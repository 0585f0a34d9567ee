//! Configuration types and loading
//!
//! The gateway consumes a frozen [`Config`] value built from defaults, an
//! optional YAML/JSON/TOML file, and command-line overrides (CLI wins).
//! Configuration is immutable after startup.

mod loader;
mod types;

pub use loader::{load_config, load_config_str, write_config};
pub use types::{parse_listen_addr, Config};
