//! Command-line subcommands for inspecting pool configuration.
//!
//! ## Usage
//!
//! ```bash
//! jca-pool-cli config show [FILE]       # Effective configuration as TOML
//! jca-pool-cli config defaults          # Built-in defaults as TOML
//! jca-pool-cli config validate [FILE]   # Exit 0 when valid, 1 otherwise
//! jca-pool-cli policies                 # Registered capacity policies
//! jca-pool-cli simulate [FILE]          # Exercise an in-memory pool
//! ```
//!
//! Without `FILE` the configuration is read from `JCA_POOL_*` variables.

pub mod config_cmd;
pub mod simulate_cmd;

use crate::config::{self, ConfigError, PoolConfiguration};

/// Configuration from `path` when given, from the environment otherwise.
pub fn load_configuration(path: Option<&str>) -> Result<PoolConfiguration, ConfigError> {
    match path {
        Some(path) => PoolConfiguration::from_file(path),
        None => Ok(config::load()),
    }
}
