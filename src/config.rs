//! Pool configuration: defaults, environment variables and TOML files.
//!
//! Environment loading never fails: invalid values fall back to defaults
//! and floors/clamps are applied. TOML loading surfaces parse errors.
//!
//! # Environment Variables
//!
//! | Variable | Default | Description |
//! |---|---|---|
//! | `JCA_POOL_NAME` | default | Pool name used in logs and metrics |
//! | `JCA_POOL_MIN_SIZE` | 0 | Minimum listeners per sub-pool |
//! | `JCA_POOL_MAX_SIZE` | 20 | Maximum listeners per sub-pool |
//! | `JCA_POOL_INITIAL_SIZE` | unset | Listeners created by prefill |
//! | `JCA_POOL_PREFILL` | false | Fill the default sub-pool at startup |
//! | `JCA_POOL_STRICT_MIN` | false | Refill to min after destruction |
//! | `JCA_POOL_IDLE_TIMEOUT_MS` | 1800000 | Idle time before removal (0 disables) |
//! | `JCA_POOL_BLOCKING_TIMEOUT_MS` | 30000 | Max wait for a listener |
//! | `JCA_POOL_ALLOCATION_RETRY` | 0 | Retries after a failed allocation |
//! | `JCA_POOL_ALLOCATION_RETRY_WAIT_MS` | 5000 | Pause between retries |
//! | `JCA_POOL_BACKGROUND_VALIDATION` | false | Validate idle listeners periodically |
//! | `JCA_POOL_BACKGROUND_VALIDATION_MS` | 0 | Background validation interval |
//! | `JCA_POOL_VALIDATE_ON_MATCH` | false | Validate before every handoff |
//! | `JCA_POOL_USE_FAST_FAIL` | false | Stop scanning after the first invalid listener |
//! | `JCA_POOL_FLUSH_STRATEGY` | failing_connection_only | Reaction to connection errors |
//! | `JCA_POOL_STRATEGY` | by_subject_and_request_info | Sub-pool partitioning |
//! | `JCA_POOL_XA_RESOURCE_TIMEOUT` | unset | XA timeout restored on return (secs) |
//! | `JCA_POOL_TRACK_BY_TX` | true | Share one listener per transaction |
//! | `JCA_POOL_INCREMENTER` | unset | Capacity incrementer name |
//! | `JCA_POOL_INCREMENTER_PROPERTIES` | unset | `key=value,...` |
//! | `JCA_POOL_DECREMENTER` | unset | Capacity decrementer name |
//! | `JCA_POOL_DECREMENTER_PROPERTIES` | unset | `key=value,...` |

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::capacity::{CapacityConfig, PolicyConfig};
use crate::credential::PoolStrategy;
use crate::pool::FlushStrategy;

pub const DEFAULT_MAX_SIZE: usize = 20;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30 * 60 * 1000;
pub const DEFAULT_BLOCKING_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_ALLOCATION_RETRY_WAIT_MS: u64 = 5_000;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file: {0}")]
    Io(String),

    #[error("Failed to parse configuration: {0}")]
    Parse(String),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Everything a [`Pool`](crate::pool::Pool) is configured with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfiguration {
    pub name: String,
    pub min_size: usize,
    pub max_size: usize,
    pub initial_size: Option<usize>,
    pub prefill: bool,
    pub strict_min: bool,
    pub idle_timeout_ms: u64,
    pub blocking_timeout_ms: u64,
    pub allocation_retry: u32,
    pub allocation_retry_wait_ms: u64,
    pub background_validation: bool,
    pub background_validation_ms: u64,
    pub validate_on_match: bool,
    pub use_fast_fail: bool,
    pub flush_strategy: FlushStrategy,
    pub strategy: PoolStrategy,
    pub xa_resource_timeout_secs: Option<u32>,
    pub track_by_tx: bool,
    pub capacity: CapacityConfig,
}

impl Default for PoolConfiguration {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            min_size: 0,
            max_size: DEFAULT_MAX_SIZE,
            initial_size: None,
            prefill: false,
            strict_min: false,
            idle_timeout_ms: DEFAULT_IDLE_TIMEOUT_MS,
            blocking_timeout_ms: DEFAULT_BLOCKING_TIMEOUT_MS,
            allocation_retry: 0,
            allocation_retry_wait_ms: DEFAULT_ALLOCATION_RETRY_WAIT_MS,
            background_validation: false,
            background_validation_ms: 0,
            validate_on_match: false,
            use_fast_fail: false,
            flush_strategy: FlushStrategy::default(),
            strategy: PoolStrategy::default(),
            xa_resource_timeout_secs: None,
            track_by_tx: true,
            capacity: CapacityConfig::default(),
        }
    }
}

impl PoolConfiguration {
    /// Parse a TOML document. Missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        toml::from_str(text).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(format!("{}: {}", path.as_ref().display(), e)))?;
        Self::from_toml_str(&text)
    }

    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Check the configuration. Hard errors are returned as `Err`; soft
    /// problems come back as warnings.
    pub fn validate(&self) -> Result<Vec<String>, ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::Invalid("max_size must be at least 1".to_string()));
        }
        if self.min_size > self.max_size {
            return Err(ConfigError::Invalid(format!(
                "min_size {} exceeds max_size {}",
                self.min_size, self.max_size
            )));
        }

        let mut warnings = Vec::new();
        if let Some(initial) = self.initial_size {
            if initial > self.max_size {
                warnings.push(format!(
                    "initial_size {} capped at max_size {}",
                    initial, self.max_size
                ));
            }
            if !self.prefill {
                warnings.push("initial_size has no effect without prefill".to_string());
            }
        }
        if self.background_validation && self.background_validation_ms == 0 {
            warnings.push(
                "background_validation enabled with a zero interval; disabled".to_string(),
            );
        }
        if self.background_validation && self.validate_on_match {
            warnings.push(
                "both background_validation and validate_on_match are enabled".to_string(),
            );
        }
        if self.use_fast_fail && !self.validate_on_match {
            warnings.push("use_fast_fail has no effect without validate_on_match".to_string());
        }
        if self.idle_timeout_ms == 0 {
            warnings.push("idle_timeout_ms is 0; idle listeners are never removed".to_string());
        }
        Ok(warnings)
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn blocking_timeout(&self) -> Duration {
        Duration::from_millis(self.blocking_timeout_ms)
    }

    pub fn allocation_retry_wait(&self) -> Duration {
        Duration::from_millis(self.allocation_retry_wait_ms)
    }

    /// Validation interval, when background validation is effectively on.
    pub fn background_validation_interval(&self) -> Option<Duration> {
        (self.background_validation && self.background_validation_ms > 0)
            .then(|| Duration::from_millis(self.background_validation_ms))
    }

    /// Listeners the default sub-pool holds right after prefill.
    pub fn prefill_size(&self) -> usize {
        if !self.prefill {
            return 0;
        }
        self.initial_size
            .unwrap_or(self.min_size)
            .max(self.min_size)
            .min(self.max_size)
    }

    /// Whether destruction is followed by a refill to `min_size`.
    pub fn keeps_minimum(&self) -> bool {
        self.strict_min || self.prefill
    }
}

/// Parse a `usize` env var, returning `default` on missing or invalid.
fn parse_usize(key: &str, default: usize) -> usize {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<usize>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u32` env var, returning `default` on missing or invalid.
fn parse_u32(key: &str, default: u32) -> u32 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u32>().unwrap_or(default),
        Err(_) => default,
    }
}

/// Parse a `u64` env var, returning `default` on missing or invalid.
fn parse_u64(key: &str, default: u64) -> u64 {
    match std::env::var(key) {
        Ok(val) => val.trim().parse::<u64>().unwrap_or(default),
        Err(_) => default,
    }
}

fn parse_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(val) => match val.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => true,
            "0" | "false" | "no" | "off" => false,
            _ => default,
        },
        Err(_) => default,
    }
}

fn parse_optional<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|val| val.trim().parse::<T>().ok())
}

fn load_policy(name_key: &str, props_key: &str) -> Option<PolicyConfig> {
    let name = std::env::var(name_key).ok()?;
    let name = name.trim();
    if name.is_empty() {
        return None;
    }
    let properties = std::env::var(props_key)
        .map(|list| PolicyConfig::parse_properties(&list))
        .unwrap_or_default();
    Some(PolicyConfig {
        name: name.to_string(),
        properties,
    })
}

/// Load the pool configuration from environment variables.
///
/// Missing or invalid values fall back to safe defaults without panicking.
pub fn load() -> PoolConfiguration {
    let defaults = PoolConfiguration::default();

    let max_size = parse_usize("JCA_POOL_MAX_SIZE", DEFAULT_MAX_SIZE).max(1);
    let min_size = parse_usize("JCA_POOL_MIN_SIZE", 0).min(max_size);
    let initial_size = parse_optional::<usize>("JCA_POOL_INITIAL_SIZE").map(|n| n.min(max_size));

    let flush_strategy = std::env::var("JCA_POOL_FLUSH_STRATEGY")
        .ok()
        .and_then(|v| FlushStrategy::parse(&v))
        .unwrap_or(defaults.flush_strategy);
    let strategy = std::env::var("JCA_POOL_STRATEGY")
        .ok()
        .and_then(|v| PoolStrategy::parse(&v))
        .unwrap_or(defaults.strategy);

    PoolConfiguration {
        name: std::env::var("JCA_POOL_NAME")
            .ok()
            .filter(|n| !n.trim().is_empty())
            .unwrap_or(defaults.name),
        min_size,
        max_size,
        initial_size,
        prefill: parse_bool("JCA_POOL_PREFILL", false),
        strict_min: parse_bool("JCA_POOL_STRICT_MIN", false),
        idle_timeout_ms: parse_u64("JCA_POOL_IDLE_TIMEOUT_MS", DEFAULT_IDLE_TIMEOUT_MS),
        blocking_timeout_ms: parse_u64("JCA_POOL_BLOCKING_TIMEOUT_MS", DEFAULT_BLOCKING_TIMEOUT_MS),
        allocation_retry: parse_u32("JCA_POOL_ALLOCATION_RETRY", 0),
        allocation_retry_wait_ms: parse_u64(
            "JCA_POOL_ALLOCATION_RETRY_WAIT_MS",
            DEFAULT_ALLOCATION_RETRY_WAIT_MS,
        ),
        background_validation: parse_bool("JCA_POOL_BACKGROUND_VALIDATION", false),
        background_validation_ms: parse_u64("JCA_POOL_BACKGROUND_VALIDATION_MS", 0),
        validate_on_match: parse_bool("JCA_POOL_VALIDATE_ON_MATCH", false),
        use_fast_fail: parse_bool("JCA_POOL_USE_FAST_FAIL", false),
        flush_strategy,
        strategy,
        xa_resource_timeout_secs: parse_optional::<u32>("JCA_POOL_XA_RESOURCE_TIMEOUT"),
        track_by_tx: parse_bool("JCA_POOL_TRACK_BY_TX", true),
        capacity: CapacityConfig {
            incrementer: load_policy("JCA_POOL_INCREMENTER", "JCA_POOL_INCREMENTER_PROPERTIES"),
            decrementer: load_policy("JCA_POOL_DECREMENTER", "JCA_POOL_DECREMENTER_PROPERTIES"),
        },
    }
}
