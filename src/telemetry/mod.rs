//! Telemetry for the connection pool.
//!
//! Structured logging through `tracing` and counters, gauges and histograms
//! through the `metrics` facade. The crate installs no exporter; the host
//! application picks one.

mod logging;
pub mod metrics;

pub use logging::{init_logging, LogConfig, LogError, LogFormat};
