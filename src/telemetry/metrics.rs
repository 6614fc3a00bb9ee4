//! Pool metrics recorded through the `metrics` facade.
//!
//! Nothing is exported unless the embedding application installs a
//! recorder; without one every call is a no-op.

use std::time::Duration;

/// Physical connection created.
pub fn record_connection_created(pool: &str) {
    metrics::counter!("jca_pool_connections_created_total", "pool" => pool.to_string())
        .increment(1);
}

/// Physical connection destroyed.
pub fn record_connection_destroyed(pool: &str) {
    metrics::counter!("jca_pool_connections_destroyed_total", "pool" => pool.to_string())
        .increment(1);
}

/// Physical connection creation failed.
pub fn record_creation_failure(pool: &str) {
    metrics::counter!("jca_pool_creation_failures_total", "pool" => pool.to_string()).increment(1);
}

/// Allocation gave up with `PoolExhausted`.
pub fn record_blocking_timeout(pool: &str) {
    metrics::counter!("jca_pool_blocking_timeouts_total", "pool" => pool.to_string()).increment(1);
}

/// A caller had to wait for a listener.
pub fn record_wait(pool: &str, waited: Duration) {
    metrics::histogram!("jca_pool_wait_seconds", "pool" => pool.to_string())
        .record(waited.as_secs_f64());
}

/// Listeners checked out and idle right now.
pub fn record_pool_usage(pool: &str, in_use: usize, idle: usize) {
    metrics::gauge!("jca_pool_in_use", "pool" => pool.to_string()).set(in_use as f64);
    metrics::gauge!("jca_pool_idle", "pool" => pool.to_string()).set(idle as f64);
}

/// Listener enlisted in a transaction.
pub fn record_enlistment(pool: &str, success: bool) {
    let outcome = if success { "success" } else { "failure" };
    metrics::counter!(
        "jca_pool_enlistments_total",
        "pool" => pool.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
