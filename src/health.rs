//! Health reporting over pool statistics for operational tooling.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::pool::{Pool, PoolStatistics};
use crate::shutdown::ShutdownState;

/// Overall health status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthState {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Detailed health report.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub state: HealthState,
    pub shutdown_state: ShutdownState,
    pub sub_pools: usize,
    pub current_size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub waiting: usize,
    pub timeouts_since_last_check: u64,
    pub uptime_secs: u64,
}

/// Computes health from successive pool snapshots.
pub struct HealthChecker {
    start_time: Instant,
    last_timeouts: AtomicU64,
}

impl HealthChecker {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            last_timeouts: AtomicU64::new(0),
        }
    }

    /// Ready: the pool accepts allocations.
    pub fn is_ready(&self, pool: &Pool) -> bool {
        pool.is_running()
    }

    /// Full report. Timeouts are counted relative to the previous call.
    pub fn check(&self, pool: &Pool) -> HealthReport {
        let stats = pool.statistics();
        let previous = self.last_timeouts.swap(stats.timed_out, Ordering::Relaxed);
        let timeouts = stats.timed_out.saturating_sub(previous);
        let state = Self::compute_state(pool.shutdown_state(), &stats, timeouts);

        HealthReport {
            state,
            shutdown_state: pool.shutdown_state(),
            sub_pools: stats.sub_pools,
            current_size: stats.current_size,
            in_use: stats.in_use,
            idle: stats.idle,
            waiting: stats.details.iter().map(|d| d.waiting).sum(),
            timeouts_since_last_check: timeouts,
            uptime_secs: self.start_time.elapsed().as_secs(),
        }
    }

    fn compute_state(
        shutdown: ShutdownState,
        stats: &PoolStatistics,
        timeouts: u64,
    ) -> HealthState {
        if shutdown != ShutdownState::Running {
            return HealthState::Unhealthy;
        }
        if timeouts > 0 {
            return HealthState::Degraded;
        }
        let saturated = !stats.details.is_empty()
            && stats
                .details
                .iter()
                .all(|d| d.current_size >= d.max_size && d.idle == 0 && d.waiting > 0);
        if saturated {
            return HealthState::Degraded;
        }
        HealthState::Healthy
    }
}

impl Default for HealthChecker {
    fn default() -> Self {
        Self::new()
    }
}
