//! Point-in-time pool statistics for operational tooling.

use serde::Serialize;

/// Snapshot of one sub-pool. Counters are read without a common lock and
/// may be momentarily inconsistent with each other.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SubPoolStatistics {
    pub key: String,
    pub current_size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub max_used: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub created: u64,
    pub destroyed: u64,
    pub timed_out: u64,
    pub waits: u64,
    pub waiting: usize,
    pub total_blocking_ms: u64,
    pub max_blocking_ms: u64,
}

/// Aggregate over every sub-pool of a [`Pool`](super::Pool).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PoolStatistics {
    pub name: String,
    pub running: bool,
    pub sub_pools: usize,
    pub current_size: usize,
    pub in_use: usize,
    pub idle: usize,
    pub created: u64,
    pub destroyed: u64,
    pub timed_out: u64,
    pub waits: u64,
    pub max_blocking_ms: u64,
    pub details: Vec<SubPoolStatistics>,
}

impl PoolStatistics {
    pub(crate) fn aggregate(
        name: &str,
        running: bool,
        mut details: Vec<SubPoolStatistics>,
    ) -> Self {
        details.sort_by(|a, b| a.key.cmp(&b.key));
        let mut stats = Self {
            name: name.to_string(),
            running,
            sub_pools: details.len(),
            ..Self::default()
        };
        for sub in &details {
            stats.current_size += sub.current_size;
            stats.in_use += sub.in_use;
            stats.idle += sub.idle;
            stats.created += sub.created;
            stats.destroyed += sub.destroyed;
            stats.timed_out += sub.timed_out;
            stats.waits += sub.waits;
            stats.max_blocking_ms = stats.max_blocking_ms.max(sub.max_blocking_ms);
        }
        stats.details = details;
        stats
    }

    /// Mean wait of the callers that had to block, in milliseconds.
    pub fn average_blocking_ms(&self) -> u64 {
        let total: u64 = self.details.iter().map(|d| d.total_blocking_ms).sum();
        if self.waits == 0 {
            0
        } else {
            total / self.waits
        }
    }
}
