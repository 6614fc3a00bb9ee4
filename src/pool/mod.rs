//! The pooled-resource lifecycle engine.
//!
//! A [`Pool`] maps partition keys to [`SubPool`]s; each sub-pool owns the
//! [`ConnectionListener`]s of one partition and applies the capacity policy
//! to grow and shrink them.

mod listener;
mod maintenance;
mod partitioned;
mod permits;
mod stats;
mod sub_pool;

use serde::{Deserialize, Serialize};

pub use listener::{ConnectionListener, ListenerId, ListenerState};
pub use partitioned::Pool;
pub use stats::{PoolStatistics, SubPoolStatistics};
pub use sub_pool::SubPool;

/// What to destroy when a connection error is reported, or on explicit flush.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushStrategy {
    /// Only the listener that failed.
    #[default]
    FailingConnectionOnly,
    /// Every idle listener of the sub-pool.
    IdleConnections,
    /// Idle listeners that fail validation.
    InvalidIdleConnections,
    /// Idle listeners now, in-use listeners when they are returned.
    Gracefully,
    /// Like `Gracefully`, across every sub-pool of the pool.
    EntirePool,
}

impl FlushStrategy {
    pub fn name(&self) -> &'static str {
        match self {
            Self::FailingConnectionOnly => "failing_connection_only",
            Self::IdleConnections => "idle_connections",
            Self::InvalidIdleConnections => "invalid_idle_connections",
            Self::Gracefully => "gracefully",
            Self::EntirePool => "entire_pool",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "failing_connection_only" | "failingconnectiononly" => {
                Some(Self::FailingConnectionOnly)
            }
            "idle_connections" | "idleconnections" => Some(Self::IdleConnections),
            "invalid_idle_connections" | "invalididleconnections" => {
                Some(Self::InvalidIdleConnections)
            }
            "gracefully" => Some(Self::Gracefully),
            "entire_pool" | "entirepool" => Some(Self::EntirePool),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_flush_strategy_parse() {
        assert_eq!(FlushStrategy::parse("EntirePool"), Some(FlushStrategy::EntirePool));
        assert_eq!(FlushStrategy::parse("idle-connections"), Some(FlushStrategy::IdleConnections));
        assert_eq!(FlushStrategy::parse("sometimes"), None);
        for strategy in [FlushStrategy::Gracefully, FlushStrategy::InvalidIdleConnections] {
            assert_eq!(FlushStrategy::parse(strategy.name()), Some(strategy));
        }
    }
}
