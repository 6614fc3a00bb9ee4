//! Capacity policy engine: when to grow a sub-pool and which idle
//! listeners to destroy.
//!
//! Policies are plain decision functions. The sub-pool owns every side
//! effect (reserving slots, creating, destroying); an [`Incrementer`] or
//! [`Decrementer`] only answers yes or no.

mod decrementer;
mod incrementer;
mod properties;
mod registry;

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::pool::ConnectionListener;

pub use decrementer::{
    MinPoolSizeDecrementer, SizeDecrementer, TimedOutDecrementer, TimedOutFifoDecrementer,
    WatermarkDecrementer,
};
pub use incrementer::{MaxPoolSizeIncrementer, SizeIncrementer, WatermarkIncrementer};
pub use properties::{CapacityConfig, PolicyConfig, PolicyProperties};
pub use registry::{CapacityRegistry, DecrementerFactory, IncrementerFactory, PolicyContext};

/// Decides whether a sub-pool should create another physical connection.
pub trait Incrementer: Send + Sync + fmt::Debug {
    /// `created_count` is the number of connections already created in the
    /// current growth round (0 for an on-demand request).
    fn should_create(&self, current_size: usize, max_size: usize, created_count: usize) -> bool;
}

/// Decides whether an idle listener should be destroyed.
///
/// Called once per idle listener, oldest validation first, with
/// `current_size` already reduced by the listeners selected earlier in the
/// same round and `destroyed_count` counting them.
pub trait Decrementer: Send + Sync + fmt::Debug {
    fn should_destroy(
        &self,
        listener: &ConnectionListener,
        idle: Duration,
        current_size: usize,
        min_size: usize,
        destroyed_count: usize,
    ) -> bool;
}

/// Incrementer/decrementer pair bound to a pool at configuration time.
#[derive(Clone)]
pub struct CapacityPolicy {
    incrementer: Arc<dyn Incrementer>,
    decrementer: Arc<dyn Decrementer>,
    eager: bool,
}

impl CapacityPolicy {
    /// Explicitly configured policies: the incrementer also drives capacity
    /// increase after on-demand creation.
    pub fn new(incrementer: Arc<dyn Incrementer>, decrementer: Arc<dyn Decrementer>) -> Self {
        Self {
            incrementer,
            decrementer,
            eager: true,
        }
    }

    /// Default pair: grow on demand up to max, destroy listeners idle past
    /// `idle_timeout` while above min.
    pub fn defaults(idle_timeout: Duration) -> Self {
        Self {
            incrementer: Arc::new(MaxPoolSizeIncrementer),
            decrementer: Arc::new(TimedOutDecrementer::new(idle_timeout)),
            eager: false,
        }
    }

    pub(crate) fn with_eager_growth(mut self, eager: bool) -> Self {
        self.eager = eager;
        self
    }

    pub fn incrementer(&self) -> &dyn Incrementer {
        self.incrementer.as_ref()
    }

    pub fn decrementer(&self) -> &dyn Decrementer {
        self.decrementer.as_ref()
    }

    /// Whether the sub-pool keeps creating idle connections after an
    /// on-demand creation while the incrementer agrees.
    pub fn grows_eagerly(&self) -> bool {
        self.eager
    }
}

impl fmt::Debug for CapacityPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapacityPolicy")
            .field("incrementer", &self.incrementer)
            .field("decrementer", &self.decrementer)
            .field("eager", &self.eager)
            .finish()
    }
}
