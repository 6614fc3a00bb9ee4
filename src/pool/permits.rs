//! Counting semaphore bounding the listeners checked out of one sub-pool.

use std::time::Instant;

use parking_lot::{Condvar, Mutex};

/// Result of waiting for a permit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Acquire {
    Acquired,
    TimedOut,
    Closed,
}

struct PermitState {
    available: usize,
    waiters: usize,
    closed: bool,
}

/// Blocking semaphore. Waiters wake in the order the condvar gives them.
pub(crate) struct Permits {
    state: Mutex<PermitState>,
    released: Condvar,
}

impl Permits {
    pub(crate) fn new(count: usize) -> Self {
        Self {
            state: Mutex::new(PermitState {
                available: count,
                waiters: 0,
                closed: false,
            }),
            released: Condvar::new(),
        }
    }

    /// Take a permit, waiting until `deadline`. Returns whether the caller
    /// had to wait along with the outcome.
    pub(crate) fn acquire_until(&self, deadline: Instant) -> (Acquire, bool) {
        let mut state = self.state.lock();
        let mut waited = false;
        loop {
            if state.closed {
                return (Acquire::Closed, waited);
            }
            if state.available > 0 {
                state.available -= 1;
                return (Acquire::Acquired, waited);
            }
            waited = true;
            state.waiters += 1;
            let timed_out = self.released.wait_until(&mut state, deadline).timed_out();
            state.waiters -= 1;
            if timed_out {
                // one last look: a release may have raced the timeout
                if !state.closed && state.available > 0 {
                    state.available -= 1;
                    return (Acquire::Acquired, waited);
                }
                return (Acquire::TimedOut, waited);
            }
        }
    }

    pub(crate) fn release(&self) {
        let mut state = self.state.lock();
        state.available += 1;
        drop(state);
        self.released.notify_one();
    }

    /// Callers currently blocked in [`acquire_until`](Self::acquire_until).
    pub(crate) fn waiters(&self) -> usize {
        self.state.lock().waiters
    }

    /// Fail every current and future waiter.
    pub(crate) fn close(&self) {
        self.state.lock().closed = true;
        self.released.notify_all();
    }
}
