//! Graceful shutdown coordination for a pool.
//!
//! Running → Draining (new allocations refused, checked-out listeners
//! still returnable) → Stopped.

use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use serde::Serialize;

/// Shutdown state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ShutdownState {
    Running,
    Draining,
    Stopped,
}

/// Result of a shutdown operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownResult {
    Complete,
    Timeout { remaining: u32 },
}

const DRAIN_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Owns a pool's shutdown state.
pub struct ShutdownCoordinator {
    state: Mutex<ShutdownState>,
    changed: Condvar,
}

impl ShutdownCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(ShutdownState::Running),
            changed: Condvar::new(),
        }
    }

    pub fn state(&self) -> ShutdownState {
        *self.state.lock()
    }

    pub fn is_accepting(&self) -> bool {
        self.state() == ShutdownState::Running
    }

    /// Running → Draining. False if shutdown had already begun.
    pub fn begin_drain(&self) -> bool {
        let mut state = self.state.lock();
        if *state != ShutdownState::Running {
            return false;
        }
        *state = ShutdownState::Draining;
        self.changed.notify_all();
        true
    }

    pub fn stop(&self) {
        *self.state.lock() = ShutdownState::Stopped;
        self.changed.notify_all();
    }

    /// Poll `in_flight` until it reaches zero or `timeout` elapses.
    pub fn wait_for_drain(
        &self,
        timeout: Duration,
        in_flight: impl Fn() -> usize,
    ) -> ShutdownResult {
        let deadline = Instant::now() + timeout;
        loop {
            let count = in_flight();
            if count == 0 {
                return ShutdownResult::Complete;
            }
            let now = Instant::now();
            if now >= deadline {
                return ShutdownResult::Timeout {
                    remaining: count as u32,
                };
            }
            std::thread::sleep(DRAIN_POLL_INTERVAL.min(deadline - now));
        }
    }

    /// Block until the state is Stopped or `timeout` elapses.
    pub fn wait_stopped(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut state = self.state.lock();
        while *state != ShutdownState::Stopped {
            if self.changed.wait_until(&mut state, deadline).timed_out() {
                return *state == ShutdownState::Stopped;
            }
        }
        true
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new()
    }
}
