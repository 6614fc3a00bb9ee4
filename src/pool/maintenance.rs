//! Background worker running idle removal and validation for one pool.

use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::Duration;

use parking_lot::{Condvar, Mutex};
use tracing::{debug, warn};

use super::Pool;

struct StopSignal {
    stopped: Mutex<bool>,
    wake: Condvar,
}

pub(crate) struct MaintenanceWorker {
    signal: Arc<StopSignal>,
    handle: Mutex<Option<JoinHandle<()>>>,
    thread_id: ThreadId,
}

impl MaintenanceWorker {
    /// Spawn the worker. The thread holds the pool weakly and exits when the
    /// pool is dropped or [`stop`](Self::stop) is called.
    pub(crate) fn start(pool: Weak<Pool>, name: &str, interval: Duration) -> Option<Self> {
        let signal = Arc::new(StopSignal {
            stopped: Mutex::new(false),
            wake: Condvar::new(),
        });
        let thread_signal = signal.clone();
        let spawned = thread::Builder::new()
            .name(format!("jca-pool-maint-{name}"))
            .spawn(move || run(pool, thread_signal, interval));

        match spawned {
            Ok(handle) => {
                debug!(
                    pool = name,
                    interval_ms = interval.as_millis() as u64,
                    "maintenance worker started"
                );
                Some(Self {
                    thread_id: handle.thread().id(),
                    signal,
                    handle: Mutex::new(Some(handle)),
                })
            }
            Err(e) => {
                warn!(pool = name, error = %e, "failed to spawn maintenance worker");
                None
            }
        }
    }

    pub(crate) fn stop(&self) {
        *self.signal.stopped.lock() = true;
        self.signal.wake.notify_all();

        // the worker may be the one dropping the pool
        if thread::current().id() == self.thread_id {
            return;
        }
        if let Some(handle) = self.handle.lock().take() {
            if handle.join().is_err() {
                warn!("maintenance worker panicked");
            }
        }
    }
}

fn run(pool: Weak<Pool>, signal: Arc<StopSignal>, interval: Duration) {
    loop {
        {
            let mut stopped = signal.stopped.lock();
            if !*stopped {
                signal.wake.wait_for(&mut stopped, interval);
            }
            if *stopped {
                break;
            }
        }
        let Some(pool) = pool.upgrade() else {
            break;
        };
        pool.run_maintenance();
    }
}
