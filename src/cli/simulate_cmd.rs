//! `simulate`: drive an in-memory pool with concurrent workers and print
//! the resulting statistics and health report as JSON.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::warn;

use crate::config::PoolConfiguration;
use crate::credential::{Credential, Subject};
use crate::health::{HealthChecker, HealthReport};
use crate::manager::ConnectionManager;
use crate::pool::{Pool, PoolStatistics};
use crate::resource::memory::MemoryConnectionFactory;
use crate::shutdown::ShutdownResult;

use super::load_configuration;

/// Workload shape for a simulation run.
#[derive(Debug, Clone, Copy)]
pub struct Workload {
    pub workers: usize,
    pub iterations: usize,
    /// Distinct principals, spread round-robin over the workers.
    pub principals: usize,
    pub hold: Duration,
}

impl Default for Workload {
    fn default() -> Self {
        Self {
            workers: 8,
            iterations: 50,
            principals: 2,
            hold: Duration::from_millis(1),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SimulationReport {
    pub allocations: usize,
    pub failures: usize,
    pub statistics: PoolStatistics,
    pub health: HealthReport,
    pub shutdown_clean: bool,
}

/// Run `workload` against a fresh pool built from `config`.
pub fn simulate(config: PoolConfiguration, workload: Workload) -> Result<SimulationReport, String> {
    let factory = Arc::new(MemoryConnectionFactory::new());
    let pool = Pool::new(config, factory).map_err(|e| e.to_string())?;
    let manager = ConnectionManager::new(pool.clone());
    let checker = HealthChecker::new();

    let (allocations, failures) = std::thread::scope(|scope| {
        let workers: Vec<_> = (0..workload.workers)
            .map(|worker| {
                let manager = &manager;
                scope.spawn(move || {
                    let principal = format!("user-{}", worker % workload.principals.max(1));
                    let credential = Credential::for_subject(Subject::new(principal));
                    let (mut ok, mut failed) = (0, 0);
                    for _ in 0..workload.iterations {
                        match manager.allocate_connection(&credential) {
                            Ok(handle) => {
                                std::thread::sleep(workload.hold);
                                let _ = handle.close();
                                ok += 1;
                            }
                            Err(e) => {
                                warn!(worker, error = %e, "simulated allocation failed");
                                failed += 1;
                            }
                        }
                    }
                    (ok, failed)
                })
            })
            .collect();
        workers
            .into_iter()
            .filter_map(|w| w.join().ok())
            .fold((0, 0), |(a, f), (ok, failed)| (a + ok, f + failed))
    });

    let statistics = pool.statistics();
    let health = checker.check(&pool);
    let shutdown_clean = pool.shutdown(Duration::from_secs(5)) == ShutdownResult::Complete;

    Ok(SimulationReport {
        allocations,
        failures,
        statistics,
        health,
        shutdown_clean,
    })
}

/// CLI entry point. Returns 0 when every allocation succeeded.
pub fn run_simulate(path: Option<&str>) -> i32 {
    let config = match load_configuration(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return 1;
        }
    };
    let report = match simulate(config, Workload::default()) {
        Ok(report) => report,
        Err(e) => {
            eprintln!("ERROR: {e}");
            return 1;
        }
    };
    match serde_json::to_string_pretty(&report) {
        Ok(json) => println!("{json}"),
        Err(e) => {
            eprintln!("ERROR: {e}");
            return 1;
        }
    }
    if report.failures == 0 {
        0
    } else {
        1
    }
}
