//! Top-level pool: partition keys to sub-pools.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::maintenance::MaintenanceWorker;
use super::stats::{PoolStatistics, SubPoolStatistics};
use super::{ConnectionListener, FlushStrategy, SubPool};
use crate::capacity::{CapacityPolicy, CapacityRegistry, PolicyContext};
use crate::config::PoolConfiguration;
use crate::credential::{Credential, PoolKey};
use crate::error::PoolError;
use crate::resource::ManagedConnectionFactory;
use crate::shutdown::{ShutdownCoordinator, ShutdownResult, ShutdownState};

/// Sub-pool lookups retried when a reaped sub-pool is hit.
const REAPED_RETRIES: usize = 3;

/// Connection pool partitioned by credential.
///
/// Sub-pools are created the first time a partition key is seen. Each pool
/// owns its own maintenance worker; nothing is process-global.
pub struct Pool {
    config: Arc<PoolConfiguration>,
    factory: Arc<dyn ManagedConnectionFactory>,
    capacity: CapacityPolicy,
    sub_pools: DashMap<PoolKey, Arc<SubPool>>,
    shutdown: ShutdownCoordinator,
    maintenance: Mutex<Option<MaintenanceWorker>>,
    self_ref: Weak<Pool>,
}

impl Pool {
    /// Build a pool with the built-in capacity policies.
    pub fn new(
        config: PoolConfiguration,
        factory: Arc<dyn ManagedConnectionFactory>,
    ) -> Result<Arc<Self>, PoolError> {
        Self::with_registry(config, factory, &CapacityRegistry::default())
    }

    /// Build a pool resolving capacity policies through `registry`.
    pub fn with_registry(
        config: PoolConfiguration,
        factory: Arc<dyn ManagedConnectionFactory>,
        registry: &CapacityRegistry,
    ) -> Result<Arc<Self>, PoolError> {
        let warnings = config
            .validate()
            .map_err(|e| PoolError::InvalidConfig(e.to_string()))?;
        for warning in &warnings {
            warn!(pool = %config.name, "{}", warning);
        }

        let capacity = registry.resolve(
            &config.capacity,
            &PolicyContext {
                idle_timeout: config.idle_timeout(),
                min_size: config.min_size,
                max_size: config.max_size,
            },
        );

        let pool = Arc::new_cyclic(|self_ref| Self {
            config: Arc::new(config),
            factory,
            capacity,
            sub_pools: DashMap::new(),
            shutdown: ShutdownCoordinator::new(),
            maintenance: Mutex::new(None),
            self_ref: self_ref.clone(),
        });

        if pool.config.prefill {
            pool.sub_pool_for_key(PoolKey::default_key())
                .fill_to(pool.config.prefill_size());
        }
        pool.start_maintenance();

        info!(
            pool = %pool.config.name,
            min = pool.config.min_size,
            max = pool.config.max_size,
            strategy = pool.config.strategy.name(),
            "pool started"
        );
        Ok(pool)
    }

    fn start_maintenance(&self) {
        let Some(interval) = self.maintenance_interval() else {
            return;
        };
        *self.maintenance.lock() =
            MaintenanceWorker::start(self.self_ref.clone(), &self.config.name, interval);
    }

    /// Half the idle timeout, tightened by the validation interval.
    fn maintenance_interval(&self) -> Option<Duration> {
        let idle = self.config.idle_timeout() / 2;
        let idle = (!idle.is_zero()).then_some(idle);
        match (idle, self.config.background_validation_interval()) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &PoolConfiguration {
        &self.config
    }

    pub fn capacity(&self) -> &CapacityPolicy {
        &self.capacity
    }

    pub fn key_for(&self, credential: &Credential) -> PoolKey {
        self.config.strategy.key_for(credential)
    }

    pub fn is_running(&self) -> bool {
        self.shutdown.is_accepting()
    }

    pub fn shutdown_state(&self) -> ShutdownState {
        self.shutdown.state()
    }

    /// Sub-pool serving `credential`, created on first use.
    pub fn sub_pool(&self, credential: &Credential) -> Result<Arc<SubPool>, PoolError> {
        if !self.is_running() {
            return Err(PoolError::Shutdown(self.config.name.clone()));
        }
        Ok(self.sub_pool_for_key(self.key_for(credential)))
    }

    fn sub_pool_for_key(&self, key: PoolKey) -> Arc<SubPool> {
        if let Some(existing) = self.sub_pools.get(&key) {
            return existing.clone();
        }
        let mut created = false;
        let sub_pool = self
            .sub_pools
            .entry(key.clone())
            .or_insert_with(|| {
                created = true;
                SubPool::new(
                    key.clone(),
                    self.factory.clone(),
                    self.config.clone(),
                    self.capacity.clone(),
                    self.self_ref.clone(),
                )
            })
            .clone();

        if created {
            debug!(pool = %sub_pool.label(), "sub-pool created");
            if self.config.prefill && !key.is_default() {
                sub_pool.fill_to(self.config.min_size);
            }
        }
        sub_pool
    }

    /// Existing sub-pool for `credential`, without creating one.
    pub fn find_sub_pool(&self, credential: &Credential) -> Option<Arc<SubPool>> {
        self.sub_pools
            .get(&self.key_for(credential))
            .map(|entry| entry.value().clone())
    }

    /// Check out a listener from the sub-pool serving `credential`.
    pub fn get_listener(
        &self,
        credential: &Credential,
    ) -> Result<Arc<ConnectionListener>, PoolError> {
        let mut attempts = 0;
        loop {
            let sub_pool = self.sub_pool(credential)?;
            match sub_pool.get_listener(credential) {
                // reaped between lookup and checkout
                Err(PoolError::Shutdown(_)) if self.is_running() && attempts < REAPED_RETRIES => {
                    attempts += 1;
                }
                result => return result,
            }
        }
    }

    /// Return a checked-out listener to the sub-pool that created it.
    pub fn return_listener(&self, listener: Arc<ConnectionListener>, kill: bool) {
        match listener.sub_pool() {
            Some(sub_pool) => sub_pool.return_listener(listener, kill),
            None => listener.return_to_pool(true),
        }
    }

    /// Apply `strategy` to every sub-pool.
    pub fn flush(&self, strategy: FlushStrategy) {
        let strategy = match strategy {
            FlushStrategy::EntirePool => FlushStrategy::Gracefully,
            other => other,
        };
        for sub_pool in self.sub_pool_list() {
            sub_pool.flush(strategy);
        }
    }

    fn sub_pool_list(&self) -> Vec<Arc<SubPool>> {
        self.sub_pools.iter().map(|entry| entry.value().clone()).collect()
    }

    pub fn sub_pool_keys(&self) -> Vec<PoolKey> {
        self.sub_pools.iter().map(|entry| entry.key().clone()).collect()
    }

    pub fn current_size(&self) -> usize {
        self.sub_pools.iter().map(|e| e.value().current_size()).sum()
    }

    pub fn in_use_count(&self) -> usize {
        self.sub_pools.iter().map(|e| e.value().in_use_count()).sum()
    }

    /// One maintenance round: background validation, idle removal and
    /// reaping of unused sub-pools.
    pub fn run_maintenance(&self) {
        if !self.is_running() {
            return;
        }
        let validation = self.config.background_validation_interval();
        for sub_pool in self.sub_pool_list() {
            if let Some(interval) = validation {
                sub_pool.validate_idle(interval);
            }
            if !self.config.idle_timeout().is_zero() {
                sub_pool.remove_idle();
            }
        }
        self.reap_sub_pools();
    }

    fn reap_sub_pools(&self) {
        let threshold = self.config.idle_timeout();
        if threshold.is_zero() {
            return;
        }
        let mut reaped = Vec::new();
        self.sub_pools.retain(|_, sub_pool| {
            if sub_pool.is_reapable(threshold) {
                reaped.push(sub_pool.clone());
                false
            } else {
                true
            }
        });
        for sub_pool in reaped {
            debug!(pool = %sub_pool.label(), "empty sub-pool reaped");
            sub_pool.shutdown();
        }
    }

    /// Refuse new allocations, wait up to `timeout` for checked-out listeners
    /// to come back, then stop. Listeners still out when the timeout expires
    /// are destroyed when they are returned.
    pub fn shutdown(&self, timeout: Duration) -> ShutdownResult {
        if !self.shutdown.begin_drain() {
            self.shutdown.wait_stopped(timeout);
            let remaining = self.in_use_count();
            return if remaining == 0 {
                ShutdownResult::Complete
            } else {
                ShutdownResult::Timeout {
                    remaining: remaining as u32,
                }
            };
        }

        info!(pool = %self.config.name, in_use = self.in_use_count(), "pool draining");
        let worker = self.maintenance.lock().take();
        if let Some(worker) = worker {
            worker.stop();
        }
        for sub_pool in self.sub_pool_list() {
            sub_pool.shutdown();
        }

        let result = self.shutdown.wait_for_drain(timeout, || self.in_use_count());
        if result == ShutdownResult::Complete {
            self.sub_pools.clear();
        }
        self.shutdown.stop();
        info!(pool = %self.config.name, result = ?result, "pool stopped");
        result
    }

    /// [`shutdown`](Self::shutdown) on tokio's blocking pool.
    pub async fn shutdown_async(self: &Arc<Self>, timeout: Duration) -> ShutdownResult {
        let pool = self.clone();
        match tokio::task::spawn_blocking(move || pool.shutdown(timeout)).await {
            Ok(result) => result,
            Err(e) => {
                warn!(pool = %self.config.name, error = %e, "shutdown task failed");
                ShutdownResult::Timeout {
                    remaining: self.in_use_count() as u32,
                }
            }
        }
    }

    pub fn statistics(&self) -> PoolStatistics {
        let details = self.sub_pools.iter().map(|e| e.value().statistics()).collect();
        PoolStatistics::aggregate(&self.config.name, self.is_running(), details)
    }

    pub fn sub_pool_statistics(&self, credential: &Credential) -> Option<SubPoolStatistics> {
        self.find_sub_pool(credential).map(|sub_pool| sub_pool.statistics())
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.config.name)
            .field("sub_pools", &self.sub_pools.len())
            .field("state", &self.shutdown_state())
            .finish()
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        if let Some(worker) = self.maintenance.get_mut().take() {
            worker.stop();
        }
        for entry in self.sub_pools.iter() {
            entry.value().shutdown();
        }
    }
}
