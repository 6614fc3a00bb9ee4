//! Listeners of one partition key.
//!
//! Free listeners sit on a LIFO stack so the most recently returned one is
//! reused first. A permit semaphore sized to `max_size` bounds how many
//! listeners are checked out; `size` counts every live listener and is only
//! grown through [`SubPool::try_reserve_slot`].
//!
//! Counters and listener states are updated separately. Readers may see a
//! counter that briefly lags a state change; every policy evaluation reads
//! fresh values, so the lag corrects itself.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{Condvar, Mutex};
use tracing::{debug, info, warn};

use super::listener::{ConnectionListener, ListenerId, ListenerState};
use super::permits::{Acquire, Permits};
use super::stats::SubPoolStatistics;
use super::{FlushStrategy, Pool};
use crate::capacity::CapacityPolicy;
use crate::config::PoolConfiguration;
use crate::credential::{Credential, PoolKey};
use crate::error::PoolError;
use crate::resource::ManagedConnectionFactory;
use crate::telemetry::metrics;

/// Listeners for one partition key.
pub struct SubPool {
    key: PoolKey,
    label: String,
    factory: Arc<dyn ManagedConnectionFactory>,
    config: Arc<PoolConfiguration>,
    capacity: CapacityPolicy,
    pool: Weak<Pool>,
    self_ref: Weak<SubPool>,

    free: Mutex<Vec<Arc<ConnectionListener>>>,
    returned: Condvar,
    permits: Permits,
    listeners: DashMap<ListenerId, Arc<ConnectionListener>>,

    size: AtomicUsize,
    in_use: AtomicUsize,
    max_used: AtomicUsize,
    created: AtomicU64,
    destroyed: AtomicU64,
    timed_out: AtomicU64,
    waits: AtomicU64,
    total_blocking_ms: AtomicU64,
    max_blocking_ms: AtomicU64,

    shut_down: AtomicBool,
    last_shrink: Mutex<Instant>,
    last_used: Mutex<Instant>,
}

impl SubPool {
    pub(crate) fn new(
        key: PoolKey,
        factory: Arc<dyn ManagedConnectionFactory>,
        config: Arc<PoolConfiguration>,
        capacity: CapacityPolicy,
        pool: Weak<Pool>,
    ) -> Arc<Self> {
        let label = format!("{}/{}", config.name, key);
        let max_size = config.max_size;
        Arc::new_cyclic(|self_ref| Self {
            key,
            label,
            factory,
            config,
            capacity,
            pool,
            self_ref: self_ref.clone(),
            free: Mutex::new(Vec::with_capacity(max_size)),
            returned: Condvar::new(),
            permits: Permits::new(max_size),
            listeners: DashMap::new(),
            size: AtomicUsize::new(0),
            in_use: AtomicUsize::new(0),
            max_used: AtomicUsize::new(0),
            created: AtomicU64::new(0),
            destroyed: AtomicU64::new(0),
            timed_out: AtomicU64::new(0),
            waits: AtomicU64::new(0),
            total_blocking_ms: AtomicU64::new(0),
            max_blocking_ms: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
            last_shrink: Mutex::new(Instant::now()),
            last_used: Mutex::new(Instant::now()),
        })
    }

    pub fn key(&self) -> &PoolKey {
        &self.key
    }

    /// `<pool name>/<key>`, used in logs, metrics and errors.
    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn current_size(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn in_use_count(&self) -> usize {
        self.in_use.load(Ordering::Acquire)
    }

    pub fn idle_count(&self) -> usize {
        self.free.lock().len()
    }

    pub fn created_count(&self) -> u64 {
        self.created.load(Ordering::Relaxed)
    }

    pub fn destroyed_count(&self) -> u64 {
        self.destroyed.load(Ordering::Relaxed)
    }

    pub fn min_size(&self) -> usize {
        self.config.min_size
    }

    pub fn max_size(&self) -> usize {
        self.config.max_size
    }

    pub fn is_shut_down(&self) -> bool {
        self.shut_down.load(Ordering::Acquire)
    }

    /// Every live listener, free or checked out.
    pub fn listeners(&self) -> Vec<Arc<ConnectionListener>> {
        self.listeners.iter().map(|entry| entry.value().clone()).collect()
    }

    /// Check out a listener, reusing a free one or creating one when the
    /// incrementer allows. Blocks up to the configured blocking timeout.
    pub fn get_listener(
        &self,
        credential: &Credential,
    ) -> Result<Arc<ConnectionListener>, PoolError> {
        if self.is_shut_down() {
            return Err(PoolError::Shutdown(self.label.clone()));
        }
        let started = Instant::now();
        let deadline = started + self.config.blocking_timeout();

        let (outcome, waited) = self.permits.acquire_until(deadline);
        match outcome {
            Acquire::Acquired => {}
            Acquire::TimedOut => {
                self.record_wait(started.elapsed());
                return Err(self.exhausted());
            }
            Acquire::Closed => return Err(PoolError::Shutdown(self.label.clone())),
        }

        let result = self.checkout(credential, deadline);
        let mut blocked = waited;
        if let Ok((_, condvar_wait)) = &result {
            blocked |= *condvar_wait;
        }
        if blocked {
            self.record_wait(started.elapsed());
        }

        match result {
            Ok((listener, _)) => Ok(listener),
            Err(e) => {
                self.permits.release();
                Err(e)
            }
        }
    }

    /// Holding a permit: find or create a listener. The flag reports whether
    /// the caller had to wait for a return.
    fn checkout(
        &self,
        credential: &Credential,
        deadline: Instant,
    ) -> Result<(Arc<ConnectionListener>, bool), PoolError> {
        let mut skip_free = false;
        let mut waited = false;
        loop {
            if self.is_shut_down() {
                return Err(PoolError::Shutdown(self.label.clone()));
            }

            if !skip_free {
                if let Some(listener) = self.pop_free() {
                    if self.config.validate_on_match {
                        if !self.factory.validate(listener.connection()) {
                            warn!(
                                pool = %self.label,
                                listener = %listener.id(),
                                "listener failed validation on match"
                            );
                            self.kill(&listener);
                            skip_free = self.config.use_fast_fail;
                            continue;
                        }
                        listener.mark_validated();
                    }
                    self.mark_checked_out(&listener);
                    debug!(pool = %self.label, listener = %listener.id(), "reused free listener");
                    return Ok((listener, waited));
                }
            }

            if self
                .capacity
                .incrementer()
                .should_create(self.current_size(), self.config.max_size, 0)
                && self.try_reserve_slot(self.config.max_size)
            {
                let listener = self.create_listener(credential, ListenerState::InUse)?;
                self.mark_checked_out(&listener);
                if self.capacity.grows_eagerly() {
                    self.increase_capacity();
                }
                return Ok((listener, waited));
            }

            // Nothing free and no growth allowed: wait for a return or a
            // destruction. Both notify under the free lock.
            let mut free = self.free.lock();
            skip_free = false;
            if !free.is_empty() {
                continue;
            }
            let size = self.current_size();
            if size < self.config.max_size
                && self.capacity.incrementer().should_create(size, self.config.max_size, 0)
            {
                continue;
            }
            waited = true;
            if self.returned.wait_until(&mut free, deadline).timed_out() && free.is_empty() {
                drop(free);
                return Err(self.exhausted());
            }
        }
    }

    fn exhausted(&self) -> PoolError {
        self.timed_out.fetch_add(1, Ordering::Relaxed);
        metrics::record_blocking_timeout(&self.label);
        debug!(pool = %self.label, "blocking timeout, pool exhausted");
        PoolError::PoolExhausted {
            pool: self.label.clone(),
            timeout_ms: self.config.blocking_timeout_ms,
        }
    }

    fn record_wait(&self, waited: Duration) {
        let ms = waited.as_millis() as u64;
        self.waits.fetch_add(1, Ordering::Relaxed);
        self.total_blocking_ms.fetch_add(ms, Ordering::Relaxed);
        self.max_blocking_ms.fetch_max(ms, Ordering::Relaxed);
        metrics::record_wait(&self.label, waited);
    }

    /// Pop the most recently freed listener, claiming it FREE → IN_USE.
    fn pop_free(&self) -> Option<Arc<ConnectionListener>> {
        let mut free = self.free.lock();
        while let Some(listener) = free.pop() {
            if listener.change_state(ListenerState::Free, ListenerState::InUse) {
                return Some(listener);
            }
        }
        None
    }

    fn push_free(&self, listener: Arc<ConnectionListener>) {
        let mut free = self.free.lock();
        free.push(listener);
        self.returned.notify_one();
    }

    fn notify_waiters(&self) {
        let _free = self.free.lock();
        self.returned.notify_all();
    }

    fn mark_checked_out(&self, listener: &Arc<ConnectionListener>) {
        listener.begin_checkout();
        let in_use = self.in_use.fetch_add(1, Ordering::AcqRel) + 1;
        self.max_used.fetch_max(in_use, Ordering::Relaxed);
        *self.last_used.lock() = Instant::now();
        metrics::record_pool_usage(&self.label, in_use, self.idle_count());
    }

    /// Claim one unit of size if the pool is below `limit`.
    pub(crate) fn try_reserve_slot(&self, limit: usize) -> bool {
        let limit = limit.min(self.config.max_size);
        let mut current = self.size.load(Ordering::Acquire);
        loop {
            if current >= limit {
                return false;
            }
            match self.size.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return true,
                Err(actual) => current = actual,
            }
        }
    }

    fn release_slot(&self) {
        let _ = self
            .size
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        self.notify_waiters();
    }

    /// Create a listener in a slot already reserved by the caller. On
    /// failure the slot is released.
    fn create_listener(
        &self,
        credential: &Credential,
        state: ListenerState,
    ) -> Result<Arc<ConnectionListener>, PoolError> {
        let connection = match self.factory.create_managed_connection(credential) {
            Ok(connection) => connection,
            Err(e) => {
                self.release_slot();
                metrics::record_creation_failure(&self.label);
                warn!(pool = %self.label, error = %e, "physical connection creation failed");
                return Err(PoolError::ResourceCreationFailure(e));
            }
        };
        let listener = ConnectionListener::new(
            connection,
            credential.clone(),
            self.self_ref.clone(),
            self.config.xa_resource_timeout_secs,
            state,
        );
        self.listeners.insert(listener.id(), listener.clone());
        self.created.fetch_add(1, Ordering::Relaxed);
        metrics::record_connection_created(&self.label);
        debug!(
            pool = %self.label,
            listener = %listener.id(),
            size = self.current_size(),
            "listener created"
        );
        Ok(listener)
    }

    /// Keep creating FREE listeners while the incrementer agrees.
    fn increase_capacity(&self) {
        let credential = self.key.to_credential();
        let mut created = 1;
        while !self.is_shut_down()
            && self
                .capacity
                .incrementer()
                .should_create(self.current_size(), self.config.max_size, created)
            && self.try_reserve_slot(self.config.max_size)
        {
            match self.create_listener(&credential, ListenerState::Free) {
                Ok(listener) => {
                    self.push_free(listener);
                    created += 1;
                }
                Err(_) => break,
            }
        }
        if created > 1 {
            debug!(pool = %self.label, created = created - 1, "capacity increased");
        }
    }

    /// Create FREE listeners until `target` (capped at max) is reached.
    pub fn fill_to(&self, target: usize) {
        let credential = self.key.to_credential();
        let mut filled = 0;
        while !self.is_shut_down() && self.try_reserve_slot(target) {
            match self.create_listener(&credential, ListenerState::Free) {
                Ok(listener) => {
                    self.push_free(listener);
                    filled += 1;
                }
                Err(_) => break,
            }
        }
        if filled > 0 {
            info!(pool = %self.label, filled, size = self.current_size(), "sub-pool filled");
        }
    }

    fn refill_minimum(&self) {
        if self.config.keeps_minimum() && self.current_size() < self.config.min_size {
            self.fill_to(self.config.min_size);
        }
    }

    /// Take back a checked-out listener. `kill` destroys it instead of
    /// freeing it.
    ///
    /// A plain return while handles are still open is refused: the listener
    /// stays IN_USE with those handles and is destroyed once the last one
    /// closes.
    pub fn return_listener(&self, listener: Arc<ConnectionListener>, kill: bool) {
        let kill = kill || listener.is_marked_for_destroy() || self.is_shut_down();
        if !kill && listener.handle_count() > 0 {
            warn!(
                pool = %self.label,
                listener = %listener.id(),
                handles = listener.handle_count(),
                "return refused, handles still open"
            );
            listener.mark_destroy_on_return();
            return;
        }
        let was_checked_out = listener.take_checkout();
        if !was_checked_out && !kill {
            debug!(pool = %self.label, listener = %listener.id(), "ignoring duplicate return");
            return;
        }
        if was_checked_out {
            let _ = self
                .in_use
                .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| Some(n.saturating_sub(1)));
        }

        let freed = !kill
            && match listener.prepare_for_pool() {
                Ok(()) => listener.change_state(ListenerState::InUse, ListenerState::Free),
                Err(e) => {
                    warn!(
                        pool = %self.label,
                        listener = %listener.id(),
                        error = %e,
                        "cleanup failed, destroying listener"
                    );
                    false
                }
            };

        if freed {
            debug!(pool = %self.label, listener = %listener.id(), "listener returned");
            self.push_free(listener);
        } else {
            self.kill(&listener);
        }

        if was_checked_out {
            self.permits.release();
        }
        metrics::record_pool_usage(&self.label, self.in_use_count(), self.idle_count());

        if freed {
            self.maybe_shrink();
        } else {
            self.refill_minimum();
        }
    }

    /// Destroy after a connection error, then apply the flush strategy.
    pub(crate) fn connection_failed(&self, listener: Arc<ConnectionListener>) {
        self.return_listener(listener, true);
        match self.config.flush_strategy {
            FlushStrategy::FailingConnectionOnly => {}
            FlushStrategy::EntirePool => match self.pool.upgrade() {
                Some(pool) => pool.flush(FlushStrategy::EntirePool),
                None => self.flush(FlushStrategy::Gracefully),
            },
            strategy => self.flush(strategy),
        }
    }

    /// Move a listener into DESTROY and destroy it, whether it is FREE or
    /// IN_USE. Losing the race to another destroyer is a no-op.
    fn kill(&self, listener: &Arc<ConnectionListener>) {
        if listener.change_state(ListenerState::InUse, ListenerState::Destroy) {
            self.destroy_listener(listener);
        } else if listener.change_state(ListenerState::Free, ListenerState::Destroy) {
            self.free.lock().retain(|l| !Arc::ptr_eq(l, listener));
            self.destroy_listener(listener);
        }
    }

    /// The caller owns the DESTROY transition.
    fn destroy_listener(&self, listener: &Arc<ConnectionListener>) {
        listener.destroy_connection();
        if self.listeners.remove(&listener.id()).is_some() {
            self.destroyed.fetch_add(1, Ordering::Relaxed);
            metrics::record_connection_destroyed(&self.label);
            self.release_slot();
        }
        debug!(
            pool = %self.label,
            listener = %listener.id(),
            size = self.current_size(),
            "listener destroyed"
        );
    }

    fn maybe_shrink(&self) {
        let interval = self.shrink_interval();
        if interval.is_zero() {
            return;
        }
        {
            let mut last = self.last_shrink.lock();
            if last.elapsed() < interval {
                return;
            }
            *last = Instant::now();
        }
        self.remove_idle();
    }

    fn shrink_interval(&self) -> Duration {
        self.config.idle_timeout() / 2
    }

    /// Ask the decrementer about every idle listener, oldest validation
    /// first, and destroy the ones it selects. Returns how many were
    /// destroyed.
    pub fn remove_idle(&self) -> usize {
        let min_size = self.config.min_size;
        let victims = {
            let mut free = self.free.lock();
            let mut candidates: Vec<Arc<ConnectionListener>> = free.clone();
            candidates.sort_by_key(|l| l.last_validated());

            let mut current = self.current_size();
            let mut victims = Vec::new();
            for listener in candidates {
                let idle = listener.idle_duration();
                if self
                    .capacity
                    .decrementer()
                    .should_destroy(&listener, idle, current, min_size, victims.len())
                    && listener.change_state(ListenerState::Free, ListenerState::Destroy)
                {
                    current = current.saturating_sub(1);
                    victims.push(listener);
                }
            }
            free.retain(|l| l.state() == ListenerState::Free);
            victims
        };

        for listener in &victims {
            self.destroy_listener(listener);
        }
        if !victims.is_empty() {
            info!(
                pool = %self.label,
                destroyed = victims.len(),
                size = self.current_size(),
                "idle listeners removed"
            );
            self.refill_minimum();
        }
        victims.len()
    }

    /// Validate free listeners not validated within `max_age`; destroy the
    /// ones that fail. Returns how many were destroyed.
    pub fn validate_idle(&self, max_age: Duration) -> usize {
        let stale = {
            let mut free = self.free.lock();
            let mut stale = Vec::new();
            free.retain(|listener| {
                if listener.last_validated().elapsed() >= max_age
                    && listener.change_state(ListenerState::Free, ListenerState::InUse)
                {
                    stale.push(listener.clone());
                    false
                } else {
                    true
                }
            });
            stale
        };

        let mut destroyed = 0;
        for listener in stale {
            if self.factory.validate(listener.connection()) {
                listener.mark_validated();
                if listener.change_state(ListenerState::InUse, ListenerState::Free) {
                    self.push_free(listener);
                }
            } else {
                warn!(
                    pool = %self.label,
                    listener = %listener.id(),
                    "idle listener failed validation"
                );
                if listener.change_state(ListenerState::InUse, ListenerState::Destroy) {
                    self.destroy_listener(&listener);
                    destroyed += 1;
                }
            }
        }
        if destroyed > 0 {
            self.refill_minimum();
        }
        destroyed
    }

    /// Destroy idle listeners per `strategy`; in-use listeners are only
    /// marked so they are destroyed when returned.
    pub fn flush(&self, strategy: FlushStrategy) {
        match strategy {
            FlushStrategy::FailingConnectionOnly => return,
            FlushStrategy::InvalidIdleConnections => {
                self.validate_idle(Duration::ZERO);
                return;
            }
            FlushStrategy::IdleConnections => {}
            FlushStrategy::Gracefully | FlushStrategy::EntirePool => {
                for listener in self.listeners() {
                    if listener.state() == ListenerState::InUse {
                        listener.mark_destroy_on_return();
                    }
                }
            }
        }
        let destroyed = self.destroy_free();
        info!(pool = %self.label, strategy = strategy.name(), destroyed, "sub-pool flushed");
        self.refill_minimum();
    }

    fn destroy_free(&self) -> usize {
        let victims: Vec<Arc<ConnectionListener>> = {
            let mut free = self.free.lock();
            free.drain(..)
                .filter(|l| l.change_state(ListenerState::Free, ListenerState::Destroy))
                .collect()
        };
        for listener in &victims {
            self.destroy_listener(listener);
        }
        victims.len()
    }

    /// Refuse new checkouts, destroy idle listeners and mark in-use ones
    /// for destruction on return.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        self.permits.close();
        for listener in self.listeners() {
            if listener.state() == ListenerState::InUse {
                listener.mark_destroy_on_return();
            }
        }
        let destroyed = self.destroy_free();
        self.notify_waiters();
        info!(pool = %self.label, destroyed, in_use = self.in_use_count(), "sub-pool shut down");
    }

    /// Empty, non-default and unused for at least `threshold`.
    pub(crate) fn is_reapable(&self, threshold: Duration) -> bool {
        !self.key.is_default()
            && self.current_size() == 0
            && self.in_use_count() == 0
            && self.permits.waiters() == 0
            && self.last_used.lock().elapsed() >= threshold
    }

    pub fn statistics(&self) -> SubPoolStatistics {
        SubPoolStatistics {
            key: self.key.to_string(),
            current_size: self.current_size(),
            in_use: self.in_use_count(),
            idle: self.idle_count(),
            max_used: self.max_used.load(Ordering::Relaxed),
            min_size: self.config.min_size,
            max_size: self.config.max_size,
            created: self.created_count(),
            destroyed: self.destroyed_count(),
            timed_out: self.timed_out.load(Ordering::Relaxed),
            waits: self.waits.load(Ordering::Relaxed),
            waiting: self.permits.waiters(),
            total_blocking_ms: self.total_blocking_ms.load(Ordering::Relaxed),
            max_blocking_ms: self.max_blocking_ms.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for SubPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubPool")
            .field("label", &self.label)
            .field("size", &self.current_size())
            .field("in_use", &self.in_use_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::memory::MemoryConnectionFactory;

    fn sub_pool(config: PoolConfiguration) -> (Arc<MemoryConnectionFactory>, Arc<SubPool>) {
        let factory = Arc::new(MemoryConnectionFactory::new());
        let capacity = CapacityPolicy::defaults(config.idle_timeout());
        let pool = SubPool::new(
            PoolKey::default_key(),
            factory.clone(),
            Arc::new(config),
            capacity,
            Weak::new(),
        );
        (factory, pool)
    }

    #[test]
    fn test_reserve_slot_caps_at_max() {
        let (_f, pool) = sub_pool(PoolConfiguration {
            max_size: 2,
            ..Default::default()
        });
        assert!(pool.try_reserve_slot(2));
        assert!(pool.try_reserve_slot(2));
        assert!(!pool.try_reserve_slot(2));
        assert!(!pool.try_reserve_slot(10));
        pool.release_slot();
        assert_eq!(pool.current_size(), 1);
    }

    #[test]
    fn test_lifo_reuse() {
        let (_f, pool) = sub_pool(PoolConfiguration::default());
        let cred = Credential::anonymous();
        let a = pool.get_listener(&cred).expect("a");
        let b = pool.get_listener(&cred).expect("b");
        pool.return_listener(a.clone(), false);
        pool.return_listener(b.clone(), false);
        let next = pool.get_listener(&cred).expect("next");
        assert_eq!(next.id(), b.id());
    }

    #[test]
    fn test_creation_failure_releases_slot() {
        let (factory, pool) = sub_pool(PoolConfiguration {
            max_size: 1,
            ..Default::default()
        });
        factory.fail_next(1);
        let err = pool.get_listener(&Credential::anonymous()).unwrap_err();
        assert!(matches!(err, PoolError::ResourceCreationFailure(_)));
        assert_eq!(pool.current_size(), 0);
        assert!(pool.get_listener(&Credential::anonymous()).is_ok());
    }

    #[test]
    fn test_kill_on_return() {
        let (_f, pool) = sub_pool(PoolConfiguration::default());
        let listener = pool.get_listener(&Credential::anonymous()).expect("listener");
        pool.return_listener(listener.clone(), true);
        assert_eq!(listener.state(), ListenerState::Destroyed);
        assert_eq!(pool.destroyed_count(), 1);
        assert_eq!(pool.idle_count(), 0);
        assert_eq!(pool.current_size(), 0);
    }

    #[test]
    fn test_double_return_counts_once() {
        let (_f, pool) = sub_pool(PoolConfiguration::default());
        let listener = pool.get_listener(&Credential::anonymous()).expect("listener");
        pool.return_listener(listener.clone(), false);
        pool.return_listener(listener.clone(), false);
        assert_eq!(pool.idle_count(), 1);
        assert_eq!(pool.in_use_count(), 0);
        assert_eq!(listener.state(), ListenerState::Free);
    }

    #[test]
    fn test_validate_idle_destroys_invalid() {
        let (factory, pool) = sub_pool(PoolConfiguration::default());
        pool.fill_to(3);
        assert_eq!(pool.idle_count(), 3);
        factory.connection(1).expect("physical").set_valid(false);
        assert_eq!(pool.validate_idle(Duration::ZERO), 1);
        assert_eq!(pool.idle_count(), 2);
        assert_eq!(pool.current_size(), 2);
    }
}
