//! Per-physical-connection state machine.
//!
//! ```text
//! FREE ──checkout──▶ IN_USE ──return──▶ FREE
//!   │                  │
//!   └──────destroy─────┴──▶ DESTROY ──▶ DESTROYED
//! ```
//!
//! Every transition is a compare-and-swap on the state word. The decision
//! to return a listener (last handle gone, no enlistment) is taken under the
//! listener's own lock together with the event that caused it, so one
//! checkout yields exactly one return.

use std::collections::HashSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::SubPool;
use crate::credential::Credential;
use crate::error::{PoolError, ResourceError};
use crate::resource::{
    ConnectionEvent, ConnectionEventListener, ConnectionHandle, HandleId, ManagedConnection,
};
use crate::tx::{
    CompletionHook, DelistFlag, LocalXaResource, Transaction, TransactionId,
    TransactionSynchronization, XaResource,
};

static NEXT_LISTENER_ID: AtomicU64 = AtomicU64::new(1);

/// Unique listener identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

impl ListenerId {
    fn next() -> Self {
        Self(NEXT_LISTENER_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ListenerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state of a listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ListenerState {
    Free = 0,
    InUse = 1,
    Destroy = 2,
    Destroyed = 3,
}

impl ListenerState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Free,
            1 => Self::InUse,
            2 => Self::Destroy,
            _ => Self::Destroyed,
        }
    }
}

struct ListenerInner {
    handles: HashSet<HandleId>,
    enlistment: Option<Arc<TransactionSynchronization>>,
    local_tx_active: bool,
    last_validated: Instant,
    idle_since: Instant,
}

/// Wrapper and state owner for one physical connection.
pub struct ConnectionListener {
    id: ListenerId,
    credential: Credential,
    state: AtomicU8,
    connection: Box<dyn ManagedConnection>,
    inner: Mutex<ListenerInner>,
    checked_out: AtomicBool,
    destroy_on_return: AtomicBool,
    checkouts: AtomicU64,
    created_at: Instant,
    xa_resource_timeout: Option<u32>,
    sub_pool: Weak<SubPool>,
    self_ref: Weak<ConnectionListener>,
}

impl ConnectionListener {
    pub(crate) fn new(
        connection: Box<dyn ManagedConnection>,
        credential: Credential,
        sub_pool: Weak<SubPool>,
        xa_resource_timeout: Option<u32>,
        initial: ListenerState,
    ) -> Arc<Self> {
        let now = Instant::now();
        let listener = Arc::new_cyclic(|self_ref| Self {
            id: ListenerId::next(),
            credential,
            state: AtomicU8::new(initial as u8),
            connection,
            inner: Mutex::new(ListenerInner {
                handles: HashSet::new(),
                enlistment: None,
                local_tx_active: false,
                last_validated: now,
                idle_since: now,
            }),
            checked_out: AtomicBool::new(false),
            destroy_on_return: AtomicBool::new(false),
            checkouts: AtomicU64::new(0),
            created_at: now,
            xa_resource_timeout,
            sub_pool,
            self_ref: self_ref.clone(),
        });

        let observer: Weak<dyn ConnectionEventListener> =
            Arc::downgrade(&listener) as Weak<dyn ConnectionEventListener>;
        listener.connection.add_event_listener(observer);
        listener
    }

    /// A listener outside any pool, already IN_USE. Returning it destroys it.
    pub fn standalone(connection: Box<dyn ManagedConnection>, credential: Credential) -> Arc<Self> {
        Self::new(connection, credential, Weak::new(), None, ListenerState::InUse)
    }

    pub fn id(&self) -> ListenerId {
        self.id
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }

    pub fn state(&self) -> ListenerState {
        ListenerState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Atomically move from `expected` to `new`; false if the state differed.
    pub fn change_state(&self, expected: ListenerState, new: ListenerState) -> bool {
        self.state
            .compare_exchange(expected as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn connection(&self) -> &dyn ManagedConnection {
        self.connection.as_ref()
    }

    pub(crate) fn sub_pool(&self) -> Option<Arc<SubPool>> {
        self.sub_pool.upgrade()
    }

    pub fn handle_count(&self) -> usize {
        self.inner.lock().handles.len()
    }

    pub fn has_handle(&self, handle: HandleId) -> bool {
        self.inner.lock().handles.contains(&handle)
    }

    pub fn is_enlisted(&self) -> bool {
        self.inner.lock().enlistment.is_some()
    }

    pub fn enlisted_transaction(&self) -> Option<TransactionId> {
        self.inner.lock().enlistment.as_ref().map(|s| s.transaction_id())
    }

    pub fn local_transaction_active(&self) -> bool {
        self.inner.lock().local_tx_active
    }

    pub fn last_validated(&self) -> Instant {
        self.inner.lock().last_validated
    }

    pub fn mark_validated(&self) {
        self.inner.lock().last_validated = Instant::now();
    }

    /// Time since the listener was last made FREE (or created).
    pub fn idle_duration(&self) -> Duration {
        self.inner.lock().idle_since.elapsed()
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// How many times the listener has been handed to a caller.
    pub fn checkout_count(&self) -> u64 {
        self.checkouts.load(Ordering::Relaxed)
    }

    /// Destroy instead of freeing on the next return.
    pub fn mark_destroy_on_return(&self) {
        self.destroy_on_return.store(true, Ordering::Release);
    }

    pub fn is_marked_for_destroy(&self) -> bool {
        self.destroy_on_return.load(Ordering::Acquire)
    }

    pub(crate) fn begin_checkout(&self) {
        self.checked_out.store(true, Ordering::Release);
        self.checkouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Clears the checked-out flag; true for exactly one caller per checkout.
    pub(crate) fn take_checkout(&self) -> bool {
        self.checked_out.swap(false, Ordering::AcqRel)
    }

    /// Issue a new handle bound to this listener's physical connection.
    pub fn get_connection(&self) -> Result<ConnectionHandle, PoolError> {
        let handle = HandleId::next();
        {
            let mut inner = self.inner.lock();
            if self.state() != ListenerState::InUse {
                return Err(PoolError::ResourceFailure(ResourceError::new(format!(
                    "listener {} is {:?}",
                    self.id,
                    self.state()
                ))));
            }
            inner.handles.insert(handle);
        }
        self.issue(handle)
    }

    /// Issue a handle only if this listener is still enlisted in `tx`.
    ///
    /// Used to share one physical connection per transaction.
    pub fn get_connection_in(
        &self,
        tx: TransactionId,
    ) -> Option<Result<ConnectionHandle, PoolError>> {
        let handle = HandleId::next();
        {
            let mut inner = self.inner.lock();
            let enlisted_here = inner
                .enlistment
                .as_ref()
                .is_some_and(|sync| sync.transaction_id() == tx);
            if !enlisted_here || self.state() != ListenerState::InUse {
                return None;
            }
            inner.handles.insert(handle);
        }
        Some(self.issue(handle))
    }

    fn issue(&self, handle: HandleId) -> Result<ConnectionHandle, PoolError> {
        let me = self.self_ref.upgrade().ok_or_else(|| {
            PoolError::ResourceFailure(ResourceError::new("listener no longer alive"))
        })?;
        if let Err(e) = self.connection.get_connection(handle, &self.credential) {
            self.inner.lock().handles.remove(&handle);
            return Err(PoolError::ResourceFailure(e));
        }
        debug!(listener = %self.id, handle = %handle, "connection handle issued");
        Ok(ConnectionHandle::new(handle, self.connection.capability(), me))
    }

    pub fn add_connection(&self, handle: HandleId) {
        self.inner.lock().handles.insert(handle);
    }

    pub fn remove_connection(&self, handle: HandleId) -> bool {
        self.inner.lock().handles.remove(&handle)
    }

    pub fn clear_connections(&self) {
        self.inner.lock().handles.clear();
    }

    /// A handle left this listener (closed or reassociated). Returns the
    /// listener to its pool when it was the last one and no transaction
    /// holds the listener.
    pub(crate) fn handle_released(&self, handle: HandleId) {
        let should_return = {
            let mut inner = self.inner.lock();
            if !inner.handles.remove(&handle) {
                debug!(listener = %self.id, handle = %handle, "release of unknown handle ignored");
                return;
            }
            inner.handles.is_empty()
                && inner.enlistment.is_none()
                && self.state() == ListenerState::InUse
        };
        if should_return {
            self.return_to_pool(false);
        }
    }

    /// The physical connection could not close `handle`. Its state is
    /// unknown, so the listener is destroyed rather than reused.
    pub(crate) fn handle_close_failed(&self, handle: HandleId, error: &ResourceError) {
        warn!(
            listener = %self.id,
            handle = %handle,
            error = %error,
            "handle close failed, destroying listener"
        );
        self.inner.lock().handles.remove(&handle);
        self.return_to_pool(true);
    }

    /// Hand the listener back to its sub-pool, or destroy it if it has none.
    pub(crate) fn return_to_pool(&self, kill: bool) {
        let Some(me) = self.self_ref.upgrade() else {
            return;
        };
        match self.sub_pool.upgrade() {
            Some(sub_pool) if kill => sub_pool.connection_failed(me),
            Some(sub_pool) => sub_pool.return_listener(me, false),
            None => {
                if self.change_state(ListenerState::InUse, ListenerState::Destroy)
                    || self.change_state(ListenerState::Free, ListenerState::Destroy)
                {
                    self.destroy_connection();
                }
            }
        }
    }

    /// Reset the physical connection before it becomes FREE.
    ///
    /// Rolls back a local transaction left open, restores the XA timeout and
    /// runs the resource's cleanup.
    pub(crate) fn prepare_for_pool(&self) -> Result<(), ResourceError> {
        let local_open = {
            let mut inner = self.inner.lock();
            if !inner.handles.is_empty() {
                return Err(ResourceError::new(format!(
                    "listener {} still has {} open handles",
                    self.id,
                    inner.handles.len()
                )));
            }
            std::mem::take(&mut inner.local_tx_active)
        };

        if local_open {
            if let Some(local) = self.connection.local_transaction() {
                debug!(listener = %self.id, "rolling back local transaction left open");
                local.rollback()?;
            }
        }

        let xa = self.connection.xa_resource();
        if let (Some(timeout), Some(xa)) = (self.xa_resource_timeout, xa) {
            if let Err(e) = xa.set_transaction_timeout(timeout) {
                warn!(listener = %self.id, error = %e, "failed to reset XA resource timeout");
            }
        }

        self.connection.cleanup()?;
        self.inner.lock().idle_since = Instant::now();
        Ok(())
    }

    /// Close the physical connection. Caller must have won the transition
    /// into DESTROY.
    pub(crate) fn destroy_connection(&self) {
        if let Err(e) = self.connection.destroy() {
            warn!(listener = %self.id, error = %e, "error destroying physical connection");
        }
        {
            let mut inner = self.inner.lock();
            inner.handles.clear();
            inner.enlistment = None;
        }
        self.state.store(ListenerState::Destroyed as u8, Ordering::Release);
        debug!(listener = %self.id, "listener destroyed");
    }

    fn transactional_resource(&self) -> Option<Arc<dyn XaResource>> {
        self.connection.xa_resource().or_else(|| {
            self.connection.local_transaction().map(|_| {
                Arc::new(LocalXaResource::new(self.self_ref.clone())) as Arc<dyn XaResource>
            })
        })
    }

    /// Enlist this listener's transactional resource in `tx`.
    ///
    /// No-op when already enlisted in `tx` or when the listener is being
    /// destroyed. On failure the listener stays usable, unenlisted.
    pub fn enlist(
        &self,
        tx: &Arc<dyn Transaction>,
        hook: Option<CompletionHook>,
    ) -> Result<(), PoolError> {
        if matches!(self.state(), ListenerState::Destroy | ListenerState::Destroyed) {
            return Ok(());
        }
        let resource = self.transactional_resource().ok_or_else(|| {
            PoolError::EnlistmentFailure(format!(
                "listener {} has no transactional resource",
                self.id
            ))
        })?;
        let tx_id = tx.id();

        let sync = {
            let mut inner = self.inner.lock();
            if let Some(existing) = &inner.enlistment {
                if existing.transaction_id() == tx_id {
                    return Ok(());
                }
                return Err(PoolError::EnlistmentFailure(format!(
                    "listener {} already enlisted in {}",
                    self.id,
                    existing.transaction_id()
                )));
            }
            let sync = Arc::new(TransactionSynchronization::new(
                tx,
                self.self_ref.clone(),
                resource.clone(),
                hook,
            ));
            inner.enlistment = Some(sync.clone());
            sync
        };

        if let Err(e) = tx.register_interposed_synchronization(sync.clone()) {
            self.clear_enlistment(&sync);
            return Err(PoolError::EnlistmentFailure(e.to_string()));
        }
        if let Err(e) = tx.enlist_resource(resource) {
            self.clear_enlistment(&sync);
            return Err(PoolError::EnlistmentFailure(e.to_string()));
        }
        sync.mark_enlisted();
        debug!(listener = %self.id, tx = %tx_id, "listener enlisted");
        Ok(())
    }

    /// End the resource's participation early.
    pub fn delist(&self, flag: DelistFlag) -> Result<(), PoolError> {
        let sync = self.inner.lock().enlistment.clone();
        match sync {
            Some(sync) => sync
                .delist(flag)
                .map_err(|e| PoolError::EnlistmentFailure(e.to_string())),
            None => Ok(()),
        }
    }

    fn clear_enlistment(&self, sync: &Arc<TransactionSynchronization>) {
        let mut inner = self.inner.lock();
        if inner.enlistment.as_ref().is_some_and(|cur| Arc::ptr_eq(cur, sync)) {
            inner.enlistment = None;
        }
        sync.cancel();
    }

    /// Called by the synchronization once its transaction has completed.
    pub(crate) fn transaction_completed(&self, sync: &TransactionSynchronization) {
        let should_return = {
            let mut inner = self.inner.lock();
            let current = inner
                .enlistment
                .as_ref()
                .is_some_and(|cur| std::ptr::eq(Arc::as_ptr(cur), sync));
            if !current {
                return;
            }
            inner.enlistment = None;
            inner.handles.is_empty() && self.state() == ListenerState::InUse
        };
        debug!(
            listener = %self.id,
            tx = %sync.transaction_id(),
            returning = should_return,
            "transaction completed"
        );
        if should_return {
            self.return_to_pool(false);
        }
    }
}

impl ConnectionEventListener for ConnectionListener {
    fn connection_closed(&self, event: &ConnectionEvent) {
        match event.handle {
            Some(handle) => self.handle_released(handle),
            None => debug!(listener = %self.id, "close event without handle ignored"),
        }
    }

    fn connection_error_occurred(&self, event: &ConnectionEvent) {
        warn!(
            listener = %self.id,
            error = event.error.as_ref().map(|e| e.message()).unwrap_or("unknown"),
            "physical connection error, destroying listener"
        );
        self.return_to_pool(true);
    }

    fn local_transaction_started(&self, _event: &ConnectionEvent) {
        self.inner.lock().local_tx_active = true;
    }

    fn local_transaction_committed(&self, _event: &ConnectionEvent) {
        self.inner.lock().local_tx_active = false;
    }

    fn local_transaction_rolled_back(&self, _event: &ConnectionEvent) {
        self.inner.lock().local_tx_active = false;
    }
}

impl fmt::Debug for ConnectionListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionListener")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("checkouts", &self.checkout_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resource::memory::MemoryConnectionFactory;
    use crate::resource::ManagedConnectionFactory;

    fn standalone() -> (MemoryConnectionFactory, Arc<ConnectionListener>) {
        let factory = MemoryConnectionFactory::new();
        let connection = factory
            .create_managed_connection(&Credential::anonymous())
            .expect("memory connection");
        let listener = ConnectionListener::standalone(connection, Credential::anonymous());
        (factory, listener)
    }

    #[test]
    fn test_change_state_is_compare_and_swap() {
        let (_factory, listener) = standalone();
        assert_eq!(listener.state(), ListenerState::InUse);
        assert!(!listener.change_state(ListenerState::Free, ListenerState::InUse));
        assert!(listener.change_state(ListenerState::InUse, ListenerState::Free));
        assert!(!listener.change_state(ListenerState::InUse, ListenerState::Free));
        assert_eq!(listener.state(), ListenerState::Free);
    }

    #[test]
    fn test_handles_tracked() {
        let (_factory, listener) = standalone();
        let h1 = listener.get_connection().expect("handle");
        let h2 = listener.get_connection().expect("handle");
        assert_eq!(listener.handle_count(), 2);
        assert!(listener.has_handle(h1.id()));

        h1.close().expect("close");
        assert_eq!(listener.handle_count(), 1);
        assert_eq!(listener.state(), ListenerState::InUse);

        // last handle closes a pool-less listener: destroyed
        h2.close().expect("close");
        assert_eq!(listener.state(), ListenerState::Destroyed);
    }

    #[test]
    fn test_get_connection_requires_in_use() {
        let (_factory, listener) = standalone();
        assert!(listener.change_state(ListenerState::InUse, ListenerState::Free));
        assert!(matches!(
            listener.get_connection(),
            Err(PoolError::ResourceFailure(_))
        ));
        assert_eq!(listener.handle_count(), 0);
    }

    #[test]
    fn test_administrative_handle_set() {
        let (_factory, listener) = standalone();
        listener.add_connection(HandleId::new(900));
        listener.add_connection(HandleId::new(901));
        assert!(listener.remove_connection(HandleId::new(900)));
        assert!(!listener.remove_connection(HandleId::new(900)));
        listener.clear_connections();
        assert_eq!(listener.handle_count(), 0);
    }

    #[test]
    fn test_error_event_destroys() {
        let (factory, listener) = standalone();
        let _handle = listener.get_connection().expect("handle");
        factory.connection(0).expect("physical").fire_error("socket reset");
        assert_eq!(listener.state(), ListenerState::Destroyed);
        assert!(factory.connection(0).expect("physical").is_destroyed());
    }
}
