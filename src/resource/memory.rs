//! In-memory resource adapter.
//!
//! Physical connections are plain bookkeeping, which makes the adapter
//! useful for embedding the pool in tests and for exercising failure paths:
//! creation can be made to fail, connections can be invalidated, and
//! connection errors can be fired on demand.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use super::{
    Capability, ConnectionEvent, ConnectionEventKind, ConnectionEventListener, EventSource,
    HandleId, LocalTransaction, ManagedConnection, ManagedConnectionFactory,
};
use crate::credential::Credential;
use crate::error::ResourceError;
use crate::tx::{DelistFlag, TransactionError, TransactionId, XaResource};

/// Default XA transaction timeout of a fresh connection, in seconds.
pub const DEFAULT_XA_TIMEOUT_SECS: u32 = 300;

/// Factory for [`MemoryConnection`]s. Keeps a clone of every connection it
/// created so callers can inspect or break them.
pub struct MemoryConnectionFactory {
    capability: Capability,
    connections: Mutex<Vec<MemoryConnection>>,
    fail_next: AtomicUsize,
    unavailable: AtomicBool,
    creation_delay: Mutex<Duration>,
}

impl MemoryConnectionFactory {
    pub fn new() -> Self {
        Self::with_capability(Capability::Basic)
    }

    pub fn with_capability(capability: Capability) -> Self {
        Self {
            capability,
            connections: Mutex::new(Vec::new()),
            fail_next: AtomicUsize::new(0),
            unavailable: AtomicBool::new(false),
            creation_delay: Mutex::new(Duration::ZERO),
        }
    }

    /// Fail the next `count` creations with a retryable error.
    pub fn fail_next(&self, count: usize) {
        self.fail_next.store(count, Ordering::SeqCst);
    }

    /// Fail every creation until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Sleep this long inside every creation.
    pub fn set_creation_delay(&self, delay: Duration) {
        *self.creation_delay.lock() = delay;
    }

    pub fn created_count(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn connections(&self) -> Vec<MemoryConnection> {
        self.connections.lock().clone()
    }

    /// The `index`-th connection created.
    pub fn connection(&self, index: usize) -> Option<MemoryConnection> {
        self.connections.lock().get(index).cloned()
    }

    /// Connections not yet destroyed.
    pub fn live_count(&self) -> usize {
        self.connections.lock().iter().filter(|c| !c.is_destroyed()).count()
    }
}

impl Default for MemoryConnectionFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl ManagedConnectionFactory for MemoryConnectionFactory {
    fn create_managed_connection(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn ManagedConnection>, ResourceError> {
        let delay = *self.creation_delay.lock();
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ResourceError::new("backend unavailable"));
        }
        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(ResourceError::retryable("injected creation failure"));
        }

        let mut connections = self.connections.lock();
        let connection =
            MemoryConnection::new(connections.len(), credential.clone(), self.capability);
        connections.push(connection.clone());
        debug!(connection = connection.id(), "memory connection created");
        Ok(Box::new(connection))
    }
}

struct Shared {
    id: usize,
    credential: Credential,
    capability: Capability,
    events: EventSource,
    handles: Mutex<HashSet<HandleId>>,
    valid: AtomicBool,
    destroyed: AtomicBool,
    destroy_calls: AtomicUsize,
    cleanups: AtomicUsize,
    fail_cleanup: AtomicBool,
    fail_get_connection: AtomicBool,
    fail_close_handle: AtomicBool,
    local_active: AtomicBool,
    local_begins: AtomicUsize,
    local_commits: AtomicUsize,
    local_rollbacks: AtomicUsize,
    xa: Option<Arc<MemoryXaResource>>,
}

/// In-memory physical connection. Clones share state.
#[derive(Clone)]
pub struct MemoryConnection {
    shared: Arc<Shared>,
}

impl MemoryConnection {
    fn new(id: usize, credential: Credential, capability: Capability) -> Self {
        let xa = capability
            .supports_xa()
            .then(|| Arc::new(MemoryXaResource::new(DEFAULT_XA_TIMEOUT_SECS)));
        Self {
            shared: Arc::new(Shared {
                id,
                credential,
                capability,
                events: EventSource::new(),
                handles: Mutex::new(HashSet::new()),
                valid: AtomicBool::new(true),
                destroyed: AtomicBool::new(false),
                destroy_calls: AtomicUsize::new(0),
                cleanups: AtomicUsize::new(0),
                fail_cleanup: AtomicBool::new(false),
                fail_get_connection: AtomicBool::new(false),
                fail_close_handle: AtomicBool::new(false),
                local_active: AtomicBool::new(false),
                local_begins: AtomicUsize::new(0),
                local_commits: AtomicUsize::new(0),
                local_rollbacks: AtomicUsize::new(0),
                xa,
            }),
        }
    }

    pub fn id(&self) -> usize {
        self.shared.id
    }

    pub fn credential(&self) -> &Credential {
        &self.shared.credential
    }

    pub fn handle_count(&self) -> usize {
        self.shared.handles.lock().len()
    }

    pub fn set_valid(&self, valid: bool) {
        self.shared.valid.store(valid, Ordering::SeqCst);
    }

    pub fn is_destroyed(&self) -> bool {
        self.shared.destroyed.load(Ordering::SeqCst)
    }

    pub fn destroy_count(&self) -> usize {
        self.shared.destroy_calls.load(Ordering::SeqCst)
    }

    pub fn cleanup_count(&self) -> usize {
        self.shared.cleanups.load(Ordering::SeqCst)
    }

    pub fn set_fail_cleanup(&self, fail: bool) {
        self.shared.fail_cleanup.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_get_connection(&self, fail: bool) {
        self.shared.fail_get_connection.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_close_handle(&self, fail: bool) {
        self.shared.fail_close_handle.store(fail, Ordering::SeqCst);
    }

    pub fn local_transaction_active(&self) -> bool {
        self.shared.local_active.load(Ordering::SeqCst)
    }

    pub fn local_begins(&self) -> usize {
        self.shared.local_begins.load(Ordering::SeqCst)
    }

    pub fn local_commits(&self) -> usize {
        self.shared.local_commits.load(Ordering::SeqCst)
    }

    pub fn local_rollbacks(&self) -> usize {
        self.shared.local_rollbacks.load(Ordering::SeqCst)
    }

    pub fn xa(&self) -> Option<Arc<MemoryXaResource>> {
        self.shared.xa.clone()
    }

    /// Report a fatal connection error to every listener.
    pub fn fire_error(&self, message: &str) {
        self.shared
            .events
            .fire(&ConnectionEvent::error(None, ResourceError::new(message)));
    }

    fn ensure_usable(&self) -> Result<(), ResourceError> {
        if self.is_destroyed() {
            return Err(ResourceError::new(format!("connection {} destroyed", self.id())));
        }
        Ok(())
    }
}

impl ManagedConnection for MemoryConnection {
    fn get_connection(
        &self,
        handle: HandleId,
        _credential: &Credential,
    ) -> Result<(), ResourceError> {
        self.ensure_usable()?;
        if self.shared.fail_get_connection.load(Ordering::SeqCst) {
            return Err(ResourceError::new("handle creation refused"));
        }
        self.shared.handles.lock().insert(handle);
        Ok(())
    }

    fn close_handle(&self, handle: HandleId) -> Result<(), ResourceError> {
        if self.is_destroyed() {
            return Ok(());
        }
        if self.shared.fail_close_handle.load(Ordering::SeqCst) {
            return Err(ResourceError::new("handle close refused"));
        }
        self.shared.handles.lock().remove(&handle);
        self.shared.events.fire(&ConnectionEvent::closed(handle));
        Ok(())
    }

    fn associate_connection(&self, handle: HandleId) -> Result<(), ResourceError> {
        self.ensure_usable()?;
        self.shared.handles.lock().insert(handle);
        Ok(())
    }

    fn capability(&self) -> Capability {
        self.shared.capability
    }

    fn add_event_listener(&self, listener: Weak<dyn ConnectionEventListener>) {
        self.shared.events.add(listener);
    }

    fn cleanup(&self) -> Result<(), ResourceError> {
        self.ensure_usable()?;
        if self.shared.fail_cleanup.load(Ordering::SeqCst) {
            return Err(ResourceError::new("cleanup failed"));
        }
        self.shared.handles.lock().clear();
        self.shared.cleanups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn destroy(&self) -> Result<(), ResourceError> {
        self.shared.destroy_calls.fetch_add(1, Ordering::SeqCst);
        self.shared.destroyed.store(true, Ordering::SeqCst);
        self.shared.handles.lock().clear();
        Ok(())
    }

    fn is_valid(&self) -> bool {
        !self.is_destroyed() && self.shared.valid.load(Ordering::SeqCst)
    }

    fn local_transaction(&self) -> Option<&dyn LocalTransaction> {
        self.shared
            .capability
            .supports_local_transactions()
            .then_some(self as &dyn LocalTransaction)
    }

    fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        self.shared.xa.clone().map(|xa| xa as Arc<dyn XaResource>)
    }
}

impl LocalTransaction for MemoryConnection {
    fn begin(&self) -> Result<(), ResourceError> {
        self.ensure_usable()?;
        if self.shared.local_active.swap(true, Ordering::SeqCst) {
            return Err(ResourceError::new("local transaction already active"));
        }
        self.shared.local_begins.fetch_add(1, Ordering::SeqCst);
        self.shared
            .events
            .fire(&ConnectionEvent::local(ConnectionEventKind::LocalTransactionStarted));
        Ok(())
    }

    fn commit(&self) -> Result<(), ResourceError> {
        if !self.shared.local_active.swap(false, Ordering::SeqCst) {
            return Err(ResourceError::new("no local transaction active"));
        }
        self.shared.local_commits.fetch_add(1, Ordering::SeqCst);
        self.shared
            .events
            .fire(&ConnectionEvent::local(ConnectionEventKind::LocalTransactionCommitted));
        Ok(())
    }

    fn rollback(&self) -> Result<(), ResourceError> {
        if !self.shared.local_active.swap(false, Ordering::SeqCst) {
            return Err(ResourceError::new("no local transaction active"));
        }
        self.shared.local_rollbacks.fetch_add(1, Ordering::SeqCst);
        self.shared
            .events
            .fire(&ConnectionEvent::local(ConnectionEventKind::LocalTransactionRolledBack));
        Ok(())
    }
}

/// XA resource of an in-memory connection. Records every call.
pub struct MemoryXaResource {
    ops: Mutex<Vec<String>>,
    timeout: AtomicU32,
    fail_start: AtomicBool,
}

impl MemoryXaResource {
    fn new(timeout: u32) -> Self {
        Self {
            ops: Mutex::new(Vec::new()),
            timeout: AtomicU32::new(timeout),
            fail_start: AtomicBool::new(false),
        }
    }

    /// Calls received so far: `start`, `end:<flag>`, `commit`, `rollback`.
    pub fn operations(&self) -> Vec<String> {
        self.ops.lock().clone()
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    fn record(&self, op: impl Into<String>) {
        self.ops.lock().push(op.into());
    }
}

impl XaResource for MemoryXaResource {
    fn start(&self, _xid: &TransactionId) -> Result<(), TransactionError> {
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(TransactionError::Resource("start refused".to_string()));
        }
        self.record("start");
        Ok(())
    }

    fn end(&self, _xid: &TransactionId, flag: DelistFlag) -> Result<(), TransactionError> {
        let flag = match flag {
            DelistFlag::Success => "success",
            DelistFlag::Fail => "fail",
            DelistFlag::Suspend => "suspend",
        };
        self.record(format!("end:{flag}"));
        Ok(())
    }

    fn commit(&self, _xid: &TransactionId, _one_phase: bool) -> Result<(), TransactionError> {
        self.record("commit");
        Ok(())
    }

    fn rollback(&self, _xid: &TransactionId) -> Result<(), TransactionError> {
        self.record("rollback");
        Ok(())
    }

    fn set_transaction_timeout(&self, seconds: u32) -> Result<bool, TransactionError> {
        self.timeout.store(seconds, Ordering::SeqCst);
        Ok(true)
    }

    fn transaction_timeout(&self) -> u32 {
        self.timeout.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_injected_failures() {
        let factory = MemoryConnectionFactory::new();
        factory.fail_next(1);
        let err = factory
            .create_managed_connection(&Credential::anonymous())
            .err()
            .expect("failure");
        assert!(err.is_retryable());
        assert!(factory.create_managed_connection(&Credential::anonymous()).is_ok());
        factory.set_unavailable(true);
        assert!(factory.create_managed_connection(&Credential::anonymous()).is_err());
        assert_eq!(factory.created_count(), 1);
    }

    #[test]
    fn test_capabilities() {
        let basic = MemoryConnectionFactory::new()
            .create_managed_connection(&Credential::anonymous())
            .expect("basic");
        assert!(basic.local_transaction().is_none());
        assert!(basic.xa_resource().is_none());

        let xa = MemoryConnectionFactory::with_capability(Capability::Xa)
            .create_managed_connection(&Credential::anonymous())
            .expect("xa");
        assert!(xa.local_transaction().is_some());
        assert_eq!(
            xa.xa_resource().expect("xa resource").transaction_timeout(),
            DEFAULT_XA_TIMEOUT_SECS
        );
    }

    #[test]
    fn test_local_transaction_bookkeeping() {
        let factory = MemoryConnectionFactory::with_capability(Capability::LocalTransaction);
        let mc = factory.create_managed_connection(&Credential::anonymous()).expect("connection");
        let local = mc.local_transaction().expect("local");
        local.begin().expect("begin");
        assert!(local.begin().is_err());
        local.rollback().expect("rollback");
        assert!(local.commit().is_err());
        let probe = factory.connection(0).expect("probe");
        assert_eq!(probe.local_begins(), 1);
        assert_eq!(probe.local_rollbacks(), 1);
        assert!(!probe.local_transaction_active());
    }

    #[test]
    fn test_destroyed_connection_refuses_handles() {
        let factory = MemoryConnectionFactory::new();
        let mc = factory.create_managed_connection(&Credential::anonymous()).expect("connection");
        mc.destroy().expect("destroy");
        assert!(mc.get_connection(HandleId::new(1), &Credential::anonymous()).is_err());
        assert!(!mc.is_valid());
        assert_eq!(factory.live_count(), 0);
    }
}
