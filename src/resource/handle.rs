//! Application-facing connection handles.
//!
//! A handle is a fixed type whose capability (plain, local-transaction or
//! XA) is chosen when the physical connection hands it out. Closing a
//! handle asks the physical connection to close it; the connection's
//! `Closed` event is what drives the pool.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{LocalTransaction, ManagedConnection};
use crate::error::{PoolError, ResourceError};
use crate::pool::{ConnectionListener, ListenerId};

static NEXT_HANDLE_ID: AtomicU64 = AtomicU64::new(1);

/// Identifier of one issued handle, unique within the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub(crate) fn next() -> Self {
        Self(NEXT_HANDLE_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn id(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// What a handle can do beyond plain use of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    /// No transaction support.
    Basic,
    /// Local (resource-manager) transactions only.
    LocalTransaction,
    /// Distributed transactions through an XA resource.
    Xa,
}

impl Capability {
    pub fn supports_local_transactions(&self) -> bool {
        matches!(self, Self::LocalTransaction | Self::Xa)
    }

    pub fn supports_xa(&self) -> bool {
        matches!(self, Self::Xa)
    }
}

/// Handle to a pooled physical connection.
///
/// Dropping an open handle closes it.
pub struct ConnectionHandle {
    id: HandleId,
    capability: Capability,
    listener: Mutex<Arc<ConnectionListener>>,
    closed: AtomicBool,
}

impl ConnectionHandle {
    pub(crate) fn new(
        id: HandleId,
        capability: Capability,
        listener: Arc<ConnectionListener>,
    ) -> Self {
        Self {
            id,
            capability,
            listener: Mutex::new(listener),
            closed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> HandleId {
        self.id
    }

    pub fn capability(&self) -> Capability {
        self.capability
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Id of the listener currently backing this handle.
    pub fn listener_id(&self) -> ListenerId {
        self.listener.lock().id()
    }

    pub(crate) fn listener(&self) -> Arc<ConnectionListener> {
        self.listener.lock().clone()
    }

    /// Close the handle. Idempotent.
    pub fn close(&self) -> Result<(), PoolError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let listener = self.listener();
        debug!(handle = %self.id, listener = %listener.id(), "closing connection handle");
        if let Err(e) = listener.connection().close_handle(self.id) {
            listener.handle_close_failed(self.id, &e);
            return Err(PoolError::ResourceFailure(e));
        }
        Ok(())
    }

    /// Run `f` against the physical connection.
    pub fn with_connection<R>(
        &self,
        f: impl FnOnce(&dyn ManagedConnection) -> R,
    ) -> Result<R, PoolError> {
        self.ensure_open()?;
        let listener = self.listener();
        Ok(f(listener.connection()))
    }

    pub fn begin_local(&self) -> Result<(), PoolError> {
        self.with_local(|local| local.begin())
    }

    pub fn commit_local(&self) -> Result<(), PoolError> {
        self.with_local(|local| local.commit())
    }

    pub fn rollback_local(&self) -> Result<(), PoolError> {
        self.with_local(|local| local.rollback())
    }

    /// Move this handle onto another listener's physical connection.
    pub fn reassociate(&self, target: &Arc<ConnectionListener>) -> Result<(), PoolError> {
        self.ensure_open()?;
        let previous = {
            let mut current = self.listener.lock();
            if Arc::ptr_eq(&current, target) {
                return Ok(());
            }
            target
                .connection()
                .associate_connection(self.id)
                .map_err(PoolError::ResourceFailure)?;
            target.add_connection(self.id);
            std::mem::replace(&mut *current, target.clone())
        };
        debug!(handle = %self.id, from = %previous.id(), to = %target.id(), "handle reassociated");
        previous.handle_released(self.id);
        Ok(())
    }

    fn ensure_open(&self) -> Result<(), PoolError> {
        if self.is_closed() {
            return Err(PoolError::HandleClosed(self.id.id()));
        }
        Ok(())
    }

    fn with_local(
        &self,
        op: impl FnOnce(&dyn LocalTransaction) -> Result<(), ResourceError>,
    ) -> Result<(), PoolError> {
        self.ensure_open()?;
        if !self.capability.supports_local_transactions() {
            return Err(PoolError::Unsupported(format!(
                "handle {} does not support local transactions",
                self.id
            )));
        }
        let listener = self.listener();
        let local = listener.connection().local_transaction().ok_or_else(|| {
            PoolError::Unsupported("physical connection has no local transaction".to_string())
        })?;
        op(local).map_err(PoolError::ResourceFailure)
    }
}

impl fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.id)
            .field("capability", &self.capability)
            .field("listener", &self.listener_id())
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Drop for ConnectionHandle {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(handle = %self.id, error = %e, "failed to close dropped connection handle");
        }
    }
}
