//! Resource-side collaborators of the pooling engine.
//!
//! The pool never talks to a backend directly. A [`ManagedConnectionFactory`]
//! creates physical connections, each physical connection implements
//! [`ManagedConnection`] and reports lifecycle events to its registered
//! [`ConnectionEventListener`]s. Applications only ever see a
//! [`ConnectionHandle`].

mod handle;
pub mod memory;

use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::credential::Credential;
use crate::error::ResourceError;
use crate::tx::XaResource;

pub use handle::{Capability, ConnectionHandle, HandleId};

/// Local (single-resource) transaction demarcation on a physical connection.
///
/// Implementations fire the matching `LocalTransaction*` events so the pool
/// knows whether a local transaction is left open.
pub trait LocalTransaction: Send + Sync {
    fn begin(&self) -> Result<(), ResourceError>;
    fn commit(&self) -> Result<(), ResourceError>;
    fn rollback(&self) -> Result<(), ResourceError>;
}

/// A physical connection to the backing resource.
pub trait ManagedConnection: Send + Sync {
    /// Issue an application handle with the given id.
    fn get_connection(
        &self,
        handle: HandleId,
        credential: &Credential,
    ) -> Result<(), ResourceError>;

    /// Close an application handle. Must fire a `Closed` event for `handle`.
    fn close_handle(&self, handle: HandleId) -> Result<(), ResourceError>;

    /// Re-bind an existing handle to this physical connection.
    fn associate_connection(&self, _handle: HandleId) -> Result<(), ResourceError> {
        Ok(())
    }

    /// Handle variant this connection hands out.
    fn capability(&self) -> Capability;

    /// Register an observer. Observers are held weakly.
    fn add_event_listener(&self, listener: Weak<dyn ConnectionEventListener>);

    /// Reset connection state before it is reused by another caller.
    fn cleanup(&self) -> Result<(), ResourceError>;

    /// Close the physical connection. Called exactly once per connection.
    fn destroy(&self) -> Result<(), ResourceError>;

    /// Cheap liveness probe used by the default factory validation.
    fn is_valid(&self) -> bool {
        true
    }

    fn local_transaction(&self) -> Option<&dyn LocalTransaction> {
        None
    }

    fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        None
    }
}

/// Creates and validates physical connections.
pub trait ManagedConnectionFactory: Send + Sync {
    fn create_managed_connection(
        &self,
        credential: &Credential,
    ) -> Result<Box<dyn ManagedConnection>, ResourceError>;

    /// Liveness check used by validate-on-match and background validation.
    fn validate(&self, connection: &dyn ManagedConnection) -> bool {
        connection.is_valid()
    }
}

/// Kind of lifecycle notification sent by a physical connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionEventKind {
    Closed,
    ErrorOccurred,
    LocalTransactionStarted,
    LocalTransactionCommitted,
    LocalTransactionRolledBack,
}

/// Lifecycle notification sent by a physical connection.
#[derive(Debug, Clone)]
pub struct ConnectionEvent {
    pub kind: ConnectionEventKind,
    pub handle: Option<HandleId>,
    pub error: Option<ResourceError>,
}

impl ConnectionEvent {
    pub fn closed(handle: HandleId) -> Self {
        Self {
            kind: ConnectionEventKind::Closed,
            handle: Some(handle),
            error: None,
        }
    }

    pub fn error(handle: Option<HandleId>, error: ResourceError) -> Self {
        Self {
            kind: ConnectionEventKind::ErrorOccurred,
            handle,
            error: Some(error),
        }
    }

    pub fn local(kind: ConnectionEventKind) -> Self {
        Self {
            kind,
            handle: None,
            error: None,
        }
    }
}

/// Observer of a physical connection's lifecycle events.
pub trait ConnectionEventListener: Send + Sync {
    fn connection_closed(&self, event: &ConnectionEvent);
    fn connection_error_occurred(&self, event: &ConnectionEvent);
    fn local_transaction_started(&self, _event: &ConnectionEvent) {}
    fn local_transaction_committed(&self, _event: &ConnectionEvent) {}
    fn local_transaction_rolled_back(&self, _event: &ConnectionEvent) {}
}

/// Listener registry a [`ManagedConnection`] implementation can embed.
///
/// Dispatch happens outside the registry lock, so observers may call back
/// into the connection.
#[derive(Default)]
pub struct EventSource {
    listeners: Mutex<Vec<Weak<dyn ConnectionEventListener>>>,
}

impl EventSource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, listener: Weak<dyn ConnectionEventListener>) {
        let mut listeners = self.listeners.lock();
        listeners.retain(|l| l.strong_count() > 0);
        listeners.push(listener);
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.lock().iter().filter(|l| l.strong_count() > 0).count()
    }

    pub fn fire(&self, event: &ConnectionEvent) {
        let live: Vec<Arc<dyn ConnectionEventListener>> =
            self.listeners.lock().iter().filter_map(Weak::upgrade).collect();

        for listener in live {
            match event.kind {
                ConnectionEventKind::Closed => listener.connection_closed(event),
                ConnectionEventKind::ErrorOccurred => listener.connection_error_occurred(event),
                ConnectionEventKind::LocalTransactionStarted => {
                    listener.local_transaction_started(event)
                }
                ConnectionEventKind::LocalTransactionCommitted => {
                    listener.local_transaction_committed(event)
                }
                ConnectionEventKind::LocalTransactionRolledBack => {
                    listener.local_transaction_rolled_back(event)
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        closed: AtomicUsize,
        errors: AtomicUsize,
    }

    impl ConnectionEventListener for Counting {
        fn connection_closed(&self, _event: &ConnectionEvent) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }

        fn connection_error_occurred(&self, _event: &ConnectionEvent) {
            self.errors.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_fire_dispatches_by_kind() {
        let source = EventSource::new();
        let observer = Arc::new(Counting::default());
        let weak: Weak<dyn ConnectionEventListener> =
            Arc::downgrade(&(observer.clone() as Arc<dyn ConnectionEventListener>));
        source.add(weak);

        source.fire(&ConnectionEvent::closed(HandleId::new(1)));
        source.fire(&ConnectionEvent::error(None, ResourceError::new("boom")));
        source.fire(&ConnectionEvent::local(ConnectionEventKind::LocalTransactionStarted));

        assert_eq!(observer.closed.load(Ordering::SeqCst), 1);
        assert_eq!(observer.errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_dropped_listeners_are_skipped() {
        let source = EventSource::new();
        {
            let observer: Arc<dyn ConnectionEventListener> = Arc::new(Counting::default());
            source.add(Arc::downgrade(&observer));
            assert_eq!(source.listener_count(), 1);
        }
        assert_eq!(source.listener_count(), 0);
        source.fire(&ConnectionEvent::closed(HandleId::new(7)));
    }
}
