//! Transaction-manager integration.
//!
//! The pool does not coordinate transactions itself. It registers a
//! [`TransactionSynchronization`] with the ambient [`Transaction`] and enlists
//! the physical connection's [`XaResource`]; transaction completion is the
//! moment an enlisted listener may go back to its pool.

mod local_xa;
mod memory;
mod synchronization;

use std::fmt;
use std::sync::Arc;

use thiserror::Error;
use uuid::Uuid;

pub use local_xa::LocalXaResource;
pub use memory::{InMemoryTransaction, InMemoryTransactionManager};
pub use synchronization::{CompletionHook, TransactionSynchronization};

/// Global transaction identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TransactionId(Uuid);

impl TransactionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for TransactionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction status as seen by participants.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionStatus {
    Active,
    MarkedRollback,
    Preparing,
    Committing,
    Committed,
    RollingBack,
    RolledBack,
    NoTransaction,
}

impl TransactionStatus {
    /// Active or marked for rollback: still accepting participants.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, Self::Active | Self::MarkedRollback)
    }
}

/// Outcome hint given when a resource is ended/delisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelistFlag {
    Success,
    Fail,
    Suspend,
}

#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("No active transaction")]
    NotActive,

    #[error("Transaction already active on this thread")]
    AlreadyActive,

    #[error("Transaction {0} was rolled back")]
    RolledBack(TransactionId),

    #[error("Resource error: {0}")]
    Resource(String),

    #[error("Transaction system error: {0}")]
    System(String),
}

/// Two-phase-capable transactional resource of a physical connection.
pub trait XaResource: Send + Sync {
    fn start(&self, xid: &TransactionId) -> Result<(), TransactionError>;
    fn end(&self, xid: &TransactionId, flag: DelistFlag) -> Result<(), TransactionError>;
    fn commit(&self, xid: &TransactionId, one_phase: bool) -> Result<(), TransactionError>;
    fn rollback(&self, xid: &TransactionId) -> Result<(), TransactionError>;

    /// Returns false if the resource does not support timeouts.
    fn set_transaction_timeout(&self, seconds: u32) -> Result<bool, TransactionError>;
    fn transaction_timeout(&self) -> u32;
}

/// Participant notified around transaction completion.
pub trait Synchronization: Send + Sync {
    fn before_completion(&self, tx: &dyn Transaction);
    fn after_completion(&self, status: TransactionStatus);
}

/// The ambient transaction, as exposed by the transaction manager.
pub trait Transaction: Send + Sync {
    fn id(&self) -> TransactionId;
    fn status(&self) -> TransactionStatus;

    /// Register a synchronization that runs after regular ones in
    /// `before_completion` and before them in `after_completion`.
    fn register_interposed_synchronization(
        &self,
        sync: Arc<dyn Synchronization>,
    ) -> Result<(), TransactionError>;

    fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<(), TransactionError>;

    fn delist_resource(
        &self,
        resource: &Arc<dyn XaResource>,
        flag: DelistFlag,
    ) -> Result<(), TransactionError>;
}

/// Source of the calling thread's transaction.
pub trait TransactionManager: Send + Sync {
    /// The transaction bound to the current thread, if any.
    fn current(&self) -> Option<Arc<dyn Transaction>>;

    /// Like [`current`](Self::current) but only when it still accepts work.
    fn current_in_flight(&self) -> Option<Arc<dyn Transaction>> {
        self.current().filter(|tx| tx.status().is_in_flight())
    }
}

/// Pointer identity for trait-object resources.
pub(crate) fn same_resource(a: &Arc<dyn XaResource>, b: &Arc<dyn XaResource>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(a) as *const (),
        Arc::as_ptr(b) as *const (),
    )
}
