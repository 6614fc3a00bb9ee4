use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tracing::{debug, warn};

use super::{DelistFlag, Synchronization, Transaction, TransactionId, TransactionStatus, XaResource};
use crate::pool::ConnectionListener;

/// Callback run once a transaction has completed, after the listener has
/// been released.
pub type CompletionHook = Box<dyn Fn(TransactionId) + Send + Sync>;

/// Ties one listener's enlistment to one transaction.
///
/// Created on enlistment, registered as an interposed synchronization, and
/// discarded when the transaction completes. A listener holds at most one.
pub struct TransactionSynchronization {
    tx_id: TransactionId,
    tx: Weak<dyn Transaction>,
    listener: Weak<ConnectionListener>,
    resource: Arc<dyn XaResource>,
    enlisted: AtomicBool,
    delisted: AtomicBool,
    cancelled: AtomicBool,
    hook: Option<CompletionHook>,
}

impl TransactionSynchronization {
    pub(crate) fn new(
        tx: &Arc<dyn Transaction>,
        listener: Weak<ConnectionListener>,
        resource: Arc<dyn XaResource>,
        hook: Option<CompletionHook>,
    ) -> Self {
        Self {
            tx_id: tx.id(),
            tx: Arc::downgrade(tx),
            listener,
            resource,
            enlisted: AtomicBool::new(false),
            delisted: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            hook,
        }
    }

    pub fn transaction_id(&self) -> TransactionId {
        self.tx_id
    }

    pub fn is_enlisted(&self) -> bool {
        self.enlisted.load(Ordering::Acquire)
    }

    pub fn is_delisted(&self) -> bool {
        self.delisted.load(Ordering::Acquire)
    }

    pub(crate) fn mark_enlisted(&self) {
        self.enlisted.store(true, Ordering::Release);
    }

    /// Enlistment failed after registration; completion callbacks become
    /// no-ops.
    pub(crate) fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Delist the resource from its transaction. Only the first call reaches
    /// the transaction.
    pub(crate) fn delist(&self, flag: DelistFlag) -> Result<(), super::TransactionError> {
        if !self.is_enlisted() || self.delisted.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        match self.tx.upgrade() {
            Some(tx) => tx.delist_resource(&self.resource, flag),
            None => Ok(()),
        }
    }
}

impl Synchronization for TransactionSynchronization {
    fn before_completion(&self, tx: &dyn Transaction) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        let status = tx.status();
        if !status.is_in_flight() || !self.is_enlisted() || self.is_delisted() {
            return;
        }
        let flag = if status == TransactionStatus::MarkedRollback {
            DelistFlag::Fail
        } else {
            DelistFlag::Success
        };
        if self.delisted.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Err(e) = tx.delist_resource(&self.resource, flag) {
            warn!(tx = %self.tx_id, error = %e, "delist before completion failed");
        }
    }

    fn after_completion(&self, status: TransactionStatus) {
        if self.cancelled.load(Ordering::Acquire) {
            return;
        }
        debug!(tx = %self.tx_id, ?status, "transaction completed");
        if let Some(listener) = self.listener.upgrade() {
            listener.transaction_completed(self);
        }
        if let Some(hook) = &self.hook {
            hook(self.tx_id);
        }
    }
}
