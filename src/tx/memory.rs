//! Thread-bound in-process transaction manager.
//!
//! Commits single-phase, resource by resource, with no recovery log. Meant
//! for embedding the pool without an external transaction manager and for
//! exercising enlistment in tests.

use std::sync::Arc;
use std::thread::{self, ThreadId};

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::{
    same_resource, DelistFlag, Synchronization, Transaction, TransactionError, TransactionId,
    TransactionManager, TransactionStatus, XaResource,
};

struct Enlisted {
    resource: Arc<dyn XaResource>,
    ended: bool,
}

/// A transaction created by [`InMemoryTransactionManager`].
pub struct InMemoryTransaction {
    id: TransactionId,
    status: Mutex<TransactionStatus>,
    synchronizations: Mutex<Vec<Arc<dyn Synchronization>>>,
    interposed: Mutex<Vec<Arc<dyn Synchronization>>>,
    resources: Mutex<Vec<Enlisted>>,
}

impl InMemoryTransaction {
    fn new() -> Self {
        Self {
            id: TransactionId::new(),
            status: Mutex::new(TransactionStatus::Active),
            synchronizations: Mutex::new(Vec::new()),
            interposed: Mutex::new(Vec::new()),
            resources: Mutex::new(Vec::new()),
        }
    }

    /// Register a regular (non-interposed) synchronization.
    pub fn register_synchronization(
        &self,
        sync: Arc<dyn Synchronization>,
    ) -> Result<(), TransactionError> {
        self.ensure_in_flight()?;
        self.synchronizations.lock().push(sync);
        Ok(())
    }

    pub fn set_rollback_only(&self) -> Result<(), TransactionError> {
        let mut status = self.status.lock();
        if !status.is_in_flight() {
            return Err(TransactionError::NotActive);
        }
        *status = TransactionStatus::MarkedRollback;
        Ok(())
    }

    pub fn resource_count(&self) -> usize {
        self.resources.lock().len()
    }

    fn set_status(&self, status: TransactionStatus) {
        *self.status.lock() = status;
    }

    fn ensure_in_flight(&self) -> Result<(), TransactionError> {
        if self.status().is_in_flight() {
            Ok(())
        } else {
            Err(TransactionError::NotActive)
        }
    }

    /// Drive the transaction to completion. `commit` is a request; a
    /// transaction marked rollback-only rolls back and reports it.
    fn complete(&self, commit: bool) -> Result<(), TransactionError> {
        self.ensure_in_flight()?;

        if commit && self.status() == TransactionStatus::Active {
            let regular = self.synchronizations.lock().clone();
            let interposed = self.interposed.lock().clone();
            for sync in regular.iter().chain(interposed.iter()) {
                sync.before_completion(self);
            }
        }

        let commit = commit && self.status() == TransactionStatus::Active;
        let end_flag = if commit { DelistFlag::Success } else { DelistFlag::Fail };
        let (to_end, resources) = {
            let mut enlisted = self.resources.lock();
            let mut to_end = Vec::new();
            for entry in enlisted.iter_mut().filter(|e| !e.ended) {
                entry.ended = true;
                to_end.push(entry.resource.clone());
            }
            let all: Vec<Arc<dyn XaResource>> =
                enlisted.iter().map(|e| e.resource.clone()).collect();
            (to_end, all)
        };
        for resource in &to_end {
            if let Err(e) = resource.end(&self.id, end_flag) {
                warn!(tx = %self.id, error = %e, "resource end failed");
            }
        }

        let mut outcome = Ok(());
        if commit {
            self.set_status(TransactionStatus::Committing);
            let one_phase = resources.len() == 1;
            let mut failed_at = None;
            for (index, resource) in resources.iter().enumerate() {
                if let Err(e) = resource.commit(&self.id, one_phase) {
                    warn!(
                        tx = %self.id,
                        error = %e,
                        "resource commit failed, rolling back the rest"
                    );
                    failed_at = Some(index);
                    outcome = Err(TransactionError::Resource(e.to_string()));
                    break;
                }
            }
            match failed_at {
                Some(index) => {
                    self.rollback_resources(&resources[index + 1..]);
                    self.set_status(TransactionStatus::RolledBack);
                }
                None => self.set_status(TransactionStatus::Committed),
            }
        } else {
            self.set_status(TransactionStatus::RollingBack);
            self.rollback_resources(&resources);
            self.set_status(TransactionStatus::RolledBack);
        }

        let status = self.status();
        let interposed = self.interposed.lock().clone();
        let regular = self.synchronizations.lock().clone();
        for sync in interposed.iter().chain(regular.iter()) {
            sync.after_completion(status);
        }
        debug!(tx = %self.id, ?status, "transaction completed");
        outcome
    }

    fn rollback_resources(&self, resources: &[Arc<dyn XaResource>]) {
        for resource in resources {
            if let Err(e) = resource.rollback(&self.id) {
                warn!(tx = %self.id, error = %e, "resource rollback failed");
            }
        }
    }
}

impl Transaction for InMemoryTransaction {
    fn id(&self) -> TransactionId {
        self.id
    }

    fn status(&self) -> TransactionStatus {
        *self.status.lock()
    }

    fn register_interposed_synchronization(
        &self,
        sync: Arc<dyn Synchronization>,
    ) -> Result<(), TransactionError> {
        self.ensure_in_flight()?;
        self.interposed.lock().push(sync);
        Ok(())
    }

    fn enlist_resource(&self, resource: Arc<dyn XaResource>) -> Result<(), TransactionError> {
        if self.status() != TransactionStatus::Active {
            return Err(TransactionError::NotActive);
        }
        if self
            .resources
            .lock()
            .iter()
            .any(|e| same_resource(&e.resource, &resource) && !e.ended)
        {
            return Ok(());
        }
        resource.start(&self.id)?;
        self.resources.lock().push(Enlisted {
            resource,
            ended: false,
        });
        Ok(())
    }

    fn delist_resource(
        &self,
        resource: &Arc<dyn XaResource>,
        flag: DelistFlag,
    ) -> Result<(), TransactionError> {
        {
            let mut enlisted = self.resources.lock();
            let entry = enlisted
                .iter_mut()
                .find(|e| same_resource(&e.resource, resource) && !e.ended)
                .ok_or_else(|| TransactionError::Resource("resource not enlisted".to_string()))?;
            entry.ended = true;
        }
        resource.end(&self.id, flag)?;
        if flag == DelistFlag::Fail {
            let mut status = self.status.lock();
            if *status == TransactionStatus::Active {
                *status = TransactionStatus::MarkedRollback;
            }
        }
        Ok(())
    }
}

/// Binds at most one [`InMemoryTransaction`] to each thread.
#[derive(Default)]
pub struct InMemoryTransactionManager {
    active: DashMap<ThreadId, Arc<InMemoryTransaction>>,
}

impl InMemoryTransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a transaction on the calling thread.
    pub fn begin(&self) -> Result<Arc<InMemoryTransaction>, TransactionError> {
        let thread = thread::current().id();
        if self.active.contains_key(&thread) {
            return Err(TransactionError::AlreadyActive);
        }
        let tx = Arc::new(InMemoryTransaction::new());
        self.active.insert(thread, tx.clone());
        debug!(tx = %tx.id, "transaction begun");
        Ok(tx)
    }

    /// The calling thread's transaction.
    pub fn transaction(&self) -> Option<Arc<InMemoryTransaction>> {
        self.active
            .get(&thread::current().id())
            .map(|entry| entry.value().clone())
    }

    /// Commit the calling thread's transaction. A rollback-only transaction
    /// is rolled back and reported as [`TransactionError::RolledBack`].
    pub fn commit(&self) -> Result<(), TransactionError> {
        let tx = self.transaction().ok_or(TransactionError::NotActive)?;
        let rollback_only = tx.status() == TransactionStatus::MarkedRollback;
        let result = tx.complete(true);
        self.active.remove(&thread::current().id());
        match result {
            Ok(()) if rollback_only || tx.status() == TransactionStatus::RolledBack => {
                Err(TransactionError::RolledBack(tx.id))
            }
            other => other,
        }
    }

    pub fn rollback(&self) -> Result<(), TransactionError> {
        let tx = self.transaction().ok_or(TransactionError::NotActive)?;
        let result = tx.complete(false);
        self.active.remove(&thread::current().id());
        result
    }

    pub fn set_rollback_only(&self) -> Result<(), TransactionError> {
        self.transaction()
            .ok_or(TransactionError::NotActive)?
            .set_rollback_only()
    }

    /// Detach the calling thread's transaction.
    pub fn suspend(&self) -> Option<Arc<InMemoryTransaction>> {
        self.active
            .remove(&thread::current().id())
            .map(|(_, tx)| tx)
    }

    /// Attach a suspended transaction to the calling thread.
    pub fn resume(&self, tx: Arc<InMemoryTransaction>) -> Result<(), TransactionError> {
        let thread = thread::current().id();
        if self.active.contains_key(&thread) {
            return Err(TransactionError::AlreadyActive);
        }
        self.active.insert(thread, tx);
        Ok(())
    }
}

impl TransactionManager for InMemoryTransactionManager {
    fn current(&self) -> Option<Arc<dyn Transaction>> {
        self.transaction().map(|tx| tx as Arc<dyn Transaction>)
    }
}
