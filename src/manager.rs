//! Connection-manager façade: allocation with retry, transactional
//! enlistment and per-transaction connection sharing.

use std::sync::Arc;

use dashmap::DashMap;
use tracing::{debug, warn};

use crate::credential::{Credential, PoolKey};
use crate::error::{PoolError, ResourceError};
use crate::pool::{ConnectionListener, Pool};
use crate::resource::ConnectionHandle;
use crate::telemetry::metrics;
use crate::tx::{CompletionHook, DelistFlag, Transaction, TransactionId, TransactionManager};

type TxTracker = DashMap<(TransactionId, PoolKey), Arc<ConnectionListener>>;

/// Entry point applications allocate connections through.
pub struct ConnectionManager {
    pool: Arc<Pool>,
    tx_manager: Option<Arc<dyn TransactionManager>>,
    tracked: Arc<TxTracker>,
}

impl ConnectionManager {
    /// A manager without transaction integration.
    pub fn new(pool: Arc<Pool>) -> Self {
        Self {
            pool,
            tx_manager: None,
            tracked: Arc::new(DashMap::new()),
        }
    }

    pub fn with_transaction_manager(
        pool: Arc<Pool>,
        tx_manager: Arc<dyn TransactionManager>,
    ) -> Self {
        Self {
            pool,
            tx_manager: Some(tx_manager),
            tracked: Arc::new(DashMap::new()),
        }
    }

    pub fn pool(&self) -> &Arc<Pool> {
        &self.pool
    }

    /// Listeners currently shared by transaction.
    pub fn tracked_count(&self) -> usize {
        self.tracked.len()
    }

    fn current_transaction(&self) -> Option<Arc<dyn Transaction>> {
        self.tx_manager.as_ref().and_then(|tm| tm.current_in_flight())
    }

    /// Allocate a handle for `credential`.
    ///
    /// Inside a transaction the listener is enlisted before the handle is
    /// issued, and with track-by-tx a second allocation in the same
    /// transaction reuses the enlisted listener.
    pub fn allocate_connection(
        &self,
        credential: &Credential,
    ) -> Result<ConnectionHandle, PoolError> {
        let tx = self.current_transaction();

        if let Some(tx) = &tx {
            if self.pool.config().track_by_tx {
                if let Some(handle) = self.tracked_handle(tx.as_ref(), credential) {
                    return handle;
                }
            }
        }

        let listener = self.get_listener_with_retry(credential)?;

        if let Some(tx) = &tx {
            if let Err(e) = self.enlist_listener(&listener, tx) {
                self.pool.return_listener(listener, false);
                return Err(e);
            }
        }

        match listener.get_connection() {
            Ok(handle) => Ok(handle),
            Err(e) => {
                warn!(
                    pool = %self.pool.name(),
                    listener = %listener.id(),
                    error = %e,
                    "handle allocation failed, destroying listener"
                );
                self.pool.return_listener(listener, true);
                Err(e)
            }
        }
    }

    /// [`allocate_connection`](Self::allocate_connection) on tokio's
    /// blocking pool. The blocking thread carries no transaction, so the
    /// handle is never enlisted automatically.
    pub async fn allocate_connection_async(
        self: &Arc<Self>,
        credential: Credential,
    ) -> Result<ConnectionHandle, PoolError> {
        let manager = self.clone();
        tokio::task::spawn_blocking(move || manager.allocate_connection(&credential))
            .await
            .map_err(|e| {
                PoolError::ResourceFailure(ResourceError::new(format!(
                    "allocation task failed: {e}"
                )))
            })?
    }

    fn tracked_handle(
        &self,
        tx: &dyn Transaction,
        credential: &Credential,
    ) -> Option<Result<ConnectionHandle, PoolError>> {
        let key = (tx.id(), self.pool.key_for(credential));
        let listener = self.tracked.get(&key).map(|entry| entry.value().clone())?;
        match listener.get_connection_in(tx.id()) {
            Some(result) => {
                debug!(
                    tx = %tx.id(),
                    listener = %listener.id(),
                    "reusing transaction-tracked listener"
                );
                Some(result)
            }
            None => {
                self.tracked.remove_if(&key, |_, l| l.id() == listener.id());
                None
            }
        }
    }

    fn get_listener_with_retry(
        &self,
        credential: &Credential,
    ) -> Result<Arc<ConnectionListener>, PoolError> {
        let retries = self.pool.config().allocation_retry;
        let wait = self.pool.config().allocation_retry_wait();
        let mut attempt = 0;
        loop {
            match self.pool.get_listener(credential) {
                Ok(listener) => return Ok(listener),
                Err(e) if e.is_retryable() && attempt < retries => {
                    attempt += 1;
                    warn!(
                        pool = %self.pool.name(),
                        attempt,
                        retries,
                        error = %e,
                        "allocation failed, retrying"
                    );
                    std::thread::sleep(wait);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn enlist_listener(
        &self,
        listener: &Arc<ConnectionListener>,
        tx: &Arc<dyn Transaction>,
    ) -> Result<(), PoolError> {
        let track = self.pool.config().track_by_tx;
        let key = (tx.id(), self.pool.key_for(listener.credential()));

        let hook: Option<CompletionHook> = track.then(|| {
            let tracked = Arc::downgrade(&self.tracked);
            let key = key.clone();
            let listener_id = listener.id();
            Box::new(move |_tx_id: TransactionId| {
                if let Some(tracked) = tracked.upgrade() {
                    tracked.remove_if(&key, |_, l| l.id() == listener_id);
                }
            }) as CompletionHook
        });

        let result = listener.enlist(tx, hook);
        metrics::record_enlistment(self.pool.name(), result.is_ok());
        result?;

        if track {
            self.tracked.insert(key, listener.clone());
        }
        Ok(())
    }

    /// Enlist the listener behind `handle` in the current transaction. Used
    /// for handles obtained before the transaction began.
    pub fn enlist(&self, handle: &ConnectionHandle) -> Result<(), PoolError> {
        let tx = self
            .current_transaction()
            .ok_or_else(|| PoolError::EnlistmentFailure("no transaction in flight".to_string()))?;
        self.enlist_listener(&handle.listener(), &tx)
    }

    /// End the participation of the listener behind `handle` early.
    pub fn delist(&self, handle: &ConnectionHandle, flag: DelistFlag) -> Result<(), PoolError> {
        handle.listener().delist(flag)
    }
}
