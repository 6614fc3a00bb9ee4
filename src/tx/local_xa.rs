//! XA facade over a physical connection that only supports local
//! transactions. There is no prepare phase; commit maps straight onto the
//! local commit whatever the one-phase hint says.

use std::sync::{Arc, Weak};

use tracing::debug;

use super::{DelistFlag, TransactionError, TransactionId, XaResource};
use crate::error::ResourceError;
use crate::pool::ConnectionListener;
use crate::resource::LocalTransaction;

pub struct LocalXaResource {
    listener: Weak<ConnectionListener>,
}

impl LocalXaResource {
    pub fn new(listener: Weak<ConnectionListener>) -> Self {
        Self { listener }
    }

    fn with_local(
        &self,
        op: impl FnOnce(&dyn LocalTransaction) -> Result<(), ResourceError>,
    ) -> Result<(), TransactionError> {
        let listener = self
            .listener
            .upgrade()
            .ok_or_else(|| TransactionError::Resource("connection listener is gone".to_string()))?;
        let local = listener.connection().local_transaction().ok_or_else(|| {
            TransactionError::Resource("physical connection has no local transaction".to_string())
        })?;
        op(local).map_err(|e| TransactionError::Resource(e.to_string()))
    }

    fn owner(&self) -> Option<Arc<ConnectionListener>> {
        self.listener.upgrade()
    }
}

impl XaResource for LocalXaResource {
    fn start(&self, xid: &TransactionId) -> Result<(), TransactionError> {
        if let Some(listener) = self.owner() {
            debug!(
                tx = %xid,
                listener = %listener.id(),
                "beginning local transaction for XA start"
            );
        }
        self.with_local(|local| local.begin())
    }

    fn end(&self, _xid: &TransactionId, _flag: DelistFlag) -> Result<(), TransactionError> {
        Ok(())
    }

    fn commit(&self, _xid: &TransactionId, _one_phase: bool) -> Result<(), TransactionError> {
        self.with_local(|local| local.commit())
    }

    fn rollback(&self, _xid: &TransactionId) -> Result<(), TransactionError> {
        self.with_local(|local| local.rollback())
    }

    fn set_transaction_timeout(&self, _seconds: u32) -> Result<bool, TransactionError> {
        Ok(false)
    }

    fn transaction_timeout(&self) -> u32 {
        0
    }
}
