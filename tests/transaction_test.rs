//! Transactional enlistment tests through the connection manager and the
//! in-memory transaction manager.

use std::sync::Arc;

use jca_pool::pool::{ConnectionListener, ListenerState};
use jca_pool::resource::memory::MemoryConnectionFactory;
use jca_pool::tx::{DelistFlag, InMemoryTransactionManager, TransactionError};
use jca_pool::{
    Capability, ConnectionHandle, ConnectionManager, Credential, Pool, PoolConfiguration, PoolError,
};

struct Fixture {
    factory: Arc<MemoryConnectionFactory>,
    pool: Arc<Pool>,
    tm: Arc<InMemoryTransactionManager>,
    manager: ConnectionManager,
}

fn fixture(config: PoolConfiguration, capability: Capability) -> Fixture {
    let factory = Arc::new(MemoryConnectionFactory::with_capability(capability));
    let pool = Pool::new(config, factory.clone()).expect("pool");
    let tm = Arc::new(InMemoryTransactionManager::new());
    let manager = ConnectionManager::with_transaction_manager(pool.clone(), tm.clone());
    Fixture {
        factory,
        pool,
        tm,
        manager,
    }
}

fn listener_of(pool: &Pool, handle: &ConnectionHandle) -> Arc<ConnectionListener> {
    pool.sub_pool(&Credential::anonymous())
        .expect("sub-pool")
        .listeners()
        .into_iter()
        .find(|l| l.id() == handle.listener_id())
        .expect("listener backing handle")
}

// ============================================================================
// Return on completion
// ============================================================================

#[test]
fn test_close_inside_transaction_defers_return_until_commit() {
    let f = fixture(PoolConfiguration::default(), Capability::LocalTransaction);
    let cred = Credential::anonymous();
    let tx = f.tm.begin().expect("begin");

    let handle = f.manager.allocate_connection(&cred).expect("handle");
    let listener = listener_of(&f.pool, &handle);
    assert!(listener.is_enlisted());
    assert_eq!(listener.enlisted_transaction(), Some(jca_pool::tx::Transaction::id(tx.as_ref())));

    handle.close().expect("close");
    assert_eq!(listener.state(), ListenerState::InUse);
    assert!(listener.is_enlisted());
    assert_eq!(f.pool.in_use_count(), 1);

    f.tm.commit().expect("commit");

    assert_eq!(listener.state(), ListenerState::Free);
    assert!(!listener.is_enlisted());
    assert_eq!(f.pool.in_use_count(), 0);
    let physical = f.factory.connection(0).expect("physical");
    assert_eq!(physical.local_begins(), 1);
    assert_eq!(physical.local_commits(), 1);
    assert!(!physical.local_transaction_active());
}

#[test]
fn test_rollback_returns_listener() {
    let f = fixture(PoolConfiguration::default(), Capability::LocalTransaction);
    f.tm.begin().expect("begin");
    let handle = f.manager.allocate_connection(&Credential::anonymous()).expect("handle");
    let listener = listener_of(&f.pool, &handle);
    handle.close().expect("close");

    f.tm.rollback().expect("rollback");

    assert_eq!(listener.state(), ListenerState::Free);
    assert_eq!(f.factory.connection(0).expect("physical").local_rollbacks(), 1);
}

#[test]
fn test_open_handle_outlives_transaction() {
    let f = fixture(PoolConfiguration::default(), Capability::LocalTransaction);
    f.tm.begin().expect("begin");
    let handle = f.manager.allocate_connection(&Credential::anonymous()).expect("handle");
    let listener = listener_of(&f.pool, &handle);

    f.tm.commit().expect("commit");
    assert!(!listener.is_enlisted());
    assert_eq!(listener.state(), ListenerState::InUse);

    handle.close().expect("close");
    assert_eq!(listener.state(), ListenerState::Free);
}

#[test]
fn test_xa_resource_sees_full_protocol() {
    let f = fixture(PoolConfiguration::default(), Capability::Xa);
    f.tm.begin().expect("begin");
    let handle = f.manager.allocate_connection(&Credential::anonymous()).expect("handle");
    handle.close().expect("close");
    f.tm.commit().expect("commit");

    let xa = f.factory.connection(0).expect("physical").xa().expect("xa");
    assert_eq!(xa.operations(), vec!["start", "end:success", "commit"]);
}

#[test]
fn test_rollback_only_transaction_rolls_back() {
    let f = fixture(PoolConfiguration::default(), Capability::Xa);
    f.tm.begin().expect("begin");
    let handle = f.manager.allocate_connection(&Credential::anonymous()).expect("handle");
    let listener = listener_of(&f.pool, &handle);
    handle.close().expect("close");
    f.tm.set_rollback_only().expect("mark");

    let result = f.tm.commit();
    assert!(matches!(result, Err(TransactionError::RolledBack(_))));

    let xa = f.factory.connection(0).expect("physical").xa().expect("xa");
    assert_eq!(xa.operations(), vec!["start", "end:fail", "rollback"]);
    assert_eq!(listener.state(), ListenerState::Free);
}

#[test]
fn test_early_delist_with_fail_marks_rollback() {
    let f = fixture(PoolConfiguration::default(), Capability::Xa);
    f.tm.begin().expect("begin");
    let handle = f.manager.allocate_connection(&Credential::anonymous()).expect("handle");
    f.manager.delist(&handle, DelistFlag::Fail).expect("delist");
    handle.close().expect("close");

    assert!(matches!(f.tm.commit(), Err(TransactionError::RolledBack(_))));
    let xa = f.factory.connection(0).expect("physical").xa().expect("xa");
    assert_eq!(xa.operations(), vec!["start", "end:fail", "rollback"]);
}

// ============================================================================
// Track by transaction
// ============================================================================

#[test]
fn test_track_by_tx_shares_listener() {
    let f = fixture(PoolConfiguration::default(), Capability::LocalTransaction);
    let cred = Credential::anonymous();
    f.tm.begin().expect("begin");

    let h1 = f.manager.allocate_connection(&cred).expect("h1");
    let h2 = f.manager.allocate_connection(&cred).expect("h2");
    assert_eq!(h1.listener_id(), h2.listener_id());
    assert_eq!(f.manager.tracked_count(), 1);
    assert_eq!(f.factory.created_count(), 1);

    h1.close().expect("close h1");
    h2.close().expect("close h2");
    f.tm.commit().expect("commit");

    assert_eq!(f.manager.tracked_count(), 0);
    assert_eq!(f.pool.in_use_count(), 0);

    // the next transaction starts from a free listener again
    f.tm.begin().expect("begin");
    let h3 = f.manager.allocate_connection(&cred).expect("h3");
    assert_eq!(h3.listener_id(), h1.listener_id());
    h3.close().expect("close h3");
    f.tm.commit().expect("commit");
}

#[test]
fn test_without_tracking_each_allocation_gets_own_listener() {
    let f = fixture(
        PoolConfiguration {
            track_by_tx: false,
            ..PoolConfiguration::default()
        },
        Capability::LocalTransaction,
    );
    let cred = Credential::anonymous();
    let tx = f.tm.begin().expect("begin");

    let h1 = f.manager.allocate_connection(&cred).expect("h1");
    let h2 = f.manager.allocate_connection(&cred).expect("h2");
    assert_ne!(h1.listener_id(), h2.listener_id());
    assert_eq!(f.manager.tracked_count(), 0);
    assert_eq!(tx.resource_count(), 2);

    drop(h1);
    drop(h2);
    f.tm.commit().expect("commit");
    assert_eq!(f.pool.in_use_count(), 0);
    for physical in f.factory.connections() {
        assert_eq!(physical.local_commits(), 1);
    }
}

#[test]
fn test_allocation_outside_transaction_not_enlisted() {
    let f = fixture(PoolConfiguration::default(), Capability::LocalTransaction);
    let handle = f.manager.allocate_connection(&Credential::anonymous()).expect("handle");
    let listener = listener_of(&f.pool, &handle);
    assert!(!listener.is_enlisted());
    handle.close().expect("close");
    assert_eq!(listener.state(), ListenerState::Free);
}

// ============================================================================
// Lazy enlistment and failures
// ============================================================================

#[test]
fn test_lazy_enlist_of_existing_handle() {
    let f = fixture(PoolConfiguration::default(), Capability::LocalTransaction);
    let handle = f.manager.allocate_connection(&Credential::anonymous()).expect("handle");
    let listener = listener_of(&f.pool, &handle);

    f.tm.begin().expect("begin");
    f.manager.enlist(&handle).expect("enlist");
    f.manager.enlist(&handle).expect("second enlist is a no-op");
    assert!(listener.is_enlisted());

    handle.close().expect("close");
    assert_eq!(listener.state(), ListenerState::InUse);
    f.tm.commit().expect("commit");
    assert_eq!(listener.state(), ListenerState::Free);
}

#[test]
fn test_enlist_without_transaction_fails() {
    let f = fixture(PoolConfiguration::default(), Capability::LocalTransaction);
    let handle = f.manager.allocate_connection(&Credential::anonymous()).expect("handle");
    assert!(matches!(
        f.manager.enlist(&handle),
        Err(PoolError::EnlistmentFailure(_))
    ));
}

#[test]
fn test_enlistment_failure_returns_listener_unharmed() {
    let f = fixture(PoolConfiguration::default(), Capability::Xa);
    let cred = Credential::anonymous();
    f.manager.allocate_connection(&cred).expect("warm-up").close().expect("close");
    f.factory
        .connection(0)
        .expect("physical")
        .xa()
        .expect("xa")
        .set_fail_start(true);

    f.tm.begin().expect("begin");
    let err = f.manager.allocate_connection(&cred).unwrap_err();
    assert!(matches!(err, PoolError::EnlistmentFailure(_)));

    let sub = f.pool.sub_pool(&cred).expect("sub-pool");
    assert_eq!(sub.in_use_count(), 0);
    assert_eq!(sub.idle_count(), 1);
    assert_eq!(sub.destroyed_count(), 0);
    assert_eq!(f.manager.tracked_count(), 0);
    f.tm.rollback().expect("rollback");
}

#[test]
fn test_basic_connection_cannot_enlist() {
    let f = fixture(PoolConfiguration::default(), Capability::Basic);
    f.tm.begin().expect("begin");
    let err = f.manager.allocate_connection(&Credential::anonymous()).unwrap_err();
    assert!(matches!(err, PoolError::EnlistmentFailure(_)));
    assert_eq!(f.pool.in_use_count(), 0);
    f.tm.rollback().expect("rollback");
}

#[test]
fn test_suspended_transaction_not_used_for_allocation() {
    let f = fixture(PoolConfiguration::default(), Capability::LocalTransaction);
    f.tm.begin().expect("begin");
    let suspended = f.tm.suspend().expect("suspend");

    let handle = f.manager.allocate_connection(&Credential::anonymous()).expect("handle");
    assert!(!listener_of(&f.pool, &handle).is_enlisted());
    handle.close().expect("close");

    f.tm.resume(suspended).expect("resume");
    f.tm.commit().expect("commit");
}
