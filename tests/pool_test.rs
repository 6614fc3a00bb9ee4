//! Partitioned pool tests: sub-pool selection, maintenance, statistics and
//! shutdown.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use jca_pool::resource::memory::MemoryConnectionFactory;
use jca_pool::{
    Credential, Pool, PoolConfiguration, PoolError, PoolStrategy, RequestInfo, ShutdownResult,
    ShutdownState, Subject,
};

fn pool_with(config: PoolConfiguration) -> (Arc<MemoryConnectionFactory>, Arc<Pool>) {
    let factory = Arc::new(MemoryConnectionFactory::new());
    let pool = Pool::new(config, factory.clone()).expect("pool");
    (factory, pool)
}

fn subject(name: &str) -> Credential {
    Credential::for_subject(Subject::new(name))
}

// ============================================================================
// Construction
// ============================================================================

#[test]
fn test_invalid_configuration_rejected() {
    let factory = Arc::new(MemoryConnectionFactory::new());
    let result = Pool::new(
        PoolConfiguration {
            min_size: 5,
            max_size: 2,
            ..PoolConfiguration::default()
        },
        factory,
    );
    assert!(matches!(result, Err(PoolError::InvalidConfig(_))));
}

#[test]
fn test_new_pool_is_running_and_empty() {
    let (factory, pool) = pool_with(PoolConfiguration::default());
    assert!(pool.is_running());
    assert_eq!(pool.shutdown_state(), ShutdownState::Running);
    assert_eq!(pool.current_size(), 0);
    assert_eq!(factory.created_count(), 0);
}

// ============================================================================
// Partitioning
// ============================================================================

#[test]
fn test_by_subject_partitions_per_principal() {
    let (_factory, pool) = pool_with(PoolConfiguration {
        strategy: PoolStrategy::BySubject,
        ..PoolConfiguration::default()
    });
    let alice = pool.get_listener(&subject("alice")).expect("alice");
    let bob = pool.get_listener(&subject("bob")).expect("bob");
    let alice_with_info = Credential::new(
        Some(Subject::new("alice")),
        Some(RequestInfo::new().with("schema", "sales")),
    );
    let alice_again = pool.get_listener(&alice_with_info).expect("alice again");

    assert_eq!(pool.sub_pool_keys().len(), 2);
    assert!(Arc::ptr_eq(
        &pool.sub_pool(&subject("alice")).expect("sub-pool"),
        &pool.sub_pool(&alice_with_info).expect("sub-pool"),
    ));
    assert_eq!(pool.find_sub_pool(&subject("alice")).expect("alice pool").in_use_count(), 2);

    pool.return_listener(alice, false);
    pool.return_listener(bob, false);
    pool.return_listener(alice_again, false);
    assert_eq!(pool.in_use_count(), 0);
}

#[test]
fn test_subject_and_request_info_partitioning() {
    let (_factory, pool) = pool_with(PoolConfiguration::default());
    let sales = Credential::new(
        Some(Subject::new("alice")),
        Some(RequestInfo::new().with("schema", "sales")),
    );
    let hr = Credential::new(
        Some(Subject::new("alice")),
        Some(RequestInfo::new().with("schema", "hr")),
    );
    pool.get_listener(&sales).expect("sales");
    pool.get_listener(&hr).expect("hr");
    assert_eq!(pool.sub_pool_keys().len(), 2);
}

#[test]
fn test_one_pool_shares_default_key() {
    let (_factory, pool) = pool_with(PoolConfiguration {
        strategy: PoolStrategy::OnePool,
        ..PoolConfiguration::default()
    });
    pool.get_listener(&subject("alice")).expect("alice");
    pool.get_listener(&subject("bob")).expect("bob");

    let keys = pool.sub_pool_keys();
    assert_eq!(keys.len(), 1);
    assert!(keys[0].is_default());
}

#[test]
fn test_lookup_without_creation() {
    let (_factory, pool) = pool_with(PoolConfiguration {
        strategy: PoolStrategy::BySubject,
        ..PoolConfiguration::default()
    });
    assert!(pool.find_sub_pool(&subject("carol")).is_none());
    assert!(pool.sub_pool_statistics(&subject("carol")).is_none());
    pool.sub_pool(&subject("carol")).expect("created");
    assert!(pool.find_sub_pool(&subject("carol")).is_some());
}

#[test]
fn test_prefill_applies_to_new_partitions() {
    let (_factory, pool) = pool_with(PoolConfiguration {
        strategy: PoolStrategy::BySubject,
        min_size: 2,
        prefill: true,
        ..PoolConfiguration::default()
    });
    let sub = pool.sub_pool(&subject("dave")).expect("sub-pool");
    assert_eq!(sub.current_size(), 2);
}

// ============================================================================
// Maintenance
// ============================================================================

#[test]
fn test_maintenance_shrinks_and_reaps_unused_partitions() {
    let (factory, pool) = pool_with(PoolConfiguration {
        strategy: PoolStrategy::BySubject,
        idle_timeout_ms: 40,
        ..PoolConfiguration::default()
    });
    let listener = pool.get_listener(&subject("erin")).expect("listener");
    pool.return_listener(listener, false);
    assert_eq!(pool.sub_pool_keys().len(), 1);

    let mut reaped = false;
    for _ in 0..100 {
        thread::sleep(Duration::from_millis(20));
        if pool.sub_pool_keys().is_empty() {
            reaped = true;
            break;
        }
    }
    assert!(reaped, "idle partition was not reaped");
    assert!(factory.connection(0).expect("physical").is_destroyed());
}

#[test]
fn test_run_maintenance_respects_validation_interval() {
    let (factory, pool) = pool_with(PoolConfiguration {
        initial_size: Some(2),
        prefill: true,
        background_validation: true,
        background_validation_ms: 60_000,
        ..PoolConfiguration::default()
    });
    factory.connection(0).expect("physical").set_valid(false);

    // nothing is older than the validation interval yet
    pool.run_maintenance();
    assert!(!factory.connection(0).expect("physical").is_destroyed());

    pool.flush(jca_pool::FlushStrategy::InvalidIdleConnections);
    assert!(factory.connection(0).expect("physical").is_destroyed());
    assert_eq!(pool.current_size(), 1);
}

// ============================================================================
// Statistics
// ============================================================================

#[test]
fn test_statistics_aggregate_partitions() {
    let (_factory, pool) = pool_with(PoolConfiguration {
        strategy: PoolStrategy::BySubject,
        name: "orders".to_string(),
        ..PoolConfiguration::default()
    });
    let a = pool.get_listener(&subject("alice")).expect("a");
    let _b = pool.get_listener(&subject("bob")).expect("b");
    pool.return_listener(a, false);

    let stats = pool.statistics();
    assert_eq!(stats.name, "orders");
    assert!(stats.running);
    assert_eq!(stats.sub_pools, 2);
    assert_eq!(stats.created, 2);
    assert_eq!(stats.in_use, 1);
    assert_eq!(stats.idle, 1);

    let json = serde_json::to_value(&stats).expect("json");
    assert_eq!(json["sub_pools"], 2);
    assert_eq!(json["details"].as_array().map(Vec::len), Some(2));
}

// ============================================================================
// Shutdown
// ============================================================================

#[test]
fn test_shutdown_waits_for_returns() {
    let (factory, pool) = pool_with(PoolConfiguration::default());
    let handle = pool
        .get_listener(&Credential::anonymous())
        .and_then(|l| l.get_connection())
        .expect("handle");

    let closer = thread::spawn(move || {
        thread::sleep(Duration::from_millis(50));
        handle.close().expect("close");
    });
    let result = pool.shutdown(Duration::from_secs(5));
    closer.join().expect("closer");

    assert_eq!(result, ShutdownResult::Complete);
    assert_eq!(pool.shutdown_state(), ShutdownState::Stopped);
    assert!(factory.connection(0).expect("physical").is_destroyed());
    assert!(matches!(
        pool.get_listener(&Credential::anonymous()),
        Err(PoolError::Shutdown(_))
    ));
}

#[test]
fn test_shutdown_timeout_reports_outstanding() {
    let (factory, pool) = pool_with(PoolConfiguration::default());
    let listener = pool.get_listener(&Credential::anonymous()).expect("listener");

    let result = pool.shutdown(Duration::from_millis(50));
    assert_eq!(result, ShutdownResult::Timeout { remaining: 1 });

    pool.return_listener(listener, false);
    assert!(factory.connection(0).expect("physical").is_destroyed());
}

#[test]
fn test_shutdown_wakes_blocked_callers() {
    let (_factory, pool) = pool_with(PoolConfiguration {
        max_size: 1,
        ..PoolConfiguration::default()
    });
    let _held = pool.get_listener(&Credential::anonymous()).expect("held");
    let waiter = {
        let pool = pool.clone();
        thread::spawn(move || pool.get_listener(&Credential::anonymous()))
    };
    thread::sleep(Duration::from_millis(50));

    pool.shutdown(Duration::from_millis(50));
    let result = waiter.join().expect("waiter");
    assert!(matches!(result, Err(PoolError::Shutdown(_))));
}

#[test]
fn test_repeated_shutdown_is_harmless() {
    let (_factory, pool) = pool_with(PoolConfiguration::default());
    assert_eq!(pool.shutdown(Duration::from_millis(100)), ShutdownResult::Complete);
    assert_eq!(pool.shutdown(Duration::from_millis(100)), ShutdownResult::Complete);
}

#[test]
fn test_dropping_pool_destroys_idle_connections() {
    let (factory, pool) = pool_with(PoolConfiguration {
        initial_size: Some(2),
        prefill: true,
        ..PoolConfiguration::default()
    });
    drop(pool);
    assert_eq!(factory.live_count(), 0);
}

#[tokio::test]
async fn test_async_shutdown() {
    let (_factory, pool) = pool_with(PoolConfiguration::default());
    let listener = pool.get_listener(&Credential::anonymous()).expect("listener");
    pool.return_listener(listener, false);

    let result = pool.shutdown_async(Duration::from_secs(1)).await;
    assert_eq!(result, ShutdownResult::Complete);
    assert!(!pool.is_running());
}
