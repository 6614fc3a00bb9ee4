//! Pool throughput benchmarks.
//!
//! Measures checkout/return cost on a warm pool, single-threaded and under
//! contention, plus transactional allocation through the manager.

use std::sync::Arc;
use std::thread;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};

use jca_pool::resource::memory::MemoryConnectionFactory;
use jca_pool::tx::InMemoryTransactionManager;
use jca_pool::{
    Capability, ConnectionManager, Credential, Pool, PoolConfiguration, PoolStrategy, Subject,
};

fn warm_pool(max_size: usize, strategy: PoolStrategy, capability: Capability) -> Arc<Pool> {
    let config = PoolConfiguration {
        max_size,
        initial_size: Some(max_size),
        prefill: true,
        strategy,
        ..PoolConfiguration::default()
    };
    Pool::new(config, Arc::new(MemoryConnectionFactory::with_capability(capability)))
        .expect("pool")
}

fn bench_checkout_return(c: &mut Criterion) {
    let mut group = c.benchmark_group("checkout_return");
    group.throughput(Throughput::Elements(1));

    let pool = warm_pool(16, PoolStrategy::OnePool, Capability::Basic);
    let cred = Credential::anonymous();
    group.bench_function("listener", |b| {
        b.iter(|| {
            let listener = pool.get_listener(black_box(&cred)).expect("listener");
            pool.return_listener(listener, false);
        })
    });

    let manager = ConnectionManager::new(pool.clone());
    group.bench_function("handle", |b| {
        b.iter(|| {
            let handle = manager.allocate_connection(black_box(&cred)).expect("handle");
            handle.close().expect("close");
        })
    });

    group.finish();
}

fn bench_contended(c: &mut Criterion) {
    let mut group = c.benchmark_group("contended_checkout");
    const OPS_PER_THREAD: usize = 200;

    for threads in [2usize, 4, 8] {
        let pool = warm_pool(4, PoolStrategy::OnePool, Capability::Basic);
        group.throughput(Throughput::Elements((threads * OPS_PER_THREAD) as u64));
        group.bench_with_input(BenchmarkId::new("threads", threads), &threads, |b, &threads| {
            b.iter(|| {
                let workers: Vec<_> = (0..threads)
                    .map(|_| {
                        let pool = pool.clone();
                        thread::spawn(move || {
                            let cred = Credential::anonymous();
                            for _ in 0..OPS_PER_THREAD {
                                let listener = pool.get_listener(&cred).expect("listener");
                                pool.return_listener(listener, false);
                            }
                        })
                    })
                    .collect();
                for worker in workers {
                    worker.join().expect("worker");
                }
            })
        });
    }

    group.finish();
}

fn bench_partitioned(c: &mut Criterion) {
    let mut group = c.benchmark_group("partitioned_lookup");
    group.throughput(Throughput::Elements(1));

    let pool = warm_pool(4, PoolStrategy::BySubject, Capability::Basic);
    let credentials: Vec<Credential> = (0..32)
        .map(|i| Credential::for_subject(Subject::new(format!("user-{i}"))))
        .collect();
    let mut next = 0;
    group.bench_function("by_subject", |b| {
        b.iter(|| {
            let cred = &credentials[next % credentials.len()];
            next += 1;
            let listener = pool.get_listener(cred).expect("listener");
            pool.return_listener(listener, false);
        })
    });

    group.finish();
}

fn bench_transactional(c: &mut Criterion) {
    let mut group = c.benchmark_group("transactional_allocation");
    group.throughput(Throughput::Elements(1));

    let pool = warm_pool(8, PoolStrategy::OnePool, Capability::LocalTransaction);
    let tm = Arc::new(InMemoryTransactionManager::new());
    let manager = ConnectionManager::with_transaction_manager(pool, tm.clone());
    let cred = Credential::anonymous();

    group.bench_function("begin_allocate_commit", |b| {
        b.iter(|| {
            tm.begin().expect("begin");
            let handle = manager.allocate_connection(&cred).expect("handle");
            handle.close().expect("close");
            tm.commit().expect("commit");
        })
    });

    group.finish();
}

criterion_group!(
    benches,
    bench_checkout_return,
    bench_contended,
    bench_partitioned,
    bench_transactional
);
criterion_main!(benches);
