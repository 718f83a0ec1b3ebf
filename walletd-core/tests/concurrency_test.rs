//! Concurrent balance mutations against the in-memory store
//!
//! Run with: cargo test -p walletd-core --test concurrency_test

use std::sync::Arc;
use std::time::Duration;

use rust_decimal::Decimal;
use rust_decimal_macros::dec;

use walletd_core::store::memory::FaultPoint;
use walletd_core::{
    BalanceEngine, Job, MemoryWalletStore, MutationPool, OpContext, PoolConfig, RetryPolicy,
    StoreError, WalletError, WalletId, WalletService, WalletStore,
};

fn fast_policy() -> RetryPolicy {
    RetryPolicy {
        base_delay: Duration::from_millis(1),
        ..RetryPolicy::default()
    }
}

fn engine_with(store: &MemoryWalletStore) -> Arc<BalanceEngine> {
    Arc::new(BalanceEngine::new(Arc::new(store.clone()), fast_policy()))
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn hundred_concurrent_deposits_converge() {
    let store = MemoryWalletStore::new();
    // Sprinkle transient failures across the run
    for _ in 0..20 {
        store.inject_fault(FaultPoint::Lock, StoreError::SerializationFailure("40001".into()));
    }
    for _ in 0..5 {
        store.inject_fault(FaultPoint::Commit, StoreError::Deadlock("40P01".into()));
    }
    let engine = engine_with(&store);
    let id = WalletId::new_v4();

    let handles: Vec<_> = (0..100)
        .map(|_| {
            let engine = Arc::clone(&engine);
            tokio::spawn(async move {
                engine
                    .apply_delta(id, dec!(1), &OpContext::background())
                    .await
            })
        })
        .collect();

    for handle in handles {
        handle.await.expect("task panicked").expect("deposit failed");
    }

    let wallet = store.fetch(id).await.unwrap().expect("wallet created");
    assert_eq!(wallet.balance, dec!(100));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn balance_equals_sum_of_successful_deltas() {
    let store = MemoryWalletStore::new();
    let engine = engine_with(&store);
    let id = WalletId::new_v4();
    let ctx = OpContext::background();
    engine.apply_delta(id, dec!(20), &ctx).await.unwrap();

    let handles: Vec<_> = (0..200)
        .map(|i| {
            let engine = Arc::clone(&engine);
            let delta = if i % 3 == 0 { dec!(-7.25) } else { dec!(2.5) };
            tokio::spawn(async move {
                let result = engine
                    .apply_delta(id, delta, &OpContext::background())
                    .await;
                (delta, result)
            })
        })
        .collect();

    let mut expected = dec!(20);
    for handle in handles {
        let (delta, result) = handle.await.expect("task panicked");
        match result {
            Ok(()) => expected += delta,
            Err(WalletError::InsufficientFunds { .. }) => assert!(delta < Decimal::ZERO),
            Err(other) => panic!("unexpected error: {other}"),
        }
    }

    let wallet = store.fetch(id).await.unwrap().unwrap();
    assert_eq!(wallet.balance, expected);
    assert!(wallet.balance >= Decimal::ZERO);
}

#[tokio::test]
async fn deposit_withdraw_scenario() {
    let store = MemoryWalletStore::new();
    let svc = WalletService::new(engine_with(&store));
    let ctx = OpContext::background();
    let id = WalletId::new_v4().to_string();

    svc.deposit(&id, dec!(100.50), &ctx).await.unwrap();
    assert_eq!(svc.get_balance(&id, &ctx).await.unwrap().balance, dec!(100.50));

    svc.withdraw(&id, dec!(50.00), &ctx).await.unwrap();
    assert_eq!(svc.get_balance(&id, &ctx).await.unwrap().balance, dec!(50.50));

    let err = svc.withdraw(&id, dec!(1000000), &ctx).await.unwrap_err();
    assert!(matches!(err, WalletError::InsufficientFunds { .. }));
    assert_eq!(svc.get_balance(&id, &ctx).await.unwrap().balance, dec!(50.50));
}

#[tokio::test]
async fn zero_deposit_keeps_updated_at() {
    let store = MemoryWalletStore::new();
    let svc = WalletService::new(engine_with(&store));
    let ctx = OpContext::background();
    let id = WalletId::new_v4().to_string();

    svc.deposit(&id, dec!(3), &ctx).await.unwrap();
    let before = svc.get_balance(&id, &ctx).await.unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;

    svc.deposit(&id, dec!(0), &ctx).await.unwrap();
    let after = svc.get_balance(&id, &ctx).await.unwrap();
    assert_eq!(before, after);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn pool_attempts_every_accepted_job_once() {
    let store = MemoryWalletStore::new();
    let engine = engine_with(&store);
    let pool = MutationPool::start(
        Arc::clone(&engine),
        PoolConfig {
            workers: 4,
            queue_capacity: 1000,
        },
    )
    .unwrap();

    let wallets: Vec<_> = (0..10).map(|_| WalletId::new_v4()).collect();
    let mut accepted = 0u64;
    for i in 0..500 {
        let id = wallets[i % wallets.len()];
        if pool.submit(Job::new(id, dec!(1), OpContext::background())) {
            accepted += 1;
        }
    }
    pool.shutdown().await;

    let stats = pool.stats();
    assert_eq!(stats.accepted, accepted);
    assert_eq!(stats.succeeded + stats.failed, accepted);
    // No retries were needed, so one transaction per job
    assert_eq!(store.transactions_started(), accepted);

    let mut total = Decimal::ZERO;
    for id in &wallets {
        total += store.fetch(*id).await.unwrap().map(|w| w.balance).unwrap_or_default();
    }
    assert_eq!(total, Decimal::from(stats.succeeded));
}
