//! Queued mutation pool
//!
//! A fixed set of workers drains one bounded queue and hands each job to the
//! `BalanceEngine`. Submission never blocks: a full queue is reported back as
//! `false` so the caller can decide what to do. Job errors are logged and
//! counted, never returned to the submitter.
//!
//! State machine: `Running` -> `Draining` (queue closed, backlog finishing)
//! -> `Stopped` (all workers exited).

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use rust_decimal::Decimal;
use serde::Serialize;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tracing::{Instrument, Span};

use crate::config::ConfigError;
use crate::context::OpContext;
use crate::domain::WalletId;
use crate::engine::BalanceEngine;

/// Default number of workers
pub const DEFAULT_WORKERS: usize = 4;

/// Default queue capacity
pub const DEFAULT_QUEUE_CAPACITY: usize = 100;

/// Pool sizing
#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub workers: usize,
    pub queue_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            workers: DEFAULT_WORKERS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
        }
    }
}

impl PoolConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        if self.queue_capacity == 0 {
            return Err(ConfigError::invalid("queue_capacity", "must be at least 1"));
        }
        Ok(())
    }
}

/// One deferred balance mutation
#[derive(Debug, Clone)]
pub struct Job {
    pub wallet_id: WalletId,
    pub delta: Decimal,
    pub ctx: OpContext,
}

impl Job {
    pub fn new(wallet_id: WalletId, delta: Decimal, ctx: OpContext) -> Self {
        Self {
            wallet_id,
            delta,
            ctx,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolState {
    Running,
    Draining,
    Stopped,
}

impl PoolState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Running,
            1 => Self::Draining,
            _ => Self::Stopped,
        }
    }
}

#[derive(Default)]
struct Counters {
    accepted: AtomicU64,
    rejected: AtomicU64,
    succeeded: AtomicU64,
    failed: AtomicU64,
}

/// Point-in-time pool counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub state: PoolState,
    pub accepted: u64,
    pub rejected: u64,
    pub succeeded: u64,
    pub failed: u64,
}

/// Fixed-size worker pool in front of the engine
pub struct MutationPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    /// Held for the whole drain so concurrent `shutdown` calls wait for it
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
    state: AtomicU8,
    counters: Arc<Counters>,
    span: Span,
}

impl MutationPool {
    /// Spawn the workers. Must be called inside a tokio runtime.
    pub fn start(engine: Arc<BalanceEngine>, config: PoolConfig) -> Result<Self, ConfigError> {
        Self::start_with_span(engine, config, tracing::info_span!("mutation_pool"))
    }

    pub fn start_with_span(
        engine: Arc<BalanceEngine>,
        config: PoolConfig,
        span: Span,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let (sender, receiver) = mpsc::channel(config.queue_capacity);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let counters = Arc::new(Counters::default());

        let workers = (0..config.workers)
            .map(|worker_id| {
                let worker_span = tracing::info_span!(parent: &span, "worker", worker_id);
                tokio::spawn(
                    run_worker(
                        Arc::clone(&engine),
                        Arc::clone(&receiver),
                        Arc::clone(&counters),
                    )
                    .instrument(worker_span),
                )
            })
            .collect();

        tracing::info!(
            parent: &span,
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            "Mutation pool started"
        );

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            workers: tokio::sync::Mutex::new(workers),
            state: AtomicU8::new(PoolState::Running as u8),
            counters,
            span,
        })
    }

    /// Enqueue without blocking.
    ///
    /// Returns `false` when the queue is full or the pool is shutting down;
    /// the job is dropped in that case.
    pub fn submit(&self, job: Job) -> bool {
        let sender = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(sender) = sender.as_ref() else {
            self.counters.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        };

        match sender.try_send(job) {
            Ok(()) => {
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                true
            }
            Err(TrySendError::Full(job)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(parent: &self.span, wallet_id = %job.wallet_id, "Job queue full, rejecting");
                false
            }
            Err(TrySendError::Closed(_)) => {
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    /// Close the queue and wait until every accepted job has been processed.
    ///
    /// Every caller returns only after the drain completed; calls after that
    /// are no-ops.
    pub async fn shutdown(&self) {
        let mut workers = self.workers.lock().await;
        let sender = self
            .sender
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if sender.is_none() {
            return;
        }

        self.state.store(PoolState::Draining as u8, Ordering::Release);
        tracing::info!(parent: &self.span, "Mutation pool draining");
        // Dropping the last sender closes the queue once it is empty
        drop(sender);

        for handle in workers.drain(..) {
            if let Err(err) = handle.await {
                tracing::error!(parent: &self.span, error = %err, "Worker terminated abnormally");
            }
        }

        self.state.store(PoolState::Stopped as u8, Ordering::Release);
        tracing::info!(parent: &self.span, "Mutation pool stopped");
    }

    pub fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            state: self.state(),
            accepted: self.counters.accepted.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            succeeded: self.counters.succeeded.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

async fn run_worker(
    engine: Arc<BalanceEngine>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    counters: Arc<Counters>,
) {
    loop {
        // Hold the receiver lock only while waiting for the next job
        let next = receiver.lock().await.recv().await;
        let Some(job) = next else {
            break;
        };

        match engine.apply_delta(job.wallet_id, job.delta, &job.ctx).await {
            Ok(()) => {
                counters.succeeded.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(wallet_id = %job.wallet_id, delta = %job.delta, "Job applied");
            }
            Err(err) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                tracing::error!(
                    wallet_id = %job.wallet_id,
                    delta = %job.delta,
                    kind = err.kind(),
                    error = %err,
                    "Failed to apply balance update"
                );
            }
        }
    }
    tracing::debug!("Worker exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RetryPolicy;
    use crate::store::{MemoryWalletStore, WalletStore};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn engine_with(store: &MemoryWalletStore) -> Arc<BalanceEngine> {
        Arc::new(BalanceEngine::new(
            Arc::new(store.clone()),
            RetryPolicy::default(),
        ))
    }

    #[test]
    fn zero_sized_config_is_rejected() {
        let workers = PoolConfig {
            workers: 0,
            ..PoolConfig::default()
        };
        assert!(workers.validate().is_err());

        let capacity = PoolConfig {
            queue_capacity: 0,
            ..PoolConfig::default()
        };
        assert!(capacity.validate().is_err());
    }

    #[tokio::test]
    async fn processes_jobs_and_drains_on_shutdown() {
        let store = MemoryWalletStore::new();
        let pool = MutationPool::start(
            engine_with(&store),
            PoolConfig {
                workers: 3,
                queue_capacity: 64,
            },
        )
        .unwrap();
        let id = WalletId::new_v4();

        for _ in 0..50 {
            assert!(pool.submit(Job::new(id, dec!(2), OpContext::background())));
        }
        pool.shutdown().await;

        let stats = pool.stats();
        assert_eq!(stats.state, PoolState::Stopped);
        assert_eq!(stats.accepted, 50);
        assert_eq!(stats.succeeded, 50);
        assert_eq!(stats.failed, 0);
        assert_eq!(store.fetch(id).await.unwrap().unwrap().balance, dec!(100));
    }

    #[tokio::test]
    async fn full_queue_rejects_without_blocking() {
        let store = MemoryWalletStore::new();
        let engine = engine_with(&store);
        let id = WalletId::new_v4();
        engine
            .apply_delta(id, dec!(1), &OpContext::background())
            .await
            .unwrap();

        // Park the only worker on the row lock so the queue cannot drain
        let mut blocker = store
            .begin(crate::config::IsolationLevel::ReadCommitted)
            .await
            .unwrap();
        blocker.lock_for_update(id).await.unwrap();

        let pool = MutationPool::start(
            engine,
            PoolConfig {
                workers: 1,
                queue_capacity: 2,
            },
        )
        .unwrap();

        assert!(pool.submit(Job::new(id, dec!(1), OpContext::background())));
        // Let the worker take the first job and block on the lock
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(pool.submit(Job::new(id, dec!(1), OpContext::background())));
        assert!(pool.submit(Job::new(id, dec!(1), OpContext::background())));
        assert!(!pool.submit(Job::new(id, dec!(1), OpContext::background())));

        let stats = pool.stats();
        assert_eq!(stats.accepted, 3);
        assert_eq!(stats.rejected, 1);

        blocker.rollback().await.unwrap();
        pool.shutdown().await;
        assert_eq!(store.fetch(id).await.unwrap().unwrap().balance, dec!(4));
    }

    #[tokio::test]
    async fn submit_after_shutdown_is_rejected() {
        let store = MemoryWalletStore::new();
        let pool = MutationPool::start(engine_with(&store), PoolConfig::default()).unwrap();
        pool.shutdown().await;

        assert!(!pool.submit(Job::new(
            WalletId::new_v4(),
            dec!(1),
            OpContext::background()
        )));
        assert_eq!(pool.state(), PoolState::Stopped);
        assert_eq!(store.transactions_started(), 0);
    }

    #[tokio::test]
    async fn shutdown_twice_is_harmless() {
        let store = MemoryWalletStore::new();
        let pool = MutationPool::start(engine_with(&store), PoolConfig::default()).unwrap();
        pool.shutdown().await;
        pool.shutdown().await;
        assert_eq!(pool.state(), PoolState::Stopped);
    }

    #[tokio::test]
    async fn concurrent_shutdown_waits_for_the_drain() {
        let store = MemoryWalletStore::new();
        let engine = engine_with(&store);
        let id = WalletId::new_v4();
        engine
            .apply_delta(id, dec!(1), &OpContext::background())
            .await
            .unwrap();

        // Keep the backlog busy until the blocker lets go
        let mut blocker = store
            .begin(crate::config::IsolationLevel::ReadCommitted)
            .await
            .unwrap();
        blocker.lock_for_update(id).await.unwrap();

        let pool = Arc::new(MutationPool::start(engine, PoolConfig::default()).unwrap());
        assert!(pool.submit(Job::new(id, dec!(1), OpContext::background())));

        let first = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.shutdown().await }
        });
        while pool.state() != PoolState::Draining {
            tokio::task::yield_now().await;
        }

        let second = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move {
                pool.shutdown().await;
                pool.state()
            }
        });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!second.is_finished(), "second shutdown returned mid-drain");

        blocker.rollback().await.unwrap();
        assert_eq!(second.await.unwrap(), PoolState::Stopped);
        first.await.unwrap();
        assert_eq!(store.fetch(id).await.unwrap().unwrap().balance, dec!(2));
    }

    #[tokio::test]
    async fn failing_jobs_do_not_stop_the_worker() {
        let store = MemoryWalletStore::new();
        let pool = MutationPool::start(
            engine_with(&store),
            PoolConfig {
                workers: 1,
                queue_capacity: 8,
            },
        )
        .unwrap();
        let id = WalletId::new_v4();

        assert!(pool.submit(Job::new(id, dec!(-5), OpContext::background())));
        assert!(pool.submit(Job::new(id, dec!(5), OpContext::background())));
        pool.shutdown().await;

        let stats = pool.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.succeeded, 1);
        assert_eq!(store.fetch(id).await.unwrap().unwrap().balance, dec!(5));
    }
}
