//! In-memory wallet store
//!
//! Committed rows live in a map read without locking. Each wallet id also
//! has an async mutex standing in for the row lock: `lock_for_update` holds it
//! until commit or rollback, and staged writes only become visible on commit.
//! Faults can be queued to make the next lock, commit or rollback fail.
//!
//! A row lock entry is dropped again once no transaction holds or waits for
//! it, so the lock table only tracks wallets currently in use.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use tokio::sync::OwnedMutexGuard;

use super::{TxBox, WalletStore, WalletTx};
use crate::config::IsolationLevel;
use crate::domain::{Wallet, WalletId};
use crate::error::StoreError;

/// Where an injected fault fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Lock,
    Commit,
    Rollback,
}

#[derive(Default)]
struct Inner {
    committed: Mutex<HashMap<WalletId, Wallet>>,
    row_locks: Mutex<HashMap<WalletId, Arc<tokio::sync::Mutex<()>>>>,
    faults: Mutex<HashMap<FaultPoint, VecDeque<StoreError>>>,
    transactions: AtomicU64,
    commits: AtomicU64,
}

fn guard<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Inner {
    fn row_lock(&self, id: WalletId) -> Arc<tokio::sync::Mutex<()>> {
        guard(&self.row_locks).entry(id).or_default().clone()
    }

    /// Drop the lock entry for `id` if nobody holds or awaits it.
    ///
    /// Waiters clone the `Arc` under the map lock, so a count of one here
    /// means the map owns the only reference.
    fn forget_idle_lock(&self, id: WalletId) {
        let mut locks = guard(&self.row_locks);
        if locks.get(&id).is_some_and(|lock| Arc::strong_count(lock) == 1) {
            locks.remove(&id);
        }
    }

    fn take_fault(&self, point: FaultPoint) -> Option<StoreError> {
        guard(&self.faults).get_mut(&point)?.pop_front()
    }
}

/// A thread-safe in-memory wallet store.
///
/// `Clone` shares the underlying state.
#[derive(Clone, Default)]
pub struct MemoryWalletStore {
    inner: Arc<Inner>,
}

impl MemoryWalletStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next call at `point` fail with `err`. Faults queue up in order.
    pub fn inject_fault(&self, point: FaultPoint, err: StoreError) {
        guard(&self.inner.faults)
            .entry(point)
            .or_default()
            .push_back(err);
    }

    /// Number of transactions begun so far
    pub fn transactions_started(&self) -> u64 {
        self.inner.transactions.load(Ordering::Relaxed)
    }

    /// Number of successful commits so far
    pub fn commits(&self) -> u64 {
        self.inner.commits.load(Ordering::Relaxed)
    }

    pub fn wallet_count(&self) -> usize {
        guard(&self.inner.committed).len()
    }
}

#[async_trait]
impl WalletStore for MemoryWalletStore {
    async fn begin(&self, _isolation: IsolationLevel) -> Result<TxBox, StoreError> {
        self.inner.transactions.fetch_add(1, Ordering::Relaxed);
        Ok(Box::new(MemoryWalletTx {
            inner: Arc::clone(&self.inner),
            held: None,
            staged: None,
            finished: false,
        }))
    }

    async fn fetch(&self, id: WalletId) -> Result<Option<Wallet>, StoreError> {
        Ok(guard(&self.inner.committed).get(&id).cloned())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

struct MemoryWalletTx {
    inner: Arc<Inner>,
    held: Option<(WalletId, OwnedMutexGuard<()>)>,
    staged: Option<Wallet>,
    finished: bool,
}

impl MemoryWalletTx {
    fn ensure_open(&self) -> Result<(), StoreError> {
        if self.finished {
            Err(StoreError::TransactionFinished)
        } else {
            Ok(())
        }
    }

    fn ensure_locked(&self, id: WalletId) -> Result<(), StoreError> {
        self.ensure_open()?;
        match &self.held {
            Some((locked, _)) if *locked == id => Ok(()),
            _ => Err(StoreError::Unavailable(format!(
                "wallet {} written without holding its row lock",
                id
            ))),
        }
    }

    fn release_row(&mut self) {
        if let Some((id, row_guard)) = self.held.take() {
            drop(row_guard);
            self.inner.forget_idle_lock(id);
        }
    }

    fn finish(&mut self) {
        self.finished = true;
        self.staged = None;
        self.release_row();
    }
}

impl Drop for MemoryWalletTx {
    // Abandoned transactions (e.g. a timed-out attempt) behave like a rollback
    fn drop(&mut self) {
        self.release_row();
    }
}

#[async_trait]
impl WalletTx for MemoryWalletTx {
    async fn lock_for_update(&mut self, id: WalletId) -> Result<Option<Wallet>, StoreError> {
        self.ensure_open()?;
        if let Some(err) = self.inner.take_fault(FaultPoint::Lock) {
            return Err(err);
        }

        match &self.held {
            Some((locked, _)) if *locked == id => {}
            Some((locked, _)) => {
                return Err(StoreError::Unavailable(format!(
                    "transaction already holds the lock for wallet {}",
                    locked
                )))
            }
            None => {
                let row_guard = self.inner.row_lock(id).lock_owned().await;
                self.held = Some((id, row_guard));
            }
        }

        Ok(guard(&self.inner.committed).get(&id).cloned())
    }

    async fn insert(
        &mut self,
        id: WalletId,
        balance: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_locked(id)?;
        if guard(&self.inner.committed).contains_key(&id) {
            return Err(StoreError::WriteConflict(format!(
                "wallet {} already exists",
                id
            )));
        }
        self.staged = Some(Wallet::opened(id, balance, now));
        Ok(())
    }

    async fn update(
        &mut self,
        id: WalletId,
        balance: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.ensure_locked(id)?;
        let current = guard(&self.inner.committed)
            .get(&id)
            .cloned()
            .ok_or(StoreError::Database(sqlx::Error::RowNotFound))?;
        self.staged = Some(Wallet {
            balance,
            updated_at: now,
            ..current
        });
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        if let Some(err) = self.inner.take_fault(FaultPoint::Commit) {
            self.finish();
            return Err(err);
        }

        if let Some(wallet) = self.staged.take() {
            guard(&self.inner.committed).insert(WalletId::from(wallet.wallet_id), wallet);
        }
        self.inner.commits.fetch_add(1, Ordering::Relaxed);
        self.finish();
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        self.ensure_open()?;
        // A failed rollback still ends the transaction, as a dropped
        // connection does in Postgres
        let fault = self.inner.take_fault(FaultPoint::Rollback);
        self.finish();
        match fault {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}
