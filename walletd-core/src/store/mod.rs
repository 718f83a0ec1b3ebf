//! Storage port and adapters
//!
//! The engine only sees these traits:
//!
//! - `WalletStore` hands out transactions and serves plain reads
//! - `WalletTx` is one transaction holding at most one wallet row lock
//!
//! Adapters: `PgWalletStore` (Postgres via sqlx) and `MemoryWalletStore`
//! (per-wallet async locks, used by tests and `--in-memory`).

pub mod memory;
pub mod migrations;
pub mod postgres;

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;

use crate::config::IsolationLevel;
use crate::domain::{Wallet, WalletId};
use crate::error::StoreError;

pub use memory::MemoryWalletStore;
pub use postgres::{create_pool, PgWalletStore};

/// Shared handle to a store
pub type StoreHandle = Arc<dyn WalletStore>;

/// Boxed transaction returned by `WalletStore::begin`
pub type TxBox = Box<dyn WalletTx>;

#[async_trait]
pub trait WalletStore: Send + Sync {
    /// Start a transaction at the given isolation level.
    async fn begin(&self, isolation: IsolationLevel) -> Result<TxBox, StoreError>;

    /// Plain, non-locking read of the current row.
    async fn fetch(&self, id: WalletId) -> Result<Option<Wallet>, StoreError>;

    /// Cheap liveness check.
    async fn ping(&self) -> Result<(), StoreError>;
}

/// A single storage transaction.
///
/// After `commit` or `rollback` every call returns
/// `StoreError::TransactionFinished`.
#[async_trait]
pub trait WalletTx: Send {
    /// Read the row and hold its exclusive lock until the transaction ends.
    async fn lock_for_update(&mut self, id: WalletId) -> Result<Option<Wallet>, StoreError>;

    async fn insert(
        &mut self,
        id: WalletId,
        balance: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn update(
        &mut self,
        id: WalletId,
        balance: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn commit(&mut self) -> Result<(), StoreError>;

    async fn rollback(&mut self) -> Result<(), StoreError>;
}
