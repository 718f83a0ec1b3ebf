//! walletd-core: transactional wallet balances
//!
//! - **engine**: the balance mutation engine (row lock, validate, persist, retry)
//! - **pool**: fixed-size worker pool applying queued mutations
//! - **service**: synchronous façade used by the request layer
//! - **store**: storage port plus Postgres and in-memory adapters

pub mod config;
pub mod context;
pub mod domain;
pub mod engine;
pub mod error;
pub mod pool;
pub mod service;
pub mod store;

pub use config::{ConfigError, IsolationLevel, StoreConfig};
pub use context::OpContext;
pub use domain::{Operation, Wallet, WalletId};
pub use engine::{BalanceEngine, RetryPolicy};
pub use error::{CancelReason, Result, StoreError, WalletError};
pub use pool::{Job, MutationPool, PoolConfig, PoolState, PoolStats};
pub use service::WalletService;
pub use store::{MemoryWalletStore, PgWalletStore, StoreHandle, WalletStore, WalletTx};
