//! Balance mutation engine
//!
//! One code path applies every signed delta:
//!
//! 1. lock the wallet row (`SELECT ... FOR UPDATE`), absence is not an error
//! 2. no row: negative delta fails, otherwise insert the new wallet
//! 3. row: reject a negative result, otherwise update balance and `updated_at`
//!
//! The whole attempt runs in one transaction. Retriable storage errors
//! restart it after a linear back-off, up to `RetryPolicy::max_attempts`.

use std::future::Future;
use std::time::Duration;

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::Span;

use crate::config::IsolationLevel;
use crate::context::OpContext;
use crate::domain::WalletId;
use crate::error::{CancelReason, StoreError, WalletError};
use crate::store::{StoreHandle, WalletTx};

/// Default number of attempts per mutation
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Default back-off unit between attempts
pub const DEFAULT_RETRY_BASE_DELAY: Duration = Duration::from_millis(100);

/// Retry and isolation settings for the engine
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub isolation: IsolationLevel,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_RETRY_BASE_DELAY,
            isolation: IsolationLevel::ReadCommitted,
        }
    }
}

impl RetryPolicy {
    /// Pause after the failed attempt with 0-based index `attempt`.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt.saturating_add(1))
    }
}

/// Why a single attempt failed
enum AttemptError {
    /// Business rule rejection; final, never retried
    Rejected(WalletError),
    Store(StoreError),
}

impl From<StoreError> for AttemptError {
    fn from(err: StoreError) -> Self {
        Self::Store(err)
    }
}

/// Applies signed deltas to wallet balances
pub struct BalanceEngine {
    store: StoreHandle,
    policy: RetryPolicy,
    span: Span,
}

impl BalanceEngine {
    pub fn new(store: StoreHandle, policy: RetryPolicy) -> Self {
        Self {
            store,
            policy,
            span: tracing::info_span!("balance_engine"),
        }
    }

    /// Log inside `span` instead of the engine's own.
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn store(&self) -> &StoreHandle {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    pub async fn deposit(
        &self,
        id: WalletId,
        amount: Decimal,
        ctx: &OpContext,
    ) -> Result<(), WalletError> {
        if amount < Decimal::ZERO {
            return Err(WalletError::invalid_amount(amount, "deposit amount must be positive"));
        }
        self.apply_delta(id, amount, ctx).await
    }

    pub async fn withdraw(
        &self,
        id: WalletId,
        amount: Decimal,
        ctx: &OpContext,
    ) -> Result<(), WalletError> {
        if amount < Decimal::ZERO {
            return Err(WalletError::invalid_amount(amount, "withdraw amount must be positive"));
        }
        self.apply_delta(id, -amount, ctx).await
    }

    /// Apply `delta` to the wallet's balance.
    ///
    /// A zero delta succeeds without touching storage. On error the stored
    /// state is unchanged.
    pub async fn apply_delta(
        &self,
        id: WalletId,
        delta: Decimal,
        ctx: &OpContext,
    ) -> Result<(), WalletError> {
        if delta.is_zero() {
            return Ok(());
        }

        let max_attempts = self.policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 0..max_attempts {
            ctx.check()?;

            match self.attempt(id, delta, ctx).await {
                Ok(()) => return Ok(()),
                Err(AttemptError::Rejected(err)) => return Err(err),
                Err(AttemptError::Store(err)) if err.is_retriable() => {
                    tracing::warn!(
                        parent: &self.span,
                        wallet_id = %id,
                        attempt = attempt + 1,
                        max_attempts,
                        error = %err,
                        "Retriable storage error, retrying"
                    );
                    last_error = Some(err);
                    if attempt + 1 < max_attempts {
                        tokio::time::sleep(self.policy.delay_for(attempt)).await;
                    }
                }
                Err(AttemptError::Store(err)) => {
                    tracing::error!(
                        parent: &self.span,
                        wallet_id = %id,
                        error = %err,
                        "Non-retriable storage error"
                    );
                    return Err(WalletError::Fatal(err));
                }
            }
        }

        Err(WalletError::TransientConflict {
            attempts: max_attempts,
            source: last_error.unwrap_or(StoreError::TransactionFinished),
        })
    }

    /// One transaction: lock, validate and stage under the context deadline,
    /// then commit.
    ///
    /// COMMIT runs to completion regardless of the deadline, since once sent
    /// it may already be durable.
    async fn attempt(
        &self,
        id: WalletId,
        delta: Decimal,
        ctx: &OpContext,
    ) -> Result<(), AttemptError> {
        let mut tx = within_deadline(ctx, async {
            Ok::<_, AttemptError>(self.store.begin(self.policy.isolation).await?)
        })
        .await?;

        // A timed-out mutation drops its pending lock wait; the rollback below
        // releases anything it already holds
        match within_deadline(ctx, self.mutate(tx.as_mut(), id, delta)).await {
            Ok(()) => {
                tx.commit().await?;
                Ok(())
            }
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    tracing::error!(
                        parent: &self.span,
                        wallet_id = %id,
                        error = %rollback_err,
                        "Rollback failed"
                    );
                }
                Err(err)
            }
        }
    }

    async fn mutate(
        &self,
        tx: &mut dyn WalletTx,
        id: WalletId,
        delta: Decimal,
    ) -> Result<(), AttemptError> {
        let now = Utc::now();

        let Some(wallet) = tx.lock_for_update(id).await? else {
            if delta < Decimal::ZERO {
                return Err(AttemptError::Rejected(WalletError::InsufficientFunds {
                    wallet_id: id.as_uuid(),
                    balance: Decimal::ZERO,
                    requested: -delta,
                }));
            }
            tracing::info!(parent: &self.span, wallet_id = %id, balance = %delta, "Creating wallet");
            tx.insert(id, delta, now).await?;
            return Ok(());
        };

        let new_balance = wallet.balance + delta;
        if new_balance < Decimal::ZERO {
            return Err(AttemptError::Rejected(WalletError::InsufficientFunds {
                wallet_id: id.as_uuid(),
                balance: wallet.balance,
                requested: -delta,
            }));
        }

        tx.update(id, new_balance, now).await?;
        Ok(())
    }
}

/// Run `fut` unless the context deadline passes first.
async fn within_deadline<T, F>(ctx: &OpContext, fut: F) -> Result<T, AttemptError>
where
    F: Future<Output = Result<T, AttemptError>>,
{
    match ctx.deadline() {
        Some(deadline) => tokio::time::timeout_at(deadline, fut)
            .await
            .unwrap_or(Err(AttemptError::Rejected(WalletError::Cancelled(
                CancelReason::DeadlineExceeded,
            )))),
        None => fut.await,
    }
}
