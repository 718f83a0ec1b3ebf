//! Wallet service - synchronous entry points for the request layer
//!
//! Validates raw ids and amounts, then calls the engine directly.
//! Invalid input is rejected before any transaction starts.

use std::sync::Arc;

use rust_decimal::Decimal;

use crate::context::OpContext;
use crate::domain::{Operation, Wallet, WalletId};
use crate::engine::BalanceEngine;
use crate::error::{CancelReason, Result, StoreError, WalletError};
use crate::store::StoreHandle;

#[derive(Clone)]
pub struct WalletService {
    engine: Arc<BalanceEngine>,
}

impl WalletService {
    pub fn new(engine: Arc<BalanceEngine>) -> Self {
        Self { engine }
    }

    pub fn engine(&self) -> &Arc<BalanceEngine> {
        &self.engine
    }

    fn store(&self) -> &StoreHandle {
        self.engine.store()
    }

    pub async fn deposit(&self, wallet_id: &str, amount: Decimal, ctx: &OpContext) -> Result<()> {
        self.execute(wallet_id, Operation::Deposit, amount, ctx).await
    }

    pub async fn withdraw(&self, wallet_id: &str, amount: Decimal, ctx: &OpContext) -> Result<()> {
        self.execute(wallet_id, Operation::Withdraw, amount, ctx).await
    }

    /// Validate and apply one operation.
    pub async fn execute(
        &self,
        wallet_id: &str,
        operation: Operation,
        amount: Decimal,
        ctx: &OpContext,
    ) -> Result<()> {
        let (id, delta) = Self::prepare(wallet_id, operation, amount)?;
        tracing::info!(wallet_id = %id, operation = operation.as_str(), %amount, "Applying operation");
        self.engine.apply_delta(id, delta, ctx).await
    }

    /// Parse the id and turn `amount` into a signed delta.
    ///
    /// Negative amounts are rejected; zero yields a zero delta, which the
    /// engine treats as a no-op.
    pub fn prepare(
        wallet_id: &str,
        operation: Operation,
        amount: Decimal,
    ) -> Result<(WalletId, Decimal)> {
        let id = WalletId::parse(wallet_id)?;
        if amount < Decimal::ZERO {
            return Err(WalletError::invalid_amount(amount, "amount cannot be negative"));
        }
        Ok((id, operation.signed(amount)))
    }

    /// Plain read of the current wallet row.
    pub async fn get_balance(&self, wallet_id: &str, ctx: &OpContext) -> Result<Wallet> {
        let id = WalletId::parse(wallet_id)?;
        self.wallet(id, ctx).await
    }

    /// Same as [`get_balance`](Self::get_balance) for an already parsed id.
    pub async fn wallet(&self, id: WalletId, ctx: &OpContext) -> Result<Wallet> {
        ctx.check()?;

        let fetched = match ctx.deadline() {
            Some(deadline) => tokio::time::timeout_at(deadline, self.store().fetch(id))
                .await
                .map_err(|_| WalletError::Cancelled(CancelReason::DeadlineExceeded))?,
            None => self.store().fetch(id).await,
        };

        fetched
            .map_err(WalletError::Fatal)?
            .ok_or(WalletError::WalletNotFound {
                wallet_id: id.as_uuid(),
            })
    }

    /// Check that the store answers.
    pub async fn ping(&self) -> std::result::Result<(), StoreError> {
        self.store().ping().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::RetryPolicy;
    use crate::store::MemoryWalletStore;
    use rust_decimal_macros::dec;

    const WALLET: &str = "550e8400-e29b-41d4-a716-446655440000";

    fn service(store: &MemoryWalletStore) -> WalletService {
        WalletService::new(Arc::new(BalanceEngine::new(
            Arc::new(store.clone()),
            RetryPolicy::default(),
        )))
    }

    #[tokio::test]
    async fn deposit_then_get_balance() {
        let store = MemoryWalletStore::new();
        let svc = service(&store);
        let ctx = OpContext::background();

        svc.deposit(WALLET, dec!(42), &ctx).await.unwrap();
        let wallet = svc.get_balance(WALLET, &ctx).await.unwrap();
        assert_eq!(wallet.balance, dec!(42));
        assert_eq!(wallet.wallet_id.to_string(), WALLET);
    }

    #[tokio::test]
    async fn invalid_id_never_reaches_storage() {
        let store = MemoryWalletStore::new();
        let svc = service(&store);
        let ctx = OpContext::background();

        let err = svc.deposit("invalid-uuid", dec!(100), &ctx).await.unwrap_err();
        assert!(err.to_string().contains("invalid wallet ID format"));
        assert!(matches!(
            svc.get_balance("nope", &ctx).await,
            Err(WalletError::InvalidIdentifier { .. })
        ));
        assert_eq!(store.transactions_started(), 0);
    }

    #[tokio::test]
    async fn negative_amounts_are_invalid() {
        let store = MemoryWalletStore::new();
        let svc = service(&store);
        let ctx = OpContext::background();

        assert!(matches!(
            svc.deposit(WALLET, dec!(-1), &ctx).await,
            Err(WalletError::InvalidAmount { .. })
        ));
        assert!(matches!(
            svc.withdraw(WALLET, dec!(-1), &ctx).await,
            Err(WalletError::InvalidAmount { .. })
        ));
    }

    #[tokio::test]
    async fn zero_deposit_is_a_no_op() {
        let store = MemoryWalletStore::new();
        let svc = service(&store);
        let ctx = OpContext::background();

        svc.deposit(WALLET, dec!(0), &ctx).await.unwrap();
        assert!(matches!(
            svc.get_balance(WALLET, &ctx).await,
            Err(WalletError::WalletNotFound { .. })
        ));
        assert_eq!(store.transactions_started(), 0);
    }

    #[tokio::test]
    async fn missing_wallet_is_not_found() {
        let store = MemoryWalletStore::new();
        let svc = service(&store);

        let err = svc
            .get_balance(WALLET, &OpContext::background())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "wallet_not_found");
    }

    #[test]
    fn prepare_signs_withdrawals() {
        let (_, delta) = WalletService::prepare(WALLET, Operation::Withdraw, dec!(3.5)).unwrap();
        assert_eq!(delta, dec!(-3.5));
    }
}
