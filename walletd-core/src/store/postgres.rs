//! Postgres adapter
//!
//! Uses sqlx PgPool with explicit connection limits. Every transaction sets
//! its isolation level first and locks rows with `SELECT ... FOR UPDATE`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Transaction};

use super::{TxBox, WalletStore, WalletTx};
use crate::config::{IsolationLevel, StoreConfig};
use crate::domain::{Wallet, WalletId};
use crate::error::StoreError;

/// Create a PostgreSQL connection pool.
///
/// # Errors
///
/// Returns an error if the first connection cannot be established.
///
/// # Example
///
/// ```ignore
/// let pool = create_pool(&StoreConfig::default()).await?;
/// ```
pub async fn create_pool(config: &StoreConfig) -> Result<PgPool, StoreError> {
    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .acquire_timeout(config.acquire_timeout)
        .connect(&config.database_url())
        .await?;
    Ok(pool)
}

/// Wallet store backed by the `wallet_db` table
#[derive(Clone)]
pub struct PgWalletStore {
    pool: PgPool,
}

impl PgWalletStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl WalletStore for PgWalletStore {
    async fn begin(&self, isolation: IsolationLevel) -> Result<TxBox, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Must be the first statement of the transaction
        sqlx::query(&format!(
            "SET TRANSACTION ISOLATION LEVEL {}",
            isolation.as_sql()
        ))
        .execute(&mut *tx)
        .await?;

        Ok(Box::new(PgWalletTx { tx: Some(tx) }))
    }

    async fn fetch(&self, id: WalletId) -> Result<Option<Wallet>, StoreError> {
        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT wallet_id, balance, created_at, updated_at
            FROM wallet_db
            WHERE wallet_id = $1
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&self.pool)
        .await?;

        Ok(wallet)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

/// Open Postgres transaction; `None` once committed or rolled back
pub struct PgWalletTx {
    tx: Option<Transaction<'static, Postgres>>,
}

impl PgWalletTx {
    fn live(&mut self) -> Result<&mut Transaction<'static, Postgres>, StoreError> {
        self.tx.as_mut().ok_or(StoreError::TransactionFinished)
    }
}

#[async_trait]
impl WalletTx for PgWalletTx {
    async fn lock_for_update(&mut self, id: WalletId) -> Result<Option<Wallet>, StoreError> {
        let tx = self.live()?;
        let wallet = sqlx::query_as::<_, Wallet>(
            r#"
            SELECT wallet_id, balance, created_at, updated_at
            FROM wallet_db
            WHERE wallet_id = $1
            FOR UPDATE
            "#,
        )
        .bind(id.as_uuid())
        .fetch_optional(&mut **tx)
        .await?;

        Ok(wallet)
    }

    async fn insert(
        &mut self,
        id: WalletId,
        balance: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let tx = self.live()?;
        // A concurrent first deposit surfaces as a unique violation,
        // which maps to the retriable StoreError::WriteConflict.
        sqlx::query(
            r#"
            INSERT INTO wallet_db (wallet_id, balance, created_at, updated_at)
            VALUES ($1, $2, $3, $3)
            "#,
        )
        .bind(id.as_uuid())
        .bind(balance)
        .bind(now)
        .execute(&mut **tx)
        .await?;

        Ok(())
    }

    async fn update(
        &mut self,
        id: WalletId,
        balance: Decimal,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let tx = self.live()?;
        let result = sqlx::query(
            r#"
            UPDATE wallet_db
            SET balance = $1, updated_at = $2
            WHERE wallet_id = $3
            "#,
        )
        .bind(balance)
        .bind(now)
        .bind(id.as_uuid())
        .execute(&mut **tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Database(sqlx::Error::RowNotFound));
        }
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionFinished)?;
        tx.commit().await?;
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        let tx = self.tx.take().ok_or(StoreError::TransactionFinished)?;
        tx.rollback().await?;
        Ok(())
    }
}
