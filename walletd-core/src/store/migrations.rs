//! Schema bootstrap for the wallet table

use sqlx::PgPool;

use crate::error::StoreError;

/// Create the wallet table if it does not exist yet
pub async fn run(pool: &PgPool) -> Result<(), StoreError> {
    tracing::info!("Running wallet migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS wallet_db (
            wallet_id UUID PRIMARY KEY,
            balance NUMERIC NOT NULL DEFAULT 0 CHECK (balance >= 0),
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    )
    .execute(pool)
    .await?;

    tracing::info!("Wallet migrations complete");
    Ok(())
}
