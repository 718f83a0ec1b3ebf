//! Schema bootstrap command

use anyhow::{Context, Result};
use clap::Parser;
use walletd_core::store::{create_pool, migrations};

use super::db::DbArgs;

/// Arguments for the migrate command
#[derive(Parser, Debug)]
pub struct MigrateArgs {
    #[command(flatten)]
    pub db: DbArgs,
}

pub async fn run_migrate(args: MigrateArgs) -> Result<()> {
    let config = args.db.store_config();
    config.validate().context("Invalid database configuration")?;

    let pool = create_pool(&config)
        .await
        .context("Failed to create database pool")?;
    migrations::run(&pool)
        .await
        .context("Failed to run migrations")?;

    tracing::info!(host = %config.host, database = %config.database, "Schema is up to date");
    Ok(())
}
