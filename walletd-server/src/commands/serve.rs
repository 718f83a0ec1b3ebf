//! HTTP server command
//!
//! Wires the store, engine and mutation pool together and runs the API
//! until Ctrl+C or SIGTERM.

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use walletd_core::store::{create_pool, migrations};
use walletd_core::{
    BalanceEngine, IsolationLevel, MemoryWalletStore, MutationPool, PgWalletStore, PoolConfig,
    RetryPolicy, StoreHandle, WalletService,
};
use walletd_server::{run_server, AppState, ServerConfig};

use super::db::DbArgs;

/// Arguments for the serve command
#[derive(Parser, Debug)]
pub struct ServeArgs {
    /// Interface to bind to
    #[arg(long, env = "APP_HOST", default_value = "0.0.0.0")]
    pub host: IpAddr,

    /// Port to listen on
    #[arg(long, short = 'p', env = "APP_PORT", default_value_t = 8080)]
    pub port: u16,

    /// Allow permissive CORS (all origins) - use with caution
    #[arg(long)]
    pub cors_permissive: bool,

    /// Keep wallets in process memory instead of Postgres
    #[arg(long)]
    pub in_memory: bool,

    #[command(flatten)]
    pub db: DbArgs,

    /// Number of queue workers
    #[arg(long, env = "WORKERS", default_value_t = 4)]
    pub workers: usize,

    /// Jobs the queue holds before rejecting
    #[arg(long, env = "QUEUE_CAPACITY", default_value_t = 100)]
    pub queue_capacity: usize,

    /// Attempts per balance update before giving up
    #[arg(long, env = "MAX_RETRIES", default_value_t = 5,
          value_parser = clap::value_parser!(u32).range(1..))]
    pub max_retries: u32,

    /// Back-off unit between attempts, in milliseconds
    #[arg(long, env = "RETRY_BASE_DELAY_MS", default_value_t = 100)]
    pub retry_base_delay_ms: u64,

    /// Deadline for synchronous requests, in seconds
    #[arg(long, env = "REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// read_committed, repeatable_read or serializable
    #[arg(long, env = "ISOLATION_LEVEL", default_value = "read_committed")]
    pub isolation_level: IsolationLevel,
}

/// Run the HTTP server
pub async fn run_serve(args: ServeArgs) -> Result<()> {
    let store = open_store(&args).await?;

    let policy = RetryPolicy {
        max_attempts: args.max_retries,
        base_delay: Duration::from_millis(args.retry_base_delay_ms),
        isolation: args.isolation_level,
    };
    let engine = Arc::new(
        BalanceEngine::new(store, policy).with_span(tracing::info_span!("balance_engine")),
    );

    let pool = MutationPool::start(
        Arc::clone(&engine),
        PoolConfig {
            workers: args.workers,
            queue_capacity: args.queue_capacity,
        },
    )
    .context("Invalid worker pool configuration")?;

    let state = AppState::new(
        WalletService::new(engine),
        Arc::new(pool),
        Duration::from_secs(args.request_timeout_secs),
    );
    let config = ServerConfig {
        bind_addr: SocketAddr::new(args.host, args.port),
        cors_permissive: args.cors_permissive,
    };

    // Run server (blocks until shutdown and pool drain)
    run_server(state, config).await.context("Server error")?;

    Ok(())
}

async fn open_store(args: &ServeArgs) -> Result<StoreHandle> {
    if args.in_memory {
        tracing::warn!("Using in-memory store, balances are lost on exit");
        return Ok(Arc::new(MemoryWalletStore::new()));
    }

    let config = args.db.store_config();
    config.validate().context("Invalid database configuration")?;

    let pool = create_pool(&config)
        .await
        .context("Failed to create database pool")?;
    migrations::run(&pool)
        .await
        .context("Failed to run migrations")?;

    tracing::info!(
        max_connections = config.max_connections,
        isolation = %args.isolation_level,
        "Connected to Postgres"
    );
    Ok(Arc::new(PgWalletStore::new(pool)))
}
