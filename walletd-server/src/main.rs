//! walletd - wallet balance service
//!
//! - `serve`: run the HTTP API (synchronous and queued balance updates)
//! - `migrate`: create the wallet table and exit

use anyhow::Result;
use clap::{Parser, Subcommand};
use walletd_server::tracing_setup::{init_tracing, TracingConfig};

mod commands;

#[derive(Parser, Debug)]
#[command(
    name = "walletd",
    author,
    version,
    about = "Wallet balance service with row-locked, retried Postgres updates"
)]
struct Cli {
    /// Enable debug logging (RUST_LOG still wins when set)
    #[arg(long, global = true)]
    debug: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the HTTP API server
    Serve(commands::serve::ServeArgs),
    /// Create the wallet schema if missing
    Migrate(commands::migrate::MigrateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    // A missing .env file is fine
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    init_tracing(&TracingConfig { debug: cli.debug })?;

    match cli.command {
        Commands::Serve(args) => commands::serve::run_serve(args).await,
        Commands::Migrate(args) => commands::migrate::run_migrate(args).await,
    }
}
