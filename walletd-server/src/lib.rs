//! walletd-server: HTTP front end for walletd
//!
//! Exposes deposits, withdrawals and balance lookups over JSON, backed by
//! the engine and worker pool in `walletd-core`.

pub mod http;
pub mod tracing_setup;

pub use http::{build_router, run_server, AppState, ServerConfig, ServerError};
