//! Wallet endpoints
//!
//! `POST /api/v1/wallet` applies an operation synchronously,
//! `POST /api/v1/wallet/queue` hands it to the mutation pool and
//! `GET /api/v1/wallets/{walletId}` reads the balance.

use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use walletd_core::{Job, OpContext, Operation, Wallet, WalletId, WalletService};

use crate::http::error::ApiError;
use crate::http::extractors::ValidWalletId;
use crate::http::server::AppState;

/// Deposit or withdraw request
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationRequest {
    pub wallet_id: String,
    pub operation_type: Operation,
    pub amount: Decimal,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: &'static str,
}

/// Balance response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BalanceResponse {
    pub wallet_id: WalletId,
    pub balance: Decimal,
}

impl From<Wallet> for BalanceResponse {
    fn from(w: Wallet) -> Self {
        Self {
            wallet_id: WalletId::from(w.wallet_id),
            balance: w.balance,
        }
    }
}

/// POST /api/v1/wallet - apply and wait for the outcome
async fn apply_operation(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<OperationRequest>, JsonRejection>,
) -> Result<Json<StatusResponse>, ApiError> {
    let Json(req) = payload?;
    let ctx = state.request_context();
    state
        .service
        .execute(&req.wallet_id, req.operation_type, req.amount, &ctx)
        .await?;

    Ok(Json(StatusResponse { status: "ok" }))
}

/// POST /api/v1/wallet/queue - validate, enqueue and return immediately
async fn queue_operation(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<OperationRequest>, JsonRejection>,
) -> Result<(StatusCode, Json<StatusResponse>), ApiError> {
    let Json(req) = payload?;
    let (id, delta) = WalletService::prepare(&req.wallet_id, req.operation_type, req.amount)?;

    // The job outlives the request, so it gets no request deadline
    if !state.pool.submit(Job::new(id, delta, OpContext::background())) {
        return Err(ApiError::QueueFull);
    }

    Ok((StatusCode::ACCEPTED, Json(StatusResponse { status: "queued" })))
}

/// GET /api/v1/wallets/{walletId}
async fn get_balance(
    State(state): State<Arc<AppState>>,
    ValidWalletId(id): ValidWalletId,
) -> Result<Json<BalanceResponse>, ApiError> {
    let wallet = state.service.wallet(id, &state.request_context()).await?;
    Ok(Json(BalanceResponse::from(wallet)))
}

/// Wallet routes
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/v1/wallet", post(apply_operation))
        .route("/api/v1/wallet/queue", post(queue_operation))
        .route("/api/v1/wallets/{wallet_id}", get(get_balance))
}
