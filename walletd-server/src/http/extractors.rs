//! Custom Axum extractors

use axum::extract::{FromRequestParts, Path};
use axum::http::request::Parts;
use walletd_core::WalletId;

use super::error::ApiError;

/// Extract and validate a wallet id from path
pub struct ValidWalletId(pub WalletId);

impl<S> FromRequestParts<S> for ValidWalletId
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Path(raw): Path<String> = Path::from_request_parts(parts, state)
            .await
            .map_err(|rejection| ApiError::BadRequest {
                message: rejection.body_text(),
            })?;

        Ok(Self(WalletId::parse(&raw)?))
    }
}
