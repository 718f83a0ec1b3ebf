//! Wallet domain types
//!
//! Ids are validated when parsed. Invalid input returns
//! `WalletError::InvalidIdentifier`, never a panic.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

use crate::error::WalletError;

/// Caller-supplied wallet identifier (always a valid UUID)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WalletId(Uuid);

impl WalletId {
    pub fn parse(value: &str) -> Result<Self, WalletError> {
        Uuid::parse_str(value.trim())
            .map(Self)
            .map_err(|_| WalletError::invalid_identifier(value))
    }

    pub fn new_v4() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl From<Uuid> for WalletId {
    fn from(id: Uuid) -> Self {
        Self(id)
    }
}

impl FromStr for WalletId {
    type Err = WalletError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for WalletId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// Persisted wallet row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Wallet {
    pub wallet_id: Uuid,
    pub balance: Decimal,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Wallet {
    /// A wallet as first persisted by a deposit.
    pub fn opened(wallet_id: WalletId, balance: Decimal, now: DateTime<Utc>) -> Self {
        Self {
            wallet_id: wallet_id.as_uuid(),
            balance,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Balance operation requested by a caller
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Deposit,
    Withdraw,
}

impl Operation {
    /// Signed delta for an unsigned amount
    pub fn signed(self, amount: Decimal) -> Decimal {
        match self {
            Self::Deposit => amount,
            Self::Withdraw => -amount,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Deposit => "DEPOSIT",
            Self::Withdraw => "WITHDRAW",
        }
    }
}
