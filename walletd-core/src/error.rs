//! Error types for walletd-core
//!
//! `WalletError` is what callers of the engine, pool and service see.
//! `StoreError` is what storage adapters return; the engine decides from
//! `StoreError::is_retriable` whether an attempt is worth repeating.

use rust_decimal::Decimal;
use thiserror::Error;
use uuid::Uuid;

/// Result type alias for wallet operations
pub type Result<T> = std::result::Result<T, WalletError>;

/// Why an operation context stopped an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The caller cancelled explicitly
    Cancelled,
    /// The context deadline passed
    DeadlineExceeded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cancelled => write!(f, "cancelled"),
            Self::DeadlineExceeded => write!(f, "deadline exceeded"),
        }
    }
}

/// Errors surfaced by balance operations
#[derive(Error, Debug)]
pub enum WalletError {
    /// The wallet id is not a valid UUID
    #[error("invalid wallet ID format: '{value}'")]
    InvalidIdentifier { value: String },

    /// The amount is not acceptable for the requested operation
    #[error("invalid amount {amount}: {reason}")]
    InvalidAmount {
        amount: Decimal,
        reason: &'static str,
    },

    /// Applying the delta would make the balance negative
    #[error("insufficient funds in wallet {wallet_id}: balance {balance}, requested {requested}")]
    InsufficientFunds {
        wallet_id: Uuid,
        balance: Decimal,
        requested: Decimal,
    },

    /// No wallet row exists for the id
    #[error("wallet {wallet_id} not found")]
    WalletNotFound { wallet_id: Uuid },

    /// Every attempt hit a retriable storage error
    #[error("max retries ({attempts}) reached, last error: {source}")]
    TransientConflict {
        attempts: u32,
        #[source]
        source: StoreError,
    },

    /// The operation context was cancelled or expired
    #[error("operation cancelled: {0}")]
    Cancelled(CancelReason),

    /// Any storage error that is not worth retrying
    #[error("storage error: {0}")]
    Fatal(#[source] StoreError),
}

impl WalletError {
    /// Stable tag for logs and API responses
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier { .. } => "invalid_identifier",
            Self::InvalidAmount { .. } => "invalid_amount",
            Self::InsufficientFunds { .. } => "insufficient_funds",
            Self::WalletNotFound { .. } => "wallet_not_found",
            Self::TransientConflict { .. } => "transient_conflict",
            Self::Cancelled(_) => "operation_cancelled",
            Self::Fatal(_) => "internal_error",
        }
    }

    pub fn invalid_identifier(value: impl Into<String>) -> Self {
        Self::InvalidIdentifier {
            value: value.into(),
        }
    }

    pub fn invalid_amount(amount: Decimal, reason: &'static str) -> Self {
        Self::InvalidAmount { amount, reason }
    }
}

/// Errors returned by storage adapters
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("serialization failure: {0}")]
    SerializationFailure(String),

    #[error("deadlock detected: {0}")]
    Deadlock(String),

    #[error("connection failure: {0}")]
    ConnectionFailure(String),

    #[error("timed out: {0}")]
    Timeout(String),

    /// Used after commit or rollback already consumed the transaction
    #[error("transaction has already been committed or rolled back")]
    TransactionFinished,

    /// Two transactions raced to create the same wallet
    #[error("write conflict: {0}")]
    WriteConflict(String),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    /// Whether a fresh attempt may succeed where this one failed.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::SerializationFailure(_)
                | Self::Deadlock(_)
                | Self::ConnectionFailure(_)
                | Self::Timeout(_)
                | Self::TransactionFinished
                | Self::WriteConflict(_)
        )
    }
}

/// SQLSTATE codes with their own classification
const SERIALIZATION_FAILURE: &str = "40001";
const DEADLOCK_DETECTED: &str = "40P01";
const UNIQUE_VIOLATION: &str = "23505";
/// Class 08: connection exceptions
const CONNECTION_EXCEPTION_CLASS: &str = "08";

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                let message = db_err.message().to_owned();
                let code = db_err.code().map(|code| code.into_owned());
                match code.as_deref() {
                    Some(SERIALIZATION_FAILURE) => Self::SerializationFailure(message),
                    Some(DEADLOCK_DETECTED) => Self::Deadlock(message),
                    Some(UNIQUE_VIOLATION) => Self::WriteConflict(message),
                    Some(code) if code.starts_with(CONNECTION_EXCEPTION_CLASS) => {
                        Self::ConnectionFailure(message)
                    }
                    _ => Self::Database(sqlx::Error::Database(db_err)),
                }
            }
            sqlx::Error::Io(io_err) if io_err.kind() == std::io::ErrorKind::TimedOut => {
                Self::Timeout(io_err.to_string())
            }
            sqlx::Error::Io(io_err) => Self::ConnectionFailure(io_err.to_string()),
            sqlx::Error::PoolTimedOut => Self::Timeout("timed out acquiring a connection".into()),
            sqlx::Error::PoolClosed => Self::Unavailable("connection pool is closed".into()),
            other => Self::Database(other),
        }
    }
}
