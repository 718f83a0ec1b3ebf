//! Cancellable operation context
//!
//! Every balance operation carries an `OpContext`. The engine checks it
//! before each attempt and bounds each attempt by its deadline.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;

use crate::error::{CancelReason, WalletError};

/// Deadline plus a cancellation flag shared by all clones
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    deadline: Option<Instant>,
    cancelled: Arc<AtomicBool>,
}

impl OpContext {
    /// A context that never expires on its own
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self::with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(deadline: Instant) -> Self {
        Self {
            deadline: Some(deadline),
            cancelled: Arc::default(),
        }
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and every clone of it.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Fails if the context was cancelled or its deadline has passed.
    pub fn check(&self) -> Result<(), WalletError> {
        if self.is_cancelled() {
            return Err(WalletError::Cancelled(CancelReason::Cancelled));
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => {
                Err(WalletError::Cancelled(CancelReason::DeadlineExceeded))
            }
            _ => Ok(()),
        }
    }
}
