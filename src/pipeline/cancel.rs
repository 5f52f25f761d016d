//! Cooperative cancellation shared between the consumer and a worker thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{PapercutError, Result};

/// A cloneable flag. Cancelling one clone cancels them all.
///
/// Work is never interrupted: long-running loops call [`CancelToken::check`]
/// between steps and unwind with [`PapercutError::Cancelled`].
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// A token that is never cancelled, for callers without a consumer.
    pub fn never() -> Self {
        Self::default()
    }

    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// `Err(Cancelled)` once cancellation was requested.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PapercutError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cancel_is_shared_between_clones() {
        let token = CancelToken::new();
        let worker = token.clone();
        assert!(worker.check().is_ok());

        token.cancel();
        assert!(worker.is_cancelled());
        assert!(worker.check().unwrap_err().is_cancelled());
    }

    #[test]
    fn test_fresh_tokens_are_independent() {
        let old = CancelToken::new();
        old.cancel();
        let fresh = CancelToken::new();
        assert!(!fresh.is_cancelled());
    }
}
