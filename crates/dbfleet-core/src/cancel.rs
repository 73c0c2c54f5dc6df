//! Stop signal for a running copy.
//!
//! The copy engine calls [`CancellationToken::check`] at every batch
//! boundary. A batch already being written is always finished and
//! checkpointed first, so a stopped copy resumes cleanly.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop flag handed to a copy through `CopyOptions::with_cancel`.
///
/// All clones observe the same flag.
///
/// # Example
///
/// ```
/// use dbfleet_core::{CancellationToken, CopyOptions};
///
/// let token = CancellationToken::new();
/// let options = CopyOptions::default().with_cancel(token.clone());
///
/// // From another thread, or a signal handler:
/// token.cancel();
/// assert!(token.check().is_err());
/// # drop(options);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the copy to stop at its next batch boundary.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// `Err(CancelledError)` once [`cancel`](Self::cancel) has been called.
    pub fn check(&self) -> Result<(), CancelledError> {
        if self.is_cancelled() {
            Err(CancelledError)
        } else {
            Ok(())
        }
    }
}

/// Returned by [`CancellationToken::check`] after a stop was requested.
/// Converts into `InterruptReason::Cancelled`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelledError;

impl fmt::Display for CancelledError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("copy cancelled")
    }
}

impl std::error::Error for CancelledError {}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::migration::InterruptReason;

    #[test]
    fn test_fresh_token_passes_check() {
        assert_eq!(CancellationToken::new().check(), Ok(()));
    }

    #[test]
    fn test_cancel_is_seen_by_every_clone() {
        let token = CancellationToken::new();
        let held_by_copy = token.clone();

        token.cancel();

        assert!(held_by_copy.is_cancelled());
        assert_eq!(held_by_copy.check(), Err(CancelledError));
    }

    #[test]
    fn test_cancelled_maps_to_interrupt_reason() {
        let reason: InterruptReason = CancelledError.into();
        assert_eq!(reason, InterruptReason::Cancelled);
        assert_eq!(CancelledError.to_string(), "copy cancelled");
    }
}
