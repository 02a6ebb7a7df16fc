//! Cooperative cancellation
//!
//! A [`CancellationToken`] is a shared kill switch. The stage runner polls it
//! between trials and while waiting on an in-flight trial; nothing is ever
//! interrupted forcibly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Cloneable cancellation flag.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    /// Create an untriggered token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Request cancellation. Every clone observes it.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    /// Whether cancellation was requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Clear the flag so the owner can run again.
    pub fn reset(&self) {
        self.flag.store(false, Ordering::SeqCst);
    }
}
