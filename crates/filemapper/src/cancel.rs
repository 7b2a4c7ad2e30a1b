//! Cooperative cancellation for scans and long table walks.
//!
//! ## Sparse Checking
//!
//! Loops over millions of extents call `is_cancelled_sparse()`, which only
//! reads the flag every `CANCEL_CHECK_INTERVAL` iterations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// How often long-running loops check whether they were cancelled.
/// Must stay a power of two.
pub const CANCEL_CHECK_INTERVAL: usize = 0x1000; // 4,096

/// A cloneable cancellation handle. All clones observe the same flag.
#[derive(Clone, Debug, Default)]
pub struct CancellationToken {
    flag: Option<Arc<AtomicBool>>,
}

impl CancellationToken {
    /// Creates a live token that can later be cancelled.
    pub fn new() -> Self {
        Self {
            flag: Some(Arc::new(AtomicBool::new(false))),
        }
    }

    /// Creates a token that is never cancelled.
    #[inline]
    pub fn noop() -> Self {
        Self { flag: None }
    }

    pub fn cancel(&self) {
        if let Some(flag) = &self.flag {
            flag.store(true, Ordering::Relaxed);
        }
    }

    /// Returns `Some(())` while active and `None` once cancelled, so callers
    /// can bail out with `?`.
    #[inline]
    pub fn is_cancelled(&self) -> Option<()> {
        match &self.flag {
            Some(flag) if flag.load(Ordering::Relaxed) => None,
            _ => Some(()),
        }
    }

    #[inline]
    pub fn is_cancelled_sparse(&self, counter: usize) -> Option<()> {
        if counter & (CANCEL_CHECK_INTERVAL - 1) == 0 {
            self.is_cancelled()
        } else {
            Some(())
        }
    }
}
