use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::stress::error::{StressError, StressResult};

/// Shared cancellation flag. Clones observe the same flag; a child also
/// observes every ancestor's.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
    parent: Option<Arc<CancelToken>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wraps an existing flag, e.g. one flipped from a signal handler.
    pub fn from_flag(flag: Arc<AtomicBool>) -> Self {
        Self { flag, parent: None }
    }

    /// Token that stops when either it or `self` is cancelled. Cancelling the
    /// child leaves `self` untouched.
    pub fn child(&self) -> Self {
        Self {
            flag: Arc::new(AtomicBool::new(false)),
            parent: Some(Arc::new(self.clone())),
        }
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Relaxed)
            || self.parent.as_ref().is_some_and(|parent| parent.is_cancelled())
    }

    pub fn check(&self) -> StressResult<()> {
        if self.is_cancelled() {
            Err(StressError::Cancelled)
        } else {
            Ok(())
        }
    }
}
