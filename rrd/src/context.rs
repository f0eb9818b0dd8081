//! Cancellation context carried by every store operation.
//!
//! A [`Context`] is a cheap, cloneable handle. Cancelling it (or any of its
//! parents) or letting its deadline pass makes every subsequent store call
//! fail with [`RrdError::Cancelled`] before touching the backend.
//!
//! ```rust
//! use std::time::Duration;
//! use rrd::context::Context;
//!
//! let root = Context::background();
//! let request = root.with_timeout(Duration::from_secs(15));
//! assert!(request.check("put").is_ok());
//!
//! root.cancel();
//! assert!(request.check("put").is_err());
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{CancelReason, Result, RrdError};

/// A cancellation handle with an optional deadline.
#[derive(Debug, Clone)]
pub struct Context {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    cancelled: AtomicBool,
    deadline: Option<Instant>,
    parent: Option<Context>,
}

impl Context {
    /// Returns a root context that is never cancelled unless `cancel` is called.
    pub fn background() -> Self {
        Self::build(None, None)
    }

    /// Returns a child context that is done when `self` is done.
    pub fn child(&self) -> Self {
        Self::build(None, Some(self.clone()))
    }

    /// Returns a child context that also expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Returns a child context that also expires at `deadline`.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        Self::build(Some(deadline), Some(self.clone()))
    }

    fn build(deadline: Option<Instant>, parent: Option<Context>) -> Self {
        Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                deadline,
                parent,
            }),
        }
    }

    /// Cancels this context and every context derived from it.
    pub fn cancel(&self) {
        self.inner.cancelled.store(true, Ordering::Release);
    }

    /// Returns why the context is done, or `None` if it still accepts work.
    pub fn err(&self) -> Option<CancelReason> {
        let mut current = Some(self);
        while let Some(ctx) = current {
            if ctx.inner.cancelled.load(Ordering::Acquire) {
                return Some(CancelReason::Cancelled);
            }
            if ctx.inner.deadline.is_some_and(|d| Instant::now() >= d) {
                return Some(CancelReason::DeadlineExceeded);
            }
            current = ctx.inner.parent.as_ref();
        }
        None
    }

    /// Returns true if the context is cancelled or expired.
    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Fails with [`RrdError::Cancelled`] if the context is done.
    ///
    /// # Errors
    ///
    /// Returns [`RrdError::Cancelled`] naming `operation`.
    #[inline]
    pub fn check(&self, operation: &'static str) -> Result<()> {
        match self.err() {
            Some(reason) => Err(RrdError::Cancelled { operation, reason }),
            None => Ok(()),
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_background_is_live() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert!(ctx.check("get").is_ok());
    }

    #[test]
    fn test_cancel_propagates_to_children_only() {
        let root = Context::background();
        let child = root.child();
        let grandchild = child.with_timeout(Duration::from_secs(60));

        child.cancel();
        assert_eq!(grandchild.err(), Some(CancelReason::Cancelled));
        assert_eq!(child.err(), Some(CancelReason::Cancelled));
        assert_eq!(root.err(), None);
    }

    #[test]
    fn test_expired_deadline() {
        let ctx = Context::background().with_deadline(Instant::now() - Duration::from_millis(1));
        assert_eq!(ctx.err(), Some(CancelReason::DeadlineExceeded));

        let err = ctx.check("scan").unwrap_err();
        assert!(err.is_cancelled());
    }
}
