//! Cooperative cancellation scope passed to every blocking operation.
//!
//! Nothing reads cancellation from ambient state: operations take a
//! [`CancelToken`] explicitly and either check it at entry or wait on it
//! through [`CancelToken::sleep`].

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use anyhow::Result;

use crate::core::error::AtlasError;

/// A composable cancellation handle. Cloning shares the underlying flag, so a
/// cancel from any clone (e.g. the Ctrl-C handler) wakes every waiter.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: Mutex<bool>,
    cond: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Signal cancellation and wake all pending sleeps.
    pub fn cancel(&self) {
        let mut flag = self.inner.cancelled.lock().expect("cancel lock poisoned");
        *flag = true;
        self.inner.cond.notify_all();
    }

    pub fn is_cancelled(&self) -> bool {
        *self.inner.cancelled.lock().expect("cancel lock poisoned")
    }

    /// Entry check: returns `AtlasError::Cancelled` once the scope is cancelled.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            return Err(AtlasError::Cancelled.into());
        }
        Ok(())
    }

    /// Sleep for `duration` or until cancelled, whichever comes first.
    /// Returns `AtlasError::Cancelled` when woken by cancellation.
    pub fn sleep(&self, duration: Duration) -> Result<()> {
        let mut flag = self.inner.cancelled.lock().expect("cancel lock poisoned");
        let deadline = std::time::Instant::now() + duration;
        while !*flag {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                return Ok(());
            }
            let (guard, timeout) = self
                .inner
                .cond
                .wait_timeout(flag, remaining)
                .expect("cancel lock poisoned");
            flag = guard;
            if timeout.timed_out() && !*flag {
                return Ok(());
            }
        }
        Err(AtlasError::Cancelled.into())
    }
}
