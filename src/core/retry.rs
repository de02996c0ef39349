//! Exponential-backoff retry for transient external failures.
//!
//! Each external subsystem (git, GitHub CLI, AI CLI) supplies its own
//! classifier; the policy and loop are shared.

use std::time::Duration;

use anyhow::Result;
use rand::Rng;
use tracing::warn;

use crate::core::cancel::CancelToken;
use crate::core::error::{is_cancelled, kind_of, AtlasError};

/// How a failure should be treated by the retry loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Worth retrying after a backoff delay.
    Transient,
    /// Retrying cannot help (auth, not-found, validation).
    Permanent,
    /// The scope was cancelled; propagate unchanged.
    Cancelled,
}

/// Backoff parameters. Defaults: 3 attempts, 2s initial, x2, 30s cap.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_delay: Duration,
    pub multiplier: f64,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay: Duration::from_secs(2),
            multiplier: 2.0,
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Extend the attempt budget, keeping the backoff curve.
    pub fn with_extra_attempts(mut self, extra: u32) -> Self {
        self.max_attempts += extra;
        self
    }
}

/// Classify using the `AtlasError` kind when present. Subsystem classifiers
/// fall back to this after their own string matching.
pub fn classify_by_kind(err: &anyhow::Error) -> ErrorClass {
    match kind_of(err) {
        Some(AtlasError::Cancelled) => ErrorClass::Cancelled,
        Some(AtlasError::Transient(_)) => ErrorClass::Transient,
        _ => ErrorClass::Permanent,
    }
}

/// Run `op` with exponential backoff between transient failures.
///
/// Waits are cancellable: cancellation during a backoff sleep (or classified
/// from the operation itself) propagates immediately without further attempts.
pub fn retry_with_backoff<T>(
    cancel: &CancelToken,
    policy: &RetryPolicy,
    classify: impl Fn(&anyhow::Error) -> ErrorClass,
    mut op: impl FnMut(u32) -> Result<T>,
) -> Result<T> {
    let mut delay = policy.initial_delay;
    let mut last_err: Option<anyhow::Error> = None;

    for attempt in 1..=policy.max_attempts.max(1) {
        cancel.check()?;
        match op(attempt) {
            Ok(value) => return Ok(value),
            Err(err) => {
                if is_cancelled(&err) {
                    return Err(err);
                }
                match classify(&err) {
                    ErrorClass::Cancelled => return Err(err),
                    ErrorClass::Permanent => return Err(err),
                    ErrorClass::Transient => {
                        warn!(
                            attempt,
                            max_attempts = policy.max_attempts,
                            error = %err,
                            "transient failure, will retry"
                        );
                        last_err = Some(err);
                    }
                }
            }
        }

        if attempt < policy.max_attempts {
            cancel.sleep(jitter(delay))?;
            delay = Duration::from_secs_f64(
                (delay.as_secs_f64() * policy.multiplier)
                    .min(policy.max_delay.as_secs_f64()),
            );
        }
    }

    Err(last_err.expect("retry loop exited without error"))
}

/// Apply +/-20% jitter so concurrent tasks do not retry in lockstep.
fn jitter(delay: Duration) -> Duration {
    let factor = 1.0 + rand::thread_rng().gen_range(-0.2..=0.2);
    Duration::from_secs_f64((delay.as_secs_f64() * factor).max(0.0))
}
