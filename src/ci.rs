//! CI watcher: polls an external check lister until the watched PR's checks
//! settle, time out, or the scope is cancelled.
//!
//! Policy notes:
//! - `skipping` counts as pass, including for required checks (a check the CI
//!   config chose to skip must not wedge the task).
//! - A required pattern matching zero reported checks is an error, never
//!   success.
//! - An empty required list with an empty check response stays `pending`
//!   until the timeout: absence of evidence is not a green build.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::error::AtlasError;
use crate::core::retry::{retry_with_backoff, RetryPolicy};
use crate::io::github::{classify_gh_error, CheckBucket, CheckLister, CheckResult};
use crate::notify::Notifier;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(120);
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Final status of a CI watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CiStatus {
    Success,
    Failure,
    Pending,
    Timeout,
}

/// Configuration for one watch.
#[derive(Debug, Clone)]
pub struct CiWatchOptions {
    pub pr_number: u64,
    /// Polling interval; non-positive values fall back to the default.
    pub interval: Duration,
    /// Total watch ceiling; non-positive values fall back to the default.
    pub timeout: Duration,
    /// Check-name patterns that must pass. Trailing `*` matches any suffix.
    /// Empty means all reported checks.
    pub required_checks: Vec<String>,
}

impl CiWatchOptions {
    pub fn new(pr_number: u64) -> Self {
        Self {
            pr_number,
            interval: DEFAULT_INTERVAL,
            timeout: DEFAULT_TIMEOUT,
            required_checks: Vec::new(),
        }
    }

    fn normalized(mut self) -> Self {
        if self.interval.is_zero() {
            self.interval = DEFAULT_INTERVAL;
        }
        if self.timeout.is_zero() {
            self.timeout = DEFAULT_TIMEOUT;
        }
        self
    }
}

/// Outcome of a watch; persisted as the `ci.json` artifact.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CiWatchResult {
    pub status: CiStatus,
    pub checks: Vec<CheckResult>,
    pub elapsed_ms: u64,
}

/// Progress callback invoked after every poll.
pub type CiProgress<'a> = &'a dyn Fn(Duration, &[CheckResult]);

/// Watch PR checks until success, failure, or timeout.
///
/// Returns `Ok` with the terminal result; `Err` on cancellation, on a
/// required pattern matching no checks (`RequiredCheckMissing`), or when the
/// check lister fails permanently. The terminal transition rings the bell
/// exactly once.
#[instrument(skip_all, fields(pr_number = opts.pr_number))]
pub fn watch_pr_checks(
    cancel: &CancelToken,
    lister: &dyn CheckLister,
    opts: CiWatchOptions,
    notifier: &Notifier,
    progress: Option<CiProgress<'_>>,
) -> Result<CiWatchResult> {
    cancel.check()?;
    let opts = opts.normalized();
    let start = Instant::now();

    info!(
        interval_secs = opts.interval.as_secs(),
        timeout_secs = opts.timeout.as_secs(),
        required = ?opts.required_checks,
        "starting CI watch"
    );

    loop {
        let elapsed = start.elapsed();
        if elapsed >= opts.timeout {
            warn!(elapsed_ms = elapsed.as_millis() as u64, "CI watch timed out");
            notifier.bell();
            return Ok(CiWatchResult {
                status: CiStatus::Timeout,
                checks: Vec::new(),
                elapsed_ms: elapsed.as_millis() as u64,
            });
        }

        let checks = fetch_checks(cancel, lister, opts.pr_number)?;
        let filtered = filter_checks(&checks, &opts.required_checks);

        if !opts.required_checks.is_empty() && filtered.is_empty() {
            return Err(AtlasError::RequiredCheckMissing {
                patterns: opts.required_checks.clone(),
            }
            .into());
        }

        let status = overall_status(&filtered);
        let elapsed = start.elapsed();
        debug!(
            ?status,
            check_count = filtered.len(),
            elapsed_ms = elapsed.as_millis() as u64,
            "CI poll completed"
        );

        if let Some(report) = progress {
            report(elapsed, &filtered);
        }

        match status {
            CiStatus::Success | CiStatus::Failure => {
                notifier.bell();
                return Ok(CiWatchResult {
                    status,
                    checks: filtered,
                    elapsed_ms: elapsed.as_millis() as u64,
                });
            }
            CiStatus::Pending => {
                let remaining = opts.timeout.saturating_sub(elapsed);
                cancel.sleep(opts.interval.min(remaining))?;
            }
            CiStatus::Timeout => unreachable!("timeout handled at loop head"),
        }
    }
}

fn fetch_checks(
    cancel: &CancelToken,
    lister: &dyn CheckLister,
    pr_number: u64,
) -> Result<Vec<CheckResult>> {
    retry_with_backoff(cancel, &RetryPolicy::default(), classify_gh_error, |_| {
        lister.list_checks(pr_number)
    })
    .context("fetch PR checks")
}

/// Filter checks by required patterns. Empty pattern list keeps everything.
pub fn filter_checks(checks: &[CheckResult], required: &[String]) -> Vec<CheckResult> {
    if required.is_empty() {
        return checks.to_vec();
    }
    checks
        .iter()
        .filter(|check| required.iter().any(|p| matches_pattern(&check.name, p)))
        .cloned()
        .collect()
}

/// Exact match, or prefix match for patterns ending in `*`.
fn matches_pattern(name: &str, pattern: &str) -> bool {
    if pattern == name {
        return true;
    }
    match pattern.strip_suffix('*') {
        Some(prefix) => name.starts_with(prefix),
        None => false,
    }
}

/// Overall status of the filtered set.
///
/// Failure dominates; unknown buckets are treated as pending; an empty set is
/// pending (we never report success on no evidence).
pub fn overall_status(checks: &[CheckResult]) -> CiStatus {
    if checks.is_empty() {
        return CiStatus::Pending;
    }
    let mut has_pending = false;
    for check in checks {
        match check.bucket {
            CheckBucket::Fail | CheckBucket::Cancel => return CiStatus::Failure,
            CheckBucket::Pending | CheckBucket::Unknown => has_pending = true,
            CheckBucket::Pass | CheckBucket::Skipping => {}
        }
    }
    if has_pending {
        CiStatus::Pending
    } else {
        CiStatus::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::ScriptedChecks;
    use std::sync::Mutex;

    fn check(name: &str, bucket: CheckBucket) -> CheckResult {
        CheckResult {
            name: name.to_string(),
            state: String::new(),
            bucket,
            started_at: String::new(),
            completed_at: String::new(),
            description: String::new(),
            workflow: String::new(),
            url: String::new(),
        }
    }

    fn fast_opts(required: &[&str]) -> CiWatchOptions {
        CiWatchOptions {
            pr_number: 7,
            interval: Duration::from_millis(10),
            timeout: Duration::from_millis(50),
            required_checks: required.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn timeout_when_checks_stay_pending() {
        let lister = ScriptedChecks::repeating(vec![check("CI", CheckBucket::Pending)]);
        let notifier = Notifier::new(false);
        let cancel = CancelToken::new();

        let result =
            watch_pr_checks(&cancel, &lister, fast_opts(&["CI*"]), &notifier, None).expect("watch");

        assert_eq!(result.status, CiStatus::Timeout);
        assert!(result.elapsed_ms >= 50);
        assert_eq!(notifier.rung_count(), 1, "bell once on timeout");
    }

    #[test]
    fn wildcard_filter_and_failure_detection() {
        let lister = ScriptedChecks::repeating(vec![
            check("CI / lint", CheckBucket::Pass),
            check("CI / test", CheckBucket::Fail),
            check("Optional", CheckBucket::Pass),
        ]);
        let notifier = Notifier::new(false);
        let cancel = CancelToken::new();

        let result =
            watch_pr_checks(&cancel, &lister, fast_opts(&["CI*"]), &notifier, None).expect("watch");

        assert_eq!(result.status, CiStatus::Failure);
        assert_eq!(result.checks.len(), 2, "filtered to CI-prefixed checks");
        assert_eq!(notifier.rung_count(), 1, "bell emitted");
    }

    #[test]
    fn success_when_all_required_pass() {
        let lister = ScriptedChecks::repeating(vec![
            check("CI / lint", CheckBucket::Pass),
            check("CI / docs", CheckBucket::Skipping),
        ]);
        let notifier = Notifier::new(false);
        let cancel = CancelToken::new();

        let result =
            watch_pr_checks(&cancel, &lister, fast_opts(&["CI*"]), &notifier, None).expect("watch");

        assert_eq!(result.status, CiStatus::Success);
        assert_eq!(notifier.rung_count(), 1);
    }

    #[test]
    fn required_pattern_matching_nothing_is_an_error() {
        let lister = ScriptedChecks::repeating(vec![check("Other", CheckBucket::Pass)]);
        let notifier = Notifier::new(false);
        let cancel = CancelToken::new();

        let err = watch_pr_checks(&cancel, &lister, fast_opts(&["CI*"]), &notifier, None)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AtlasError>(),
            Some(AtlasError::RequiredCheckMissing { .. })
        ));
    }

    #[test]
    fn empty_required_and_empty_response_stays_pending_until_timeout() {
        let lister = ScriptedChecks::repeating(Vec::new());
        let notifier = Notifier::new(false);
        let cancel = CancelToken::new();

        let result =
            watch_pr_checks(&cancel, &lister, fast_opts(&[]), &notifier, None).expect("watch");
        assert_eq!(result.status, CiStatus::Timeout);
    }

    #[test]
    fn pending_then_success_across_polls() {
        let lister = ScriptedChecks::sequence(vec![
            vec![check("CI", CheckBucket::Pending)],
            vec![check("CI", CheckBucket::Pass)],
        ]);
        let notifier = Notifier::new(false);
        let cancel = CancelToken::new();

        let mut opts = fast_opts(&[]);
        opts.timeout = Duration::from_secs(5);
        let result = watch_pr_checks(&cancel, &lister, opts, &notifier, None).expect("watch");
        assert_eq!(result.status, CiStatus::Success);
    }

    #[test]
    fn zero_interval_and_timeout_fall_back_to_defaults() {
        let opts = CiWatchOptions {
            pr_number: 1,
            interval: Duration::ZERO,
            timeout: Duration::ZERO,
            required_checks: Vec::new(),
        }
        .normalized();
        assert_eq!(opts.interval, DEFAULT_INTERVAL);
        assert_eq!(opts.timeout, DEFAULT_TIMEOUT);
    }

    #[test]
    fn progress_callback_sees_filtered_checks() {
        let lister = ScriptedChecks::repeating(vec![
            check("CI / lint", CheckBucket::Pass),
            check("Other", CheckBucket::Pass),
        ]);
        let notifier = Notifier::new(false);
        let cancel = CancelToken::new();
        let seen: Mutex<Vec<usize>> = Mutex::new(Vec::new());

        let record = |_elapsed: Duration, checks: &[CheckResult]| {
            seen.lock().expect("lock").push(checks.len());
        };
        watch_pr_checks(&cancel, &lister, fast_opts(&["CI*"]), &notifier, Some(&record))
            .expect("watch");

        assert_eq!(*seen.lock().expect("lock"), vec![1]);
    }

    #[test]
    fn cancelled_watch_stops_promptly() {
        let lister = ScriptedChecks::repeating(vec![check("CI", CheckBucket::Pending)]);
        let notifier = Notifier::new(false);
        let cancel = CancelToken::new();
        cancel.cancel();

        let err =
            watch_pr_checks(&cancel, &lister, fast_opts(&[]), &notifier, None).unwrap_err();
        assert!(crate::core::error::is_cancelled(&err));
    }
}
