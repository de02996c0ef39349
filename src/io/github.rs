//! GitHub CLI adapter: PR creation, PR lookup, and check listing.
//!
//! All calls shell out to `gh`. The check-listing seam is a trait so the CI
//! watcher can be driven by scripted results in tests.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::core::cancel::CancelToken;
use crate::core::error::AtlasError;
use crate::core::retry::ErrorClass;
use crate::io::process::{run_checked, CommandError, CommandErrorKind};

const OUTPUT_LIMIT: usize = 100_000;

/// Categorical outcome of an external check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckBucket {
    Pass,
    Fail,
    Pending,
    Skipping,
    Cancel,
    /// Anything the CLI starts reporting that we do not know yet; treated as
    /// pending by the watcher.
    #[serde(other)]
    Unknown,
}

/// One CI check as reported by `gh pr checks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckResult {
    pub name: String,
    #[serde(default)]
    pub state: String,
    pub bucket: CheckBucket,
    #[serde(default, rename = "startedAt")]
    pub started_at: String,
    #[serde(default, rename = "completedAt")]
    pub completed_at: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub workflow: String,
    #[serde(default, rename = "link")]
    pub url: String,
}

impl CheckResult {
    /// Check runtime from timestamps; zero when not derivable.
    pub fn duration(&self) -> Duration {
        let Ok(start) = chrono::DateTime::parse_from_rfc3339(&self.started_at) else {
            return Duration::ZERO;
        };
        let end = match chrono::DateTime::parse_from_rfc3339(&self.completed_at) {
            Ok(end) => end,
            Err(_) => return Duration::ZERO,
        };
        (end - start).to_std().unwrap_or(Duration::ZERO)
    }
}

/// A created or discovered pull request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrInfo {
    pub number: u64,
    pub url: String,
}

/// Check-listing seam used by the CI watcher. `Sync` so parallel step groups
/// can share one lister.
pub trait CheckLister: Sync {
    fn list_checks(&self, pr_number: u64) -> Result<Vec<CheckResult>>;
}

/// `gh` CLI runner bound to a working directory and cancellation scope.
#[derive(Debug, Clone)]
pub struct GhRunner {
    workdir: PathBuf,
    cancel: CancelToken,
    timeout: Duration,
}

impl GhRunner {
    pub fn new(workdir: impl Into<PathBuf>, cancel: CancelToken, timeout: Duration) -> Self {
        Self {
            workdir: workdir.into(),
            cancel,
            timeout,
        }
    }

    /// Create a PR for the current branch. Maps failures to
    /// `AtlasError::PrCreationFailed` so the engine routes to `gh_failed`.
    #[instrument(skip_all, fields(title))]
    pub fn create_pr(&self, title: &str, body: &str, base: &str) -> Result<PrInfo> {
        let out = self
            .run(&[
                "pr", "create", "--title", title, "--body", body, "--base", base,
            ])
            .map_err(|err| {
                if is_gh_permanent(&err) {
                    anyhow::Error::new(AtlasError::PrCreationFailed(format!("{err:#}")))
                } else {
                    err
                }
            })?;
        let url = out.trim().lines().last().unwrap_or("").to_string();
        let number = parse_pr_number(&url)
            .ok_or_else(|| anyhow!("could not parse PR number from '{url}'"))?;
        debug!(number, %url, "created PR");
        Ok(PrInfo { number, url })
    }

    /// Look up the open PR for the current branch, if one exists.
    ///
    /// Used before retrying an ambiguous `pr create` failure to avoid
    /// double-creation.
    pub fn find_existing_pr(&self) -> Result<Option<PrInfo>> {
        let out = self.run(&["pr", "view", "--json", "number,url"]);
        match out {
            Ok(json) => {
                let info: PrInfo = serde_json::from_str(json.trim())
                    .with_context(|| format!("parse gh pr view output: {json}"))?;
                Ok(Some(info))
            }
            Err(err) => {
                let text = format!("{err:#}").to_lowercase();
                if text.contains("no pull requests found") || text.contains("not found") {
                    return Ok(None);
                }
                Err(err)
            }
        }
    }

    /// Update the PR body (used by the `pr_update` git action).
    pub fn update_pr(&self, number: u64, body: &str) -> Result<()> {
        self.run(&["pr", "edit", &number.to_string(), "--body", body])?;
        Ok(())
    }

    fn run(&self, args: &[&str]) -> Result<String> {
        let out = run_checked(
            &self.cancel,
            &self.workdir,
            "gh",
            args,
            self.timeout,
            OUTPUT_LIMIT,
        )?;
        Ok(out.stdout)
    }
}

impl CheckLister for GhRunner {
    fn list_checks(&self, pr_number: u64) -> Result<Vec<CheckResult>> {
        let out = self.run(&[
            "pr",
            "checks",
            &pr_number.to_string(),
            "--json",
            "name,state,bucket,completedAt,startedAt,description,workflow,link",
        ])?;
        parse_check_results(&out)
    }
}

/// Parse JSON output from `gh pr checks`. Empty output means no checks
/// reported.
pub fn parse_check_results(output: &str) -> Result<Vec<CheckResult>> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Ok(Vec::new());
    }
    serde_json::from_str(trimmed).context("parse gh pr checks JSON")
}

fn parse_pr_number(url: &str) -> Option<u64> {
    url.rsplit('/').next()?.trim().parse().ok()
}

/// Classify a GitHub CLI failure for the retry controller.
///
/// Unknown `gh` errors are treated as transient: the CLI surfaces plenty of
/// recoverable conditions with nonspecific messages.
pub fn classify_gh_error(err: &anyhow::Error) -> ErrorClass {
    if let Some(cmd_err) = err.downcast_ref::<CommandError>() {
        return match cmd_err.kind {
            CommandErrorKind::Cancelled => ErrorClass::Cancelled,
            CommandErrorKind::Timeout => ErrorClass::Transient,
            CommandErrorKind::NotFound => ErrorClass::Permanent,
            CommandErrorKind::Io => ErrorClass::Permanent,
            CommandErrorKind::NonZeroExit => classify_gh_detail(&cmd_err.detail),
        };
    }
    match crate::core::retry::classify_by_kind(err) {
        ErrorClass::Cancelled => ErrorClass::Cancelled,
        _ if is_gh_permanent(err) => ErrorClass::Permanent,
        _ => ErrorClass::Transient,
    }
}

fn classify_gh_detail(detail: &str) -> ErrorClass {
    let lower = detail.to_lowercase();
    const PERMANENT: &[&str] = &[
        "401",
        "403",
        "404",
        "authentication",
        "gh auth login",
        "not found",
        "could not find",
        "forbidden",
    ];
    if PERMANENT.iter().any(|marker| lower.contains(marker)) {
        ErrorClass::Permanent
    } else {
        ErrorClass::Transient
    }
}

fn is_gh_permanent(err: &anyhow::Error) -> bool {
    if let Some(cmd_err) = err.downcast_ref::<CommandError>() {
        if cmd_err.kind == CommandErrorKind::NonZeroExit {
            return classify_gh_detail(&cmd_err.detail) == ErrorClass::Permanent;
        }
    }
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_check_results_json() {
        let json = r#"[
            {"name":"CI / lint","state":"SUCCESS","bucket":"pass",
             "startedAt":"2026-01-01T10:00:00Z","completedAt":"2026-01-01T10:01:30Z",
             "description":"","workflow":"CI","link":"https://example.test/1"},
            {"name":"CI / test","state":"FAILURE","bucket":"fail",
             "startedAt":"","completedAt":"","description":"","workflow":"CI","link":""}
        ]"#;
        let checks = parse_check_results(json).expect("parse");
        assert_eq!(checks.len(), 2);
        assert_eq!(checks[0].bucket, CheckBucket::Pass);
        assert_eq!(checks[0].duration(), Duration::from_secs(90));
        assert_eq!(checks[1].bucket, CheckBucket::Fail);
        assert_eq!(checks[1].duration(), Duration::ZERO);
    }

    #[test]
    fn empty_output_means_no_checks() {
        assert!(parse_check_results("  \n").expect("parse").is_empty());
    }

    #[test]
    fn unknown_bucket_deserializes_without_error() {
        let json = r#"[{"name":"x","state":"","bucket":"mystery"}]"#;
        let checks = parse_check_results(json).expect("parse");
        assert_eq!(checks[0].bucket, CheckBucket::Unknown);
    }

    #[test]
    fn pr_number_parsed_from_url() {
        assert_eq!(parse_pr_number("https://github.com/o/r/pull/42"), Some(42));
        assert_eq!(parse_pr_number("nonsense"), None);
    }

    #[test]
    fn auth_failures_classify_permanent() {
        let err: anyhow::Error = CommandError {
            kind: CommandErrorKind::NonZeroExit,
            program: "gh".to_string(),
            detail: "HTTP 401: authentication required (gh auth login)".to_string(),
        }
        .into();
        assert_eq!(classify_gh_error(&err), ErrorClass::Permanent);
    }

    #[test]
    fn unknown_gh_failures_classify_transient() {
        let err: anyhow::Error = CommandError {
            kind: CommandErrorKind::NonZeroExit,
            program: "gh".to_string(),
            detail: "something flaky happened".to_string(),
        }
        .into();
        assert_eq!(classify_gh_error(&err), ErrorClass::Transient);
    }
}
