//! Git adapter for engine operations.
//!
//! The engine commits deterministically and supervises worktrees, so we keep
//! a small, explicit wrapper around `git` subprocess calls. Network-facing
//! operations (push) are classified for the retry controller.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Result};
use tracing::{debug, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::error::AtlasError;
use crate::core::retry::ErrorClass;
use crate::io::process::{run_checked, run_command, CommandError, CommandErrorKind};

/// Ceiling for local plumbing commands; network operations pass their own.
const LOCAL_TIMEOUT: Duration = Duration::from_secs(60);
const OUTPUT_LIMIT: usize = 100_000;

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
    cancel: CancelToken,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>, cancel: CancelToken) -> Self {
        Self {
            workdir: workdir.into(),
            cancel,
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to operate)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    pub fn has_changes(&self) -> Result<bool> {
        Ok(!self.status_porcelain()?.is_empty())
    }

    /// Stage all changes (respects .gitignore).
    pub fn stage_all(&self) -> Result<()> {
        self.checked(&["add", "-A"], LOCAL_TIMEOUT)?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.capture(&["diff", "--cached", "--name-only"])?;
        Ok(!out.trim().is_empty())
    }

    /// Commit staged changes, appending footer trailers after a blank line.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit(&self, message: &str, trailers: &[String]) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        let mut full = message.trim_end().to_string();
        if !trailers.is_empty() {
            full.push_str("\n\n");
            full.push_str(&trailers.join("\n"));
        }
        debug!("committing staged changes");
        self.checked(&["commit", "-m", &full], LOCAL_TIMEOUT)?;
        Ok(true)
    }

    /// Discard uncommitted changes and untracked files in the worktree.
    pub fn clean(&self) -> Result<()> {
        self.checked(&["checkout", "--", "."], LOCAL_TIMEOUT)?;
        self.checked(&["clean", "-fd"], LOCAL_TIMEOUT)?;
        Ok(())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let out = run_command(
            &self.cancel,
            &self.workdir,
            "git",
            &[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ],
            LOCAL_TIMEOUT,
            OUTPUT_LIMIT,
        )?;
        Ok(out.success())
    }

    /// Create and checkout a new branch at current HEAD.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_new_branch(&self, branch: &str) -> Result<()> {
        debug!(branch, "creating and checking out new branch");
        self.checked(&["checkout", "-b", branch], LOCAL_TIMEOUT)?;
        Ok(())
    }

    /// Push the branch, setting upstream. Maps remote rejections to
    /// `AtlasError::PushRejected` so the engine can route to `gh_failed`.
    #[instrument(skip_all, fields(branch))]
    pub fn push(&self, branch: &str, timeout: Duration) -> Result<()> {
        let result = self.checked(&["push", "--set-upstream", "origin", branch], timeout);
        match result {
            Ok(_) => Ok(()),
            Err(err) => {
                let text = format!("{err:#}");
                if text.contains("[rejected]") || text.contains("failed to push") {
                    Err(anyhow::Error::new(AtlasError::PushRejected(text)))
                } else {
                    Err(err)
                }
            }
        }
    }

    // --- worktrees ---

    /// Add a worktree at `path` on a new `branch` created from `base`.
    #[instrument(skip_all, fields(branch, path = %path.display()))]
    pub fn worktree_add(&self, path: &Path, branch: &str, base: &str) -> Result<()> {
        let path_str = path.to_string_lossy();
        debug!("adding worktree");
        self.checked(
            &["worktree", "add", "-b", branch, path_str.as_ref(), base],
            LOCAL_TIMEOUT,
        )?;
        Ok(())
    }

    /// Remove a worktree. With `force`, uncommitted changes are discarded.
    /// Missing worktrees are not an error (idempotent cleanup).
    pub fn worktree_remove(&self, path: &Path, force: bool) -> Result<()> {
        if !path.exists() {
            self.prune_worktrees();
            return Ok(());
        }
        let path_str = path.to_string_lossy();
        let mut args = vec!["worktree", "remove"];
        if force {
            args.push("--force");
        }
        args.push(path_str.as_ref());
        self.checked(&args, LOCAL_TIMEOUT)?;
        Ok(())
    }

    /// Drop stale worktree registrations; best-effort.
    pub fn prune_worktrees(&self) {
        let _ = run_command(
            &self.cancel,
            &self.workdir,
            "git",
            &["worktree", "prune"],
            LOCAL_TIMEOUT,
            OUTPUT_LIMIT,
        );
    }

    fn capture(&self, args: &[&str]) -> Result<String> {
        Ok(self.checked(args, LOCAL_TIMEOUT)?.stdout)
    }

    fn checked(&self, args: &[&str], timeout: Duration) -> Result<crate::io::process::CommandOutput> {
        run_checked(
            &self.cancel,
            &self.workdir,
            "git",
            args,
            timeout,
            OUTPUT_LIMIT,
        )
    }
}

/// Build a conventional commit subject from the porcelain status summary.
///
/// Used by the `smart_commit` git action when the template does not supply a
/// message.
pub fn smart_commit_message(description: &str, entries: &[StatusEntry]) -> String {
    let added = entries.iter().filter(|e| e.code.contains('A') || e.code == "??").count();
    let deleted = entries.iter().filter(|e| e.code.contains('D')).count();
    let summary = match (added, deleted) {
        (0, 0) => format!("{} files changed", entries.len()),
        (a, 0) => format!("{} files changed, {a} added", entries.len()),
        (0, d) => format!("{} files changed, {d} removed", entries.len()),
        (a, d) => format!("{} files changed, {a} added, {d} removed", entries.len()),
    };
    let subject = if description.is_empty() {
        "chore: apply workspace changes".to_string()
    } else {
        let mut line = description.trim().trim_end_matches('.').to_string();
        if let Some(first) = line.get(0..1) {
            line.replace_range(0..1, &first.to_lowercase());
        }
        format!("feat: {line}")
    };
    format!("{subject}\n\n{summary}")
}

/// Classify a git failure for the retry controller.
///
/// Network hiccups retry; local errors (bad ref, conflicts, auth) surface
/// immediately.
pub fn classify_git_error(err: &anyhow::Error) -> ErrorClass {
    if let Some(cmd_err) = err.downcast_ref::<CommandError>() {
        return match cmd_err.kind {
            CommandErrorKind::Cancelled => ErrorClass::Cancelled,
            CommandErrorKind::Timeout => ErrorClass::Transient,
            CommandErrorKind::NotFound | CommandErrorKind::Io => ErrorClass::Permanent,
            CommandErrorKind::NonZeroExit => classify_git_detail(&cmd_err.detail),
        };
    }
    crate::core::retry::classify_by_kind(err)
}

fn classify_git_detail(detail: &str) -> ErrorClass {
    let lower = detail.to_lowercase();
    const TRANSIENT: &[&str] = &[
        "could not resolve host",
        "connection reset",
        "connection refused",
        "connection timed out",
        "operation timed out",
        "early eof",
        "remote hung up",
        "the remote end hung up",
        "502",
        "503",
        "504",
    ];
    if TRANSIENT.iter().any(|marker| lower.contains(marker)) {
        ErrorClass::Transient
    } else {
        ErrorClass::Permanent
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}
