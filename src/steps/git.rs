//! Git step: branch, clean, stage, commit, smart-commit, push, PR create,
//! PR update.
//!
//! Push and PR creation are not idempotent, so a pre-intent marker artifact
//! is written before invoking; a post-crash reader can tell a completed side
//! effect from one that never started. On retry after an ambiguous failure,
//! PR creation first queries remote state to avoid double-creation.

use anyhow::{Context, Result};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, info};

use crate::core::cancel::CancelToken;
use crate::core::error::AtlasError;
use crate::core::retry::{retry_with_backoff, RetryPolicy};
use crate::core::task::Task;
use crate::core::template::{GitOp, StepAction, StepSpec};
use crate::io::git::{classify_git_error, smart_commit_message};
use crate::io::github::{classify_gh_error, PrInfo};
use crate::steps::{Deps, StepExecutor, StepOutcome, PR_NUMBER_VAR};

pub struct GitStep;

impl StepExecutor for GitStep {
    fn execute(
        &self,
        cancel: &CancelToken,
        task: &Task,
        spec: &StepSpec,
        deps: &Deps<'_>,
    ) -> Result<StepOutcome> {
        cancel.check()?;
        let StepAction::Git { op } = &spec.action else {
            unreachable!("dispatched on action tag");
        };

        match op {
            GitOp::Branch => ensure_branch(deps),
            GitOp::Clean => {
                deps.git.clean()?;
                Ok(StepOutcome::success())
            }
            GitOp::Stage => {
                deps.git.stage_all()?;
                Ok(StepOutcome::success())
            }
            GitOp::Commit => commit(task, deps, false),
            GitOp::SmartCommit => commit(task, deps, true),
            GitOp::Push => push(cancel, task, spec, deps),
            GitOp::Pr => create_pr(cancel, task, spec, deps),
            GitOp::PrUpdate => update_pr(task, deps),
        }
    }
}

fn ensure_branch(deps: &Deps<'_>) -> Result<StepOutcome> {
    let current = deps.git.current_branch()?;
    anyhow::ensure!(
        current == deps.workspace.branch,
        "worktree is on '{current}', expected '{}'",
        deps.workspace.branch
    );
    Ok(StepOutcome::success())
}

fn commit(task: &Task, deps: &Deps<'_>, smart: bool) -> Result<StepOutcome> {
    deps.git.stage_all()?;
    let message = if smart {
        smart_commit_message(&task.description, &deps.git.status_porcelain()?)
    } else if task.description.is_empty() {
        "apply task changes".to_string()
    } else {
        task.description.clone()
    };

    // Every engine commit is traceable back to its task via a footer trailer.
    let mut trailers = deps.config.git.commit_trailers.clone();
    trailers.push(format!("Atlas-Task: {}", task.id));

    let committed = deps.git.commit(&message, &trailers)?;
    if !committed {
        debug!("nothing staged, commit skipped");
        return Ok(StepOutcome::skipped("nothing to commit"));
    }
    info!("committed staged changes");
    Ok(StepOutcome::success().with_output(message.lines().next().unwrap_or("").to_string()))
}

fn push(
    cancel: &CancelToken,
    task: &Task,
    spec: &StepSpec,
    deps: &Deps<'_>,
) -> Result<StepOutcome> {
    write_intent(task, deps, "push", &deps.workspace.branch)?;

    let timeout = spec.timeout().unwrap_or_else(|| deps.config.network_timeout());
    let policy = RetryPolicy::default().with_extra_attempts(spec.retry_count);
    retry_with_backoff(cancel, &policy, classify_git_error, |_| {
        deps.git.push(&deps.workspace.branch, timeout)
    })
    .with_context(|| format!("push branch '{}'", deps.workspace.branch))?;

    info!(branch = %deps.workspace.branch, "branch pushed");
    Ok(StepOutcome::success().with_artifact("push.intent.json".to_string()))
}

fn create_pr(
    cancel: &CancelToken,
    task: &Task,
    spec: &StepSpec,
    deps: &Deps<'_>,
) -> Result<StepOutcome> {
    // A PR may already exist from a crashed or rejected earlier run.
    if let Some(existing) = deps.gh.find_existing_pr()? {
        info!(number = existing.number, "reusing existing PR");
        return pr_outcome(task, deps, existing);
    }

    write_intent(task, deps, "pr", &deps.workspace.branch)?;

    let title = pr_title(task);
    let body = format!("{}\n\n---\nTask: {}", task.description, task.id);
    let policy = RetryPolicy::default().with_extra_attempts(spec.retry_count);
    let info = retry_with_backoff(cancel, &policy, classify_gh_error, |attempt| {
        if attempt > 1 {
            // The previous attempt failed ambiguously; the PR may exist.
            if let Some(existing) = deps.gh.find_existing_pr()? {
                return Ok(existing);
            }
        }
        deps.gh
            .create_pr(&title, &body, &deps.workspace.base_branch)
    })
    .context("create pull request")?;

    info!(number = info.number, url = %info.url, "pull request ready");
    pr_outcome(task, deps, info)
}

fn pr_outcome(task: &Task, deps: &Deps<'_>, info: PrInfo) -> Result<StepOutcome> {
    let payload = serde_json::to_vec_pretty(&info).context("serialize pr info")?;
    deps.store
        .save_artifact(&task.workspace, &task.id, "pr.json", &payload)
        .context("persist pr artifact")?;
    Ok(StepOutcome::success()
        .with_artifact("pr.json".to_string())
        .with_output(info.url.clone())
        .with_variable(PR_NUMBER_VAR, &info.number.to_string())
        .with_variable("pr_url", &info.url))
}

fn update_pr(task: &Task, deps: &Deps<'_>) -> Result<StepOutcome> {
    let number: u64 = task
        .variable(PR_NUMBER_VAR)
        .ok_or_else(|| AtlasError::NotFound("pr_number variable".to_string()))?
        .parse()
        .context("parse pr_number variable")?;
    let body = format!("{}\n\n---\nTask: {}", task.description, task.id);
    deps.gh.update_pr(number, &body)?;
    Ok(StepOutcome::success())
}

fn pr_title(task: &Task) -> String {
    let first_line = task.description.lines().next().unwrap_or("").trim();
    if first_line.is_empty() {
        format!("ATLAS task {}", task.id)
    } else {
        first_line.to_string()
    }
}

/// Marker artifact written before a non-idempotent side effect.
fn write_intent(task: &Task, deps: &Deps<'_>, op: &str, branch: &str) -> Result<()> {
    let payload = serde_json::to_vec_pretty(&json!({
        "operation": op,
        "branch": branch,
        "at": Utc::now().to_rfc3339(),
    }))
    .context("serialize intent marker")?;
    deps.store
        .save_artifact(&task.workspace, &task.id, &format!("{op}.intent.json"), &payload)
        .with_context(|| format!("persist {op} intent marker"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pr_title_falls_back_to_task_id() {
        let task = Task::new_for_test("ws", "feature");
        assert_eq!(pr_title(&task), format!("ATLAS task {}", task.id));
    }

    #[test]
    fn pr_title_uses_first_description_line() {
        let mut task = Task::new_for_test("ws", "feature");
        task.description = "Add login flow\n\nmore detail".to_string();
        assert_eq!(pr_title(&task), "Add login flow");
    }

    // Commit, stage, and branch behavior runs against a real temp repository
    // in tests/engine_lifecycle.rs.
}
