//! CI step: watch PR checks recorded by an earlier git step.

use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use crate::ci::{watch_pr_checks, CiStatus, CiWatchOptions};
use crate::core::cancel::CancelToken;
use crate::core::error::AtlasError;
use crate::core::task::Task;
use crate::core::template::StepSpec;
use crate::steps::{Deps, StepExecutor, StepOutcome, PR_NUMBER_VAR, SKIP_GIT_STEPS_VAR};

pub struct CiStep;

impl StepExecutor for CiStep {
    fn execute(
        &self,
        cancel: &CancelToken,
        task: &Task,
        spec: &StepSpec,
        deps: &Deps<'_>,
    ) -> Result<StepOutcome> {
        if task.variable(SKIP_GIT_STEPS_VAR) == Some("true") {
            return Ok(StepOutcome::skipped("no changes were pushed"));
        }
        let Some(pr_number) = task.variable(PR_NUMBER_VAR) else {
            return Ok(StepOutcome::skipped("no PR recorded for this task"));
        };
        let pr_number: u64 = pr_number.parse().context("parse pr_number variable")?;

        let mut opts = CiWatchOptions::new(pr_number);
        opts.interval = Duration::from_secs(deps.config.ci.interval_secs);
        opts.timeout = spec
            .timeout()
            .unwrap_or(Duration::from_secs(deps.config.ci.timeout_secs));
        opts.required_checks = deps.config.ci.required_checks.clone();

        let result = watch_pr_checks(cancel, deps.checks, opts, deps.notifier, None)?;

        let payload = serde_json::to_vec_pretty(&result).context("serialize ci result")?;
        let artifact = deps
            .store
            .save_versioned_artifact(&task.workspace, &task.id, "ci.json", &payload)
            .context("persist ci artifact")?;

        match result.status {
            CiStatus::Success => {
                info!(pr_number, elapsed_ms = result.elapsed_ms, "CI checks passed");
                Ok(StepOutcome::success()
                    .with_artifact(artifact)
                    .with_output(format!("CI passed after {}ms", result.elapsed_ms)))
            }
            CiStatus::Failure => Err(anyhow::Error::new(AtlasError::CiFailed)
                .context(format!("CI checks failed (details in {artifact})"))),
            CiStatus::Timeout => Err(anyhow::Error::new(AtlasError::CiTimeout)
                .context(format!("CI watch timed out (details in {artifact})"))),
            CiStatus::Pending => unreachable!("watcher never returns pending"),
        }
    }
}
