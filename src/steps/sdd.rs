//! SDD step: drive the spec-driven development CLI.

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use crate::core::cancel::CancelToken;
use crate::core::retry::{retry_with_backoff, RetryPolicy};
use crate::core::task::Task;
use crate::core::template::{StepAction, StepSpec};
use crate::io::ai::classify_ai_error;
use crate::io::process::run_checked;
use crate::steps::{Deps, StepExecutor, StepOutcome};

pub struct SddStep;

impl StepExecutor for SddStep {
    fn execute(
        &self,
        cancel: &CancelToken,
        task: &Task,
        spec: &StepSpec,
        deps: &Deps<'_>,
    ) -> Result<StepOutcome> {
        let StepAction::Sdd { command } = &spec.action else {
            unreachable!("dispatched on action tag");
        };

        let timeout = spec.timeout().unwrap_or_else(|| deps.config.ai_timeout());
        let policy = RetryPolicy::default().with_extra_attempts(spec.retry_count);
        let output = retry_with_backoff(cancel, &policy, classify_ai_error, |_| {
            run_checked(
                cancel,
                &deps.workspace.worktree_path,
                &deps.config.ai.sdd_command,
                &[command.as_str(), task.description.as_str()],
                timeout,
                deps.config.output_limit_bytes,
            )
        })
        .with_context(|| format!("sdd step '{}'", spec.name))?;

        let payload = serde_json::to_vec_pretty(&json!({
            "command": command,
            "stdout": output.stdout,
            "stderr": output.stderr,
            "duration_ms": output.duration.as_millis() as u64,
        }))
        .context("serialize sdd result")?;
        let artifact = deps
            .store
            .save_versioned_artifact(
                &task.workspace,
                &task.id,
                &format!("{}.json", spec.name),
                &payload,
            )
            .context("persist sdd artifact")?;

        info!(step = %spec.name, command = %command, "sdd step completed");
        Ok(StepOutcome::success().with_artifact(artifact))
    }
}
