//! AI step: invoke the AI CLI with a rendered prompt, persist the raw
//! response as an artifact.

use anyhow::{Context, Result};
use tracing::info;

use crate::core::cancel::CancelToken;
use crate::core::retry::{retry_with_backoff, RetryPolicy};
use crate::core::task::Task;
use crate::core::template::{render_vars, StepAction, StepSpec};
use crate::io::ai::{classify_ai_error, AiRequest};
use crate::steps::{Deps, OutcomeStatus, StepExecutor, StepOutcome};

pub struct AiStep;

impl StepExecutor for AiStep {
    fn execute(
        &self,
        cancel: &CancelToken,
        task: &Task,
        spec: &StepSpec,
        deps: &Deps<'_>,
    ) -> Result<StepOutcome> {
        let StepAction::Ai { prompt } = &spec.action else {
            unreachable!("dispatched on action tag");
        };

        let request = AiRequest {
            workdir: deps.workspace.worktree_path.clone(),
            prompt: render_vars(prompt, &task.variables),
            model: deps.config.ai.model.clone(),
            timeout: spec.timeout().unwrap_or_else(|| deps.config.ai_timeout()),
            output_limit_bytes: deps.config.output_limit_bytes,
        };

        let policy = RetryPolicy::default().with_extra_attempts(spec.retry_count);
        let result = retry_with_backoff(cancel, &policy, classify_ai_error, |_| {
            deps.ai.run(cancel, &request)
        })
        .with_context(|| format!("ai step '{}'", spec.name))?;

        let artifact = deps
            .store
            .save_versioned_artifact(
                &task.workspace,
                &task.id,
                &format!("{}.json", spec.name),
                result.raw.as_bytes(),
            )
            .context("persist ai artifact")?;

        info!(step = %spec.name, no_changes = result.no_changes, "ai step completed");

        let mut outcome = StepOutcome::success()
            .with_artifact(artifact)
            .with_output(result.summary);
        if result.no_changes {
            outcome.status = OutcomeStatus::NoChanges;
        }
        Ok(outcome)
    }
}
