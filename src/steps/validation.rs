//! Validation step: run the pipeline and persist the versioned
//! `validation.json` artifact.

use anyhow::{Context, Result};
use tracing::info;

use crate::core::cancel::CancelToken;
use crate::core::error::AtlasError;
use crate::core::task::Task;
use crate::core::template::StepSpec;
use crate::pipeline::run_pipeline;
use crate::steps::{Deps, StepExecutor, StepOutcome};

pub struct ValidationStep;

impl StepExecutor for ValidationStep {
    fn execute(
        &self,
        cancel: &CancelToken,
        task: &Task,
        spec: &StepSpec,
        deps: &Deps<'_>,
    ) -> Result<StepOutcome> {
        let result = run_pipeline(
            cancel,
            &deps.config.validation,
            &deps.workspace.worktree_path,
            deps.config.output_limit_bytes,
            deps.notifier,
        )?;

        let payload = serde_json::to_vec_pretty(&result).context("serialize pipeline result")?;
        let artifact = deps
            .store
            .save_versioned_artifact(&task.workspace, &task.id, "validation.json", &payload)
            .context("persist validation artifact")?;

        if !result.success {
            return Err(anyhow::Error::new(AtlasError::ValidationFailed {
                failed_step: result.failed_step.clone(),
            })
            .context(format!(
                "validation step '{}' failed at '{}' (details in {artifact})",
                spec.name, result.failed_step
            )));
        }

        info!(step = %spec.name, duration_ms = result.duration_ms, "validation passed");
        Ok(StepOutcome::success()
            .with_artifact(artifact)
            .with_output(format!("validation passed in {}ms", result.duration_ms)))
    }
}
