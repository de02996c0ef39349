//! Gather step: ensure declared inputs exist in the variable bag.
//!
//! Skipped when every input is already present; otherwise missing variables
//! are filled with empty values so later prompt rendering stays total. Never
//! fails fatally.

use anyhow::Result;
use tracing::debug;

use crate::core::cancel::CancelToken;
use crate::core::task::Task;
use crate::core::template::{StepAction, StepSpec};
use crate::steps::{Deps, StepExecutor, StepOutcome};

pub struct GatherStep;

impl StepExecutor for GatherStep {
    fn execute(
        &self,
        cancel: &CancelToken,
        task: &Task,
        spec: &StepSpec,
        _deps: &Deps<'_>,
    ) -> Result<StepOutcome> {
        cancel.check()?;
        let StepAction::Gather { variables } = &spec.action else {
            unreachable!("dispatched on action tag");
        };

        let missing: Vec<&String> = variables
            .iter()
            .filter(|name| task.variable(name).map(str::is_empty).unwrap_or(true))
            .collect();

        if missing.is_empty() {
            debug!(step = %spec.name, "all inputs present, skipping gather");
            return Ok(StepOutcome::skipped("inputs already present"));
        }

        let mut outcome = StepOutcome::success();
        for name in missing {
            outcome = outcome.with_variable(name, "");
        }
        Ok(outcome)
    }
}
