//! Human step: suspend the task for approval.

use anyhow::Result;

use crate::core::cancel::CancelToken;
use crate::core::task::Task;
use crate::core::template::{StepAction, StepSpec};
use crate::steps::{Deps, StepExecutor, StepOutcome};

pub struct HumanStep;

impl StepExecutor for HumanStep {
    fn execute(
        &self,
        cancel: &CancelToken,
        _task: &Task,
        spec: &StepSpec,
        _deps: &Deps<'_>,
    ) -> Result<StepOutcome> {
        cancel.check()?;
        let StepAction::Human { prompt } = &spec.action else {
            unreachable!("dispatched on action tag");
        };
        Ok(StepOutcome::awaiting_approval(prompt))
    }
}
