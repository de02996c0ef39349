//! Step executors: one adapter per step kind behind a single contract.
//!
//! Executors receive via [`Deps`] only the capabilities their step kind
//! needs, never the engine itself. They do not mutate the task; variable
//! updates travel back in the [`StepOutcome`] and are merged by the engine,
//! which keeps parallel groups race-free.

use anyhow::Result;

use crate::config::AtlasConfig;
use crate::core::cancel::CancelToken;
use crate::core::task::Task;
use crate::core::template::{StepAction, StepSpec};
use crate::core::workspace::Workspace;
use crate::io::ai::AiRunner;
use crate::io::git::Git;
use crate::io::github::{CheckLister, GhRunner};
use crate::io::store::FileStore;
use crate::notify::Notifier;

mod ai;
mod ci;
mod gather;
mod git;
mod human;
mod sdd;
mod validation;

/// Variable set by an AI step reporting no changes; push/PR steps consult it.
pub const SKIP_GIT_STEPS_VAR: &str = "skip_git_steps";
/// Variable holding the PR number recorded by the `pr` git action.
pub const PR_NUMBER_VAR: &str = "pr_number";
/// Variable carrying rejection feedback into rework prompts.
pub const FEEDBACK_VAR: &str = "feedback";

/// Capabilities handed to executors.
pub struct Deps<'a> {
    pub store: &'a FileStore,
    pub config: &'a AtlasConfig,
    pub notifier: &'a Notifier,
    pub workspace: &'a Workspace,
    pub git: &'a Git,
    pub gh: &'a GhRunner,
    pub ai: &'a dyn AiRunner,
    pub checks: &'a dyn CheckLister,
}

/// How a step concluded when it did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutcomeStatus {
    Success,
    /// The step ran but found nothing to do; downstream push/PR steps skip.
    NoChanges,
    /// Human gate reached; the engine suspends the task.
    AwaitingApproval,
    /// The step did not need to run.
    Skipped,
}

/// Result of one executor run.
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub status: OutcomeStatus,
    /// Artifact filenames written, in creation order.
    pub artifacts: Vec<String>,
    /// Short human-readable output (PR URL, summary line).
    pub output: String,
    /// Variable updates for the engine to merge into the task.
    pub variables: Vec<(String, String)>,
}

impl StepOutcome {
    pub fn success() -> Self {
        Self::with_status(OutcomeStatus::Success)
    }

    pub fn skipped(reason: &str) -> Self {
        let mut outcome = Self::with_status(OutcomeStatus::Skipped);
        outcome.output = reason.to_string();
        outcome
    }

    pub fn awaiting_approval(prompt: &str) -> Self {
        let mut outcome = Self::with_status(OutcomeStatus::AwaitingApproval);
        outcome.output = prompt.to_string();
        outcome
    }

    fn with_status(status: OutcomeStatus) -> Self {
        Self {
            status,
            artifacts: Vec::new(),
            output: String::new(),
            variables: Vec::new(),
        }
    }

    pub fn with_artifact(mut self, name: String) -> Self {
        self.artifacts.push(name);
        self
    }

    pub fn with_output(mut self, output: String) -> Self {
        self.output = output;
        self
    }

    pub fn with_variable(mut self, key: &str, value: &str) -> Self {
        self.variables.push((key.to_string(), value.to_string()));
        self
    }
}

/// Single contract every step kind implements.
pub trait StepExecutor: Sync {
    fn execute(
        &self,
        cancel: &CancelToken,
        task: &Task,
        spec: &StepSpec,
        deps: &Deps<'_>,
    ) -> Result<StepOutcome>;
}

/// Dispatch on the step spec's action tag.
pub fn executor_for(action: &StepAction) -> &'static dyn StepExecutor {
    match action {
        StepAction::Ai { .. } => &ai::AiStep,
        StepAction::Gather { .. } => &gather::GatherStep,
        StepAction::Validation => &validation::ValidationStep,
        StepAction::Git { .. } => &git::GitStep,
        StepAction::Ci => &ci::CiStep,
        StepAction::Human { .. } => &human::HumanStep,
        StepAction::Sdd { .. } => &sdd::SddStep,
    }
}
