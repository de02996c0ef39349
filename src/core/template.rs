//! Templates: ordered step specifications a task is expanded from.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Git sub-actions a `Git` step can perform.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitOp {
    Branch,
    Clean,
    Stage,
    Commit,
    SmartCommit,
    Push,
    Pr,
    PrUpdate,
}

/// What a step does. One variant per step kind; executor dispatch matches on
/// this tag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StepAction {
    /// Invoke the AI CLI with a rendered prompt.
    Ai { prompt: String },
    /// Fill missing template variables from defaults; skipped when present.
    Gather { variables: Vec<String> },
    /// Run the validation pipeline.
    Validation,
    /// Perform one git sub-action.
    Git { op: GitOp },
    /// Watch CI checks for the PR recorded by an earlier git step.
    Ci,
    /// Pause for human approval.
    Human { prompt: String },
    /// Invoke the spec-driven development tool.
    Sdd { command: String },
}

impl StepAction {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Ai { .. } => "ai",
            Self::Gather { .. } => "gather",
            Self::Validation => "validation",
            Self::Git { .. } => "git",
            Self::Ci => "ci",
            Self::Human { .. } => "human",
            Self::Sdd { .. } => "sdd",
        }
    }
}

/// One step specification within a template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepSpec {
    pub name: String,
    #[serde(flatten)]
    pub action: StepAction,
    /// Optional steps are recorded skipped without executing.
    pub required: bool,
    /// Per-step wall-clock ceiling in seconds. Zero means the subsystem default.
    #[serde(default)]
    pub timeout_secs: u64,
    /// Extra attempts for transient failures, on top of the retry policy.
    #[serde(default)]
    pub retry_count: u32,
    /// Steps sharing a group id run concurrently under one barrier.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,
}

impl StepSpec {
    pub fn kind(&self) -> &'static str {
        self.action.kind()
    }

    pub fn timeout(&self) -> Option<Duration> {
        if self.timeout_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(self.timeout_secs))
        }
    }
}

/// A declared template variable.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TemplateVariable {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub default: String,
    #[serde(default)]
    pub required: bool,
}

/// An ordered list of step specifications plus template-wide settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Template {
    pub name: String,
    pub description: String,
    /// Prepended to workspace branch names (`feat`, `fix`, ...).
    pub branch_prefix: String,
    /// Default AI model; empty means CLI default.
    #[serde(default)]
    pub default_model: String,
    pub steps: Vec<StepSpec>,
    /// Declared variables with defaults.
    #[serde(default)]
    pub variables: BTreeMap<String, TemplateVariable>,
    /// Step a rejection rewinds to. Must name an earlier step than the
    /// approval gate; defaults to the first AI/SDD step when empty.
    #[serde(default)]
    pub rework_step: String,
}

impl Template {
    pub fn step_index(&self, name: &str) -> Option<usize> {
        self.steps.iter().position(|s| s.name == name)
    }

    /// Index a rejection rewinds to: the named rework step, else the first
    /// AI or SDD step.
    pub fn rework_index(&self) -> Option<usize> {
        if !self.rework_step.is_empty() {
            return self.step_index(&self.rework_step);
        }
        self.steps
            .iter()
            .position(|s| matches!(s.action, StepAction::Ai { .. } | StepAction::Sdd { .. }))
    }

    /// Contiguous run of steps sharing `start`'s parallel group, or just
    /// `start` itself when untagged.
    pub fn group_indices(&self, start: usize) -> Vec<usize> {
        let Some(head) = self.steps.get(start) else {
            return Vec::new();
        };
        let Some(group) = head.parallel_group.as_deref() else {
            return vec![start];
        };
        let mut indices = vec![start];
        for (offset, spec) in self.steps[start + 1..].iter().enumerate() {
            if spec.parallel_group.as_deref() == Some(group) {
                indices.push(start + 1 + offset);
            } else {
                break;
            }
        }
        indices
    }
}

/// Substitute `{{name}}` placeholders from the variable bag. Unknown
/// placeholders are left intact so prompt bugs stay visible in artifacts.
pub fn render_vars(text: &str, variables: &BTreeMap<String, String>) -> String {
    let mut out = text.to_string();
    for (key, value) in variables {
        out = out.replace(&format!("{{{{{key}}}}}"), value);
    }
    out
}
