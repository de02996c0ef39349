//! Task and workspace status enums plus the transition state machine.
//!
//! The transition table is the single source of truth: terminal and error
//! status sets are derived from it so the three can never drift apart.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::error::AtlasError;

/// Task lifecycle status.
///
/// ```text
/// pending ──► running
/// running ──► validating │ gh_failed │ ci_failed │ ci_timeout │ abandoned
/// validating ──► awaiting_approval │ validation_failed
/// validation_failed ──► running │ abandoned
/// awaiting_approval ──► completed │ running │ rejected
/// gh_failed / ci_failed / ci_timeout ──► running │ abandoned
/// completed, rejected, abandoned are terminal
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Running,
    Validating,
    ValidationFailed,
    AwaitingApproval,
    Completed,
    Rejected,
    Abandoned,
    GhFailed,
    CiFailed,
    CiTimeout,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Validating => "validating",
            Self::ValidationFailed => "validation_failed",
            Self::AwaitingApproval => "awaiting_approval",
            Self::Completed => "completed",
            Self::Rejected => "rejected",
            Self::Abandoned => "abandoned",
            Self::GhFailed => "gh_failed",
            Self::CiFailed => "ci_failed",
            Self::CiTimeout => "ci_timeout",
        }
    }

    /// Valid transition targets from this status. Empty for terminal states.
    pub fn valid_targets(&self) -> &'static [TaskStatus] {
        use TaskStatus::*;
        match self {
            Pending => &[Running],
            Running => &[Validating, GhFailed, CiFailed, CiTimeout, Abandoned],
            Validating => &[AwaitingApproval, ValidationFailed],
            ValidationFailed => &[Running, Abandoned],
            AwaitingApproval => &[Completed, Running, Rejected],
            GhFailed => &[Running, Abandoned],
            CiFailed => &[Running, Abandoned],
            CiTimeout => &[Running, Abandoned],
            Completed | Rejected | Abandoned => &[],
        }
    }

    /// Terminal: no outgoing transitions.
    pub fn is_terminal(&self) -> bool {
        self.valid_targets().is_empty()
    }

    /// Error states can retry (→ running) or give up (→ abandoned).
    pub fn is_error(&self) -> bool {
        use TaskStatus::*;
        if matches!(self, Pending | Running) {
            return false;
        }
        let targets = self.valid_targets();
        targets.contains(&Running) && targets.contains(&Abandoned)
    }

    /// Attention states demand user action before further progress.
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::AwaitingApproval) || self.is_error()
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

pub fn is_valid_transition(from: TaskStatus, to: TaskStatus) -> bool {
    from != to && from.valid_targets().contains(&to)
}

/// Workspace lifecycle status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkspaceStatus {
    Active,
    Paused,
    Retired,
}

/// Per-step execution status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Skipped,
}

/// One entry of a task's transition audit trail.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionRecord {
    pub from: TaskStatus,
    pub to: TaskStatus,
    pub at: DateTime<Utc>,
    pub reason: String,
}

/// Validate and apply a status change, recording it in the audit trail.
///
/// The caller is responsible for persisting the updated task.
pub fn transition(
    task: &mut crate::core::task::Task,
    to: TaskStatus,
    reason: &str,
) -> Result<()> {
    let from = task.status;
    if !is_valid_transition(from, to) {
        if from.is_terminal() {
            return Err(AtlasError::AlreadyTerminal {
                status: from.as_str().to_string(),
            }
            .into());
        }
        return Err(AtlasError::InvalidTransition {
            from: from.as_str().to_string(),
            to: to.as_str().to_string(),
        }
        .into());
    }

    let now = Utc::now();
    task.transitions.push(TransitionRecord {
        from,
        to,
        at: now,
        reason: reason.to_string(),
    });
    task.status = to;
    task.updated_at = now;
    if to.is_terminal() {
        task.completed_at = Some(now);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::Task;

    #[test]
    fn terminal_states_have_no_targets() {
        for status in [
            TaskStatus::Completed,
            TaskStatus::Rejected,
            TaskStatus::Abandoned,
        ] {
            assert!(status.is_terminal());
            assert!(status.valid_targets().is_empty());
        }
    }

    #[test]
    fn error_states_can_retry_or_abandon() {
        for status in [
            TaskStatus::ValidationFailed,
            TaskStatus::GhFailed,
            TaskStatus::CiFailed,
            TaskStatus::CiTimeout,
        ] {
            assert!(status.is_error(), "{status} should be an error state");
            assert!(status.needs_attention());
        }
        assert!(!TaskStatus::Running.is_error());
        assert!(TaskStatus::AwaitingApproval.needs_attention());
    }

    #[test]
    fn self_transition_is_invalid() {
        assert!(!is_valid_transition(
            TaskStatus::Running,
            TaskStatus::Running
        ));
    }

    #[test]
    fn transition_records_audit_trail() {
        let mut task = Task::new_for_test("ws", "feature");
        transition(&mut task, TaskStatus::Running, "task started").expect("transition");
        assert_eq!(task.status, TaskStatus::Running);
        assert_eq!(task.transitions.len(), 1);
        assert_eq!(task.transitions[0].from, TaskStatus::Pending);
        assert_eq!(task.transitions[0].reason, "task started");
    }

    #[test]
    fn transition_from_terminal_reports_already_terminal() {
        let mut task = Task::new_for_test("ws", "feature");
        task.status = TaskStatus::Completed;
        let err = transition(&mut task, TaskStatus::Running, "nope").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AtlasError>(),
            Some(AtlasError::AlreadyTerminal { .. })
        ));
    }

    #[test]
    fn invalid_transition_reports_pair() {
        let mut task = Task::new_for_test("ws", "feature");
        let err = transition(&mut task, TaskStatus::Completed, "skip ahead").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AtlasError>(),
            Some(AtlasError::InvalidTransition { .. })
        ));
        assert!(task.transitions.is_empty());
    }

    #[test]
    fn completed_at_set_on_terminal_transition() {
        let mut task = Task::new_for_test("ws", "feature");
        transition(&mut task, TaskStatus::Running, "start").expect("start");
        transition(&mut task, TaskStatus::Abandoned, "give up").expect("abandon");
        assert!(task.completed_at.is_some());
    }
}
