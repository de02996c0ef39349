//! Task and step records persisted under `tasks/<task-id>/task.json`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::core::status::{StepStatus, TaskStatus, TransitionRecord};
use crate::core::template::Template;

/// Current task record schema. Readers refuse anything newer.
pub const TASK_SCHEMA_VERSION: u32 = 1;

/// One run of a template inside a workspace.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    /// Unique id, `task-YYYYMMDD-HHMMSS-<rand>`.
    pub id: String,
    /// Owning workspace, by name (logical back-reference, not ownership).
    pub workspace: String,
    /// Template this task was expanded from.
    pub template: String,
    /// Human-readable summary of what the task does.
    pub description: String,
    pub status: TaskStatus,
    /// Zero-based index of the step the scheduler is at.
    pub current_step_index: usize,
    pub total_steps: usize,
    /// Per-step execution records, one per template step, in order.
    pub steps: Vec<StepRecord>,
    /// Status-change audit trail.
    pub transitions: Vec<TransitionRecord>,
    /// Template variables plus values accumulated at runtime (feedback,
    /// pr_number, skip flags). BTreeMap keeps serialization deterministic.
    pub variables: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub schema_version: u32,
}

/// Execution record for a single step. Created when the scheduler reaches the
/// step, updated on start/end, never deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub name: String,
    /// Step kind tag (`ai`, `validation`, `git`, ...), denormalized from the
    /// template so status output does not need template lookups.
    pub kind: String,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    /// Artifact filenames this step produced, in creation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<String>,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
}

impl StepRecord {
    fn pending(name: &str, kind: &str) -> Self {
        Self {
            name: name.to_string(),
            kind: kind.to_string(),
            status: StepStatus::Pending,
            started_at: None,
            completed_at: None,
            attempts: 0,
            artifacts: Vec::new(),
            error: String::new(),
        }
    }
}

impl Task {
    /// Build a fresh pending task from a template.
    pub fn from_template(
        workspace: &str,
        template: &Template,
        description: &str,
        variables: BTreeMap<String, String>,
    ) -> Self {
        let now = Utc::now();
        let steps = template
            .steps
            .iter()
            .map(|spec| StepRecord::pending(&spec.name, spec.kind()))
            .collect::<Vec<_>>();
        Self {
            id: generate_task_id(),
            workspace: workspace.to_string(),
            template: template.name.clone(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            current_step_index: 0,
            total_steps: steps.len(),
            steps,
            transitions: Vec::new(),
            variables,
            created_at: now,
            updated_at: now,
            completed_at: None,
            schema_version: TASK_SCHEMA_VERSION,
        }
    }

    pub fn variable(&self, key: &str) -> Option<&str> {
        self.variables.get(key).map(String::as_str)
    }

    pub fn set_variable(&mut self, key: &str, value: &str) {
        self.variables.insert(key.to_string(), value.to_string());
    }

    /// Minimal task for unit tests: two pending steps, no template lookup.
    #[doc(hidden)]
    pub fn new_for_test(workspace: &str, template: &str) -> Self {
        let now = Utc::now();
        Self {
            id: generate_task_id(),
            workspace: workspace.to_string(),
            template: template.to_string(),
            description: String::new(),
            status: TaskStatus::Pending,
            current_step_index: 0,
            total_steps: 2,
            steps: vec![
                StepRecord::pending("implement", "ai"),
                StepRecord::pending("review", "human"),
            ],
            transitions: Vec::new(),
            variables: BTreeMap::new(),
            created_at: now,
            updated_at: now,
            completed_at: None,
            schema_version: TASK_SCHEMA_VERSION,
        }
    }
}

/// Generate a unique task id: `task-YYYYMMDD-HHMMSS-<4 random alnum>`.
///
/// The random suffix keeps ids unique when several tasks start within the
/// same second.
pub fn generate_task_id() -> String {
    let stamp = Utc::now().format("%Y%m%d-%H%M%S");
    let mut rng = rand::thread_rng();
    let suffix: String = (0..4)
        .map(|_| {
            let chars = b"abcdefghijklmnopqrstuvwxyz0123456789";
            chars[rng.gen_range(0..chars.len())] as char
        })
        .collect();
    format!("task-{stamp}-{suffix}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_id_shape() {
        let id = generate_task_id();
        let parts: Vec<&str> = id.split('-').collect();
        assert_eq!(parts.len(), 4);
        assert_eq!(parts[0], "task");
        assert_eq!(parts[1].len(), 8);
        assert_eq!(parts[2].len(), 6);
        assert_eq!(parts[3].len(), 4);
    }

    #[test]
    fn task_ids_are_unique_within_a_second() {
        let a = generate_task_id();
        let b = generate_task_id();
        assert_ne!(a, b);
    }

    #[test]
    fn from_template_creates_pending_records() {
        let template = crate::templates::builtin::commit_template();
        let task = Task::from_template("ws", &template, "ship it", BTreeMap::new());
        assert_eq!(task.status, TaskStatus::Pending);
        assert_eq!(task.total_steps, template.steps.len());
        assert_eq!(task.steps.len(), template.steps.len());
        assert!(task
            .steps
            .iter()
            .all(|s| s.status == StepStatus::Pending && s.attempts == 0));
    }

    #[test]
    fn record_round_trips_through_json() {
        let task = Task::new_for_test("ws", "feature");
        let json = serde_json::to_string(&task).expect("serialize");
        let back: Task = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, task);
    }
}
