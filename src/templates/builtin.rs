//! Builtin templates.
//!
//! Step constructors are shared so every template commits, pushes, and waits
//! for CI the same way.

use std::collections::BTreeMap;

use crate::core::template::{GitOp, StepAction, StepSpec, Template, TemplateVariable};

pub fn all() -> Vec<Template> {
    vec![
        feature_template(),
        bugfix_template(),
        commit_template(),
        fix_template(),
    ]
}

/// Develop a new feature with spec-driven development.
/// Steps: specify -> review_spec -> plan -> implement -> validate ->
/// git_commit -> git_push -> git_pr -> ci_wait -> review
pub fn feature_template() -> Template {
    Template {
        name: "feature".to_string(),
        description: "Develop a new feature with spec-driven development".to_string(),
        branch_prefix: "feat".to_string(),
        default_model: String::new(),
        steps: vec![
            sdd_step("specify", "specify", 20 * 60),
            human_step("review_spec", "Review the specification and approve or request changes"),
            sdd_step("plan", "plan", 15 * 60),
            sdd_step("implement", "implement", 45 * 60),
            validation_step(),
            git_step("git_commit", GitOp::Commit, 60, 0),
            git_step("git_push", GitOp::Push, 2 * 60, 3),
            git_step("git_pr", GitOp::Pr, 2 * 60, 2),
            ci_step(),
            human_step("review", "Review the feature implementation and approve or reject"),
        ],
        variables: BTreeMap::new(),
        rework_step: "implement".to_string(),
    }
}

/// Fix a reported bug.
/// Steps: analyze -> implement -> validate -> git_commit -> git_push ->
/// git_pr -> ci_wait -> review
pub fn bugfix_template() -> Template {
    Template {
        name: "bugfix".to_string(),
        description: "Fix a reported bug".to_string(),
        branch_prefix: "fix".to_string(),
        default_model: String::new(),
        steps: vec![
            ai_step(
                "analyze",
                "Analyze this bug report and locate the root cause. Do not make \
                 changes yet.\n\nBug: {{description}}",
                15 * 60,
            ),
            ai_step(
                "implement",
                "Fix the bug described below. Keep the change minimal and add a \
                 regression test.\n\nBug: {{description}}\n{{feedback}}",
                30 * 60,
            ),
            validation_step(),
            git_step("git_commit", GitOp::Commit, 60, 0),
            git_step("git_push", GitOp::Push, 2 * 60, 3),
            git_step("git_pr", GitOp::Pr, 2 * 60, 2),
            ci_step(),
            human_step("review", "Review the bug fix and approve or reject"),
        ],
        variables: BTreeMap::new(),
        rework_step: "implement".to_string(),
    }
}

/// Validate and ship the current workspace changes without a PR cycle.
/// Steps: gather -> validate -> smart_commit -> git_push
pub fn commit_template() -> Template {
    let mut variables = BTreeMap::new();
    variables.insert(
        "description".to_string(),
        TemplateVariable {
            description: "Commit subject".to_string(),
            default: String::new(),
            required: false,
        },
    );
    Template {
        name: "commit".to_string(),
        description: "Validate and commit current workspace changes".to_string(),
        branch_prefix: "chore".to_string(),
        default_model: String::new(),
        steps: vec![
            StepSpec {
                name: "gather".to_string(),
                action: StepAction::Gather {
                    variables: vec!["description".to_string()],
                },
                required: true,
                timeout_secs: 0,
                retry_count: 0,
                parallel_group: None,
            },
            validation_step(),
            git_step("smart_commit", GitOp::SmartCommit, 60, 0),
            git_step("git_push", GitOp::Push, 2 * 60, 3),
        ],
        variables,
        rework_step: String::new(),
    }
}

/// Apply a described fix locally and stop at the review gate (no PR cycle).
/// Steps: implement -> validate -> review
pub fn fix_template() -> Template {
    Template {
        name: "fix".to_string(),
        description: "Apply a described fix and validate it locally".to_string(),
        branch_prefix: "fix".to_string(),
        default_model: String::new(),
        steps: vec![
            ai_step(
                "implement",
                "Apply this fix:\n\n{{description}}\n{{feedback}}",
                30 * 60,
            ),
            validation_step(),
            human_step("review", "Review the fix and approve or reject"),
        ],
        variables: BTreeMap::new(),
        rework_step: "implement".to_string(),
    }
}

fn ai_step(name: &str, prompt: &str, timeout_secs: u64) -> StepSpec {
    StepSpec {
        name: name.to_string(),
        action: StepAction::Ai {
            prompt: prompt.to_string(),
        },
        required: true,
        timeout_secs,
        retry_count: 1,
        parallel_group: None,
    }
}

fn sdd_step(name: &str, command: &str, timeout_secs: u64) -> StepSpec {
    StepSpec {
        name: name.to_string(),
        action: StepAction::Sdd {
            command: command.to_string(),
        },
        required: true,
        timeout_secs,
        retry_count: 1,
        parallel_group: None,
    }
}

fn validation_step() -> StepSpec {
    StepSpec {
        name: "validate".to_string(),
        action: StepAction::Validation,
        required: true,
        timeout_secs: 0,
        retry_count: 0,
        parallel_group: None,
    }
}

fn git_step(name: &str, op: GitOp, timeout_secs: u64, retry_count: u32) -> StepSpec {
    StepSpec {
        name: name.to_string(),
        action: StepAction::Git { op },
        required: true,
        timeout_secs,
        retry_count,
        parallel_group: None,
    }
}

fn ci_step() -> StepSpec {
    StepSpec {
        name: "ci_wait".to_string(),
        action: StepAction::Ci,
        required: true,
        timeout_secs: 0,
        retry_count: 0,
        parallel_group: None,
    }
}

fn human_step(name: &str, prompt: &str) -> StepSpec {
    StepSpec {
        name: name.to_string(),
        action: StepAction::Human {
            prompt: prompt.to_string(),
        },
        required: true,
        timeout_secs: 0,
        retry_count: 0,
        parallel_group: None,
    }
}
