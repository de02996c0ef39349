//! End-to-end task lifecycle tests against a real temp repository, with
//! scripted AI and CI backends.

use std::collections::BTreeMap;

use atlas::config::AtlasConfig;
use atlas::core::cancel::CancelToken;
use atlas::core::error::AtlasError;
use atlas::core::status::{StepStatus, TaskStatus};
use atlas::core::task::Task;
use atlas::core::template::{StepAction, StepSpec, Template};
use atlas::engine::Engine;
use atlas::io::store::FileStore;
use atlas::notify::Notifier;
use atlas::steps::FEEDBACK_VAR;
use atlas::templates::Registry;
use atlas::test_support::{ScriptedAi, ScriptedAiOutcome, ScriptedChecks, TestRepo};
use atlas::workspace::{CreateOptions, WorkspaceManager};

struct Harness {
    _home: tempfile::TempDir,
    _repo: TestRepo,
    store: FileStore,
    config: AtlasConfig,
    registry: Registry,
    notifier: Notifier,
    workspace: atlas::core::workspace::Workspace,
}

impl Harness {
    fn new() -> Self {
        Self::with_registry(Registry::with_builtins())
    }

    fn with_registry(registry: Registry) -> Self {
        let home = tempfile::tempdir().expect("tempdir");
        let repo = TestRepo::new().expect("repo");
        let store = FileStore::new(home.path());

        let mut config = AtlasConfig::default();
        config.home = home.path().to_path_buf();
        config.bell_enabled = false;
        config.validation.format_commands = vec!["true".to_string()];

        let manager = WorkspaceManager::new(&store);
        let workspace = manager
            .create(
                &CancelToken::new(),
                &CreateOptions {
                    name: "ws".to_string(),
                    base_branch: None,
                    branch_prefix: "fix".to_string(),
                    repo_root: repo.root().to_path_buf(),
                },
            )
            .expect("workspace");

        Self {
            _home: home,
            _repo: repo,
            store,
            config,
            registry,
            notifier: Notifier::new(false),
            workspace,
        }
    }

    fn engine<'a>(&'a self, ai: &'a ScriptedAi, checks: &'a ScriptedChecks) -> Engine<'a> {
        Engine::new(&self.store, &self.registry, &self.config, &self.notifier, ai)
            .with_checks(checks)
    }
}

fn step_named<'t>(task: &'t Task, name: &str) -> &'t atlas::core::task::StepRecord {
    task.steps
        .iter()
        .find(|s| s.name == name)
        .unwrap_or_else(|| panic!("step '{name}' not found"))
}

/// Happy path for the `fix` template: implement, validate, reach the review
/// gate, approve to completion.
#[test]
fn fix_template_runs_to_approval_and_completes() {
    let harness = Harness::new();
    let ai = ScriptedAi::with_script(vec![ScriptedAiOutcome::ok("patched")]);
    let checks = ScriptedChecks::default();
    let engine = harness.engine(&ai, &checks);
    let cancel = CancelToken::new();

    let task = engine
        .start(&cancel, &harness.workspace, "fix", "fix the login bug", BTreeMap::new())
        .expect("start");

    assert_eq!(task.status, TaskStatus::AwaitingApproval);
    assert_eq!(step_named(&task, "implement").status, StepStatus::Succeeded);
    assert_eq!(step_named(&task, "validate").status, StepStatus::Succeeded);
    assert_eq!(step_named(&task, "review").status, StepStatus::Running);
    assert_eq!(ai.calls(), 1);

    let artifacts = harness
        .store
        .list_artifacts("ws", &task.id)
        .expect("artifacts");
    assert!(artifacts.contains(&"implement.json".to_string()));
    assert!(artifacts.contains(&"validation.json".to_string()));

    let done = engine.approve(&cancel, &task.id).expect("approve");
    assert_eq!(done.status, TaskStatus::Completed);
    assert!(done.completed_at.is_some());
    assert_eq!(step_named(&done, "review").status, StepStatus::Succeeded);
}

/// Approve on a terminal task is a typed `already_terminal` error.
#[test]
fn approve_on_terminal_task_is_rejected() {
    let harness = Harness::new();
    let ai = ScriptedAi::new();
    let checks = ScriptedChecks::default();
    let engine = harness.engine(&ai, &checks);
    let cancel = CancelToken::new();

    let task = engine
        .start(&cancel, &harness.workspace, "fix", "small fix", BTreeMap::new())
        .expect("start");
    engine.approve(&cancel, &task.id).expect("approve");

    let err = engine.approve(&cancel, &task.id).unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AtlasError>(),
        Some(AtlasError::AlreadyTerminal { .. })
    ));
}

/// Reject with feedback rewinds to the implementation step, carries the
/// feedback in the variable bag, and re-runs to the gate.
#[test]
fn reject_with_feedback_reworks_from_implementation_step() {
    let harness = Harness::new();
    let ai = ScriptedAi::with_script(vec![
        ScriptedAiOutcome::ok("first attempt"),
        ScriptedAiOutcome::ok("second attempt"),
    ]);
    let checks = ScriptedChecks::default();
    let engine = harness.engine(&ai, &checks);
    let cancel = CancelToken::new();

    let task = engine
        .start(&cancel, &harness.workspace, "fix", "fix the login bug", BTreeMap::new())
        .expect("start");
    let gate_index = task.current_step_index;

    let reworked = engine
        .reject(&cancel, &task.id, Some("handle empty passwords"))
        .expect("reject");

    // The engine re-ran from the implementation step back to the gate.
    assert_eq!(reworked.status, TaskStatus::AwaitingApproval);
    assert_eq!(reworked.variable(FEEDBACK_VAR), Some("handle empty passwords"));
    assert_eq!(ai.calls(), 2);
    assert_eq!(reworked.current_step_index, gate_index);

    // The rewind itself is on the audit trail: awaiting_approval -> running.
    assert!(reworked
        .transitions
        .iter()
        .any(|t| t.from == TaskStatus::AwaitingApproval && t.to == TaskStatus::Running));

    // Preserved history: both validation runs exist.
    let artifacts = harness
        .store
        .list_artifacts("ws", &reworked.id)
        .expect("artifacts");
    assert!(artifacts.contains(&"validation.json".to_string()));
    assert!(artifacts.contains(&"validation.1.json".to_string()));
    assert!(artifacts.contains(&"implement.1.json".to_string()));

    let done = engine.approve(&cancel, &reworked.id).expect("approve");
    assert_eq!(done.status, TaskStatus::Completed);
}

/// Reject without feedback terminally rejects the task.
#[test]
fn reject_without_feedback_is_terminal() {
    let harness = Harness::new();
    let ai = ScriptedAi::new();
    let checks = ScriptedChecks::default();
    let engine = harness.engine(&ai, &checks);
    let cancel = CancelToken::new();

    let task = engine
        .start(&cancel, &harness.workspace, "fix", "small fix", BTreeMap::new())
        .expect("start");
    let rejected = engine.reject(&cancel, &task.id, None).expect("reject");

    assert_eq!(rejected.status, TaskStatus::Rejected);
    assert!(rejected.completed_at.is_some());
}

/// A failing validation command stops the task in `validation_failed`; fixing
/// the commands and resuming carries it to the gate.
#[test]
fn validation_failure_then_resume() {
    let mut harness = Harness::new();
    harness.config.validation.test_commands = vec!["false".to_string()];
    let ai = ScriptedAi::new();
    let checks = ScriptedChecks::default();
    let cancel = CancelToken::new();

    let task = {
        let engine = harness.engine(&ai, &checks);
        engine
            .start(&cancel, &harness.workspace, "fix", "doomed fix", BTreeMap::new())
            .expect("start")
    };
    assert_eq!(task.status, TaskStatus::ValidationFailed);
    assert_eq!(step_named(&task, "validate").status, StepStatus::Failed);
    assert!(step_named(&task, "validate").error.contains("test"));
    // Implementation step is untouched; resume continues from validation.
    assert_eq!(step_named(&task, "implement").status, StepStatus::Succeeded);

    harness.config.validation.test_commands = vec!["true".to_string()];
    let engine = harness.engine(&ai, &checks);
    let resumed = engine.resume(&cancel, &task.id).expect("resume");

    assert_eq!(resumed.status, TaskStatus::AwaitingApproval);
    assert_eq!(step_named(&resumed, "validate").status, StepStatus::Succeeded);
    assert_eq!(step_named(&resumed, "validate").attempts, 2);

    // Both validation runs were preserved as versioned artifacts.
    let artifacts = harness
        .store
        .list_artifacts("ws", &resumed.id)
        .expect("artifacts");
    assert!(artifacts.contains(&"validation.json".to_string()));
    assert!(artifacts.contains(&"validation.1.json".to_string()));
}

/// Crash between step-start persist and step-end persist leaves the task
/// `running` at the same index; resume re-executes the step.
#[test]
fn crash_mid_step_resumes_at_same_index() {
    let harness = Harness::new();
    let ai = ScriptedAi::new();
    let checks = ScriptedChecks::default();
    let engine = harness.engine(&ai, &checks);
    let cancel = CancelToken::new();

    // Simulate the post-crash on-disk state: running task, step 0 marked
    // running, no completion persisted.
    let template = harness.registry.get("fix").expect("template");
    let mut task = Task::from_template("ws", template, "crashy fix", BTreeMap::new());
    atlas::core::status::transition(&mut task, TaskStatus::Running, "task started")
        .expect("transition");
    task.steps[0].status = StepStatus::Running;
    task.steps[0].started_at = Some(chrono::Utc::now());
    task.steps[0].attempts = 1;
    harness.store.save_task(&task).expect("save");

    let loaded = harness.store.load_task("ws", &task.id).expect("load");
    assert_eq!(loaded.status, TaskStatus::Running);
    assert_eq!(loaded.current_step_index, 0, "engine must not auto-advance");

    let resumed = engine.resume(&cancel, &task.id).expect("resume");
    assert_eq!(resumed.status, TaskStatus::AwaitingApproval);
    assert_eq!(step_named(&resumed, "implement").status, StepStatus::Succeeded);
    assert_eq!(step_named(&resumed, "implement").attempts, 2, "step re-executed");
}

/// Abandon from an error state is terminal and preserves the worktree.
#[test]
fn abandon_after_failure_preserves_worktree() {
    let mut harness = Harness::new();
    harness.config.validation.lint_commands = vec!["false".to_string()];
    let ai = ScriptedAi::new();
    let checks = ScriptedChecks::default();
    let engine = harness.engine(&ai, &checks);
    let cancel = CancelToken::new();

    let task = engine
        .start(&cancel, &harness.workspace, "fix", "doomed", BTreeMap::new())
        .expect("start");
    assert_eq!(task.status, TaskStatus::ValidationFailed);

    let abandoned = engine
        .abandon(&cancel, &task.id, "giving up")
        .expect("abandon");
    assert_eq!(abandoned.status, TaskStatus::Abandoned);
    assert!(harness.workspace.worktree_path.exists());
}

fn ci_only_template(timeout_secs: u64) -> Template {
    Template {
        name: "ci-only".to_string(),
        description: "watch CI".to_string(),
        branch_prefix: "ci".to_string(),
        default_model: String::new(),
        steps: vec![StepSpec {
            name: "ci_wait".to_string(),
            action: StepAction::Ci,
            required: true,
            timeout_secs,
            retry_count: 0,
            parallel_group: None,
        }],
        variables: BTreeMap::new(),
        rework_step: String::new(),
    }
}

/// A failing required check routes the task to `ci_failed`.
#[test]
fn failing_checks_route_to_ci_failed() {
    let mut registry = Registry::new();
    registry.register(ci_only_template(0)).expect("register");
    let harness = Harness::with_registry(registry);

    let ai = ScriptedAi::new();
    let checks = ScriptedChecks::repeating(vec![atlas::io::github::CheckResult {
        name: "CI / test".to_string(),
        state: "FAILURE".to_string(),
        bucket: atlas::io::github::CheckBucket::Fail,
        started_at: String::new(),
        completed_at: String::new(),
        description: String::new(),
        workflow: String::new(),
        url: String::new(),
    }]);
    let engine = harness.engine(&ai, &checks);
    let cancel = CancelToken::new();

    let vars = BTreeMap::from([("pr_number".to_string(), "7".to_string())]);
    let task = engine
        .start(&cancel, &harness.workspace, "ci-only", "watch", vars)
        .expect("start");

    assert_eq!(task.status, TaskStatus::CiFailed);
    let artifacts = harness.store.list_artifacts("ws", &task.id).expect("artifacts");
    assert!(artifacts.contains(&"ci.json".to_string()));
}

/// Checks that never settle route to `ci_timeout`.
#[test]
fn pending_checks_route_to_ci_timeout() {
    let mut registry = Registry::new();
    registry.register(ci_only_template(1)).expect("register");
    let harness = Harness::with_registry(registry);

    let ai = ScriptedAi::new();
    let checks = ScriptedChecks::repeating(vec![atlas::io::github::CheckResult {
        name: "CI".to_string(),
        state: "PENDING".to_string(),
        bucket: atlas::io::github::CheckBucket::Pending,
        started_at: String::new(),
        completed_at: String::new(),
        description: String::new(),
        workflow: String::new(),
        url: String::new(),
    }]);
    let engine = harness.engine(&ai, &checks);
    let cancel = CancelToken::new();

    let vars = BTreeMap::from([("pr_number".to_string(), "7".to_string())]);
    let task = engine
        .start(&cancel, &harness.workspace, "ci-only", "watch", vars)
        .expect("start");

    assert_eq!(task.status, TaskStatus::CiTimeout);
}

/// A CI step without a recorded PR is skipped, not failed.
#[test]
fn ci_step_without_pr_is_skipped() {
    let mut registry = Registry::new();
    registry.register(ci_only_template(0)).expect("register");
    let harness = Harness::with_registry(registry);

    let ai = ScriptedAi::new();
    let checks = ScriptedChecks::default();
    let engine = harness.engine(&ai, &checks);
    let cancel = CancelToken::new();

    let task = engine
        .start(&cancel, &harness.workspace, "ci-only", "watch", BTreeMap::new())
        .expect("start");

    assert_eq!(task.status, TaskStatus::AwaitingApproval);
    assert_eq!(step_named(&task, "ci_wait").status, StepStatus::Skipped);
}

/// Steps sharing a parallel group run under one barrier; a member failure
/// marks the group failed after all members finish.
#[test]
fn parallel_group_failure_waits_for_siblings() {
    let mut registry = Registry::new();
    registry
        .register(Template {
            name: "grouped".to_string(),
            description: "parallel group".to_string(),
            branch_prefix: "grp".to_string(),
            default_model: String::new(),
            steps: vec![
                StepSpec {
                    name: "implement".to_string(),
                    action: StepAction::Ai {
                        prompt: "do it".to_string(),
                    },
                    required: true,
                    timeout_secs: 0,
                    retry_count: 0,
                    parallel_group: Some("pair".to_string()),
                },
                StepSpec {
                    name: "collect".to_string(),
                    action: StepAction::Gather {
                        variables: vec!["notes".to_string()],
                    },
                    required: true,
                    timeout_secs: 0,
                    retry_count: 0,
                    parallel_group: Some("pair".to_string()),
                },
            ],
            variables: BTreeMap::new(),
            rework_step: String::new(),
        })
        .expect("register");
    let harness = Harness::with_registry(registry);

    let ai = ScriptedAi::with_script(vec![ScriptedAiOutcome::Failure(
        "invalid prompt".to_string(),
    )]);
    let checks = ScriptedChecks::default();
    let engine = harness.engine(&ai, &checks);
    let cancel = CancelToken::new();

    let task = engine
        .start(&cancel, &harness.workspace, "grouped", "pair work", BTreeMap::new())
        .expect("start");

    assert_eq!(task.status, TaskStatus::ValidationFailed);
    assert_eq!(step_named(&task, "implement").status, StepStatus::Failed);
    // The sibling ran to completion despite the failure.
    assert_eq!(step_named(&task, "collect").status, StepStatus::Succeeded);
    assert_eq!(task.current_step_index, 0, "group did not advance");
}

/// Smart commit flow against a real repository: changes in the worktree are
/// committed; the workspace ends clean.
#[test]
fn smart_commit_commits_worktree_changes() {
    let mut registry = Registry::new();
    registry
        .register(Template {
            name: "ship".to_string(),
            description: "validate and commit".to_string(),
            branch_prefix: "chore".to_string(),
            default_model: String::new(),
            steps: vec![
                StepSpec {
                    name: "validate".to_string(),
                    action: StepAction::Validation,
                    required: true,
                    timeout_secs: 0,
                    retry_count: 0,
                    parallel_group: None,
                },
                StepSpec {
                    name: "smart_commit".to_string(),
                    action: StepAction::Git {
                        op: atlas::core::template::GitOp::SmartCommit,
                    },
                    required: true,
                    timeout_secs: 0,
                    retry_count: 0,
                    parallel_group: None,
                },
            ],
            variables: BTreeMap::new(),
            rework_step: String::new(),
        })
        .expect("register");
    let harness = Harness::with_registry(registry);

    std::fs::write(harness.workspace.worktree_path.join("new.txt"), "hello\n")
        .expect("write change");

    let ai = ScriptedAi::new();
    let checks = ScriptedChecks::default();
    let engine = harness.engine(&ai, &checks);
    let cancel = CancelToken::new();

    let task = engine
        .start(&cancel, &harness.workspace, "ship", "Add greeting file", BTreeMap::new())
        .expect("start");

    assert_eq!(task.status, TaskStatus::AwaitingApproval);
    assert_eq!(step_named(&task, "smart_commit").status, StepStatus::Succeeded);

    let git = atlas::io::git::Git::new(&harness.workspace.worktree_path, CancelToken::new());
    assert!(!git.has_changes().expect("status"), "worktree is clean after commit");
}

/// Tasks on distinct workspaces run concurrently without touching each
/// other's records.
#[test]
fn concurrent_tasks_on_distinct_workspaces_stay_isolated() {
    let home = tempfile::tempdir().expect("tempdir");
    let repo = TestRepo::new().expect("repo");
    let store = FileStore::new(home.path());
    let mut config = AtlasConfig::default();
    config.home = home.path().to_path_buf();
    config.bell_enabled = false;
    config.validation.format_commands = vec!["true".to_string()];
    let registry = Registry::with_builtins();
    let notifier = Notifier::new(false);
    let manager = WorkspaceManager::new(&store);

    let workspaces: Vec<_> = ["alpha", "beta"]
        .iter()
        .map(|name| {
            manager
                .create(
                    &CancelToken::new(),
                    &CreateOptions {
                        name: name.to_string(),
                        base_branch: None,
                        branch_prefix: "fix".to_string(),
                        repo_root: repo.root().to_path_buf(),
                    },
                )
                .expect("workspace")
        })
        .collect();

    let tasks: Vec<Task> = std::thread::scope(|scope| {
        let handles: Vec<_> = workspaces
            .iter()
            .map(|ws| {
                let store = &store;
                let config = &config;
                let registry = &registry;
                let notifier = &notifier;
                scope.spawn(move || {
                    let ai = ScriptedAi::new();
                    let checks = ScriptedChecks::default();
                    let engine = Engine::new(store, registry, config, notifier, &ai)
                        .with_checks(&checks);
                    engine
                        .start(
                            &CancelToken::new(),
                            ws,
                            "fix",
                            &format!("task in {}", ws.name),
                            BTreeMap::new(),
                        )
                        .expect("start")
                })
            })
            .collect();
        handles
            .into_iter()
            .map(|h| h.join().expect("task thread"))
            .collect()
    });

    for (task, ws_name) in tasks.iter().zip(["alpha", "beta"]) {
        assert_eq!(task.status, TaskStatus::AwaitingApproval);
        assert_eq!(task.workspace, ws_name);
        let reloaded = store.load_task(ws_name, &task.id).expect("reload");
        assert_eq!(&reloaded, task);
    }
    assert_ne!(tasks[0].id, tasks[1].id);
}

/// A second writer against a locked workspace fails fast.
#[test]
fn second_writer_on_same_workspace_fails_fast() {
    let harness = Harness::new();
    let ai = ScriptedAi::new();
    let checks = ScriptedChecks::default();
    let engine = harness.engine(&ai, &checks);
    let cancel = CancelToken::new();

    let _held =
        atlas::io::lock::WorkspaceLock::acquire(&harness.store, "ws").expect("hold lock");
    let err = engine
        .start(&cancel, &harness.workspace, "fix", "blocked", BTreeMap::new())
        .unwrap_err();
    assert!(matches!(
        err.downcast_ref::<AtlasError>(),
        Some(AtlasError::Locked { .. })
    ));
}

/// Every observed transition across a full lifecycle is legal.
#[test]
fn all_recorded_transitions_are_legal() {
    let harness = Harness::new();
    let ai = ScriptedAi::new();
    let checks = ScriptedChecks::default();
    let engine = harness.engine(&ai, &checks);
    let cancel = CancelToken::new();

    let task = engine
        .start(&cancel, &harness.workspace, "fix", "audit me", BTreeMap::new())
        .expect("start");
    let reworked = engine.reject(&cancel, &task.id, Some("tweak")).expect("reject");
    let done = engine.approve(&cancel, &reworked.id).expect("approve");

    for t in &done.transitions {
        assert!(
            atlas::core::status::is_valid_transition(t.from, t.to),
            "illegal transition {} -> {}",
            t.from,
            t.to
        );
    }
}
