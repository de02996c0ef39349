//! Task engine: state machine plus step scheduler.
//!
//! Each engine call drives one task; multiple tasks run as independent engine
//! invocations sharing only the store. The loop reloads the task from the
//! store at every iteration (authoritative after restart), persists before
//! and after each step, and stops on the first failure: a user command
//! resumes it, never the engine itself.

use std::collections::BTreeMap;
use std::thread;
use std::time::Instant;

use anyhow::{Context, Result};
use chrono::Utc;
use tracing::{debug, info, instrument, warn};

use crate::config::AtlasConfig;
use crate::core::cancel::CancelToken;
use crate::core::error::{is_cancelled, kind_of, AtlasError};
use crate::core::status::{transition, StepStatus, TaskStatus};
use crate::core::task::Task;
use crate::core::template::{StepAction, StepSpec, Template};
use crate::core::workspace::Workspace;
use crate::io::ai::AiRunner;
use crate::io::git::Git;
use crate::io::github::{CheckLister, GhRunner};
use crate::io::lock::WorkspaceLock;
use crate::io::store::FileStore;
use crate::notify::Notifier;
use crate::steps::{executor_for, Deps, OutcomeStatus, StepOutcome, FEEDBACK_VAR, SKIP_GIT_STEPS_VAR};
use crate::templates::Registry;

/// Progress callback phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProgressPhase {
    Start,
    Complete,
}

/// Step progress event for UI feedback.
#[derive(Debug, Clone)]
pub struct StepProgressEvent {
    pub phase: ProgressPhase,
    pub task_id: String,
    pub workspace: String,
    pub step_index: usize,
    pub total_steps: usize,
    pub step_name: String,
    pub step_kind: &'static str,
    /// Step status after completion ("succeeded", "failed", "skipped");
    /// empty for start events.
    pub status: String,
    pub duration_ms: u64,
}

pub type ProgressCallback = Box<dyn Fn(StepProgressEvent) + Send + Sync>;

/// Engine-level configuration.
#[derive(Default)]
pub struct EngineConfig {
    /// Called before and after each step execution.
    pub progress: Option<ProgressCallback>,
}

/// Orchestrates task execution through template steps.
pub struct Engine<'a> {
    store: &'a FileStore,
    registry: &'a Registry,
    config: &'a AtlasConfig,
    notifier: &'a Notifier,
    ai: &'a dyn AiRunner,
    /// Check lister override; defaults to the per-workspace `gh` runner.
    checks: Option<&'a dyn CheckLister>,
    engine_config: EngineConfig,
}

impl<'a> Engine<'a> {
    pub fn new(
        store: &'a FileStore,
        registry: &'a Registry,
        config: &'a AtlasConfig,
        notifier: &'a Notifier,
        ai: &'a dyn AiRunner,
    ) -> Self {
        Self {
            store,
            registry,
            config,
            notifier,
            ai,
            checks: None,
            engine_config: EngineConfig::default(),
        }
    }

    /// Replace the CI check source (tests script it).
    pub fn with_checks(mut self, checks: &'a dyn CheckLister) -> Self {
        self.checks = Some(checks);
        self
    }

    pub fn with_engine_config(mut self, engine_config: EngineConfig) -> Self {
        self.engine_config = engine_config;
        self
    }

    /// Create and begin executing a new task in `workspace`.
    ///
    /// Step failures are persisted into the task record and reported through
    /// its status; `Err` is reserved for cancellation and infrastructure
    /// failures. The returned task is the final persisted snapshot.
    #[instrument(skip_all, fields(workspace = %workspace.name, template = template_name))]
    pub fn start(
        &self,
        cancel: &CancelToken,
        workspace: &Workspace,
        template_name: &str,
        description: &str,
        extra_variables: BTreeMap<String, String>,
    ) -> Result<Task> {
        cancel.check()?;
        let template = self.registry.get(template_name)?;
        let _lock = WorkspaceLock::acquire(self.store, &workspace.name)?;

        let mut variables: BTreeMap<String, String> = template
            .variables
            .iter()
            .map(|(k, v)| (k.clone(), v.default.clone()))
            .collect();
        variables.extend(extra_variables);
        variables.insert("description".to_string(), description.to_string());
        variables.entry(FEEDBACK_VAR.to_string()).or_default();

        let mut task = Task::from_template(&workspace.name, template, description, variables);
        transition(&mut task, TaskStatus::Running, "task started")?;
        self.store.save_task(&task)?;
        self.log(&task, &format!("task created from template '{template_name}'"));

        let mut ws = workspace.clone();
        ws.latest_task = Some(task.id.clone());
        ws.updated_at = Utc::now();
        self.store.save_workspace(&ws)?;

        info!(task_id = %task.id, "task started");
        self.drive(cancel, &ws, &task.id, template)
    }

    /// Resume a task after a transient failure, rejection rework, or crash.
    ///
    /// Error statuses transition back to running; a task already `running`
    /// (crash while mid-step) resumes at its current index without a
    /// transition.
    #[instrument(skip_all, fields(task_id))]
    pub fn resume(&self, cancel: &CancelToken, task_id: &str) -> Result<Task> {
        cancel.check()?;
        let mut task = self.store.find_task(task_id)?;
        let _lock = WorkspaceLock::acquire(self.store, &task.workspace)?;
        if task.status.is_terminal() {
            return Err(AtlasError::AlreadyTerminal {
                status: task.status.as_str().to_string(),
            }
            .into());
        }

        if task.status.is_error() || task.status == TaskStatus::Pending {
            transition(&mut task, TaskStatus::Running, "resumed by user")?;
            self.store.save_task(&task)?;
            self.log(&task, "resumed");
        } else if task.status != TaskStatus::Running {
            return Err(AtlasError::InvalidTransition {
                from: task.status.as_str().to_string(),
                to: TaskStatus::Running.as_str().to_string(),
            }
            .into());
        }

        let workspace = self.store.load_workspace(&task.workspace)?;
        let template = self.registry.get(&task.template)?;
        self.drive(cancel, &workspace, &task.id, template)
    }

    /// Approve the pending gate: move past it, or complete the task when no
    /// steps remain.
    #[instrument(skip_all, fields(task_id))]
    pub fn approve(&self, cancel: &CancelToken, task_id: &str) -> Result<Task> {
        cancel.check()?;
        let mut task = self.load_awaiting(task_id)?;
        let _lock = WorkspaceLock::acquire(self.store, &task.workspace)?;

        // Close out an explicit human gate step.
        if let Some(record) = task.steps.get_mut(task.current_step_index) {
            if record.status == StepStatus::Running {
                record.status = StepStatus::Succeeded;
                record.completed_at = Some(Utc::now());
            }
        }
        if task.current_step_index < task.total_steps {
            task.current_step_index += 1;
        }

        if task.current_step_index >= task.total_steps {
            transition(&mut task, TaskStatus::Completed, "approved by user")?;
            self.store.save_task(&task)?;
            self.log(&task, "approved; task completed");
            info!(task_id = %task.id, "task completed");
            return Ok(task);
        }

        transition(&mut task, TaskStatus::Running, "approved, continuing")?;
        self.store.save_task(&task)?;
        self.log(&task, "approved; continuing");

        let workspace = self.store.load_workspace(&task.workspace)?;
        let template = self.registry.get(&task.template)?;
        self.drive(cancel, &workspace, &task.id, template)
    }

    /// Reject the pending gate. With feedback the task rewinds to the
    /// template's rework step and resumes; without it the task is terminally
    /// rejected.
    #[instrument(skip_all, fields(task_id))]
    pub fn reject(
        &self,
        cancel: &CancelToken,
        task_id: &str,
        feedback: Option<&str>,
    ) -> Result<Task> {
        cancel.check()?;
        let mut task = self.load_awaiting(task_id)?;
        let _lock = WorkspaceLock::acquire(self.store, &task.workspace)?;
        let feedback = feedback.map(str::trim).filter(|f| !f.is_empty());

        let Some(feedback) = feedback else {
            if let Some(record) = task.steps.get_mut(task.current_step_index) {
                if record.status == StepStatus::Running {
                    record.status = StepStatus::Failed;
                    record.error = "rejected by user".to_string();
                    record.completed_at = Some(Utc::now());
                }
            }
            transition(&mut task, TaskStatus::Rejected, "rejected by user")?;
            self.store.save_task(&task)?;
            self.log(&task, "rejected");
            return Ok(task);
        };

        let template = self.registry.get(&task.template)?;
        let rework = rework_target(template, task.current_step_index)
            .context("no prior implementation step to rework from")?;

        // Reset everything from the rework step forward; attempts and
        // artifacts are history and stay.
        for record in task.steps.iter_mut().skip(rework) {
            record.status = StepStatus::Pending;
            record.started_at = None;
            record.completed_at = None;
            record.error.clear();
        }
        task.current_step_index = rework;
        task.set_variable(FEEDBACK_VAR, feedback);
        transition(&mut task, TaskStatus::Running, "changes requested")?;
        self.store.save_task(&task)?;
        self.log(&task, &format!("rejected with feedback, rework from step {rework}"));

        let workspace = self.store.load_workspace(&task.workspace)?;
        self.drive(cancel, &workspace, &task.id, template)
    }

    /// Abandon a task. Worktree and artifacts are preserved.
    #[instrument(skip_all, fields(task_id))]
    pub fn abandon(&self, cancel: &CancelToken, task_id: &str, reason: &str) -> Result<Task> {
        cancel.check()?;
        let mut task = self.store.find_task(task_id)?;
        let _lock = WorkspaceLock::acquire(self.store, &task.workspace)?;
        if task.status.is_terminal() {
            return Err(AtlasError::AlreadyTerminal {
                status: task.status.as_str().to_string(),
            }
            .into());
        }
        transition(&mut task, TaskStatus::Abandoned, reason)?;
        self.store.save_task(&task)?;
        self.log(&task, &format!("abandoned: {reason}"));
        Ok(task)
    }

    fn load_awaiting(&self, task_id: &str) -> Result<Task> {
        let task = self.store.find_task(task_id)?;
        if task.status.is_terminal() {
            return Err(AtlasError::AlreadyTerminal {
                status: task.status.as_str().to_string(),
            }
            .into());
        }
        if task.status != TaskStatus::AwaitingApproval {
            return Err(AtlasError::InvalidTransition {
                from: task.status.as_str().to_string(),
                to: TaskStatus::Completed.as_str().to_string(),
            }
            .into());
        }
        Ok(task)
    }

    /// Run the scheduler loop and return the final persisted task snapshot.
    /// Cancellation and infrastructure failures surface as `Err`; step
    /// failures land in the task status.
    fn drive(
        &self,
        cancel: &CancelToken,
        workspace: &Workspace,
        task_id: &str,
        template: &Template,
    ) -> Result<Task> {
        match self.run_steps(cancel, workspace, task_id, template) {
            Ok(()) => {}
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => {
                // The failure is persisted on the task; surface infrastructure
                // errors (store, invalid transitions) that left no status.
                let task = self.store.load_task(&workspace.name, task_id)?;
                if !task.status.is_error() {
                    return Err(err);
                }
                debug!(task_id, status = %task.status, "task stopped on step failure");
            }
        }
        self.store
            .load_task(&workspace.name, task_id)
            .context("reload task after run")
    }

    /// Scheduler loop; see module docs for the contract.
    fn run_steps(
        &self,
        cancel: &CancelToken,
        workspace: &Workspace,
        task_id: &str,
        template: &Template,
    ) -> Result<()> {
        let git = Git::new(&workspace.worktree_path, cancel.clone());
        let gh = GhRunner::new(
            &workspace.worktree_path,
            cancel.clone(),
            self.config.network_timeout(),
        );
        let deps = Deps {
            store: self.store,
            config: self.config,
            notifier: self.notifier,
            workspace,
            git: &git,
            gh: &gh,
            ai: self.ai,
            checks: self.checks.unwrap_or(&gh),
        };

        loop {
            // Authoritative state, also after restart.
            let mut task = self.store.load_task(&workspace.name, task_id)?;
            if task.status != TaskStatus::Running {
                return Ok(());
            }
            if task.current_step_index >= task.total_steps {
                return self.finish(&mut task);
            }

            let indices = template.group_indices(task.current_step_index);
            debug_assert!(!indices.is_empty());

            if indices.len() == 1 {
                let spec = &template.steps[indices[0]];
                if let Some(reason) = self.skip_reason(&task, spec) {
                    self.record_skip(&mut task, indices[0], spec, &reason)?;
                    continue;
                }
            }

            // Write-before-side-effect: mark running, persist, then execute.
            let now = Utc::now();
            for &i in &indices {
                let record = &mut task.steps[i];
                record.status = StepStatus::Running;
                record.started_at = Some(now);
                record.attempts += 1;
            }
            task.updated_at = now;
            self.store.save_task(&task)?;
            for &i in &indices {
                self.log(&task, &format!("step '{}' started", template.steps[i].name));
                self.progress(&task, &template.steps[i], i, ProgressPhase::Start, "", 0);
            }

            let started = Instant::now();
            let results = self.execute_group(cancel, &task, template, &indices, &deps);
            let duration_ms = started.elapsed().as_millis() as u64;

            match self.apply_results(&mut task, template, &indices, results, duration_ms)? {
                LoopControl::Continue => continue,
                LoopControl::Stop => return Ok(()),
                LoopControl::Fail(err) => return Err(err),
            }
        }
    }

    /// Execute one step or one parallel group. Group members run on scoped
    /// threads against an immutable task snapshot; completions are unordered
    /// but the barrier is total.
    fn execute_group(
        &self,
        cancel: &CancelToken,
        task: &Task,
        template: &Template,
        indices: &[usize],
        deps: &Deps<'_>,
    ) -> Vec<(usize, Result<StepOutcome>)> {
        if indices.len() == 1 {
            let i = indices[0];
            let spec = &template.steps[i];
            return vec![(i, executor_for(&spec.action).execute(cancel, task, spec, deps))];
        }

        info!(count = indices.len(), "executing parallel step group");
        let snapshot = task.clone();
        thread::scope(|scope| {
            let handles: Vec<_> = indices
                .iter()
                .map(|&i| {
                    let spec = &template.steps[i];
                    let snapshot = &snapshot;
                    scope.spawn(move || {
                        (
                            i,
                            executor_for(&spec.action).execute(cancel, snapshot, spec, deps),
                        )
                    })
                })
                .collect();
            handles
                .into_iter()
                .map(|handle| handle.join().expect("step thread panicked"))
                .collect()
        })
    }

    /// Fold executor results into the task: records, variables, transitions.
    fn apply_results(
        &self,
        task: &mut Task,
        template: &Template,
        indices: &[usize],
        results: Vec<(usize, Result<StepOutcome>)>,
        duration_ms: u64,
    ) -> Result<LoopControl> {
        let now = Utc::now();
        let mut awaiting_approval = false;
        let mut first_error: Option<(usize, anyhow::Error)> = None;
        let mut cancelled: Option<anyhow::Error> = None;

        for (i, result) in results {
            let spec = &template.steps[i];
            match result {
                Ok(outcome) => {
                    for (key, value) in &outcome.variables {
                        task.variables.insert(key.clone(), value.clone());
                    }
                    if outcome.status == OutcomeStatus::NoChanges {
                        task.set_variable(SKIP_GIT_STEPS_VAR, "true");
                        self.log(task, &format!("step '{}' made no changes", spec.name));
                    }
                    let record = &mut task.steps[i];
                    record.artifacts.extend(outcome.artifacts.iter().cloned());
                    match outcome.status {
                        OutcomeStatus::AwaitingApproval => {
                            // Gate stays `running` until approve/reject.
                            awaiting_approval = true;
                            self.progress(task, spec, i, ProgressPhase::Complete, "awaiting_approval", duration_ms);
                        }
                        OutcomeStatus::Skipped => {
                            record.status = StepStatus::Skipped;
                            record.completed_at = Some(now);
                            self.log(task, &format!("step '{}' skipped: {}", spec.name, outcome.output));
                            self.progress(task, spec, i, ProgressPhase::Complete, "skipped", duration_ms);
                        }
                        OutcomeStatus::Success | OutcomeStatus::NoChanges => {
                            record.status = StepStatus::Succeeded;
                            record.completed_at = Some(now);
                            self.log(task, &format!("step '{}' succeeded", spec.name));
                            self.progress(task, spec, i, ProgressPhase::Complete, "succeeded", duration_ms);
                        }
                    }
                }
                Err(err) => {
                    let record = &mut task.steps[i];
                    record.status = StepStatus::Failed;
                    record.error = format!("{err:#}");
                    record.completed_at = Some(now);
                    self.log(task, &format!("step '{}' failed: {err:#}", spec.name));
                    self.progress(task, spec, i, ProgressPhase::Complete, "failed", duration_ms);
                    if is_cancelled(&err) {
                        task.steps[i].error = "cancelled".to_string();
                        cancelled.get_or_insert(err);
                    } else if first_error.is_none() {
                        first_error = Some((i, err));
                    }
                }
            }
        }

        if let Some(err) = cancelled {
            // Status stays `running`: crash/interrupt semantics, resume
            // re-executes the step.
            task.updated_at = now;
            self.store.save_task(task)?;
            return Ok(LoopControl::Fail(err));
        }

        if let Some((i, err)) = first_error {
            let target = failure_status(&template.steps[i], &err);
            self.transition_to_failure(task, target, &format!("{err:#}"))?;
            self.store.save_task(task)?;
            return Ok(LoopControl::Fail(err));
        }

        if awaiting_approval {
            transition(task, TaskStatus::Validating, "approval gate reached")?;
            transition(task, TaskStatus::AwaitingApproval, "awaiting user approval")?;
            self.notifier.notify_transition(TaskStatus::AwaitingApproval);
            self.store.save_task(task)?;
            self.log(task, "awaiting approval");
            return Ok(LoopControl::Stop);
        }

        // Whole group succeeded: advance past it and checkpoint.
        task.current_step_index = indices.iter().max().copied().unwrap_or(0) + 1;
        task.updated_at = now;
        self.store.save_task(task)?;
        Ok(LoopControl::Continue)
    }

    /// All steps done: close the run at the implicit approval gate.
    fn finish(&self, task: &mut Task) -> Result<()> {
        transition(task, TaskStatus::Validating, "all steps completed")?;
        transition(task, TaskStatus::AwaitingApproval, "awaiting final approval")?;
        self.notifier.notify_transition(TaskStatus::AwaitingApproval);
        self.store.save_task(task)?;
        self.log(task, "all steps completed, awaiting approval");
        info!(task_id = %task.id, "task awaiting approval");
        Ok(())
    }

    fn transition_to_failure(
        &self,
        task: &mut Task,
        target: TaskStatus,
        reason: &str,
    ) -> Result<()> {
        // ValidationFailed is only reachable through Validating.
        if target == TaskStatus::ValidationFailed && task.status == TaskStatus::Running {
            transition(task, TaskStatus::Validating, "step failed")?;
        }
        transition(task, target, reason)?;
        self.notifier.notify_transition(target);
        warn!(task_id = %task.id, status = %target, "task stopped");
        Ok(())
    }

    fn skip_reason(&self, task: &Task, spec: &StepSpec) -> Option<String> {
        if !spec.required {
            return Some("optional step not enabled".to_string());
        }
        if task.variable(SKIP_GIT_STEPS_VAR) == Some("true") {
            if let StepAction::Git { op } = &spec.action {
                use crate::core::template::GitOp;
                if matches!(op, GitOp::Push | GitOp::Pr | GitOp::PrUpdate) {
                    return Some("no changes to push".to_string());
                }
            }
        }
        None
    }

    fn record_skip(&self, task: &mut Task, index: usize, spec: &StepSpec, reason: &str) -> Result<()> {
        let now = Utc::now();
        let record = &mut task.steps[index];
        record.status = StepStatus::Skipped;
        record.started_at = Some(now);
        record.completed_at = Some(now);
        task.current_step_index = index + 1;
        task.updated_at = now;
        self.store.save_task(task)?;
        self.log(task, &format!("step '{}' skipped: {reason}", spec.name));
        self.progress(task, spec, index, ProgressPhase::Complete, "skipped", 0);
        Ok(())
    }

    fn progress(
        &self,
        task: &Task,
        spec: &StepSpec,
        index: usize,
        phase: ProgressPhase,
        status: &str,
        duration_ms: u64,
    ) {
        if let Some(callback) = &self.engine_config.progress {
            callback(StepProgressEvent {
                phase,
                task_id: task.id.clone(),
                workspace: task.workspace.clone(),
                step_index: index,
                total_steps: task.total_steps,
                step_name: spec.name.clone(),
                step_kind: spec.kind(),
                status: status.to_string(),
                duration_ms,
            });
        }
    }

    /// Append to the task log; never fails the engine.
    fn log(&self, task: &Task, line: &str) {
        if let Err(err) = self.store.append_log(&task.workspace, &task.id, line) {
            warn!(task_id = %task.id, error = %err, "failed to append task log");
        }
    }
}

enum LoopControl {
    Continue,
    Stop,
    Fail(anyhow::Error),
}

/// Step a rejection at `gate_index` rewinds to: the template's designated
/// rework step when it lies at or before the gate, otherwise the nearest
/// prior AI/SDD step (rejecting an early gate reworks the step that fed it).
fn rework_target(template: &Template, gate_index: usize) -> Option<usize> {
    if template.steps.is_empty() {
        return None;
    }
    if let Some(designated) = template.rework_index() {
        if designated <= gate_index {
            return Some(designated);
        }
    }
    let horizon = gate_index.min(template.steps.len() - 1);
    template.steps[..=horizon]
        .iter()
        .rposition(|s| matches!(s.action, StepAction::Ai { .. } | StepAction::Sdd { .. }))
}

/// Map a failed step to the task status the state machine routes it to.
fn failure_status(spec: &StepSpec, err: &anyhow::Error) -> TaskStatus {
    match kind_of(err) {
        Some(AtlasError::CiTimeout) => TaskStatus::CiTimeout,
        Some(AtlasError::CiFailed) | Some(AtlasError::RequiredCheckMissing { .. }) => {
            TaskStatus::CiFailed
        }
        Some(AtlasError::PushRejected(_))
        | Some(AtlasError::PrCreationFailed(_))
        | Some(AtlasError::AuthFailed(_)) => TaskStatus::GhFailed,
        Some(AtlasError::ValidationFailed { .. }) => TaskStatus::ValidationFailed,
        _ => match &spec.action {
            StepAction::Git { .. } => TaskStatus::GhFailed,
            StepAction::Ci => TaskStatus::CiFailed,
            // AI, SDD, gather, validation: general failure routes through
            // validation_failed so resume re-runs the step.
            _ => TaskStatus::ValidationFailed,
        },
    }
}
