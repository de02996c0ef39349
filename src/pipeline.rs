//! Validation pipeline: format, then a parallel group of lint / test /
//! pre-commit.
//!
//! Failure semantics: a command is failed when it exits non-zero or cannot be
//! run at all. The first failure in the parallel group marks the pipeline
//! failed but in-flight siblings are allowed to complete, so the user sees
//! every failure at once. `failed_step` is the earliest-ordered failed stage
//! (format < lint < test < pre_commit).

use std::path::Path;
use std::thread;
use std::time::Instant;

use anyhow::Result;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::config::ValidationConfig;
use crate::core::cancel::CancelToken;
use crate::core::error::is_cancelled;
use crate::io::process::run_command;
use crate::notify::Notifier;

/// Per-command ceiling. Validation commands are user-configured and bounded
/// here rather than per-command.
const COMMAND_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(15 * 60);

/// Outcome of one validation command.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandResult {
    pub command: String,
    pub success: bool,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub error: String,
    pub started_at: String,
    pub completed_at: String,
}

/// Outcome of one pipeline run; persisted verbatim as `validation.json`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineResult {
    pub success: bool,
    pub format_results: Vec<CommandResult>,
    pub lint_results: Vec<CommandResult>,
    pub test_results: Vec<CommandResult>,
    pub pre_commit_results: Vec<CommandResult>,
    pub duration_ms: u64,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub failed_step: String,
}

impl PipelineResult {
    fn stage_failed(results: &[CommandResult]) -> bool {
        results.iter().any(|r| !r.success)
    }
}

/// Run the full pipeline in `workdir`.
///
/// Phase 1: format commands, sequential (they mutate files and must finish
/// before anything else reads the tree). Phase 2: lint, test, and pre-commit
/// stages run concurrently; commands within each stage stay sequential.
///
/// Returns `Err` only on cancellation; all command failures are reported in
/// the result. A failing run rings the notifier bell exactly once.
#[instrument(skip_all, fields(workdir = %workdir.display()))]
pub fn run_pipeline(
    cancel: &CancelToken,
    config: &ValidationConfig,
    workdir: &Path,
    output_limit_bytes: usize,
    notifier: &Notifier,
) -> Result<PipelineResult> {
    let start = Instant::now();
    let mut result = PipelineResult {
        success: true,
        ..PipelineResult::default()
    };

    info!("starting validation pipeline");
    cancel.check()?;

    // Phase 1: format.
    result.format_results = run_stage(cancel, &config.format_commands, workdir, output_limit_bytes)?;
    if PipelineResult::stage_failed(&result.format_results) {
        warn!("format stage failed");
        return Ok(finalize(result, "format", start, notifier));
    }

    cancel.check()?;

    // Phase 2: lint, test, pre-commit in parallel. Each closure returns its
    // stage results; cancellation is surfaced after all siblings finish.
    let (lint, test, pre_commit) = thread::scope(|scope| {
        let lint = scope.spawn(|| run_stage(cancel, &config.lint_commands, workdir, output_limit_bytes));
        let test = scope.spawn(|| run_stage(cancel, &config.test_commands, workdir, output_limit_bytes));
        let pre_commit =
            scope.spawn(|| run_stage(cancel, &config.pre_commit_commands, workdir, output_limit_bytes));
        (
            lint.join().expect("lint stage thread panicked"),
            test.join().expect("test stage thread panicked"),
            pre_commit.join().expect("pre-commit stage thread panicked"),
        )
    });

    // run_stage only errors on cancellation; command failures are folded
    // into the results.
    result.lint_results = lint?;
    result.test_results = test?;
    result.pre_commit_results = pre_commit?;

    let failed_step = ["lint", "test", "pre_commit"]
        .into_iter()
        .zip([
            &result.lint_results,
            &result.test_results,
            &result.pre_commit_results,
        ])
        .find(|(_, results)| PipelineResult::stage_failed(results))
        .map(|(name, _)| name);

    if let Some(step) = failed_step {
        warn!(failed_step = step, "validation pipeline failed");
        return Ok(finalize(result, step, start, notifier));
    }

    result.duration_ms = start.elapsed().as_millis() as u64;
    info!(duration_ms = result.duration_ms, "validation pipeline completed");
    Ok(result)
}

fn finalize(
    mut result: PipelineResult,
    failed_step: &str,
    start: Instant,
    notifier: &Notifier,
) -> PipelineResult {
    result.success = false;
    result.failed_step = failed_step.to_string();
    result.duration_ms = start.elapsed().as_millis() as u64;
    notifier.bell();
    result
}

/// Run one stage's command list sequentially, stopping at the first failure.
fn run_stage(
    cancel: &CancelToken,
    commands: &[String],
    workdir: &Path,
    output_limit_bytes: usize,
) -> Result<Vec<CommandResult>> {
    let mut results = Vec::with_capacity(commands.len());
    for command in commands {
        cancel.check()?;
        let result = run_one(cancel, command, workdir, output_limit_bytes)?;
        let failed = !result.success;
        results.push(result);
        if failed {
            break;
        }
    }
    Ok(results)
}

/// Run a single user-configured command through the shell. Exit code alone
/// determines success; spawn failures become a failed result with `error`.
fn run_one(
    cancel: &CancelToken,
    command: &str,
    workdir: &Path,
    output_limit_bytes: usize,
) -> Result<CommandResult> {
    let started_at = Utc::now().to_rfc3339();
    let start = Instant::now();
    debug!(command, "running validation command");

    match run_command(
        cancel,
        workdir,
        "sh",
        &["-c", command],
        COMMAND_TIMEOUT,
        output_limit_bytes,
    ) {
        Ok(output) => Ok(CommandResult {
            command: command.to_string(),
            success: output.success(),
            exit_code: output.exit_code,
            stdout: output.stdout,
            stderr: output.stderr,
            duration_ms: output.duration.as_millis() as u64,
            error: String::new(),
            started_at,
            completed_at: Utc::now().to_rfc3339(),
        }),
        Err(err) if is_cancelled(&err) => Err(err),
        Err(err) => Ok(CommandResult {
            command: command.to_string(),
            success: false,
            exit_code: -1,
            stdout: String::new(),
            stderr: String::new(),
            duration_ms: start.elapsed().as_millis() as u64,
            error: format!("{err:#}"),
            started_at,
            completed_at: Utc::now().to_rfc3339(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(format: &[&str], lint: &[&str], test: &[&str]) -> ValidationConfig {
        ValidationConfig {
            format_commands: format.iter().map(|s| s.to_string()).collect(),
            lint_commands: lint.iter().map(|s| s.to_string()).collect(),
            test_commands: test.iter().map(|s| s.to_string()).collect(),
            pre_commit_commands: Vec::new(),
        }
    }

    fn run(config: &ValidationConfig, notifier: &Notifier) -> PipelineResult {
        let temp = tempfile::tempdir().expect("tempdir");
        let cancel = CancelToken::new();
        run_pipeline(&cancel, config, temp.path(), 100_000, notifier).expect("pipeline")
    }

    #[test]
    fn happy_path_all_stages_pass() {
        let notifier = Notifier::new(false);
        let result = run(&config(&["true"], &["true"], &["true"]), &notifier);
        assert!(result.success);
        assert!(result.failed_step.is_empty());
        assert_eq!(result.format_results.len(), 1);
        assert_eq!(result.lint_results.len(), 1);
        assert_eq!(result.test_results.len(), 1);
        assert_eq!(notifier.rung_count(), 0, "no bell on success");
    }

    #[test]
    fn mixed_failure_reports_failed_step_and_bells_once() {
        let notifier = Notifier::new(false);
        let result = run(&config(&["true"], &["true"], &["false"]), &notifier);
        assert!(!result.success);
        assert_eq!(result.failed_step, "test");
        assert_eq!(result.test_results[0].exit_code, 1);
        assert!(result.lint_results[0].success, "siblings ran to completion");
        assert_eq!(notifier.rung_count(), 1, "exactly one bell per failed run");
    }

    #[test]
    fn failed_step_is_earliest_ordered_stage() {
        let notifier = Notifier::new(false);
        let result = run(&config(&["true"], &["false"], &["false"]), &notifier);
        assert_eq!(result.failed_step, "lint");
    }

    #[test]
    fn format_failure_skips_parallel_group() {
        let notifier = Notifier::new(false);
        let result = run(&config(&["false"], &["true"], &["true"]), &notifier);
        assert!(!result.success);
        assert_eq!(result.failed_step, "format");
        assert!(result.lint_results.is_empty());
        assert!(result.test_results.is_empty());
    }

    #[test]
    fn no_commands_configured_is_success() {
        let notifier = Notifier::new(false);
        let result = run(&ValidationConfig::default(), &notifier);
        assert!(result.success);
        assert!(result.format_results.is_empty());
        assert!(result.lint_results.is_empty());
        assert!(result.test_results.is_empty());
        assert!(result.pre_commit_results.is_empty());
    }

    #[test]
    fn stage_stops_at_first_failing_command() {
        let notifier = Notifier::new(false);
        let cfg = config(&["true"], &["false", "true"], &[]);
        let result = run(&cfg, &notifier);
        assert_eq!(result.lint_results.len(), 1, "second lint command not run");
    }

    #[test]
    fn unrunnable_command_is_a_failure_with_error() {
        let notifier = Notifier::new(false);
        let cfg = config(&[], &["definitely-not-a-real-program-xyz"], &[]);
        let result = run(&cfg, &notifier);
        // The shell reports a missing program through its exit code.
        assert!(!result.success);
        assert_eq!(result.failed_step, "lint");
        assert!(!result.lint_results[0].success);
    }

    #[test]
    fn cancelled_pipeline_propagates_cancellation() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cancel = CancelToken::new();
        cancel.cancel();
        let notifier = Notifier::new(false);
        let err = run_pipeline(
            &cancel,
            &config(&["true"], &[], &[]),
            temp.path(),
            100_000,
            &notifier,
        )
        .unwrap_err();
        assert!(crate::core::error::is_cancelled(&err));
    }

    #[test]
    fn result_serializes_for_artifact() {
        let notifier = Notifier::new(false);
        let result = run(&config(&["true"], &[], &[]), &notifier);
        let json = serde_json::to_string_pretty(&result).expect("serialize");
        let back: PipelineResult = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(back, result);
    }
}
