//! AI CLI abstraction.
//!
//! The [`AiRunner`] trait decouples step execution from the actual agent
//! backend. Tests use scripted runners that return predetermined outputs
//! without spawning processes.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{anyhow, Result};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::retry::ErrorClass;
use crate::io::process::{run_command, CommandError, CommandErrorKind};

/// Parameters for one AI invocation.
#[derive(Debug, Clone)]
pub struct AiRequest {
    /// Working directory the agent operates in (the task's worktree).
    pub workdir: PathBuf,
    /// Fully rendered prompt text.
    pub prompt: String,
    /// Model override; empty means the CLI default.
    pub model: String,
    /// Wall-clock ceiling for the invocation.
    pub timeout: Duration,
    /// Truncate captured output beyond this many bytes.
    pub output_limit_bytes: usize,
}

/// Structured result of one AI invocation.
#[derive(Debug, Clone)]
pub struct AiResult {
    /// Full stdout payload, persisted verbatim as the step artifact.
    pub raw: String,
    /// Short summary pulled from the structured output, when present.
    pub summary: String,
    /// Agent declared that no modifications were needed.
    pub no_changes: bool,
}

/// Abstraction over AI CLI backends. `Sync` so parallel step groups can share
/// one runner.
pub trait AiRunner: Sync {
    fn run(&self, cancel: &CancelToken, request: &AiRequest) -> Result<AiResult>;
}

/// Runner that spawns the Claude CLI in print mode.
#[derive(Debug, Clone)]
pub struct ClaudeCliRunner {
    command: String,
}

impl ClaudeCliRunner {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
        }
    }
}

impl AiRunner for ClaudeCliRunner {
    #[instrument(skip_all, fields(timeout_secs = request.timeout.as_secs()))]
    fn run(&self, cancel: &CancelToken, request: &AiRequest) -> Result<AiResult> {
        info!(workdir = %request.workdir.display(), "starting AI invocation");

        let mut args = vec!["-p", request.prompt.as_str(), "--output-format", "json"];
        if !request.model.is_empty() {
            args.push("--model");
            args.push(&request.model);
        }

        let output = run_command(
            cancel,
            &request.workdir,
            &self.command,
            &args,
            request.timeout,
            request.output_limit_bytes,
        )?;

        if !output.success() {
            warn!(exit_code = output.exit_code, "AI invocation failed");
            return Err(anyhow!(
                "{} exited with code {}: {}",
                self.command,
                output.exit_code,
                output.stderr.trim().lines().last().unwrap_or("")
            ));
        }

        debug!(bytes = output.stdout.len(), "AI invocation completed");
        Ok(parse_ai_output(&output.stdout))
    }
}

/// Pull summary and no-changes marker out of the CLI's JSON envelope.
/// Non-JSON output is kept raw with an empty summary; the artifact still
/// carries everything.
pub fn parse_ai_output(stdout: &str) -> AiResult {
    let parsed: Option<Value> = serde_json::from_str(stdout.trim()).ok();
    let summary = parsed
        .as_ref()
        .and_then(|v| {
            v.get("result")
                .or_else(|| v.get("summary"))
                .or_else(|| v.get("message"))
        })
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    let no_changes = parsed
        .as_ref()
        .and_then(|v| v.get("no_changes"))
        .and_then(Value::as_bool)
        .unwrap_or(false);
    AiResult {
        raw: stdout.to_string(),
        summary,
        no_changes,
    }
}

/// Classify an AI CLI failure for the retry controller.
pub fn classify_ai_error(err: &anyhow::Error) -> ErrorClass {
    if let Some(cmd_err) = err.downcast_ref::<CommandError>() {
        return match cmd_err.kind {
            CommandErrorKind::Cancelled => ErrorClass::Cancelled,
            CommandErrorKind::Timeout => ErrorClass::Transient,
            _ => ErrorClass::Permanent,
        };
    }
    let text = format!("{err:#}").to_lowercase();
    const TRANSIENT: &[&str] = &["overloaded", "rate limit", "429", "500", "502", "503", "529"];
    if TRANSIENT.iter().any(|marker| text.contains(marker)) {
        return ErrorClass::Transient;
    }
    crate::core::retry::classify_by_kind(err)
}
