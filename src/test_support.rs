//! Test-only helpers: scripted runners and temp fixtures.
//!
//! Scripted runners return predetermined outputs without spawning processes,
//! so engine and step tests stay hermetic. `TestRepo` builds a real git
//! repository in a temp directory for worktree and commit coverage.

use std::collections::VecDeque;
use std::path::Path;
use std::process::Command;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use tempfile::TempDir;

use crate::config::AtlasConfig;
use crate::core::cancel::CancelToken;
use crate::core::workspace::Workspace;
use crate::io::ai::{AiRequest, AiResult, AiRunner};
use crate::io::git::Git;
use crate::io::github::{CheckLister, CheckResult, GhRunner};
use crate::io::store::FileStore;
use crate::notify::Notifier;
use crate::steps::Deps;

/// A real git repository in a temp directory, with one initial commit so
/// worktrees can be created from it.
pub struct TestRepo {
    temp: TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = TempDir::new().context("create temp dir")?;
        let repo = Self { temp };
        repo.git(&["init", "--initial-branch=main"])?;
        repo.git(&["config", "user.email", "atlas-test@example.invalid"])?;
        repo.git(&["config", "user.name", "atlas test"])?;
        std::fs::write(repo.root().join("README.md"), "# test repo\n")
            .context("write README")?;
        repo.git(&["add", "-A"])?;
        repo.git(&["commit", "-m", "initial commit"])?;
        Ok(repo)
    }

    pub fn root(&self) -> &Path {
        self.temp.path()
    }

    pub fn write_file(&self, name: &str, contents: &str) -> Result<()> {
        std::fs::write(self.root().join(name), contents)
            .with_context(|| format!("write {name}"))
    }

    fn git(&self, args: &[&str]) -> Result<()> {
        let status = Command::new("git")
            .args(args)
            .current_dir(self.root())
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))?;
        if !status.status.success() {
            return Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&status.stderr).trim()
            ));
        }
        Ok(())
    }
}

/// One scripted AI invocation outcome.
#[derive(Debug, Clone)]
pub enum ScriptedAiOutcome {
    Success(AiResult),
    Failure(String),
}

impl ScriptedAiOutcome {
    pub fn ok(summary: &str) -> Self {
        Self::Success(AiResult {
            raw: format!("{{\"result\":\"{summary}\"}}"),
            summary: summary.to_string(),
            no_changes: false,
        })
    }

    pub fn no_changes() -> Self {
        Self::Success(AiResult {
            raw: "{\"result\":\"nothing to do\",\"no_changes\":true}".to_string(),
            summary: "nothing to do".to_string(),
            no_changes: true,
        })
    }
}

/// AI runner that replays scripted outcomes; repeats the default success once
/// the script is exhausted.
#[derive(Debug, Default)]
pub struct ScriptedAi {
    script: Mutex<VecDeque<ScriptedAiOutcome>>,
    calls: AtomicUsize,
}

impl ScriptedAi {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_script(outcomes: Vec<ScriptedAiOutcome>) -> Self {
        Self {
            script: Mutex::new(outcomes.into()),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl AiRunner for ScriptedAi {
    fn run(&self, cancel: &CancelToken, _request: &AiRequest) -> Result<AiResult> {
        cancel.check()?;
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = self.script.lock().expect("script lock").pop_front();
        match next.unwrap_or_else(|| ScriptedAiOutcome::ok("ok")) {
            ScriptedAiOutcome::Success(result) => Ok(result),
            ScriptedAiOutcome::Failure(message) => Err(anyhow!(message)),
        }
    }
}

/// Check lister that replays rounds of results; the final round repeats
/// forever.
#[derive(Debug, Default)]
pub struct ScriptedChecks {
    rounds: Mutex<(Vec<Vec<CheckResult>>, usize)>,
}

impl ScriptedChecks {
    /// The same round on every poll.
    pub fn repeating(checks: Vec<CheckResult>) -> Self {
        Self::sequence(vec![checks])
    }

    /// One round per poll; the last round repeats.
    pub fn sequence(rounds: Vec<Vec<CheckResult>>) -> Self {
        Self {
            rounds: Mutex::new((rounds, 0)),
        }
    }
}

impl CheckLister for ScriptedChecks {
    fn list_checks(&self, _pr_number: u64) -> Result<Vec<CheckResult>> {
        let mut state = self.rounds.lock().expect("rounds lock");
        let (rounds, idx) = &mut *state;
        if rounds.is_empty() {
            return Ok(Vec::new());
        }
        let round = rounds[(*idx).min(rounds.len() - 1)].clone();
        *idx += 1;
        Ok(round)
    }
}

/// Temp ATLAS home with a store.
pub struct TestHome {
    temp: TempDir,
    store: FileStore,
}

impl TestHome {
    pub fn new() -> Self {
        let temp = TempDir::new().expect("tempdir");
        let store = FileStore::new(temp.path());
        Self { temp, store }
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn store(&self) -> &FileStore {
        &self.store
    }

    /// Fixture bundling everything a [`Deps`] borrows, with scripted
    /// runners. Customize the public fields before calling [`DepsFixture::deps`].
    pub fn deps(&self) -> DepsFixture<'_> {
        let worktree = self.temp.path().join("worktrees").join("ws");
        std::fs::create_dir_all(&worktree).expect("create worktree dir");
        let cancel = CancelToken::new();
        let mut config = AtlasConfig::default();
        config.home = self.temp.path().to_path_buf();
        let workspace = Workspace::new(
            "ws",
            "feat/ws",
            "main",
            worktree.clone(),
            self.temp.path().to_path_buf(),
        );
        DepsFixture {
            store: &self.store,
            config,
            notifier: Notifier::new(false),
            git: Git::new(&worktree, cancel.clone()),
            gh: GhRunner::new(&worktree, cancel, std::time::Duration::from_secs(30)),
            workspace,
            ai: ScriptedAi::new(),
            checks: ScriptedChecks::default(),
        }
    }
}

impl Default for TestHome {
    fn default() -> Self {
        Self::new()
    }
}

/// Owns every collaborator a [`Deps`] borrows.
pub struct DepsFixture<'a> {
    pub store: &'a FileStore,
    pub config: AtlasConfig,
    pub notifier: Notifier,
    pub workspace: Workspace,
    pub git: Git,
    pub gh: GhRunner,
    pub ai: ScriptedAi,
    pub checks: ScriptedChecks,
}

impl DepsFixture<'_> {
    pub fn deps(&self) -> Deps<'_> {
        Deps {
            store: self.store,
            config: &self.config,
            notifier: &self.notifier,
            workspace: &self.workspace,
            git: &self.git,
            gh: &self.gh,
            ai: &self.ai,
            checks: &self.checks,
        }
    }
}
