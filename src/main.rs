//! ATLAS CLI: template-driven AI development tasks in isolated worktrees.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};

use atlas::config::load_config;
use atlas::core::cancel::CancelToken;
use atlas::core::error::{is_cancelled, kind_of, AtlasError};
use atlas::core::status::TaskStatus;
use atlas::engine::Engine;
use atlas::io::ai::ClaudeCliRunner;
use atlas::io::store::FileStore;
use atlas::notify::Notifier;
use atlas::templates::Registry;
use atlas::workspace::{CreateOptions, WorkspaceManager};
use atlas::{exit_codes, logging};

#[derive(Parser)]
#[command(
    name = "atlas",
    version,
    about = "Orchestrate AI-assisted development tasks in isolated git worktrees"
)]
struct Cli {
    /// ATLAS home directory (default: $ATLAS_HOME, else ~/.atlas).
    #[arg(long, global = true)]
    home: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a new task from a template.
    Start {
        /// Template name (feature, bugfix, commit, fix, ...).
        #[arg(short, long)]
        template: String,
        /// Workspace name; created if it does not exist.
        #[arg(short, long)]
        workspace: String,
        /// Base branch for a new workspace (default: current branch).
        #[arg(long)]
        base: Option<String>,
        /// Task description.
        description: String,
    },
    /// Show workspaces and their tasks.
    Status {
        /// Limit to one workspace.
        #[arg(short, long)]
        workspace: Option<String>,
    },
    /// Approve the task waiting at its approval gate.
    Approve { task_id: String },
    /// Reject the task; with feedback the task reworks, without it the task
    /// is terminally rejected.
    Reject {
        task_id: String,
        #[arg(short, long)]
        feedback: Option<String>,
    },
    /// Abandon a task, keeping worktree and artifacts.
    Abandon { task_id: String },
    /// Resume a task after a failure, crash, or rework.
    Resume { task_id: String },
    /// Workspace maintenance.
    #[command(subcommand)]
    Workspace(WorkspaceCommand),
    /// Follow a task's status until it needs attention.
    Watch { task_id: String },
}

#[derive(Subcommand)]
enum WorkspaceCommand {
    /// Remove the worktree, keep metadata.
    Retire { name: String },
    /// Remove worktree and metadata.
    Destroy { name: String },
}

static INTERRUPTED: AtomicBool = AtomicBool::new(false);

extern "C" fn on_sigint(_signal: libc::c_int) {
    INTERRUPTED.store(true, Ordering::SeqCst);
}

fn install_sigint_handler(cancel: CancelToken) {
    // SAFETY: installing a signal handler that only touches an atomic.
    unsafe {
        libc::signal(libc::SIGINT, on_sigint as libc::sighandler_t);
    }
    std::thread::spawn(move || loop {
        if INTERRUPTED.load(Ordering::SeqCst) {
            cancel.cancel();
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    });
}

fn main() {
    logging::init();
    let cli = Cli::parse();

    let cancel = CancelToken::new();
    install_sigint_handler(cancel.clone());

    std::process::exit(match run(&cli, &cancel) {
        Ok(code) => code,
        Err(err) => {
            eprintln!("{err:#}");
            classify_exit(&err)
        }
    });
}

fn classify_exit(err: &anyhow::Error) -> i32 {
    if is_cancelled(err) {
        return exit_codes::CANCELLED;
    }
    match kind_of(err) {
        Some(AtlasError::InvalidTransition { .. }) | Some(AtlasError::NotFound(_)) => {
            exit_codes::USAGE
        }
        _ => exit_codes::FAILURE,
    }
}

fn run(cli: &Cli, cancel: &CancelToken) -> Result<i32> {
    let home = resolve_home(cli.home.clone())?;
    let config = load_config(&home.join("config.toml"))?;
    let store = FileStore::new(&home);
    let registry = Registry::with_builtins();
    let notifier = Notifier::new(config.bell_enabled);
    let ai = ClaudeCliRunner::new(config.ai.command.clone());
    let engine = Engine::new(&store, &registry, &config, &notifier, &ai);

    match &cli.command {
        Command::Start {
            template,
            workspace,
            base,
            description,
        } => cmd_start(
            cancel, &store, &registry, &engine, template, workspace, base.clone(), description,
        ),
        Command::Status { workspace } => cmd_status(&store, workspace.as_deref()),
        Command::Approve { task_id } => {
            let task = engine.approve(cancel, task_id)?;
            println!("{} -> {}", task.id, task.status);
            Ok(task_exit_code(task.status))
        }
        Command::Reject { task_id, feedback } => {
            let task = engine.reject(cancel, task_id, feedback.as_deref())?;
            println!("{} -> {}", task.id, task.status);
            Ok(task_exit_code(task.status))
        }
        Command::Abandon { task_id } => {
            let task = engine.abandon(cancel, task_id, "abandoned by user")?;
            println!("{} -> {}", task.id, task.status);
            Ok(exit_codes::OK)
        }
        Command::Resume { task_id } => {
            let task = engine.resume(cancel, task_id)?;
            println!("{} -> {}", task.id, task.status);
            Ok(task_exit_code(task.status))
        }
        Command::Workspace(cmd) => {
            let manager = WorkspaceManager::new(&store);
            match cmd {
                WorkspaceCommand::Retire { name } => {
                    manager.retire(cancel, name)?;
                    println!("workspace '{name}' retired");
                }
                WorkspaceCommand::Destroy { name } => {
                    manager.destroy(cancel, name)?;
                    println!("workspace '{name}' destroyed");
                }
            }
            Ok(exit_codes::OK)
        }
        Command::Watch { task_id } => cmd_watch(cancel, &store, task_id),
    }
}

#[allow(clippy::too_many_arguments)]
fn cmd_start(
    cancel: &CancelToken,
    store: &FileStore,
    registry: &Registry,
    engine: &Engine<'_>,
    template: &str,
    workspace_name: &str,
    base: Option<String>,
    description: &str,
) -> Result<i32> {
    let template_def = registry.get(template)?;
    let manager = WorkspaceManager::new(store);

    let workspace = match store.load_workspace(workspace_name) {
        Ok(existing) => existing,
        Err(_) => manager.create(
            cancel,
            &CreateOptions {
                name: workspace_name.to_string(),
                base_branch: base,
                branch_prefix: template_def.branch_prefix.clone(),
                repo_root: std::env::current_dir().context("resolve current directory")?,
            },
        )?,
    };

    let task = engine.start(cancel, &workspace, template, description, BTreeMap::new())?;
    println!("{} [{}] {}", task.id, task.status, task.description);
    Ok(task_exit_code(task.status))
}

fn cmd_status(store: &FileStore, workspace: Option<&str>) -> Result<i32> {
    let workspaces = match workspace {
        Some(name) => vec![store.load_workspace(name)?],
        None => store.list_workspaces()?,
    };
    if workspaces.is_empty() {
        println!("no workspaces");
        return Ok(exit_codes::OK);
    }
    for ws in workspaces {
        println!("{} [{:?}] branch {}", ws.name, ws.status, ws.branch);
        for task in store.list_tasks(&ws.name)? {
            println!(
                "  {} [{}] step {}/{} {}",
                task.id, task.status, task.current_step_index, task.total_steps, task.description
            );
        }
    }
    Ok(exit_codes::OK)
}

fn cmd_watch(cancel: &CancelToken, store: &FileStore, task_id: &str) -> Result<i32> {
    loop {
        let task = store.find_task(task_id)?;
        let step_name = task
            .steps
            .get(task.current_step_index)
            .map(|s| s.name.as_str())
            .unwrap_or("-");
        println!(
            "{} [{}] step {}/{} ({step_name})",
            task.id, task.status, task.current_step_index, task.total_steps
        );
        if task.status.is_terminal() || task.status.needs_attention() {
            return Ok(task_exit_code(task.status));
        }
        cancel.sleep(Duration::from_secs(2))?;
    }
}

/// Exit code for a task's final status: attention/error states are
/// user-visible failures, everything else is success.
fn task_exit_code(status: TaskStatus) -> i32 {
    if status.is_error() {
        exit_codes::FAILURE
    } else {
        exit_codes::OK
    }
}

fn resolve_home(flag: Option<PathBuf>) -> Result<PathBuf> {
    if let Some(home) = flag {
        return Ok(home);
    }
    if let Some(home) = std::env::var_os("ATLAS_HOME") {
        return Ok(PathBuf::from(home));
    }
    let user_home = std::env::var_os("HOME").context("HOME is not set")?;
    Ok(PathBuf::from(user_home).join(".atlas"))
}
