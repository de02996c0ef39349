//! File-backed persistence for workspace and task records.
//!
//! Layout under the ATLAS home:
//!
//! ```text
//! workspaces/<ws-name>/
//!   workspace.json
//!   tasks/<task-id>/
//!     task.json
//!     task.log             # append-only
//!     artifacts/           # step outputs, versioned
//! worktrees/<ws-name>/     # git worktree, managed elsewhere
//! ```
//!
//! Every record write goes through a temp-sibling + rename, so a reader sees
//! either the pre-image or the post-image, never a partial file.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::core::error::AtlasError;
use crate::core::task::{Task, TASK_SCHEMA_VERSION};
use crate::core::workspace::{Workspace, WORKSPACE_SCHEMA_VERSION};

/// Artifact versions are bounded to keep directory scans cheap.
const MAX_ARTIFACT_VERSIONS: u32 = 1000;

/// File-backed store rooted at the ATLAS home directory.
#[derive(Debug, Clone)]
pub struct FileStore {
    home: PathBuf,
}

impl FileStore {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn workspace_dir(&self, workspace: &str) -> PathBuf {
        self.home.join("workspaces").join(workspace)
    }

    pub fn worktree_dir(&self, workspace: &str) -> PathBuf {
        self.home.join("worktrees").join(workspace)
    }

    pub fn task_dir(&self, workspace: &str, task_id: &str) -> PathBuf {
        self.workspace_dir(workspace).join("tasks").join(task_id)
    }

    fn artifacts_dir(&self, workspace: &str, task_id: &str) -> PathBuf {
        self.task_dir(workspace, task_id).join("artifacts")
    }

    // --- workspace records ---

    pub fn save_workspace(&self, workspace: &Workspace) -> Result<()> {
        let path = self.workspace_dir(&workspace.name).join("workspace.json");
        debug!(workspace = %workspace.name, "saving workspace record");
        write_json_atomic(&path, workspace)
    }

    pub fn load_workspace(&self, name: &str) -> Result<Workspace> {
        let path = self.workspace_dir(name).join("workspace.json");
        if !path.exists() {
            return Err(AtlasError::NotFound(format!("workspace '{name}'")).into());
        }
        let ws: Workspace = read_json(&path)?;
        check_schema_version(ws.schema_version, WORKSPACE_SCHEMA_VERSION, &path)?;
        Ok(ws)
    }

    /// List workspace records, skipping temp siblings and entries without a
    /// readable record (corruption is surfaced only when a workspace is
    /// addressed directly, so one bad record cannot poison listings).
    pub fn list_workspaces(&self) -> Result<Vec<Workspace>> {
        let dir = self.home.join("workspaces");
        let mut out = Vec::new();
        for name in sorted_subdirs(&dir)? {
            if let Ok(ws) = self.load_workspace(&name) {
                out.push(ws);
            }
        }
        Ok(out)
    }

    /// Remove all metadata for a workspace. Idempotent.
    pub fn delete_workspace(&self, name: &str) -> Result<()> {
        let dir = self.workspace_dir(name);
        if dir.exists() {
            fs::remove_dir_all(&dir)
                .with_context(|| format!("remove workspace metadata {}", dir.display()))?;
        }
        Ok(())
    }

    // --- task records ---

    pub fn save_task(&self, task: &Task) -> Result<()> {
        let dir = self.task_dir(&task.workspace, &task.id);
        fs::create_dir_all(dir.join("artifacts"))
            .with_context(|| format!("create task dir {}", dir.display()))?;
        write_json_atomic(&dir.join("task.json"), task)
    }

    pub fn load_task(&self, workspace: &str, task_id: &str) -> Result<Task> {
        let path = self.task_dir(workspace, task_id).join("task.json");
        if !path.exists() {
            return Err(AtlasError::NotFound(format!("task '{task_id}'")).into());
        }
        let task: Task = read_json(&path)?;
        check_schema_version(task.schema_version, TASK_SCHEMA_VERSION, &path)?;
        Ok(task)
    }

    pub fn list_tasks(&self, workspace: &str) -> Result<Vec<Task>> {
        let dir = self.workspace_dir(workspace).join("tasks");
        let mut out = Vec::new();
        for id in sorted_subdirs(&dir)? {
            if let Ok(task) = self.load_task(workspace, &id) {
                out.push(task);
            }
        }
        Ok(out)
    }

    /// Find a task by id across all workspaces.
    pub fn find_task(&self, task_id: &str) -> Result<Task> {
        for ws in self.list_workspaces()? {
            let path = self.task_dir(&ws.name, task_id).join("task.json");
            if path.exists() {
                return self.load_task(&ws.name, task_id);
            }
        }
        Err(AtlasError::NotFound(format!("task '{task_id}'")).into())
    }

    /// Append one timestamped line to the task's append-only log.
    pub fn append_log(&self, workspace: &str, task_id: &str, line: &str) -> Result<()> {
        let dir = self.task_dir(workspace, task_id);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join("task.log");
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("open task log {}", path.display()))?;
        writeln!(file, "{} {}", Utc::now().to_rfc3339(), line)
            .with_context(|| format!("append task log {}", path.display()))?;
        Ok(())
    }

    // --- artifacts ---

    /// Write an artifact under a fixed filename (rename-based atomicity).
    pub fn save_artifact(
        &self,
        workspace: &str,
        task_id: &str,
        filename: &str,
        data: &[u8],
    ) -> Result<()> {
        validate_artifact_name(filename)?;
        let dir = self.artifacts_dir(workspace, task_id);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        write_bytes_atomic(&dir.join(filename), data)
    }

    /// Write an artifact under the next free version of `basename`.
    ///
    /// The first write lands at `<basename>`; later writes at `<basename>.1`,
    /// `<basename>.2`, ... (version inserted before the extension). Returns
    /// the filename actually written.
    pub fn save_versioned_artifact(
        &self,
        workspace: &str,
        task_id: &str,
        basename: &str,
        data: &[u8],
    ) -> Result<String> {
        validate_artifact_name(basename)?;
        let dir = self.artifacts_dir(workspace, task_id);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;

        for version in 0..MAX_ARTIFACT_VERSIONS {
            let filename = versioned_name(basename, version);
            let path = dir.join(&filename);
            if path.exists() {
                continue;
            }
            write_bytes_atomic(&path, data)?;
            debug!(workspace, task_id, artifact = %filename, "saved versioned artifact");
            return Ok(filename);
        }
        Err(anyhow!(
            "too many versions of artifact '{basename}' (limit {MAX_ARTIFACT_VERSIONS})"
        ))
    }

    pub fn read_artifact(&self, workspace: &str, task_id: &str, filename: &str) -> Result<Vec<u8>> {
        validate_artifact_name(filename)?;
        let path = self.artifacts_dir(workspace, task_id).join(filename);
        if !path.exists() {
            return Err(AtlasError::NotFound(format!("artifact '{filename}'")).into());
        }
        fs::read(&path).with_context(|| format!("read artifact {}", path.display()))
    }

    pub fn list_artifacts(&self, workspace: &str, task_id: &str) -> Result<Vec<String>> {
        let dir = self.artifacts_dir(workspace, task_id);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut names = Vec::new();
        for entry in fs::read_dir(&dir).with_context(|| format!("read {}", dir.display()))? {
            let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
            let name = entry.file_name().to_string_lossy().to_string();
            if name.ends_with(".tmp") {
                continue;
            }
            names.push(name);
        }
        names.sort();
        Ok(names)
    }
}

/// Insert a version number before the final extension:
/// `validation.json` -> `validation.1.json`; extensionless names get a
/// plain suffix.
fn versioned_name(basename: &str, version: u32) -> String {
    if version == 0 {
        return basename.to_string();
    }
    match basename.rsplit_once('.') {
        Some((stem, ext)) => format!("{stem}.{version}.{ext}"),
        None => format!("{basename}.{version}"),
    }
}

fn validate_artifact_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(anyhow!("artifact name must not be empty"));
    }
    if name.contains('/') || name.contains("..") {
        return Err(anyhow!("artifact name '{name}' must be a plain filename"));
    }
    Ok(())
}

fn check_schema_version(found: u32, supported: u32, path: &Path) -> Result<()> {
    if found > supported {
        return Err(anyhow!(
            "{} has schema version {found}, newer than supported {supported}; upgrade atlas",
            path.display()
        ));
    }
    Ok(())
}

fn sorted_subdirs(dir: &Path) -> Result<Vec<String>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut names = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry.with_context(|| format!("read entry in {}", dir.display()))?;
        if entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            names.push(entry.file_name().to_string_lossy().to_string());
        }
    }
    names.sort();
    Ok(names)
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).map_err(|err| {
        anyhow::Error::new(AtlasError::CorruptedState {
            path: path.to_path_buf(),
        })
        .context(format!("parse {}: {err}", path.display()))
    })
}

/// Serialize to pretty JSON with trailing newline, write to a temp sibling,
/// rename over the target.
fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut payload = serde_json::to_string_pretty(value).context("serialize json")?;
    payload.push('\n');
    write_bytes_atomic(path, payload.as_bytes())
}

fn write_bytes_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let file_name = path
        .file_name()
        .with_context(|| format!("path missing file name {}", path.display()))?
        .to_string_lossy();
    let tmp_path = parent.join(format!(".{file_name}.tmp"));
    fs::write(&tmp_path, data).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}
