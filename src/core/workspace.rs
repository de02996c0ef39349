//! Workspace record persisted under `workspaces/<name>/workspace.json`.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::status::WorkspaceStatus;

/// Current workspace record schema. Readers refuse anything newer.
pub const WORKSPACE_SCHEMA_VERSION: u32 = 1;

/// A named, isolated working directory (git worktree) and its metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workspace {
    /// Unique name within the host (lowercase, hyphenated).
    pub name: String,
    /// Branch the worktree is checked out on.
    pub branch: String,
    /// Branch the worktree was created from.
    pub base_branch: String,
    /// Path of the git worktree. Exists iff status != retired.
    pub worktree_path: PathBuf,
    /// Main repository the worktree was created from; worktree bookkeeping
    /// commands run here even after the worktree itself is gone.
    pub repo_root: PathBuf,
    pub status: WorkspaceStatus,
    /// Id of the most recently started task, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub latest_task: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub schema_version: u32,
}

impl Workspace {
    pub fn new(
        name: &str,
        branch: &str,
        base_branch: &str,
        worktree_path: PathBuf,
        repo_root: PathBuf,
    ) -> Self {
        let now = Utc::now();
        Self {
            name: name.to_string(),
            branch: branch.to_string(),
            base_branch: base_branch.to_string(),
            worktree_path,
            repo_root,
            status: WorkspaceStatus::Active,
            latest_task: None,
            created_at: now,
            updated_at: now,
            schema_version: WORKSPACE_SCHEMA_VERSION,
        }
    }
}

/// Sanitize a user-supplied workspace name: lowercase, hyphenated, trimmed.
pub fn sanitize_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.trim().chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else if (ch == '-' || ch == '_' || ch.is_whitespace() || ch == '/')
            && !out.ends_with('-')
        {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}
