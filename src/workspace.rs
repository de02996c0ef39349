//! Workspace lifecycle: create, retire, destroy.
//!
//! A workspace exclusively owns its worktree directory under
//! `<atlas_home>/worktrees/<name>`; metadata lives in a separate tree so
//! corruption in one cannot poison the other.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use tracing::{debug, info, instrument, warn};

use crate::core::cancel::CancelToken;
use crate::core::status::WorkspaceStatus;
use crate::core::workspace::{sanitize_name, Workspace};
use crate::io::git::Git;
use crate::io::lock::WorkspaceLock;
use crate::io::store::FileStore;

/// Inputs for workspace creation.
#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Raw user-supplied name; sanitized to lowercase-hyphenated.
    pub name: String,
    /// Base branch for the worktree; current branch of the repo when `None`.
    pub base_branch: Option<String>,
    /// Branch prefix, usually from the template (`feat`, `fix`, ...).
    pub branch_prefix: String,
    /// Main repository the worktree is created from.
    pub repo_root: std::path::PathBuf,
}

/// Manages workspace lifecycle against the store and git.
pub struct WorkspaceManager<'a> {
    store: &'a FileStore,
}

impl<'a> WorkspaceManager<'a> {
    pub fn new(store: &'a FileStore) -> Self {
        Self { store }
    }

    /// Create a workspace: record plus `git worktree add`, atomically.
    ///
    /// Name collisions are decorated with a numeric suffix (`name-2`,
    /// `name-3`, ...). On any failure partial state is undone so either the
    /// full record and worktree exist, or neither.
    #[instrument(skip_all, fields(name = %opts.name))]
    pub fn create(&self, cancel: &CancelToken, opts: &CreateOptions) -> Result<Workspace> {
        cancel.check()?;
        let base = sanitize_name(&opts.name);
        anyhow::ensure!(!base.is_empty(), "workspace name '{}' is empty after sanitizing", opts.name);

        let name = self.unique_name(&base)?;
        let _lock = WorkspaceLock::acquire(self.store, &name)?;

        let git = Git::new(&opts.repo_root, cancel.clone());
        let base_branch = match &opts.base_branch {
            Some(branch) => branch.clone(),
            None => git.current_branch()?,
        };
        let branch = format!("{}/{}", opts.branch_prefix, name);
        let worktree_path = self.store.worktree_dir(&name);

        info!(workspace = %name, %branch, %base_branch, "creating workspace");
        git.worktree_add(&worktree_path, &branch, &base_branch)
            .with_context(|| format!("create worktree for workspace '{name}'"))
            .map_err(|err| {
                // Undo partial state: worktree add may have left a directory.
                let _ = fs::remove_dir_all(&worktree_path);
                git.prune_worktrees();
                let _ = self.store.delete_workspace(&name);
                err
            })?;

        let workspace = Workspace::new(
            &name,
            &branch,
            &base_branch,
            worktree_path.clone(),
            opts.repo_root.clone(),
        );
        if let Err(err) = self.store.save_workspace(&workspace) {
            let _ = git.worktree_remove(&worktree_path, true);
            let _ = self.store.delete_workspace(&name);
            return Err(err).context("persist workspace record");
        }
        Ok(workspace)
    }

    /// Remove the worktree, keep the metadata. Status becomes `retired`.
    #[instrument(skip_all, fields(name))]
    pub fn retire(&self, cancel: &CancelToken, name: &str) -> Result<()> {
        cancel.check()?;
        let _lock = WorkspaceLock::acquire(self.store, name)?;
        let mut workspace = self.store.load_workspace(name)?;

        let git = Git::new(&workspace.repo_root, cancel.clone());
        git.worktree_remove(&workspace.worktree_path, true)
            .with_context(|| format!("remove worktree for workspace '{name}'"))?;
        git.prune_worktrees();

        workspace.status = WorkspaceStatus::Retired;
        workspace.updated_at = chrono::Utc::now();
        self.store.save_workspace(&workspace)?;
        info!(workspace = name, "workspace retired");
        Ok(())
    }

    /// Remove worktree and metadata. Succeeds even when the worktree is
    /// already gone or the metadata is unreadable; calling it twice is a
    /// no-op the second time.
    #[instrument(skip_all, fields(name))]
    pub fn destroy(&self, cancel: &CancelToken, name: &str) -> Result<()> {
        cancel.check()?;

        match self.store.load_workspace(name) {
            Ok(workspace) => {
                let git = Git::new(&workspace.repo_root, cancel.clone());
                if let Err(err) = git.worktree_remove(&workspace.worktree_path, true) {
                    warn!(workspace = name, error = %err, "worktree removal failed, removing directory directly");
                    remove_dir_best_effort(&workspace.worktree_path);
                }
                git.prune_worktrees();
            }
            Err(err) => {
                // Metadata unreadable or missing: still clear the worktree dir.
                debug!(workspace = name, error = %err, "destroying workspace without readable metadata");
                remove_dir_best_effort(&self.store.worktree_dir(name));
            }
        }

        self.store.delete_workspace(name)?;
        info!(workspace = name, "workspace destroyed");
        Ok(())
    }

    /// First free name among `base`, `base-2`, `base-3`, ...
    fn unique_name(&self, base: &str) -> Result<String> {
        if !self.exists(base) {
            return Ok(base.to_string());
        }
        for n in 2..1000 {
            let candidate = format!("{base}-{n}");
            if !self.exists(&candidate) {
                return Ok(candidate);
            }
        }
        anyhow::bail!("could not find a free workspace name for '{base}'")
    }

    fn exists(&self, name: &str) -> bool {
        self.store
            .workspace_dir(name)
            .join("workspace.json")
            .exists()
    }
}

fn remove_dir_best_effort(path: &Path) {
    if path.exists() {
        if let Err(err) = fs::remove_dir_all(path) {
            warn!(path = %path.display(), error = %err, "best-effort directory removal failed");
        }
    }
}
