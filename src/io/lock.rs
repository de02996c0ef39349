//! Per-workspace advisory file lock.
//!
//! Serializes metadata writers for one workspace. A second writer fails fast
//! with `AtlasError::Locked` instead of blocking, so concurrent CLI
//! invocations surface immediately.

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;

use anyhow::{Context, Result};
use fs2::FileExt;
use tracing::debug;

use crate::core::error::AtlasError;
use crate::io::store::FileStore;

/// Held advisory lock; released on drop.
#[derive(Debug)]
pub struct WorkspaceLock {
    file: File,
    path: PathBuf,
}

impl WorkspaceLock {
    /// Acquire the exclusive lock for a workspace, failing fast when another
    /// process holds it.
    pub fn acquire(store: &FileStore, workspace: &str) -> Result<Self> {
        let dir = store.workspace_dir(workspace);
        fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
        let path = dir.join(".lock");
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("open lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(AtlasError::Locked {
                workspace: workspace.to_string(),
            }
            .into());
        }
        debug!(workspace, "acquired workspace lock");
        Ok(Self { file, path })
    }
}

impl Drop for WorkspaceLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
        debug!(path = %self.path.display(), "released workspace lock");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_writer_fails_fast() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path());

        let _held = WorkspaceLock::acquire(&store, "ws").expect("first lock");
        let err = WorkspaceLock::acquire(&store, "ws").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<AtlasError>(),
            Some(AtlasError::Locked { workspace }) if workspace == "ws"
        ));
    }

    #[test]
    fn lock_released_on_drop() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path());

        drop(WorkspaceLock::acquire(&store, "ws").expect("first lock"));
        WorkspaceLock::acquire(&store, "ws").expect("relock after drop");
    }

    #[test]
    fn locks_on_distinct_workspaces_are_independent() {
        let temp = tempfile::tempdir().expect("tempdir");
        let store = FileStore::new(temp.path());

        let _a = WorkspaceLock::acquire(&store, "a").expect("lock a");
        let _b = WorkspaceLock::acquire(&store, "b").expect("lock b");
    }
}
