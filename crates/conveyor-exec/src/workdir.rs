// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Workspace layout.
//!
//! The shared tmp directory is partitioned per project. Cloned repositories
//! are cached per template inside the project directory; inventory and
//! credential artefacts live in a per-task directory that is acquired
//! exclusively and removed when the task exits, on every path including
//! panics.

use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

/// Workspace paths of the execution engine.
#[derive(Debug, Clone)]
pub struct WorkPaths {
    /// Shared tmp directory.
    pub tmp_path: PathBuf,
}

impl WorkPaths {
    /// Layout rooted at `tmp_path`.
    pub fn new(tmp_path: impl Into<PathBuf>) -> Self {
        Self {
            tmp_path: tmp_path.into(),
        }
    }

    /// Ensure the shared tmp directory exists.
    pub fn ensure_tmp_dir(&self) -> Result<()> {
        std::fs::create_dir_all(&self.tmp_path)?;
        Ok(())
    }

    /// Per-project cache directory.
    pub fn project_dir(&self, project_id: i64) -> PathBuf {
        self.tmp_path.join(format!("project_{project_id}"))
    }

    /// Clone cache of a repository, scoped per template so concurrent
    /// templates never share a checkout.
    pub fn repository_dir(&self, project_id: i64, repository_id: i64, template_id: i64) -> PathBuf {
        self.project_dir(project_id)
            .join(format!("repository_{repository_id}_{template_id}"))
    }

    /// Acquire the per-task artefact directory.
    pub fn acquire_task_dir(&self, project_id: i64, task_id: i64) -> Result<TaskDir> {
        let path = self
            .project_dir(project_id)
            .join(format!("task_{task_id}"));

        if path.exists() {
            return Err(Error::Other(format!(
                "task directory already acquired: {}",
                path.display()
            )));
        }
        std::fs::create_dir_all(&path)?;

        Ok(TaskDir { path })
    }

    /// Remove the whole tmp directory (agent cache clear).
    pub fn clear(&self) -> Result<()> {
        remove_if_present(&self.tmp_path)
    }

    /// Remove one project's cache directory.
    pub fn clear_project(&self, project_id: i64) -> Result<()> {
        remove_if_present(&self.project_dir(project_id))
    }
}

fn remove_if_present(path: &Path) -> Result<()> {
    match std::fs::remove_dir_all(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

/// Exclusively held per-task artefact directory. Removed on drop.
#[derive(Debug)]
pub struct TaskDir {
    path: PathBuf,
}

impl TaskDir {
    /// Directory path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for TaskDir {
    fn drop(&mut self) {
        if let Err(e) = remove_if_present(&self.path) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to remove task dir");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn task_dir_is_exclusive_and_removed_on_drop() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = WorkPaths::new(tmp.path());

        let dir = paths.acquire_task_dir(1, 42).unwrap();
        let kept = dir.path().to_path_buf();
        assert!(kept.is_dir());

        // second acquisition of the same task must fail
        assert!(paths.acquire_task_dir(1, 42).is_err());

        drop(dir);
        assert!(!kept.exists());

        // after release the directory can be acquired again
        let again = paths.acquire_task_dir(1, 42).unwrap();
        assert!(again.path().is_dir());
    }

    #[test]
    fn repository_dir_is_scoped_per_template() {
        let paths = WorkPaths::new("/tmp/conveyor");
        let a = paths.repository_dir(1, 5, 7);
        let b = paths.repository_dir(1, 5, 8);
        assert_ne!(a, b);
        assert!(a.starts_with("/tmp/conveyor/project_1"));
    }
}
