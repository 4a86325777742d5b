// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Repository entity.

use serde::{Deserialize, Serialize};

/// Where a repository lives. Derived from the URL, never stored.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepositoryKind {
    /// Filesystem path used in place; never cloned.
    Local,
    /// Remote git URL; cloned into the per-template cache.
    Remote,
}

/// Git source (or local path) referenced by templates.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Repository {
    /// Unique identifier.
    pub id: i64,
    /// Owning project.
    pub project_id: i64,
    /// Display name.
    pub name: String,
    /// Git URL or filesystem path.
    pub git_url: String,
    /// Default branch checked out for tasks.
    pub git_branch: String,
    /// Key used to fetch the repository.
    pub ssh_key_id: Option<i64>,
}

impl Repository {
    /// Kind derived from the URL: filesystem paths are local.
    pub fn kind(&self) -> RepositoryKind {
        if self.git_url.starts_with('/') || self.git_url.starts_with("file://") {
            RepositoryKind::Local
        } else {
            RepositoryKind::Remote
        }
    }

    /// Filesystem path of a local repository.
    pub fn local_path(&self) -> &str {
        self.git_url.strip_prefix("file://").unwrap_or(&self.git_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_is_derived_from_url() {
        let mut repo = Repository {
            git_url: "git@github.com:acme/infra.git".into(),
            ..Default::default()
        };
        assert_eq!(repo.kind(), RepositoryKind::Remote);

        repo.git_url = "https://github.com/acme/infra.git".into();
        assert_eq!(repo.kind(), RepositoryKind::Remote);

        repo.git_url = "/srv/repos/infra".into();
        assert_eq!(repo.kind(), RepositoryKind::Local);

        repo.git_url = "file:///srv/repos/infra".into();
        assert_eq!(repo.kind(), RepositoryKind::Local);
        assert_eq!(repo.local_path(), "/srv/repos/infra");
    }
}
