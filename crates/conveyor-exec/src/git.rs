// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Git workspace operations.
//!
//! Drives the `git` CLI against the per-template clone cache. Clone and
//! pull output flows through the task logger (the stage parser recognizes
//! it); plumbing queries (`rev-parse`, `log -1`) capture their output
//! directly.

use std::path::PathBuf;
use std::sync::Arc;

use conveyor_core::model::Repository;

use crate::error::{Error, Result};
use crate::logger::TaskLogger;
use crate::process::{run_and_log, CommandSpec, ProcessHandle, StdinSource};

/// One repository checkout in the clone cache.
pub struct GitRepo {
    /// Repository row, with the effective branch already resolved.
    pub repository: Repository,
    /// Clone cache directory of this repository/template pair.
    pub clone_dir: PathBuf,
    /// `GIT_SSH_COMMAND` built by the key installer, when the repository
    /// carries an SSH key.
    pub ssh_command: Option<String>,
    /// Task logger receiving clone/pull output.
    pub logger: Arc<dyn TaskLogger>,
}

impl GitRepo {
    fn git_env(&self) -> Vec<(String, String)> {
        let mut env = vec![("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())];
        if let Some(ssh_command) = &self.ssh_command {
            env.push(("GIT_SSH_COMMAND".to_string(), ssh_command.clone()));
        }
        env
    }

    /// Whether the clone cache holds a usable checkout.
    pub fn validate(&self) -> bool {
        self.clone_dir.join(".git").is_dir()
    }

    /// Whether a plain pull can advance the checkout (the cached HEAD is on
    /// the requested branch).
    pub async fn can_be_pulled(&self) -> bool {
        match self.output(&["rev-parse", "--abbrev-ref", "HEAD"]).await {
            Ok(head) => head == self.repository.git_branch,
            Err(_) => false,
        }
    }

    /// Clone the repository into the cache directory.
    pub async fn clone_repo(&self, process: &ProcessHandle) -> Result<()> {
        let parent = self
            .clone_dir
            .parent()
            .ok_or_else(|| Error::Other("clone dir has no parent".into()))?;
        std::fs::create_dir_all(parent)?;

        let target = self
            .clone_dir
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Other("invalid clone dir".into()))?;

        let spec = CommandSpec::new("git", parent)
            .args([
                "clone",
                "--recursive",
                "--branch",
                &self.repository.git_branch,
                &self.repository.git_url,
                target,
            ])
            .envs(self.git_env());

        run_and_log(spec, self.logger.clone(), process.clone(), StdinSource::Closed)
            .await
            .map_err(|e| Error::Git {
                action: "clone".into(),
                message: e.to_string(),
            })
    }

    /// Pull the requested branch.
    pub async fn pull(&self, process: &ProcessHandle) -> Result<()> {
        let spec = CommandSpec::new("git", &self.clone_dir)
            .args(["pull", "origin", &self.repository.git_branch])
            .envs(self.git_env());

        run_and_log(spec, self.logger.clone(), process.clone(), StdinSource::Closed)
            .await
            .map_err(|e| Error::Git {
                action: "pull".into(),
                message: e.to_string(),
            })
    }

    /// Check out a specific commit.
    pub async fn checkout(&self, commit_hash: &str) -> Result<()> {
        self.output(&["checkout", commit_hash]).await.map(|_| ())
    }

    /// Hash of the checkout's HEAD.
    pub async fn last_commit_hash(&self) -> Result<String> {
        self.output(&["rev-parse", "HEAD"]).await
    }

    /// Subject line of the checkout's HEAD.
    pub async fn last_commit_message(&self) -> Result<String> {
        self.output(&["log", "-1", "--pretty=format:%s"]).await
    }

    /// Bring the cache up to date: clone when absent, pull otherwise,
    /// retrying a fresh clone once when the pull fails.
    pub async fn update(&self, process: &ProcessHandle) -> Result<()> {
        if !self.validate() {
            if self.clone_dir.exists() {
                std::fs::remove_dir_all(&self.clone_dir)?;
            }
            return self.clone_repo(process).await;
        }

        if self.can_be_pulled().await && self.pull(process).await.is_ok() {
            return Ok(());
        }

        std::fs::remove_dir_all(&self.clone_dir)?;
        self.clone_repo(process).await
    }

    async fn output(&self, args: &[&str]) -> Result<String> {
        let mut command = tokio::process::Command::new("git");
        command
            .args(args)
            .current_dir(&self.clone_dir)
            .stdin(std::process::Stdio::null());
        for (key, value) in self.git_env() {
            command.env(key, value);
        }

        let out = command.output().await?;
        if !out.status.success() {
            return Err(Error::Git {
                action: args.first().copied().unwrap_or("git").to_string(),
                message: String::from_utf8_lossy(&out.stderr).trim().to_string(),
            });
        }

        Ok(String::from_utf8_lossy(&out.stdout).trim().to_string())
    }
}
