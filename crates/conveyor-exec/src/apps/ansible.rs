// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Ansible app runner.

use async_trait::async_trait;

use crate::error::Result;
use crate::process::{run_and_log, CommandSpec, StdinSource};

use super::{AppContext, AppRunArgs, LocalApp};

const REQUIREMENT_FILES: &[(&str, &str)] = &[
    ("collection", "collections/requirements.yml"),
    ("role", "roles/requirements.yml"),
    ("role", "requirements.yml"),
];

/// Runs `ansible-playbook`, installing galaxy requirements first.
pub struct AnsibleApp {
    ctx: AppContext,
}

impl AnsibleApp {
    /// App bound to a prepared workspace.
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl LocalApp for AnsibleApp {
    async fn install_requirements(&self, environment: &[(String, String)]) -> Result<()> {
        for (kind, file) in REQUIREMENT_FILES {
            if !self.ctx.work_dir.join(file).is_file() {
                continue;
            }

            let spec = CommandSpec::new("ansible-galaxy", &self.ctx.work_dir)
                .args([*kind, "install", "-r", file])
                .envs(self.ctx.child_env(environment));

            run_and_log(
                spec,
                self.ctx.logger.clone(),
                self.ctx.process.clone(),
                StdinSource::Closed,
            )
            .await?;
        }

        Ok(())
    }

    async fn run(&self, args: AppRunArgs) -> Result<()> {
        let spec = CommandSpec::new("ansible-playbook", &self.ctx.work_dir)
            .args(args.cli_args)
            .envs(self.ctx.child_env(&args.environment))
            // interleave without buffering so prompts surface immediately
            .envs([("PYTHONUNBUFFERED".to_string(), "1".to_string())]);

        run_and_log(
            spec,
            self.ctx.logger.clone(),
            self.ctx.process.clone(),
            StdinSource::Prompts(args.inputs),
        )
        .await
    }
}
