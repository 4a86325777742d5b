// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Script app runner (bash, powershell, python, pulumi).

use async_trait::async_trait;

use conveyor_core::model::TemplateApp;

use crate::error::Result;
use crate::process::{run_and_log, CommandSpec, StdinSource};

use super::{AppContext, AppRunArgs, LocalApp};

/// Runs the script named by the template's playbook through the app's
/// interpreter.
pub struct ShellApp {
    ctx: AppContext,
    binary: &'static str,
}

impl ShellApp {
    /// App bound to a prepared workspace.
    pub fn new(ctx: AppContext, app: TemplateApp) -> Self {
        Self {
            ctx,
            binary: app.default_binary(),
        }
    }
}

#[async_trait]
impl LocalApp for ShellApp {
    async fn install_requirements(&self, _environment: &[(String, String)]) -> Result<()> {
        Ok(())
    }

    async fn run(&self, args: AppRunArgs) -> Result<()> {
        let spec = CommandSpec::new(self.binary, &self.ctx.work_dir)
            .args(args.cli_args)
            .envs(self.ctx.child_env(&args.environment));

        run_and_log(
            spec,
            self.ctx.logger.clone(),
            self.ctx.process.clone(),
            StdinSource::Closed,
        )
        .await
    }
}
