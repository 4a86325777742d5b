// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Terraform-family app runner (terraform, tofu, terragrunt).
//!
//! Three phases: `init` (with the interactive copy-state prompt bridged to
//! the task lifecycle), workspace selection where supported, then
//! plan/apply. A plan with no changes, or a plan-only task, terminates the
//! task successfully; otherwise apply runs either immediately
//! (auto-approve) or after an operator confirmation.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use conveyor_core::model::{TemplateApp, TerraformTaskParams, TerraformTemplateParams};
use conveyor_core::TaskStatus;

use crate::confirm::{ConfirmationReader, POLL_INTERVAL};
use crate::error::Result;
use crate::process::{run_and_log, run_silent, CommandSpec, StdinSource};

use super::{AppContext, AppRunArgs, LocalApp};

/// Runs the terraform-family init/workspace/plan/apply flow.
pub struct TerraformApp {
    ctx: AppContext,
    binary: &'static str,
    is_terragrunt: bool,
    workspace: String,
    task_params: TerraformTaskParams,
    template_params: TerraformTemplateParams,
    plan_has_no_changes: Arc<AtomicBool>,
}

impl TerraformApp {
    /// App bound to a prepared workspace.
    pub fn new(
        ctx: AppContext,
        app: TemplateApp,
        workspace: String,
        task_params: TerraformTaskParams,
        template_params: TerraformTemplateParams,
    ) -> Self {
        Self {
            ctx,
            binary: app.default_binary(),
            is_terragrunt: app == TemplateApp::Terragrunt,
            workspace,
            task_params,
            template_params,
            plan_has_no_changes: Arc::new(AtomicBool::new(false)),
        }
    }

    async fn init(&self, environment: &[(String, String)]) -> Result<()> {
        let mut args = vec!["init".to_string(), "-lock=false".to_string()];

        if self.task_params.upgrade {
            args.push("-upgrade".to_string());
        }
        if self.task_params.reconfigure {
            args.push("-reconfigure".to_string());
        } else {
            args.push("-migrate-state".to_string());
        }
        if self.is_terragrunt {
            args.push("--tf-path=terraform".to_string());
        }

        let spec = CommandSpec::new(self.binary, &self.ctx.work_dir)
            .args(args)
            .envs(self.ctx.child_env(environment));

        let reader = ConfirmationReader::new(self.ctx.logger.clone());

        run_and_log(
            spec,
            self.ctx.logger.clone(),
            self.ctx.process.clone(),
            StdinSource::Confirm(reader),
        )
        .await
    }

    async fn workspaces_supported(&self, environment: &[(String, String)]) -> bool {
        let mut args: Vec<String> = vec!["workspace".into(), "list".into()];
        if self.is_terragrunt {
            args = ["run".to_string(), "--".to_string()]
                .into_iter()
                .chain(args)
                .collect();
            args.push("--tf-path=terraform".to_string());
        }

        let spec = CommandSpec::new(self.binary, &self.ctx.work_dir)
            .args(args)
            .envs(self.ctx.child_env(environment));

        run_silent(spec).await
    }

    async fn select_workspace(&self, environment: &[(String, String)]) -> Result<()> {
        let mut args: Vec<String> = vec![
            "workspace".into(),
            "select".into(),
            "-or-create=true".into(),
            self.workspace.clone(),
        ];
        if self.is_terragrunt {
            args = ["run".to_string(), "--".to_string()]
                .into_iter()
                .chain(args)
                .collect();
            args.push("--tf-path=terraform".to_string());
        }

        let spec = CommandSpec::new(self.binary, &self.ctx.work_dir)
            .args(args)
            .envs(self.ctx.child_env(environment));

        run_and_log(
            spec,
            self.ctx.logger.clone(),
            self.ctx.process.clone(),
            StdinSource::Closed,
        )
        .await
    }

    async fn plan(&self, args: &AppRunArgs) -> Result<()> {
        let mut plan_args = vec!["plan".to_string(), "-lock=false".to_string()];
        if self.is_terragrunt {
            plan_args.push("--tf-path=terraform".to_string());
        }
        plan_args.extend(args.cli_args.iter().cloned());

        let no_changes = self.plan_has_no_changes.clone();
        self.ctx.logger.add_log_listener(Box::new(move |_, line| {
            if line.contains("No changes.") {
                no_changes.store(true, Ordering::SeqCst);
            }
        }));

        let spec = CommandSpec::new(self.binary, &self.ctx.work_dir)
            .args(plan_args)
            .envs(self.ctx.child_env(&args.environment));

        run_and_log(
            spec,
            self.ctx.logger.clone(),
            self.ctx.process.clone(),
            StdinSource::Closed,
        )
        .await
    }

    async fn apply(&self, args: &AppRunArgs) -> Result<()> {
        let mut apply_args = vec![
            "apply".to_string(),
            "-auto-approve".to_string(),
            "-lock=false".to_string(),
        ];
        if self.is_terragrunt {
            apply_args.push("--tf-path=terraform".to_string());
        }
        apply_args.extend(args.cli_args.iter().cloned());

        let spec = CommandSpec::new(self.binary, &self.ctx.work_dir)
            .args(apply_args)
            .envs(self.ctx.child_env(&args.environment));

        run_and_log(
            spec,
            self.ctx.logger.clone(),
            self.ctx.process.clone(),
            StdinSource::Closed,
        )
        .await
    }

    /// Block until an operator resolves the pending confirmation.
    async fn await_confirmation(&self) -> TaskStatus {
        loop {
            tokio::time::sleep(POLL_INTERVAL).await;
            let status = self.ctx.logger.status();
            if status.is_terminal()
                || status == TaskStatus::Confirmed
                || status == TaskStatus::Rejected
            {
                return status;
            }
        }
    }
}

#[async_trait]
impl LocalApp for TerraformApp {
    async fn install_requirements(&self, environment: &[(String, String)]) -> Result<()> {
        self.init(environment).await?;

        if !self.workspaces_supported(environment).await {
            return Ok(());
        }

        self.select_workspace(environment).await
    }

    async fn run(&self, args: AppRunArgs) -> Result<()> {
        self.plan(&args).await?;

        if self.plan_has_no_changes.load(Ordering::SeqCst) || self.task_params.plan {
            self.ctx.logger.set_status(TaskStatus::Success);
            return Ok(());
        }

        let auto = self.template_params.auto_approve
            || (self.template_params.allow_auto_approve && self.task_params.auto_approve);
        if auto {
            return self.apply(&args).await;
        }

        self.ctx.logger.set_status(TaskStatus::WaitingConfirmation);

        match self.await_confirmation().await {
            TaskStatus::Confirmed => {
                self.ctx.logger.set_status(TaskStatus::Running);
                self.apply(&args).await
            }
            TaskStatus::Rejected => {
                self.ctx.logger.set_status(TaskStatus::Error);
                Ok(())
            }
            // stopped externally while waiting
            _ => Ok(()),
        }
    }
}
