// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-app invocation runners.
//!
//! Each supported tool family implements [`LocalApp`]: requirement
//! installation (galaxy roles, terraform init + workspace) and the main
//! invocation. Argument vectors are composed by the job (`job.rs`); apps
//! own process mechanics and tool-specific control flow.

mod ansible;
mod shell;
mod terraform;

pub use ansible::AnsibleApp;
pub use shell::ShellApp;
pub use terraform::TerraformApp;

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use conveyor_core::model::{Inventory, Task, TemplateApp};
use conveyor_core::model::{Template, TerraformTaskParams, TerraformTemplateParams};

use crate::error::Result;
use crate::logger::TaskLogger;
use crate::process::ProcessHandle;

/// Shared pieces every app needs.
pub struct AppContext {
    /// Task logger receiving tool output.
    pub logger: Arc<dyn TaskLogger>,
    /// Kill handle the spawned child registers with.
    pub process: ProcessHandle,
    /// Directory the tool runs in.
    pub work_dir: PathBuf,
    /// Per-project tmp directory, exported as the child's `HOME`.
    pub project_tmp_dir: PathBuf,
}

impl AppContext {
    /// Base child environment: inherited env plus `HOME`/`PWD` overrides and
    /// the caller's variables.
    pub fn child_env(&self, extra: &[(String, String)]) -> Vec<(String, String)> {
        let mut env = vec![
            (
                "HOME".to_string(),
                self.project_tmp_dir.display().to_string(),
            ),
            ("PWD".to_string(), self.work_dir.display().to_string()),
        ];
        env.extend(extra.iter().cloned());
        env
    }
}

/// The main invocation of an app.
pub struct AppRunArgs {
    /// Composed argument vector.
    pub cli_args: Vec<String>,
    /// Child environment variables.
    pub environment: Vec<(String, String)>,
    /// Prompt literal → stdin line (ansible password prompts).
    pub inputs: HashMap<String, String>,
}

/// One tool family the local engine can drive.
#[async_trait]
pub trait LocalApp: Send + Sync {
    /// Install prerequisites before the main invocation (galaxy
    /// requirements, terraform init and workspace selection).
    async fn install_requirements(&self, environment: &[(String, String)]) -> Result<()>;

    /// Run the main invocation to completion.
    async fn run(&self, args: AppRunArgs) -> Result<()>;
}

/// Build the app for a template, with task parameters already applied.
pub fn create_app(
    template: &Template,
    inventory: Option<&Inventory>,
    task: &Task,
    repo_dir: PathBuf,
    project_tmp_dir: PathBuf,
    logger: Arc<dyn TaskLogger>,
    process: ProcessHandle,
) -> Result<Box<dyn LocalApp>> {
    match template.app {
        TemplateApp::Ansible => {
            let ctx = AppContext {
                logger,
                process,
                work_dir: repo_dir,
                project_tmp_dir,
            };
            Ok(Box::new(AnsibleApp::new(ctx)))
        }

        app if app.is_terraform() => {
            let work_dir = repo_dir.join(template.playbook.trim_start_matches('/'));
            let ctx = AppContext {
                logger,
                process,
                work_dir,
                project_tmp_dir,
            };
            let task_params: TerraformTaskParams = task.fill_params()?;
            let template_params: TerraformTemplateParams = template.fill_params()?;
            let workspace = inventory
                .map(|i| i.workspace().to_string())
                .unwrap_or_else(|| "default".to_string());

            Ok(Box::new(TerraformApp::new(
                ctx,
                app,
                workspace,
                task_params,
                template_params,
            )))
        }

        app => {
            let ctx = AppContext {
                logger,
                process,
                work_dir: repo_dir,
                project_tmp_dir,
            };
            Ok(Box::new(ShellApp::new(ctx, app)))
        }
    }
}
