// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Template entity and typed template parameters.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::JsonMap;
use crate::error::{Error, Result};

/// Tool a template wraps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateApp {
    /// `ansible-playbook`.
    Ansible,
    /// `terraform`.
    Terraform,
    /// OpenTofu.
    Tofu,
    /// Terragrunt driving terraform.
    Terragrunt,
    /// `bash` script.
    Bash,
    /// `pwsh` script.
    Powershell,
    /// `python3` script.
    Python,
    /// `pulumi` program.
    Pulumi,
}

impl TemplateApp {
    /// Terraform-family tools share the init/workspace/plan/apply flow.
    pub fn is_terraform(self) -> bool {
        matches!(
            self,
            TemplateApp::Terraform | TemplateApp::Tofu | TemplateApp::Terragrunt
        )
    }

    /// Whether tasks of this app get a public alias on creation. The alias
    /// is how the tool reaches the orchestrator as an HTTP state backend.
    pub fn need_task_alias(self) -> bool {
        self.is_terraform()
    }

    /// Name of the binary the local engine invokes.
    pub fn default_binary(self) -> &'static str {
        match self {
            TemplateApp::Ansible => "ansible-playbook",
            TemplateApp::Terraform => "terraform",
            TemplateApp::Tofu => "tofu",
            TemplateApp::Terragrunt => "terragrunt",
            TemplateApp::Bash => "bash",
            TemplateApp::Powershell => "pwsh",
            TemplateApp::Python => "python3",
            TemplateApp::Pulumi => "pulumi",
        }
    }

    /// Stable string form, matching the wire and database representation.
    pub fn as_str(self) -> &'static str {
        match self {
            TemplateApp::Ansible => "ansible",
            TemplateApp::Terraform => "terraform",
            TemplateApp::Tofu => "tofu",
            TemplateApp::Terragrunt => "terragrunt",
            TemplateApp::Bash => "bash",
            TemplateApp::Powershell => "powershell",
            TemplateApp::Python => "python",
            TemplateApp::Pulumi => "pulumi",
        }
    }
}

impl fmt::Display for TemplateApp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateApp {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "ansible" => Ok(TemplateApp::Ansible),
            "terraform" => Ok(TemplateApp::Terraform),
            "tofu" => Ok(TemplateApp::Tofu),
            "terragrunt" => Ok(TemplateApp::Terragrunt),
            "bash" => Ok(TemplateApp::Bash),
            "powershell" => Ok(TemplateApp::Powershell),
            "python" => Ok(TemplateApp::Python),
            "pulumi" => Ok(TemplateApp::Pulumi),
            other => Err(Error::Validation(format!("unknown template app: {other}"))),
        }
    }
}

/// What kind of artefact a template produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemplateType {
    /// Plain task.
    #[default]
    Task,
    /// Produces a versioned build artefact.
    Build,
    /// Deploys an artefact produced by a build template.
    Deploy,
}

impl TemplateType {
    /// Stable string form.
    pub fn as_str(self) -> &'static str {
        match self {
            TemplateType::Task => "task",
            TemplateType::Build => "build",
            TemplateType::Deploy => "deploy",
        }
    }
}

impl fmt::Display for TemplateType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TemplateType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "" | "task" => Ok(TemplateType::Task),
            "build" => Ok(TemplateType::Build),
            "deploy" => Ok(TemplateType::Deploy),
            other => Err(Error::Validation(format!("unknown template type: {other}"))),
        }
    }
}

/// How a vault key attached to a template is materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum TemplateVaultKind {
    /// The vault key's password is fed to the tool's prompt.
    #[default]
    Password,
    /// A client script resolves the password at run time.
    Script,
}

/// Vault attachment of a template.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TemplateVault {
    /// Unique identifier.
    pub id: i64,
    /// Owning template.
    pub template_id: i64,
    /// Access key holding the vault password (password kind).
    pub vault_key_id: Option<i64>,
    /// Vault id name; `default` when absent.
    pub name: Option<String>,
    /// Materialization kind.
    #[serde(rename = "type", default)]
    pub kind: TemplateVaultKind,
    /// Path of the password script (script kind).
    pub script: Option<String>,
}

impl TemplateVault {
    /// Vault id name used on the tool command line.
    pub fn vault_name(&self) -> &str {
        self.name.as_deref().unwrap_or("default")
    }
}

/// Typed parameters of an ansible template (`task_params`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnsibleTemplateParams {
    /// Tasks may request `-vvvv`.
    pub allow_debug: bool,
    /// Tasks may override the template inventory.
    pub allow_override_inventory: bool,
    /// Tasks may override the host limit.
    pub allow_override_limit: bool,
    /// Tasks may override tags.
    pub allow_override_tags: bool,
    /// Tasks may override skip-tags.
    pub allow_override_skip_tags: bool,
    /// Default host limit.
    pub limit: Vec<String>,
    /// Default tags.
    pub tags: Vec<String>,
    /// Default skip-tags.
    pub skip_tags: Vec<String>,
}

/// Typed parameters of a terraform-family template (`task_params`).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TerraformTemplateParams {
    /// Tasks may request `-destroy`.
    pub allow_destroy: bool,
    /// Tasks may request auto-approve.
    pub allow_auto_approve: bool,
    /// Apply without confirmation regardless of the task.
    pub auto_approve: bool,
}

/// Executable definition from which tasks are created.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    /// Unique identifier.
    pub id: i64,
    /// Owning project.
    pub project_id: i64,
    /// Display name.
    pub name: String,
    /// Tool this template wraps.
    pub app: TemplateApp,
    /// Task, build or deploy.
    #[serde(rename = "type", default)]
    pub kind: TemplateType,
    /// Source repository.
    pub repository_id: i64,
    /// Target inventory. Required for ansible.
    pub inventory_id: Option<i64>,
    /// Environment providing extra vars and process env.
    pub environment_id: Option<i64>,
    /// Playbook / script / terraform subdirectory.
    #[serde(default)]
    pub playbook: String,
    /// Extra CLI arguments, JSON array of strings.
    pub arguments: Option<String>,
    /// Tasks may append their own extra arguments.
    #[serde(default)]
    pub allow_override_args_in_task: bool,
    /// Tasks may override the git branch.
    #[serde(default)]
    pub allow_override_branch_in_task: bool,
    /// Tasks of this template may run concurrently within a project.
    #[serde(default)]
    pub allow_parallel_tasks: bool,
    /// Branch override applied to the repository.
    pub git_branch: Option<String>,
    /// Route tasks to agents carrying this tag instead of running locally.
    pub runner_tag: Option<String>,
    /// First version of a build template.
    pub start_version: Option<String>,
    /// Build template a deploy template consumes.
    pub build_template_id: Option<i64>,
    /// App-specific parameters.
    #[serde(default)]
    pub task_params: JsonMap,
    /// Vault keys attached to the template.
    #[serde(default)]
    pub vaults: Vec<TemplateVault>,
}

impl Template {
    /// Deserialize `task_params` into a typed parameter struct.
    pub fn fill_params<T: DeserializeOwned>(&self) -> Result<T> {
        let value = serde_json::Value::Object(self.task_params.clone());
        Ok(serde_json::from_value(value)?)
    }

    /// Validate the template invariants.
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(Error::Validation("template name can not be empty".into()));
        }

        if self.app == TemplateApp::Ansible && self.inventory_id.is_none() {
            return Err(Error::Validation(
                "template inventory can not be empty".into(),
            ));
        }

        if !self.app.is_terraform() && self.playbook.is_empty() {
            return Err(Error::Validation(
                "template playbook can not be empty".into(),
            ));
        }

        if let Some(arguments) = &self.arguments {
            if serde_json::from_str::<Vec<String>>(arguments).is_err() {
                return Err(Error::Validation(
                    "template arguments must be a valid JSON array".into(),
                ));
            }
        }

        Ok(())
    }

    /// Parse the template's extra CLI arguments.
    pub fn parse_arguments(&self) -> Result<Vec<String>> {
        match &self.arguments {
            None => Ok(Vec::new()),
            Some(raw) => serde_json::from_str(raw).map_err(|_| {
                Error::Validation(
                    "invalid format of the template extra arguments, must be valid JSON".into(),
                )
            }),
        }
    }
}

impl Default for Template {
    fn default() -> Self {
        Self {
            id: 0,
            project_id: 0,
            name: String::new(),
            app: TemplateApp::Ansible,
            kind: TemplateType::Task,
            repository_id: 0,
            inventory_id: None,
            environment_id: None,
            playbook: String::new(),
            arguments: None,
            allow_override_args_in_task: false,
            allow_override_branch_in_task: false,
            allow_parallel_tasks: false,
            git_branch: None,
            runner_tag: None,
            start_version: None,
            build_template_id: None,
            task_params: JsonMap::new(),
            vaults: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_template(app: TemplateApp) -> Template {
        Template {
            id: 1,
            project_id: 1,
            name: "deploy web".into(),
            app,
            repository_id: 1,
            inventory_id: Some(1),
            playbook: "site.yml".into(),
            ..Default::default()
        }
    }

    #[test]
    fn ansible_requires_inventory() {
        let mut tpl = base_template(TemplateApp::Ansible);
        tpl.inventory_id = None;
        assert!(matches!(tpl.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn terraform_allows_empty_playbook() {
        let mut tpl = base_template(TemplateApp::Terraform);
        tpl.playbook = String::new();
        assert!(tpl.validate().is_ok());
    }

    #[test]
    fn shell_requires_playbook() {
        let mut tpl = base_template(TemplateApp::Bash);
        tpl.playbook = String::new();
        assert!(matches!(tpl.validate(), Err(Error::Validation(_))));
    }

    #[test]
    fn arguments_must_be_json_array() {
        let mut tpl = base_template(TemplateApp::Ansible);
        tpl.arguments = Some("--check".into());
        assert!(tpl.validate().is_err());

        tpl.arguments = Some(r#"["--check", "--diff"]"#.into());
        assert!(tpl.validate().is_ok());
        assert_eq!(tpl.parse_arguments().unwrap(), vec!["--check", "--diff"]);
    }

    #[test]
    fn fill_params_reads_task_params() {
        let mut tpl = base_template(TemplateApp::Ansible);
        tpl.task_params = serde_json::from_str(
            r#"{"allow_debug": true, "limit": ["web1", "web2"], "tags": ["deploy"]}"#,
        )
        .unwrap();

        let params: AnsibleTemplateParams = tpl.fill_params().unwrap();
        assert!(params.allow_debug);
        assert_eq!(params.limit, vec!["web1", "web2"]);
        assert_eq!(params.tags, vec!["deploy"]);
        assert!(params.skip_tags.is_empty());
    }

    #[test]
    fn app_helpers() {
        assert!(TemplateApp::Terragrunt.is_terraform());
        assert!(TemplateApp::Tofu.need_task_alias());
        assert!(!TemplateApp::Bash.need_task_alias());
        assert_eq!(TemplateApp::Powershell.default_binary(), "pwsh");
        assert_eq!("tofu".parse::<TemplateApp>().unwrap(), TemplateApp::Tofu);
    }
}
