// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task entity, task output and task stages.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{JsonMap, Template, TemplateApp};
use crate::error::{Error, Result};
use crate::status::TaskStatus;

/// Typed parameters of an ansible task.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct AnsibleTaskParams {
    /// Run with `-vvvv` (requires the template to allow debug).
    pub debug: bool,
    /// Run with `--check`.
    pub dry_run: bool,
    /// Run with `--diff`.
    pub diff: bool,
    /// Host limit override.
    pub limit: Vec<String>,
    /// Tags override.
    pub tags: Vec<String>,
    /// Skip-tags override.
    pub skip_tags: Vec<String>,
}

/// Typed parameters of a terraform-family task.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct TerraformTaskParams {
    /// Stop after the plan phase.
    pub plan: bool,
    /// Run with `-destroy`.
    pub destroy: bool,
    /// Apply without confirmation (requires the template to allow it).
    pub auto_approve: bool,
    /// Run init with `-upgrade`.
    pub upgrade: bool,
    /// Run init with `-reconfigure` instead of `-migrate-state`.
    pub reconfigure: bool,
}

/// Parameters of shell-family tasks. Currently empty; kept typed so task
/// validation treats unknown shapes uniformly.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DefaultTaskParams {}

fn min_time() -> DateTime<Utc> {
    DateTime::<Utc>::MIN_UTC
}

/// One execution attempt of a template.
///
/// Deserializes from partial shapes too: an integration's `task_params`
/// carries only the override fields, so identifiers and timestamps default
/// and are filled by the dispatcher and the pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    /// Unique identifier.
    #[serde(default)]
    pub id: i64,
    /// Template this task executes.
    #[serde(default)]
    pub template_id: i64,
    /// Owning project.
    #[serde(default)]
    pub project_id: i64,
    /// Lifecycle status.
    #[serde(default)]
    pub status: TaskStatus,

    /// Playbook override.
    #[serde(default)]
    pub playbook: String,
    /// Environment JSON override, merged into extra vars.
    #[serde(default)]
    pub environment: String,
    /// Secret extra vars. Never persisted; blanked after consumption.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret: String,
    /// Extra CLI arguments override, JSON array of strings.
    pub arguments: Option<String>,
    /// Git branch override.
    pub git_branch: Option<String>,

    /// Submitting user, when created through the API.
    pub user_id: Option<i64>,
    /// Originating integration, when created by a webhook.
    pub integration_id: Option<i64>,
    /// Originating schedule, when created by the scheduler service.
    pub schedule_id: Option<i64>,

    /// Creation time.
    #[serde(default = "min_time")]
    pub created: DateTime<Utc>,
    /// Time the runner started preparing.
    pub start: Option<DateTime<Utc>>,
    /// Time a terminal status was reached.
    pub end: Option<DateTime<Utc>>,

    /// Free-form message shown in history.
    #[serde(default)]
    pub message: String,

    /// Commit the task ran against.
    pub commit_hash: Option<String>,
    /// Commit message recorded after checkout.
    #[serde(default)]
    pub commit_message: String,
    /// Build task a deploy task consumes.
    pub build_task_id: Option<i64>,
    /// Build version; only set for tasks of build templates.
    pub version: Option<String>,

    /// Inventory override.
    pub inventory_id: Option<i64>,

    /// App-typed parameter map, merged from template defaults and caller
    /// overrides.
    #[serde(default)]
    pub params: JsonMap,

    /// Host limit (comma separated).
    #[serde(default, rename = "limit")]
    pub hosts_limit: String,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: 0,
            template_id: 0,
            project_id: 0,
            status: TaskStatus::Waiting,
            playbook: String::new(),
            environment: String::new(),
            secret: String::new(),
            arguments: None,
            git_branch: None,
            user_id: None,
            integration_id: None,
            schedule_id: None,
            created: DateTime::<Utc>::MIN_UTC,
            start: None,
            end: None,
            message: String::new(),
            commit_hash: None,
            commit_message: String::new(),
            build_task_id: None,
            version: None,
            inventory_id: None,
            params: JsonMap::new(),
            hosts_limit: String::new(),
        }
    }
}

impl Task {
    /// Bare task for a template, as composed by webhook dispatch.
    pub fn new(project_id: i64, template_id: i64) -> Self {
        Self {
            project_id,
            template_id,
            ..Default::default()
        }
    }

    /// Deserialize `params` into a typed parameter struct.
    pub fn fill_params<T: DeserializeOwned>(&self) -> Result<T> {
        let value = serde_json::Value::Object(self.params.clone());
        Ok(serde_json::from_value(value)?)
    }

    /// Validate the task shape against its template's app.
    pub fn validate_new_task(&self, template: &Template) -> Result<()> {
        let check = match template.app {
            TemplateApp::Ansible => self.fill_params::<AnsibleTaskParams>().map(|_| ()),
            app if app.is_terraform() => self.fill_params::<TerraformTaskParams>().map(|_| ()),
            _ => self.fill_params::<DefaultTaskParams>().map(|_| ()),
        };

        check.map_err(|_| {
            Error::Validation(format!(
                "task params do not fit the {} app",
                template.app
            ))
        })
    }

    /// Public history URL of this task, when the web host is configured.
    pub fn url(&self, web_host: &str) -> Option<String> {
        if web_host.is_empty() {
            return None;
        }
        Some(format!(
            "{}/project/{}/history?t={}",
            web_host, self.project_id, self.id
        ))
    }
}

/// Kind of a task stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStageKind {
    /// Cloning / pulling the repository.
    RepositoryClone,
    /// Running the playbook or script.
    ScriptRun,
    /// Terraform plan output.
    TerraformPlan,
}

impl TaskStageKind {
    /// Stable string form.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskStageKind::RepositoryClone => "repository_clone",
            TaskStageKind::ScriptRun => "script_run",
            TaskStageKind::TerraformPlan => "terraform_plan",
        }
    }
}

impl fmt::Display for TaskStageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStageKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "repository_clone" => Ok(TaskStageKind::RepositoryClone),
            "script_run" => Ok(TaskStageKind::ScriptRun),
            "terraform_plan" => Ok(TaskStageKind::TerraformPlan),
            other => Err(Error::Validation(format!("unknown stage type: {other}"))),
        }
    }
}

/// One logged output line of a task. Append-only, ordered by time and id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskOutput {
    /// Identifier assigned by the store; increases in insertion order.
    pub id: i64,
    /// Owning task.
    pub task_id: i64,
    /// Time the line was emitted by the backend.
    pub time: DateTime<Utc>,
    /// The line.
    pub output: String,
    /// Stage this line belongs to, when one is open.
    pub stage_id: Option<i64>,
}

/// Coarse phase of a task run, bounded by log-content predicates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStage {
    /// Unique identifier.
    pub id: i64,
    /// Owning task.
    pub task_id: i64,
    /// Time of the opening output line.
    pub start: Option<DateTime<Utc>>,
    /// Time of the closing output line.
    pub end: Option<DateTime<Utc>>,
    /// Id of the opening output line.
    pub start_output_id: Option<i64>,
    /// Id of the closing output line.
    pub end_output_id: Option<i64>,
    /// Stage kind.
    #[serde(rename = "type")]
    pub kind: TaskStageKind,
}

/// Parsed JSON summary produced from a stage's output lines.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStageResult {
    /// Owning task.
    pub task_id: i64,
    /// Stage the summary was parsed from.
    pub stage_id: i64,
    /// Parser output.
    pub result: JsonMap,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::TemplateType;

    #[test]
    fn validate_checks_params_shape_per_app() {
        let mut tpl = Template {
            app: TemplateApp::Ansible,
            ..Default::default()
        };

        let mut task = Task::new(1, 1);
        task.params = serde_json::from_str(r#"{"debug": true, "limit": ["db1"]}"#).unwrap();
        assert!(task.validate_new_task(&tpl).is_ok());

        task.params = serde_json::from_str(r#"{"limit": 42}"#).unwrap();
        assert!(task.validate_new_task(&tpl).is_err());

        tpl.app = TemplateApp::Terraform;
        task.params = serde_json::from_str(r#"{"plan": true, "auto_approve": false}"#).unwrap();
        assert!(task.validate_new_task(&tpl).is_ok());
    }

    #[test]
    fn fill_params_defaults_missing_fields() {
        let task = Task::new(1, 1);
        let params: TerraformTaskParams = task.fill_params().unwrap();
        assert!(!params.plan);
        assert!(!params.auto_approve);
    }

    #[test]
    fn url_requires_web_host() {
        let mut task = Task::new(3, 1);
        task.id = 17;
        assert_eq!(task.url(""), None);
        assert_eq!(
            task.url("https://conveyor.example.com").unwrap(),
            "https://conveyor.example.com/project/3/history?t=17"
        );
    }

    #[test]
    fn template_type_default_is_task() {
        assert_eq!(TemplateType::default(), TemplateType::Task);
    }
}
