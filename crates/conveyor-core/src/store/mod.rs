// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Persistence abstraction.
//!
//! The orchestrator core consumes entities through this narrow trait; the
//! full CRUD surface of the management API lives elsewhere. Two backends are
//! provided: [`MemoryStore`] for tests and embedded single-process use, and
//! [`PostgresStore`] for deployments.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::Result;
use crate::model::{
    AccessKey, AliasLevel, Environment, Event, Integration, IntegrationExtractValue,
    IntegrationMatcher, Inventory, JsonMap, Project, Repository, Runner, Task, TaskOutput,
    TaskStage, TaskStageKind, Template,
};

/// Narrow persistence interface consumed by the task execution core.
#[async_trait]
pub trait Store: Send + Sync {
    /// Load a project.
    async fn get_project(&self, project_id: i64) -> Result<Project>;

    /// Load a template with its vaults.
    async fn get_template(&self, project_id: i64, template_id: i64) -> Result<Template>;

    /// Load the most recent tasks of a template, newest first.
    async fn get_template_tasks(
        &self,
        project_id: i64,
        template_id: i64,
        limit: i64,
    ) -> Result<Vec<Task>>;

    /// Load an inventory.
    async fn get_inventory(&self, project_id: i64, inventory_id: i64) -> Result<Inventory>;

    /// Load a repository.
    async fn get_repository(&self, project_id: i64, repository_id: i64) -> Result<Repository>;

    /// Load an environment with its secrets.
    async fn get_environment(&self, project_id: i64, environment_id: i64) -> Result<Environment>;

    /// Load an access key with its resolved payload.
    async fn get_access_key(&self, key_id: i64) -> Result<AccessKey>;

    /// Persist a new task and return it with its id assigned. When
    /// `max_per_template` is positive, terminal tasks of the same template
    /// beyond the cap are pruned, oldest first.
    async fn create_task(&self, task: Task, max_per_template: i64) -> Result<Task>;

    /// Persist the mutable fields of a task row (status, timestamps,
    /// commit, version).
    async fn update_task(&self, task: &Task) -> Result<()>;

    /// Load a task.
    async fn get_task(&self, project_id: i64, task_id: i64) -> Result<Task>;

    /// Append one output line; the store assigns the id.
    async fn create_task_output(&self, output: TaskOutput) -> Result<TaskOutput>;

    /// Re-assign an output line to a stage. Used when the line itself
    /// triggers a stage transition, so its membership is only known after
    /// the transition is resolved.
    async fn set_task_output_stage(
        &self,
        task_id: i64,
        output_id: i64,
        stage_id: Option<i64>,
    ) -> Result<()>;

    /// Open a new stage.
    async fn create_task_stage(
        &self,
        task_id: i64,
        kind: TaskStageKind,
        start: DateTime<Utc>,
        start_output_id: i64,
    ) -> Result<TaskStage>;

    /// Close a stage.
    async fn end_task_stage(
        &self,
        task_id: i64,
        stage_id: i64,
        end: DateTime<Utc>,
        end_output_id: i64,
    ) -> Result<()>;

    /// Outputs belonging to a closed stage, in emission order.
    async fn get_task_stage_outputs(&self, task_id: i64, stage_id: i64) -> Result<Vec<TaskOutput>>;

    /// Persist the parsed summary of a closed stage.
    async fn create_task_stage_result(
        &self,
        task_id: i64,
        stage_id: i64,
        result: JsonMap,
    ) -> Result<()>;

    /// Integrations sharing a webhook alias, with the alias level.
    async fn get_integrations_by_alias(
        &self,
        alias: &str,
    ) -> Result<(Vec<Integration>, AliasLevel)>;

    /// Matchers of an integration.
    async fn get_integration_matchers(
        &self,
        project_id: i64,
        integration_id: i64,
    ) -> Result<Vec<IntegrationMatcher>>;

    /// Extract rules of an integration.
    async fn get_integration_extract_values(
        &self,
        project_id: i64,
        integration_id: i64,
    ) -> Result<Vec<IntegrationExtractValue>>;

    /// Persist a newly registered runner and return it with its id.
    async fn create_runner(&self, runner: Runner) -> Result<Runner>;

    /// Look a runner up by its authentication token.
    async fn get_runner_by_token(&self, token: &str) -> Result<Runner>;

    /// Remove a runner registration.
    async fn delete_runner(&self, runner_id: i64) -> Result<()>;

    /// Append a history event.
    async fn create_event(&self, event: Event) -> Result<()>;
}
