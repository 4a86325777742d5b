// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! In-memory store backend.
//!
//! Fully functional implementation used by tests and by embedded
//! single-process deployments. All state lives behind one `RwLock`; no
//! operation awaits while holding it.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::RwLock;

use super::Store;
use crate::error::{Error, Result};
use crate::model::{
    AccessKey, AliasLevel, Environment, Event, Integration, IntegrationAlias,
    IntegrationExtractValue, IntegrationMatcher, Inventory, JsonMap, Project, Repository, Runner,
    Task, TaskOutput, TaskStage, TaskStageKind, TaskStageResult, Template,
};

#[derive(Default)]
struct Inner {
    projects: HashMap<i64, Project>,
    templates: HashMap<i64, Template>,
    inventories: HashMap<i64, Inventory>,
    repositories: HashMap<i64, Repository>,
    environments: HashMap<i64, Environment>,
    access_keys: HashMap<i64, AccessKey>,
    integrations: HashMap<i64, Integration>,
    matchers: Vec<IntegrationMatcher>,
    extract_values: Vec<IntegrationExtractValue>,
    aliases: Vec<IntegrationAlias>,
    tasks: HashMap<i64, Task>,
    outputs: Vec<TaskOutput>,
    stages: HashMap<i64, TaskStage>,
    stage_results: Vec<TaskStageResult>,
    runners: HashMap<i64, Runner>,
    events: Vec<Event>,
    next_task_id: i64,
    next_output_id: i64,
    next_stage_id: i64,
    next_runner_id: i64,
}

/// In-memory [`Store`] implementation.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<Inner>,
}

impl MemoryStore {
    /// Empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a project.
    pub fn insert_project(&self, project: Project) {
        self.inner.write().unwrap().projects.insert(project.id, project);
    }

    /// Seed a template (vaults embedded).
    pub fn insert_template(&self, template: Template) {
        self.inner
            .write()
            .unwrap()
            .templates
            .insert(template.id, template);
    }

    /// Seed an inventory.
    pub fn insert_inventory(&self, inventory: Inventory) {
        self.inner
            .write()
            .unwrap()
            .inventories
            .insert(inventory.id, inventory);
    }

    /// Seed a repository.
    pub fn insert_repository(&self, repository: Repository) {
        self.inner
            .write()
            .unwrap()
            .repositories
            .insert(repository.id, repository);
    }

    /// Seed an environment (secrets embedded).
    pub fn insert_environment(&self, environment: Environment) {
        self.inner
            .write()
            .unwrap()
            .environments
            .insert(environment.id, environment);
    }

    /// Seed an access key.
    pub fn insert_access_key(&self, key: AccessKey) {
        self.inner.write().unwrap().access_keys.insert(key.id, key);
    }

    /// Seed an integration.
    pub fn insert_integration(&self, integration: Integration) {
        self.inner
            .write()
            .unwrap()
            .integrations
            .insert(integration.id, integration);
    }

    /// Seed a matcher.
    pub fn insert_matcher(&self, matcher: IntegrationMatcher) {
        self.inner.write().unwrap().matchers.push(matcher);
    }

    /// Seed an extract rule.
    pub fn insert_extract_value(&self, value: IntegrationExtractValue) {
        self.inner.write().unwrap().extract_values.push(value);
    }

    /// Seed a webhook alias.
    pub fn insert_alias(&self, alias: IntegrationAlias) {
        self.inner.write().unwrap().aliases.push(alias);
    }

    /// Snapshot of recorded history events (test helper).
    pub fn events(&self) -> Vec<Event> {
        self.inner.read().unwrap().events.clone()
    }

    /// Snapshot of all outputs of a task, in insertion order (test helper).
    pub fn task_outputs(&self, task_id: i64) -> Vec<TaskOutput> {
        self.inner
            .read()
            .unwrap()
            .outputs
            .iter()
            .filter(|o| o.task_id == task_id)
            .cloned()
            .collect()
    }

    /// Snapshot of all stages of a task (test helper).
    pub fn task_stages(&self, task_id: i64) -> Vec<TaskStage> {
        let inner = self.inner.read().unwrap();
        let mut stages: Vec<TaskStage> = inner
            .stages
            .values()
            .filter(|s| s.task_id == task_id)
            .cloned()
            .collect();
        stages.sort_by_key(|s| s.id);
        stages
    }

    /// Snapshot of stage results of a task (test helper).
    pub fn stage_results(&self, task_id: i64) -> Vec<TaskStageResult> {
        self.inner
            .read()
            .unwrap()
            .stage_results
            .iter()
            .filter(|r| r.task_id == task_id)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get_project(&self, project_id: i64) -> Result<Project> {
        self.inner
            .read()
            .unwrap()
            .projects
            .get(&project_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("project {project_id}")))
    }

    async fn get_template(&self, project_id: i64, template_id: i64) -> Result<Template> {
        self.inner
            .read()
            .unwrap()
            .templates
            .get(&template_id)
            .filter(|t| t.project_id == project_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("template {template_id}")))
    }

    async fn get_template_tasks(
        &self,
        project_id: i64,
        template_id: i64,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let inner = self.inner.read().unwrap();
        let mut tasks: Vec<Task> = inner
            .tasks
            .values()
            .filter(|t| t.project_id == project_id && t.template_id == template_id)
            .cloned()
            .collect();
        tasks.sort_by(|a, b| b.id.cmp(&a.id));
        tasks.truncate(limit.max(0) as usize);
        Ok(tasks)
    }

    async fn get_inventory(&self, project_id: i64, inventory_id: i64) -> Result<Inventory> {
        self.inner
            .read()
            .unwrap()
            .inventories
            .get(&inventory_id)
            .filter(|i| i.project_id == project_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("inventory {inventory_id}")))
    }

    async fn get_repository(&self, project_id: i64, repository_id: i64) -> Result<Repository> {
        self.inner
            .read()
            .unwrap()
            .repositories
            .get(&repository_id)
            .filter(|r| r.project_id == project_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("repository {repository_id}")))
    }

    async fn get_environment(&self, project_id: i64, environment_id: i64) -> Result<Environment> {
        self.inner
            .read()
            .unwrap()
            .environments
            .get(&environment_id)
            .filter(|e| e.project_id == project_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("environment {environment_id}")))
    }

    async fn get_access_key(&self, key_id: i64) -> Result<AccessKey> {
        self.inner
            .read()
            .unwrap()
            .access_keys
            .get(&key_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("access key {key_id}")))
    }

    async fn create_task(&self, mut task: Task, max_per_template: i64) -> Result<Task> {
        let mut inner = self.inner.write().unwrap();
        inner.next_task_id += 1;
        task.id = inner.next_task_id;
        inner.tasks.insert(task.id, task.clone());

        if max_per_template > 0 {
            let mut old: Vec<(i64, DateTime<Utc>)> = inner
                .tasks
                .values()
                .filter(|t| {
                    t.template_id == task.template_id
                        && t.project_id == task.project_id
                        && t.status.is_terminal()
                })
                .map(|t| (t.id, t.created))
                .collect();
            old.sort_by_key(|(id, _)| *id);

            let total = inner
                .tasks
                .values()
                .filter(|t| t.template_id == task.template_id && t.project_id == task.project_id)
                .count() as i64;

            let mut excess = total - max_per_template;
            for (id, _) in old {
                if excess <= 0 {
                    break;
                }
                inner.tasks.remove(&id);
                excess -= 1;
            }
        }

        Ok(task)
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        match inner.tasks.get_mut(&task.id) {
            Some(slot) => {
                *slot = task.clone();
                Ok(())
            }
            None => Err(Error::NotFound(format!("task {}", task.id))),
        }
    }

    async fn get_task(&self, project_id: i64, task_id: i64) -> Result<Task> {
        self.inner
            .read()
            .unwrap()
            .tasks
            .get(&task_id)
            .filter(|t| t.project_id == project_id)
            .cloned()
            .ok_or_else(|| Error::NotFound(format!("task {task_id}")))
    }

    async fn create_task_output(&self, mut output: TaskOutput) -> Result<TaskOutput> {
        let mut inner = self.inner.write().unwrap();
        inner.next_output_id += 1;
        output.id = inner.next_output_id;
        inner.outputs.push(output.clone());
        Ok(output)
    }

    async fn set_task_output_stage(
        &self,
        task_id: i64,
        output_id: i64,
        stage_id: Option<i64>,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        match inner
            .outputs
            .iter_mut()
            .find(|o| o.task_id == task_id && o.id == output_id)
        {
            Some(output) => {
                output.stage_id = stage_id;
                Ok(())
            }
            None => Err(Error::NotFound(format!("task output {output_id}"))),
        }
    }

    async fn create_task_stage(
        &self,
        task_id: i64,
        kind: TaskStageKind,
        start: DateTime<Utc>,
        start_output_id: i64,
    ) -> Result<TaskStage> {
        let mut inner = self.inner.write().unwrap();
        inner.next_stage_id += 1;
        let stage = TaskStage {
            id: inner.next_stage_id,
            task_id,
            start: Some(start),
            end: None,
            start_output_id: Some(start_output_id),
            end_output_id: None,
            kind,
        };
        inner.stages.insert(stage.id, stage.clone());
        Ok(stage)
    }

    async fn end_task_stage(
        &self,
        task_id: i64,
        stage_id: i64,
        end: DateTime<Utc>,
        end_output_id: i64,
    ) -> Result<()> {
        let mut inner = self.inner.write().unwrap();
        match inner.stages.get_mut(&stage_id) {
            Some(stage) if stage.task_id == task_id => {
                stage.end = Some(end);
                stage.end_output_id = Some(end_output_id);
                Ok(())
            }
            _ => Err(Error::NotFound(format!("stage {stage_id}"))),
        }
    }

    async fn get_task_stage_outputs(&self, task_id: i64, stage_id: i64) -> Result<Vec<TaskOutput>> {
        let inner = self.inner.read().unwrap();
        let Some(stage) = inner.stages.get(&stage_id).filter(|s| s.task_id == task_id) else {
            return Err(Error::NotFound(format!("stage {stage_id}")));
        };

        let from = stage.start_output_id.unwrap_or(i64::MIN);
        let to = stage.end_output_id.unwrap_or(i64::MAX);
        Ok(inner
            .outputs
            .iter()
            .filter(|o| o.task_id == task_id && o.id >= from && o.id <= to)
            .cloned()
            .collect())
    }

    async fn create_task_stage_result(
        &self,
        task_id: i64,
        stage_id: i64,
        result: JsonMap,
    ) -> Result<()> {
        self.inner.write().unwrap().stage_results.push(TaskStageResult {
            task_id,
            stage_id,
            result,
        });
        Ok(())
    }

    async fn get_integrations_by_alias(
        &self,
        alias: &str,
    ) -> Result<(Vec<Integration>, AliasLevel)> {
        let inner = self.inner.read().unwrap();
        let Some(found) = inner.aliases.iter().find(|a| a.alias == alias) else {
            return Err(Error::NotFound(format!("integration alias {alias}")));
        };

        match found.integration_id {
            Some(integration_id) => {
                let integration = inner
                    .integrations
                    .get(&integration_id)
                    .cloned()
                    .ok_or_else(|| Error::NotFound(format!("integration {integration_id}")))?;
                Ok((vec![integration], AliasLevel::Single))
            }
            None => {
                let mut integrations: Vec<Integration> = inner
                    .integrations
                    .values()
                    .filter(|i| i.project_id == found.project_id && i.searchable)
                    .cloned()
                    .collect();
                integrations.sort_by_key(|i| i.id);
                Ok((integrations, AliasLevel::Project))
            }
        }
    }

    async fn get_integration_matchers(
        &self,
        _project_id: i64,
        integration_id: i64,
    ) -> Result<Vec<IntegrationMatcher>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .matchers
            .iter()
            .filter(|m| m.integration_id == integration_id)
            .cloned()
            .collect())
    }

    async fn get_integration_extract_values(
        &self,
        _project_id: i64,
        integration_id: i64,
    ) -> Result<Vec<IntegrationExtractValue>> {
        Ok(self
            .inner
            .read()
            .unwrap()
            .extract_values
            .iter()
            .filter(|v| v.integration_id == integration_id)
            .cloned()
            .collect())
    }

    async fn create_runner(&self, mut runner: Runner) -> Result<Runner> {
        let mut inner = self.inner.write().unwrap();
        inner.next_runner_id += 1;
        runner.id = inner.next_runner_id;
        inner.runners.insert(runner.id, runner.clone());
        Ok(runner)
    }

    async fn get_runner_by_token(&self, token: &str) -> Result<Runner> {
        self.inner
            .read()
            .unwrap()
            .runners
            .values()
            .find(|r| r.token == token && r.active)
            .cloned()
            .ok_or_else(|| Error::NotFound("runner".into()))
    }

    async fn delete_runner(&self, runner_id: i64) -> Result<()> {
        self.inner.write().unwrap().runners.remove(&runner_id);
        Ok(())
    }

    async fn create_event(&self, event: Event) -> Result<()> {
        self.inner.write().unwrap().events.push(event);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn output_ids_increase_in_insertion_order() {
        let store = MemoryStore::new();
        let mut ids = Vec::new();
        for n in 0..5 {
            let out = store
                .create_task_output(TaskOutput {
                    id: 0,
                    task_id: 1,
                    time: Utc::now(),
                    output: format!("line {n}"),
                    stage_id: None,
                })
                .await
                .unwrap();
            ids.push(out.id);
        }
        assert!(ids.windows(2).all(|w| w[0] < w[1]));
    }

    #[tokio::test]
    async fn create_task_prunes_old_terminal_tasks() {
        let store = MemoryStore::new();
        for _ in 0..3 {
            let mut t = Task::new(1, 1);
            t.status = crate::TaskStatus::Success;
            store.create_task(t, 0).await.unwrap();
        }

        // cap 2: inserting a fourth prunes the two oldest terminal rows
        let t = Task::new(1, 1);
        let created = store.create_task(t, 2).await.unwrap();

        let remaining = store.get_template_tasks(1, 1, 10).await.unwrap();
        assert_eq!(remaining.len(), 2);
        assert_eq!(remaining[0].id, created.id);
    }

    #[tokio::test]
    async fn alias_levels() {
        let store = MemoryStore::new();
        store.insert_integration(Integration {
            id: 1,
            project_id: 7,
            template_id: 1,
            searchable: true,
            ..Default::default()
        });
        store.insert_integration(Integration {
            id: 2,
            project_id: 7,
            template_id: 1,
            searchable: false,
            ..Default::default()
        });
        store.insert_alias(IntegrationAlias {
            id: 1,
            alias: "single0123456789".into(),
            project_id: 7,
            integration_id: Some(2),
        });
        store.insert_alias(IntegrationAlias {
            id: 2,
            alias: "project123456789".into(),
            project_id: 7,
            integration_id: None,
        });

        let (list, level) = store
            .get_integrations_by_alias("single0123456789")
            .await
            .unwrap();
        assert_eq!(level, AliasLevel::Single);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, 2);

        // project level only returns searchable integrations
        let (list, level) = store
            .get_integrations_by_alias("project123456789")
            .await
            .unwrap();
        assert_eq!(level, AliasLevel::Project);
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].id, 1);

        assert!(store
            .get_integrations_by_alias("unknown")
            .await
            .unwrap_err()
            .is_not_found());
    }
}
