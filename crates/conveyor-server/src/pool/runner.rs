// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-task runner.
//!
//! A `TaskRunner` drives one task from `waiting` to a terminal status. It
//! mirrors the persistent row, applies the status FSM, fans transitions out
//! to listeners, and owns the backend job (local or remote) once the
//! scheduler admits the task. The pool holds runners strongly; runners
//! reach back to the pool through a weak reference.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use conveyor_core::model::{
    AccessKey, AnsibleTemplateParams, Event, Task, TaskStage, Template,
};
use conveyor_core::{Error, Result, TaskStatus};
use conveyor_exec::job::JobResources;
use conveyor_exec::logger::{LogListener, StatusListener, TaskLogger};

use super::{LogRecord, PoolCommand, PoolShared};

/// Backend executing one admitted task. Both backends expose the same
/// run/kill contract; the pool never branches on the kind after admission.
#[async_trait::async_trait]
pub trait Job: Send + Sync {
    /// Drive the task to completion.
    async fn run(
        &self,
        username: &str,
        incoming_version: Option<&str>,
        alias: &str,
    ) -> conveyor_exec::Result<()>;

    /// Terminate the backend process / revoke the pending job.
    fn kill(&self);
}

#[async_trait::async_trait]
impl Job for conveyor_exec::LocalJob {
    async fn run(
        &self,
        username: &str,
        incoming_version: Option<&str>,
        alias: &str,
    ) -> conveyor_exec::Result<()> {
        conveyor_exec::LocalJob::run(self, username, incoming_version, alias).await
    }

    fn kill(&self) {
        conveyor_exec::LocalJob::kill(self)
    }
}

/// One in-flight task.
pub struct TaskRunner {
    shared: Weak<PoolShared>,
    self_ref: Weak<TaskRunner>,

    task: Mutex<Task>,
    template: Mutex<Option<Template>>,

    username: Mutex<String>,
    incoming_version: Mutex<Option<String>>,
    alias: Mutex<Option<String>>,
    runner_id: Mutex<Option<i64>>,
    job: Mutex<Option<Arc<dyn Job>>>,

    // log/stage pipeline state, owned by the batcher
    pub(crate) current_stage: Mutex<Option<TaskStage>>,
    pub(crate) current_output_id: Mutex<Option<i64>>,
    pub(crate) current_output_time: Mutex<Option<DateTime<Utc>>>,

    status_listeners: Mutex<Vec<StatusListener>>,
    log_listeners: Mutex<Vec<LogListener>>,
}

impl TaskRunner {
    /// Runner mirroring `task`, attached to the pool.
    pub(crate) fn new(
        shared: &Arc<PoolShared>,
        task: Task,
        username: impl Into<String>,
    ) -> Arc<Self> {
        let username = username.into();
        let shared = Arc::downgrade(shared);
        Arc::new_cyclic(|self_ref| Self {
            shared,
            self_ref: self_ref.clone(),
            task: Mutex::new(task),
            template: Mutex::new(None),
            username: Mutex::new(username),
            incoming_version: Mutex::new(None),
            alias: Mutex::new(None),
            runner_id: Mutex::new(None),
            job: Mutex::new(None),
            current_stage: Mutex::new(None),
            current_output_id: Mutex::new(None),
            current_output_time: Mutex::new(None),
            status_listeners: Mutex::new(Vec::new()),
            log_listeners: Mutex::new(Vec::new()),
        })
    }

    /// Snapshot of the task row.
    pub fn task(&self) -> Task {
        self.task.lock().unwrap().clone()
    }

    /// Task id.
    pub fn task_id(&self) -> i64 {
        self.task.lock().unwrap().id
    }

    /// Project id.
    pub fn project_id(&self) -> i64 {
        self.task.lock().unwrap().project_id
    }

    /// Template id the task references.
    pub fn template_id(&self) -> i64 {
        self.task.lock().unwrap().template_id
    }

    /// Populated template, after [`populate`](Self::populate).
    pub fn template(&self) -> Option<Template> {
        self.template.lock().unwrap().clone()
    }

    pub(crate) fn set_template(&self, template: Template) {
        *self.template.lock().unwrap() = Some(template);
    }

    /// Public alias of the task, when one was assigned.
    pub fn alias(&self) -> Option<String> {
        self.alias.lock().unwrap().clone()
    }

    pub(crate) fn set_alias(&self, alias: String) {
        *self.alias.lock().unwrap() = Some(alias);
    }

    /// Name of the submitting user, carried into `semaphore_vars`.
    pub fn username(&self) -> String {
        self.username.lock().unwrap().clone()
    }

    /// Restore the submitting user (shared-state hydration).
    pub fn set_username(&self, username: String) {
        *self.username.lock().unwrap() = username;
    }

    /// Remote runner currently assigned, when the backend is remote.
    pub fn runner_id(&self) -> Option<i64> {
        *self.runner_id.lock().unwrap()
    }

    /// Assign the remote runner executing this task. The caller mirrors the
    /// change through `PoolStateStore::update_runtime_fields`.
    pub fn set_runner_id(&self, runner_id: Option<i64>) {
        *self.runner_id.lock().unwrap() = runner_id;
    }

    /// Version of the build artefact a deploy task consumes.
    pub fn incoming_version(&self) -> Option<String> {
        self.incoming_version.lock().unwrap().clone()
    }

    /// Restore the incoming version (shared-state hydration).
    pub fn set_incoming_version(&self, version: Option<String>) {
        *self.incoming_version.lock().unwrap() = version;
    }

    pub(crate) fn set_job(&self, job: Arc<dyn Job>) {
        *self.job.lock().unwrap() = Some(job);
    }

    /// Whether this process owns a backend for the task. Runners hydrated
    /// from a shared pool state are pointers only.
    pub fn is_local(&self) -> bool {
        self.job.lock().unwrap().is_some()
    }

    /// Kill the backend.
    pub fn kill_job(&self) {
        let job = self.job.lock().unwrap().clone();
        if let Some(job) = job {
            job.kill();
        }
    }

    /// Emit a history event about this task.
    pub fn create_task_event(&self, description: impl Into<String>) {
        let task = self.task();
        let event = Event::for_task(task.project_id, task.user_id, task.id, description);
        if let Some(shared) = self.shared.upgrade() {
            let _ = shared.command_tx.send(PoolCommand::Event(event));
        }
    }

    /// Load the template, repository, inventory (with keys), environment
    /// and vault keys; resolve the incoming version for deploy tasks.
    ///
    /// Failure here marks the task `error` before it is admitted; the
    /// caller is responsible for that transition.
    pub async fn populate(&self) -> Result<JobResources> {
        let task = self.task();
        let Some(shared) = self.shared.upgrade() else {
            return Err(Error::Other("pool is gone".into()));
        };
        let store = &shared.store;

        let template = store.get_template(task.project_id, task.template_id).await?;
        template.validate()?;

        let repository = store
            .get_repository(task.project_id, template.repository_id)
            .await?;
        let repository_key = match repository.ssh_key_id {
            Some(key_id) => Some(store.get_access_key(key_id).await?),
            None => None,
        };

        let inventory_id = self.effective_inventory_id(&template, &task)?;
        let mut inventory = None;
        let mut inventory_repository = None;
        let mut inventory_ssh_key = None;
        let mut inventory_become_key = None;
        if let Some(inventory_id) = inventory_id {
            let loaded = store.get_inventory(task.project_id, inventory_id).await?;
            if let Some(key_id) = loaded.ssh_key_id {
                inventory_ssh_key = Some(store.get_access_key(key_id).await?);
            }
            if let Some(key_id) = loaded.become_key_id {
                inventory_become_key = Some(store.get_access_key(key_id).await?);
            }
            if let Some(repository_id) = loaded.repository_id {
                inventory_repository =
                    Some(store.get_repository(task.project_id, repository_id).await?);
            }
            inventory = Some(loaded);
        }

        let environment = match template.environment_id {
            Some(environment_id) => {
                Some(store.get_environment(task.project_id, environment_id).await?)
            }
            None => None,
        };

        let mut vault_keys: HashMap<i64, AccessKey> = HashMap::new();
        for vault in &template.vaults {
            if let Some(key_id) = vault.vault_key_id {
                vault_keys.insert(key_id, store.get_access_key(key_id).await?);
            }
        }

        self.set_incoming_version(self.resolve_incoming_version(&task, store.as_ref()).await);
        *self.template.lock().unwrap() = Some(template.clone());

        Ok(JobResources {
            task,
            template,
            inventory,
            inventory_repository,
            repository,
            environment,
            secret: String::new(),
            repository_key,
            inventory_ssh_key,
            inventory_become_key,
            vault_keys,
        })
    }

    fn effective_inventory_id(&self, template: &Template, task: &Task) -> Result<Option<i64>> {
        if let Some(inventory_id) = task.inventory_id {
            let allowed = template
                .fill_params::<AnsibleTemplateParams>()
                .map(|p| p.allow_override_inventory)
                .unwrap_or(false);
            if !allowed {
                return Err(Error::Validation(
                    "template does not allow inventory override".into(),
                ));
            }
            return Ok(Some(inventory_id));
        }
        Ok(template.inventory_id)
    }

    /// Walk `build_task_id` links to the nearest build template's version.
    async fn resolve_incoming_version(
        &self,
        task: &Task,
        store: &dyn conveyor_core::Store,
    ) -> Option<String> {
        let mut build_task_id = task.build_task_id?;

        // bounded walk; build chains are short
        for _ in 0..8 {
            let build = store.get_task(task.project_id, build_task_id).await.ok()?;
            let template = store
                .get_template(task.project_id, build.template_id)
                .await
                .ok()?;
            if template.kind == conveyor_core::model::TemplateType::Build {
                return build.version;
            }
            build_task_id = build.build_task_id?;
        }

        None
    }

    /// Apply a status transition; returns whether it was accepted.
    ///
    /// Accepted transitions update the row timestamps, notify listeners,
    /// queue a durable row update, and on terminal statuses ask the pool to
    /// release the runner.
    pub fn try_set_status(&self, status: TaskStatus) -> bool {
        let snapshot = {
            let mut task = self.task.lock().unwrap();
            if task.status == status || !task.status.can_transition(status) {
                return false;
            }
            task.status = status;
            match status {
                TaskStatus::Running => {
                    if task.start.is_none() {
                        task.start = Some(Utc::now());
                    }
                }
                s if s.is_terminal() => task.end = Some(Utc::now()),
                _ => {}
            }
            task.clone()
        };

        tracing::info!(task_id = snapshot.id, status = %status, "task status changed");

        for listener in self.status_listeners.lock().unwrap().iter() {
            listener(status);
        }

        if let Some(shared) = self.shared.upgrade() {
            let _ = shared.command_tx.send(PoolCommand::Persist(snapshot));

            if status.is_notifiable() || status == TaskStatus::Stopped {
                self.create_task_event(format!("Task {} {}", self.task_id(), status));
            }

            if status.is_terminal() {
                if let Some(me) = self.self_ref.upgrade() {
                    let _ = shared.command_tx.send(PoolCommand::Release(me));
                }
            }
        }

        true
    }

    /// Drive the admitted task to its terminal status.
    pub async fn run(self: Arc<Self>) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };

        self.try_set_status(TaskStatus::Starting);
        self.create_task_event(format!("Task {} started", self.task_id()));

        let job = self.job.lock().unwrap().clone();
        let Some(job) = job else {
            self.log("Error: task has no backend");
            self.try_set_status(TaskStatus::Error);
            return;
        };

        let username = self.username();
        let incoming_version = self.incoming_version();
        let alias = self.alias().unwrap_or_default();

        let run = job.run(&username, incoming_version.as_deref(), &alias);
        tokio::pin!(run);

        let max_duration = shared.config.max_task_duration_sec;
        let result = if max_duration > 0 {
            tokio::select! {
                result = &mut run => result,
                _ = tokio::time::sleep(std::time::Duration::from_secs(max_duration)) => {
                    self.log("Task exceeded the maximum allowed duration");
                    self.try_set_status(TaskStatus::Stopping);
                    job.kill();
                    run.await
                }
            }
        } else {
            run.await
        };

        let status = self.status();
        match (&result, status) {
            (_, TaskStatus::Stopping) => {
                self.try_set_status(TaskStatus::Stopped);
            }
            (Ok(()), _) => {
                self.try_set_status(TaskStatus::Success);
            }
            (Err(e), _) => {
                if !status.is_terminal() {
                    self.log(&format!("Error: {e}"));
                }
                self.try_set_status(TaskStatus::Error);
            }
        }
    }

    /// Record the commit the task ran against.
    fn apply_commit(&self, hash: &str, message: &str) {
        let snapshot = {
            let mut task = self.task.lock().unwrap();
            task.commit_hash = Some(hash.to_string());
            task.commit_message = message.to_string();
            task.clone()
        };
        if let Some(shared) = self.shared.upgrade() {
            let _ = shared.command_tx.send(PoolCommand::Persist(snapshot));
        }
    }
}

impl TaskLogger for TaskRunner {
    fn log_with_time(&self, time: DateTime<Utc>, message: &str) {
        for listener in self.log_listeners.lock().unwrap().iter() {
            listener(time, message);
        }

        let (Some(shared), Some(me)) = (self.shared.upgrade(), self.self_ref.upgrade()) else {
            return;
        };

        let record = LogRecord {
            runner: me,
            time,
            message: message.to_string(),
        };
        if shared.log_tx.try_send(record).is_err() {
            tracing::warn!(task_id = self.task_id(), "log channel full, dropping record");
        }
    }

    fn set_status(&self, status: TaskStatus) {
        self.try_set_status(status);
    }

    fn status(&self) -> TaskStatus {
        self.task.lock().unwrap().status
    }

    fn set_commit(&self, hash: &str, message: &str) {
        self.apply_commit(hash, message);
    }

    fn add_status_listener(&self, listener: StatusListener) {
        self.status_listeners.lock().unwrap().push(listener);
    }

    fn add_log_listener(&self, listener: LogListener) {
        self.log_listeners.lock().unwrap().push(listener);
    }
}
