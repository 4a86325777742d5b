// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Agent job pool.
//!
//! Two timers drive the agent: every second it reports progress and polls
//! for work; every five seconds it starts the job at the head of its local
//! queue. Server state is authoritative except where the local job has
//! advanced further (the reconciliation rules below). HTTP failures are
//! logged; the next tick retries.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error as ThisError;

use conveyor_core::model::AccessKey;
use conveyor_core::wire::{JobDescriptor, JobState, RunnerProgress, RunnerRegistration};
use conveyor_core::TaskStatus;
use conveyor_exec::job::JobResources;
use conveyor_exec::logger::BufferedLogger;
use conveyor_exec::workdir::WorkPaths;
use conveyor_exec::LocalJob;

use crate::client::ApiClient;
use crate::config::AgentConfig;
use crate::crypto;
use crate::job::RunningJob;

/// Progress/poll period.
const REQUEST_INTERVAL: Duration = Duration::from_secs(1);

/// Queue start period.
const QUEUE_INTERVAL: Duration = Duration::from_secs(5);

/// Agent errors.
#[derive(Debug, ThisError)]
#[non_exhaustive]
pub enum Error {
    /// HTTP transport failed.
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    /// The server rejected a request.
    #[error("the server returned error {status}: {message}")]
    Server {
        /// HTTP status code.
        status: u16,
        /// Server-provided error message, when present.
        message: String,
    },

    /// Key handling or response decryption failed.
    #[error("crypto error: {0}")]
    Crypto(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The agent is not usable in its current configuration.
    #[error("{0}")]
    Config(String),
}

/// The agent's job pool and protocol loops.
pub struct JobPool {
    config: AgentConfig,
    client: ApiClient,
    paths: WorkPaths,
    queue: Mutex<Vec<Arc<RunningJob>>>,
    running: Mutex<HashMap<i64, Arc<RunningJob>>>,
    /// Set once any job was accepted; one-off agents exit when it is set
    /// and nothing is queued or running.
    served: AtomicBool,
}

impl JobPool {
    /// Pool for a configured agent.
    pub fn new(config: AgentConfig) -> Self {
        let client = ApiClient::new(config.web_host.clone());
        let paths = WorkPaths::new(config.tmp_path.clone());
        Self {
            config,
            client,
            paths,
            queue: Mutex::new(Vec::new()),
            running: Mutex::new(HashMap::new()),
            served: AtomicBool::new(false),
        }
    }

    /// Register this agent with the orchestrator and persist the token.
    pub async fn register(&self) -> Result<(), Error> {
        if self.config.registration_token.is_empty() {
            return Err(Error::Config("registration token cannot be empty".into()));
        }

        tracing::info!("Registering a new runner");

        let public_key = match &self.config.private_key_file {
            Some(path) => Some(crypto::generate_private_key(path)?),
            None => None,
        };

        let token = self
            .client
            .register(&RunnerRegistration {
                registration_token: self.config.registration_token.clone(),
                webhook: self.config.webhook.clone(),
                max_parallel_tasks: self.config.max_parallel_tasks,
                public_key,
                tag: self.config.tag.clone(),
            })
            .await?;

        self.config.save_token(&token)?;
        Ok(())
    }

    /// Remove this agent's registration.
    pub async fn unregister(&self) -> Result<(), Error> {
        if self.config.token.is_empty() {
            return Err(Error::Config("runner is not registered".into()));
        }

        self.client.unregister(&self.config.token).await?;

        if let Some(path) = &self.config.token_file {
            let _ = std::fs::remove_file(path);
        }
        Ok(())
    }

    /// Run the poll/progress/queue loops until the process exits.
    pub async fn run(&self) -> Result<(), Error> {
        if self.config.token.is_empty() {
            return Err(Error::Config("no runner token provided".into()));
        }

        let private_key = match &self.config.private_key_file {
            Some(path) => Some(crypto::load_private_key(path)?),
            None => None,
        };

        let mut queue_tick = tokio::time::interval(QUEUE_INTERVAL);
        let mut request_tick = tokio::time::interval(REQUEST_INTERVAL);
        queue_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        request_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = queue_tick.tick() => {
                    self.start_queued();
                }
                _ = request_tick.tick() => {
                    if let Err(e) = self.send_progress().await {
                        tracing::error!(error = %e, "progress report failed");
                    }

                    if self.config.one_off
                        && self.served.load(Ordering::SeqCst)
                        && self.running.lock().unwrap().is_empty()
                        && self.queue.lock().unwrap().is_empty()
                    {
                        tracing::info!("one-off agent finished, exiting");
                        std::process::exit(0);
                    }

                    if let Err(e) = self.check_new_jobs(private_key.as_ref()).await {
                        tracing::error!(error = %e, "poll failed");
                    }
                }
            }
        }
    }

    /// Start the job at the head of the local queue.
    fn start_queued(&self) {
        let job = {
            let mut queue = self.queue.lock().unwrap();
            if queue.is_empty() {
                return;
            }
            queue.remove(0)
        };

        if job.status().is_terminal() {
            tracing::info!(task_id = job.task_id(), "task dequeued already finished");
            return;
        }

        tracing::info!(task_id = job.task_id(), "task started");
        self.running.lock().unwrap().insert(job.task_id(), job.clone());
        tokio::spawn(job.execute());
    }

    /// Report progress for every held job; finished jobs leave the table
    /// after a successful report.
    async fn send_progress(&self) -> Result<(), Error> {
        let jobs: Vec<Arc<RunningJob>> =
            self.running.lock().unwrap().values().cloned().collect();
        if jobs.is_empty() {
            return Ok(());
        }

        let mut progress = RunnerProgress::default();
        for job in &jobs {
            progress.jobs.push(job.take_progress());
        }

        match self.client.send_progress(&self.config.token, &progress).await {
            Ok(()) => {
                let mut running = self.running.lock().unwrap();
                for job in &jobs {
                    if job.status().is_terminal() {
                        tracing::info!(
                            task_id = job.task_id(),
                            status = %job.status(),
                            "task removed from running list"
                        );
                        running.remove(&job.task_id());
                    }
                }
                Ok(())
            }
            Err(e) => {
                // the server did not journal these records; keep them
                for (job, entry) in jobs.iter().zip(progress.jobs) {
                    job.restore_records(entry.log_records);
                }
                Err(e)
            }
        }
    }

    /// Poll the server, reconcile current jobs, and accept new ones.
    async fn check_new_jobs(&self, private_key: Option<&rsa::RsaPrivateKey>) -> Result<(), Error> {
        let state = self.client.poll(&self.config.token, private_key).await?;

        if state.clear_cache {
            self.clear_cache(state.cache_clean_project_id);
        }

        for current in &state.current_jobs {
            self.reconcile(current);
        }

        if self.config.one_off
            && (!self.queue.lock().unwrap().is_empty()
                || !self.running.lock().unwrap().is_empty())
        {
            return Ok(());
        }

        for descriptor in state.new_jobs {
            self.accept(descriptor, &state.access_keys);
        }

        Ok(())
    }

    fn clear_cache(&self, project_id: Option<i64>) {
        let result = match project_id {
            Some(project_id) => self.paths.clear_project(project_id),
            None => self.paths.clear(),
        };
        if let Err(e) = result {
            tracing::error!(error = %e, "cache clear failed");
        }
    }

    /// Apply the server's authoritative status unless the local job has
    /// advanced further.
    fn reconcile(&self, current: &JobState) {
        let job = {
            let running = self.running.lock().unwrap();
            match running.get(&current.id) {
                Some(job) => job.clone(),
                None => return,
            }
        };

        let local = job.status();

        if local == TaskStatus::Stopping || local == TaskStatus::Stopped {
            job.kill();
        }

        if local.is_terminal() {
            return;
        }

        match local {
            // an already running job never regresses to a scheduler state
            TaskStatus::Running
                if matches!(current.status, TaskStatus::Starting | TaskStatus::Waiting) =>
            {
                return;
            }
            // a stopping job only accepts the server's terminal verdict
            TaskStatus::Stopping if !current.status.is_terminal() => return,
            // a confirmation the operator already gave is not re-asked
            TaskStatus::Confirmed if current.status == TaskStatus::WaitingConfirmation => {
                return;
            }
            _ => {}
        }

        job.set_status(current.status);
    }

    /// Turn one job descriptor into a queued local job.
    fn accept(&self, descriptor: JobDescriptor, access_keys: &HashMap<i64, AccessKey>) {
        let task_id = descriptor.task.id;

        if self.running.lock().unwrap().contains_key(&task_id) {
            return;
        }
        if self
            .queue
            .lock()
            .unwrap()
            .iter()
            .any(|job| job.task_id() == task_id)
        {
            return;
        }

        let key = |id: Option<i64>| id.and_then(|id| access_keys.get(&id).cloned());

        let mut vault_keys = HashMap::new();
        for vault in &descriptor.template.vaults {
            if let Some(key_id) = vault.vault_key_id {
                if let Some(key) = access_keys.get(&key_id) {
                    vault_keys.insert(key_id, key.clone());
                }
            }
        }

        let resources = JobResources {
            repository_key: key(descriptor.repository.ssh_key_id),
            inventory_ssh_key: key(descriptor.inventory.as_ref().and_then(|i| i.ssh_key_id)),
            inventory_become_key: key(descriptor.inventory.as_ref().and_then(|i| i.become_key_id)),
            vault_keys,
            task: descriptor.task,
            template: descriptor.template,
            inventory: descriptor.inventory,
            inventory_repository: descriptor.inventory_repository,
            repository: descriptor.repository,
            environment: descriptor.environment,
            secret: String::new(),
        };

        let logger = Arc::new(BufferedLogger::new());
        let local_job = Arc::new(LocalJob::new(
            resources,
            logger.clone(),
            self.paths.clone(),
            self.config.web_host.clone(),
        ));

        let job = RunningJob::new(
            task_id,
            descriptor.username,
            descriptor.incoming_version,
            descriptor.alias.unwrap_or_default(),
            logger,
            local_job,
        );

        tracing::info!(task_id = task_id, "task enqueued");
        self.served.store(true, Ordering::SeqCst);
        self.queue.lock().unwrap().push(job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use conveyor_core::model::{Repository, Task, Template, TemplateApp};

    fn pool() -> JobPool {
        JobPool::new(AgentConfig {
            web_host: "http://localhost:3000".into(),
            token: "token".into(),
            token_file: None,
            registration_token: String::new(),
            max_parallel_tasks: 0,
            one_off: false,
            tag: None,
            private_key_file: None,
            webhook: None,
            tmp_path: std::env::temp_dir().join("conveyor-agent-test"),
        })
    }

    fn descriptor(task_id: i64) -> JobDescriptor {
        let mut task = Task::new(1, 1);
        task.id = task_id;
        JobDescriptor {
            task,
            template: Template {
                id: 1,
                project_id: 1,
                name: "tpl".into(),
                app: TemplateApp::Bash,
                repository_id: 1,
                playbook: "run.sh".into(),
                ..Default::default()
            },
            inventory: None,
            inventory_repository: None,
            repository: Repository {
                id: 1,
                project_id: 1,
                git_url: "/srv/repo".into(),
                git_branch: "main".into(),
                ..Default::default()
            },
            environment: None,
            username: "ci".into(),
            incoming_version: None,
            alias: None,
        }
    }

    #[test]
    fn accept_is_idempotent_per_task() {
        let pool = pool();
        let keys = HashMap::new();

        pool.accept(descriptor(7), &keys);
        pool.accept(descriptor(7), &keys);
        assert_eq!(pool.queue.lock().unwrap().len(), 1);
    }

    #[test]
    fn reconcile_ignores_scheduler_regressions() {
        let pool = pool();
        let keys = HashMap::new();
        pool.accept(descriptor(9), &keys);

        let job = pool.queue.lock().unwrap()[0].clone();
        pool.running.lock().unwrap().insert(9, job.clone());
        pool.queue.lock().unwrap().clear();

        job.set_status(TaskStatus::Starting);
        job.set_status(TaskStatus::Running);

        // server still believes the task is starting: no regression
        pool.reconcile(&JobState {
            id: 9,
            status: TaskStatus::Starting,
        });
        assert_eq!(job.status(), TaskStatus::Running);

        // but a stop instruction is accepted
        pool.reconcile(&JobState {
            id: 9,
            status: TaskStatus::Stopping,
        });
        assert_eq!(job.status(), TaskStatus::Stopping);
    }

    #[test]
    fn reconcile_accepts_confirmation_resolution() {
        let pool = pool();
        let keys = HashMap::new();
        pool.accept(descriptor(11), &keys);

        let job = pool.queue.lock().unwrap()[0].clone();
        pool.running.lock().unwrap().insert(11, job.clone());
        pool.queue.lock().unwrap().clear();

        job.set_status(TaskStatus::Starting);
        job.set_status(TaskStatus::Running);
        job.set_status(TaskStatus::WaitingConfirmation);

        pool.reconcile(&JobState {
            id: 11,
            status: TaskStatus::Confirmed,
        });
        assert_eq!(job.status(), TaskStatus::Confirmed);

        // the server echoing waiting_confirmation must not re-ask
        pool.reconcile(&JobState {
            id: 11,
            status: TaskStatus::WaitingConfirmation,
        });
        assert_eq!(job.status(), TaskStatus::Confirmed);
    }
}
