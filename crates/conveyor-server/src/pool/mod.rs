// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Task pool and scheduler.
//!
//! The pool owns admission for every task in the process: it translates
//! submit requests into queued runners, admits them under the global,
//! per-template and per-project concurrency limits, and serializes all task
//! output through a single batching consumer.
//!
//! Three loops run per pool: the scheduler (register channel + 5-second
//! tick), the log batcher (log channel, 500 records / 500 ms), and the
//! command writer persisting row updates and history events in order.
//! Request handlers never share mutable state with the loops; they enqueue
//! through channels or read through the state store.

pub mod batcher;
pub mod runner;
pub mod stages;

pub use runner::{Job, TaskRunner};

use chrono::{DateTime, Utc};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

use conveyor_core::model::{Event, Task, TemplateType};
use conveyor_core::version::next_build_version;
use conveyor_core::{ids, Error, Result, Store, TaskStatus};
use conveyor_exec::logger::TaskLogger;
use conveyor_exec::workdir::WorkPaths;

use crate::config::Config;
use crate::dispatch::{RemoteJob, RunnerRegistry};
use crate::state::{Hydrator, PoolStateStore};

/// Capacity of the log channel.
const LOG_CHANNEL_CAPACITY: usize = 10_000;

/// Scheduler tick.
const SCHEDULE_INTERVAL: Duration = Duration::from_secs(5);

/// External gate consulted before a task is accepted. Its error is
/// surfaced verbatim (`Error::InvalidSubscription`).
pub type SubscriptionGate = Arc<dyn Fn(&Task) -> Result<()> + Send + Sync>;

/// One output line on its way to the store.
pub struct LogRecord {
    /// Runner the line belongs to.
    pub runner: Arc<TaskRunner>,
    /// Emission time.
    pub time: DateTime<Utc>,
    /// The line.
    pub message: String,
}

/// Durable side effects queued by runners, applied in order by one writer.
pub(crate) enum PoolCommand {
    /// Persist the mutable fields of a task row.
    Persist(Task),
    /// Append a history event.
    Event(Event),
    /// A runner reached a terminal status; release its pool state.
    Release(Arc<TaskRunner>),
}

pub(crate) struct PoolShared {
    pub store: Arc<dyn Store>,
    pub state: Arc<dyn PoolStateStore>,
    pub registry: Arc<RunnerRegistry>,
    pub config: Config,
    pub gate: Option<SubscriptionGate>,
    pub log_tx: mpsc::Sender<LogRecord>,
    pub command_tx: mpsc::UnboundedSender<PoolCommand>,
    pub register_tx: mpsc::Sender<Arc<TaskRunner>>,
}

/// The task pool.
#[derive(Clone)]
pub struct TaskPool {
    shared: Arc<PoolShared>,
    receivers: Arc<Mutex<Option<Receivers>>>,
}

struct Receivers {
    log_rx: mpsc::Receiver<LogRecord>,
    command_rx: mpsc::UnboundedReceiver<PoolCommand>,
    register_rx: mpsc::Receiver<Arc<TaskRunner>>,
}

impl TaskPool {
    /// Pool over a store, a state backend and a runner registry.
    pub fn new(
        store: Arc<dyn Store>,
        state: Arc<dyn PoolStateStore>,
        registry: Arc<RunnerRegistry>,
        config: Config,
    ) -> Self {
        Self::with_gate(store, state, registry, config, None)
    }

    /// Pool with an external subscription gate.
    pub fn with_gate(
        store: Arc<dyn Store>,
        state: Arc<dyn PoolStateStore>,
        registry: Arc<RunnerRegistry>,
        config: Config,
        gate: Option<SubscriptionGate>,
    ) -> Self {
        let (log_tx, log_rx) = mpsc::channel(LOG_CHANNEL_CAPACITY);
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (register_tx, register_rx) = mpsc::channel(256);

        let shared = Arc::new(PoolShared {
            store,
            state,
            registry,
            config,
            gate,
            log_tx,
            command_tx,
            register_tx,
        });

        Self {
            shared,
            receivers: Arc::new(Mutex::new(Some(Receivers {
                log_rx,
                command_rx,
                register_rx,
            }))),
        }
    }

    /// Start the scheduler, batcher and command writer. Runs until the
    /// process exits; call once.
    pub async fn run(&self) {
        let Some(receivers) = self.receivers.lock().unwrap().take() else {
            tracing::error!("task pool started twice");
            return;
        };

        let Receivers {
            log_rx,
            command_rx,
            register_rx,
        } = receivers;

        // restore shared state and subscribe to peer events; hydrated
        // runners are pointers only, never started here
        let hydrator: Hydrator = {
            let shared = self.shared.clone();
            Arc::new(move |task_id, project_id| {
                let shared = shared.clone();
                Box::pin(async move {
                    let task = shared.store.get_task(project_id, task_id).await?;
                    Ok(TaskRunner::new(&shared, task, ""))
                })
            })
        };
        if let Err(e) = self.shared.state.start(hydrator).await {
            tracing::error!(error = %e, "pool state restore failed");
        }

        tokio::spawn(batcher::run_batcher(self.shared.store.clone(), log_rx));
        tokio::spawn(run_command_writer(self.shared.clone(), command_rx));

        self.run_scheduler(register_rx).await;
    }

    // -----------------------------------------------------------------
    // Public API
    // -----------------------------------------------------------------

    /// Create, validate and enqueue a task.
    pub async fn add_task(
        &self,
        mut task: Task,
        user_id: Option<i64>,
        username: &str,
        project_id: i64,
        need_alias: bool,
    ) -> Result<Task> {
        let shared = &self.shared;

        task.created = Utc::now();
        task.status = TaskStatus::Waiting;
        task.user_id = user_id.or(task.user_id);
        task.project_id = project_id;
        let secret = std::mem::take(&mut task.secret);

        if let Some(gate) = &shared.gate {
            gate(&task)?;
        }

        let template = shared.store.get_template(project_id, task.template_id).await?;
        task.validate_new_task(&template)?;

        if template.kind == TemplateType::Build {
            let previous = shared
                .store
                .get_template_tasks(project_id, template.id, 1)
                .await?;
            task.version = match (&template.start_version, previous.first().and_then(|t| t.version.clone())) {
                (Some(start), Some(current)) => Some(next_build_version(start, &current)),
                (Some(start), None) => Some(start.clone()),
                (None, _) => None,
            };
        }

        let new_task = shared
            .store
            .create_task(task, shared.config.max_tasks_per_template)
            .await?;

        let runner = TaskRunner::new(shared, new_task.clone(), username);

        if need_alias {
            let alias = ids::random_token(ids::TASK_ALIAS_LEN);
            runner.set_alias(alias.clone());
            shared.state.set_alias(&alias, runner.clone()).await;
        }

        let resources = match runner.populate().await {
            Ok(resources) => resources,
            Err(e) => {
                runner.log(&format!("Error: {e}"));
                runner.try_set_status(TaskStatus::Error);
                return Err(e);
            }
        };

        // remote backend when the config demands it, or when a runner tag
        // is present (template tag wins over inventory tag)
        let runner_tag = resources
            .template
            .runner_tag
            .clone()
            .or_else(|| resources.inventory.as_ref().and_then(|i| i.runner_tag.clone()));

        let job: Arc<dyn Job> = if shared.config.use_remote_runner || runner_tag.is_some() {
            Arc::new(RemoteJob::new(
                shared.registry.clone(),
                runner_tag,
                resources,
                runner.clone(),
            ))
        } else {
            let mut resources = resources;
            resources.secret = secret;
            Arc::new(conveyor_exec::LocalJob::new(
                resources,
                runner.clone(),
                WorkPaths::new(shared.config.tmp_path.clone()),
                shared.config.web_host.clone(),
            ))
        };
        runner.set_job(job);

        shared
            .register_tx
            .send(runner.clone())
            .await
            .map_err(|_| Error::Other("pool is shut down".into()))?;

        runner.create_task_event(format!("Task {} created", new_task.id));

        Ok(new_task)
    }

    /// Stop one task. `force` jumps straight to `stopped`.
    pub async fn stop_task(&self, task: &Task, force: bool) -> Result<()> {
        match self.get_task(task.id).await {
            Some(active) => {
                let previous = active.status();

                if force {
                    active.try_set_status(TaskStatus::Stopping);
                    active.try_set_status(TaskStatus::Stopped);
                } else if !active.try_set_status(TaskStatus::Stopping) {
                    // not stoppable in place (queued / preparing): stop it
                    active.try_set_status(TaskStatus::Stopped);
                }

                if previous == TaskStatus::Running || previous == TaskStatus::Starting {
                    active.kill_job();
                }
                Ok(())
            }
            None => {
                // not managed by this process: mark the row and record it
                let mut row = self.shared.store.get_task(task.project_id, task.id).await?;
                if !row.status.is_terminal() {
                    row.status = TaskStatus::Stopped;
                    row.end = Some(Utc::now());
                    self.shared.store.update_task(&row).await?;
                }
                self.shared
                    .store
                    .create_event(Event::for_task(
                        row.project_id,
                        None,
                        row.id,
                        format!("Task {} stopped", row.id),
                    ))
                    .await?;
                Ok(())
            }
        }
    }

    /// Apply [`stop_task`](Self::stop_task) to every queued or running task
    /// of a template.
    pub async fn stop_tasks_by_template(
        &self,
        project_id: i64,
        template_id: i64,
        force: bool,
    ) -> Result<()> {
        let mut targets = self.shared.state.queue_range().await;
        targets.extend(self.shared.state.running_range().await);

        for target in targets {
            if target.project_id() != project_id || target.template_id() != template_id {
                continue;
            }

            if target.is_local() || target.status() == TaskStatus::Waiting {
                let task = target.task();
                if let Err(e) = self.stop_task(&task, force).await {
                    tracing::error!(task_id = task.id, error = %e, "stop by template failed");
                }
            } else {
                // active on a peer process: record the stop request only
                let task = target.task();
                let _ = self
                    .shared
                    .store
                    .create_event(Event::for_task(
                        task.project_id,
                        None,
                        task.id,
                        format!("Task {} stopped", task.id),
                    ))
                    .await;
            }
        }

        Ok(())
    }

    /// Resolve a pending confirmation positively.
    pub async fn confirm_task(&self, task: &Task) -> Result<()> {
        let active = self
            .get_task(task.id)
            .await
            .ok_or_else(|| Error::InvalidOperation("task is not active".into()))?;
        active.try_set_status(TaskStatus::Confirmed);
        Ok(())
    }

    /// Resolve a pending confirmation negatively.
    pub async fn reject_task(&self, task: &Task) -> Result<()> {
        let active = self
            .get_task(task.id)
            .await
            .ok_or_else(|| Error::InvalidOperation("task is not active".into()))?;
        active.try_set_status(TaskStatus::Rejected);
        Ok(())
    }

    /// Find an active (queued or running) task by id.
    pub async fn get_task(&self, task_id: i64) -> Option<Arc<TaskRunner>> {
        for runner in self.shared.state.queue_range().await {
            if runner.task_id() == task_id {
                return Some(runner);
            }
        }
        for runner in self.shared.state.running_range().await {
            if runner.task_id() == task_id {
                return Some(runner);
            }
        }
        None
    }

    /// Find an active task by its public alias.
    pub async fn get_task_by_alias(&self, alias: &str) -> Option<Arc<TaskRunner>> {
        self.shared.state.get_by_alias(alias).await
    }

    /// Snapshot of the running set.
    pub async fn get_running_tasks(&self) -> Vec<Arc<TaskRunner>> {
        self.shared.state.running_range().await
    }

    /// Snapshot of the queue.
    pub async fn get_queued_tasks(&self) -> Vec<Arc<TaskRunner>> {
        self.shared.state.queue_range().await
    }

    /// Number of running tasks assigned to one remote runner.
    pub async fn running_tasks_of_runner(&self, runner_id: i64) -> usize {
        self.shared
            .state
            .running_range()
            .await
            .iter()
            .filter(|r| r.runner_id() == Some(runner_id))
            .count()
    }

    // -----------------------------------------------------------------
    // Scheduling
    // -----------------------------------------------------------------

    async fn run_scheduler(&self, mut register_rx: mpsc::Receiver<Arc<TaskRunner>>) {
        let mut tick = tokio::time::interval(SCHEDULE_INTERVAL);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                registered = register_rx.recv() => {
                    match registered {
                        Some(runner) => {
                            let task_id = runner.task_id();
                            self.shared.state.enqueue(runner.clone()).await;
                            runner.log(&format!("Task {task_id} added to queue"));
                            tracing::info!(task_id = task_id, "task added to queue");
                            self.schedule_pass().await;
                        }
                        None => return,
                    }
                }
                _ = tick.tick() => {
                    self.schedule_pass().await;
                }
            }
        }
    }

    /// One admission scan: head to tail, preserving the position of
    /// blocked items.
    async fn schedule_pass(&self) {
        let state = &self.shared.state;
        let mut index = 0usize;

        while index < state.queue_len().await {
            let Some(candidate) = state.queue_get(index).await else {
                break;
            };

            // queued stop targets never reach a backend
            if candidate.status() == TaskStatus::Stopping {
                candidate.try_set_status(TaskStatus::Stopped);
            }
            if candidate.status().is_terminal() {
                state.dequeue_at(index).await;
                tracing::info!(task_id = candidate.task_id(), "task removed from queue");
                continue;
            }

            if self.admission_blocks(&candidate).await {
                index += 1;
                continue;
            }

            if !state.try_claim(candidate.task_id()).await {
                index += 1;
                continue;
            }

            state.dequeue_at(index).await;
            state.set_running(candidate.clone()).await;
            state
                .add_active(candidate.project_id(), candidate.clone())
                .await;
            state.update_runtime_fields(&candidate).await;

            tracing::info!(task_id = candidate.task_id(), "task admitted");
            tokio::spawn(candidate.clone().run());
        }
    }

    /// Admission predicate: global cap, same-template serialization, and
    /// the project cap.
    async fn admission_blocks(&self, candidate: &Arc<TaskRunner>) -> bool {
        let shared = &self.shared;

        if shared.config.max_parallel_tasks > 0
            && shared.state.running_count().await >= shared.config.max_parallel_tasks
        {
            return true;
        }

        // tasks that already finished but have not been released yet must
        // not count against the project
        let project_id = candidate.project_id();
        let active: Vec<Arc<TaskRunner>> = shared
            .state
            .get_active(project_id)
            .await
            .into_iter()
            .filter(|other| !other.status().is_terminal())
            .collect();
        if active.is_empty() {
            return false;
        }

        let allow_parallel = candidate
            .template()
            .map(|t| t.allow_parallel_tasks)
            .unwrap_or(false);
        if !allow_parallel {
            for other in &active {
                if other.template_id() == candidate.template_id() {
                    return true;
                }
            }
        }

        let project = match shared.store.get_project(project_id).await {
            Ok(project) => project,
            Err(e) => {
                tracing::error!(project_id = project_id, error = %e, "project lookup failed");
                return false;
            }
        };

        project.max_parallel_tasks > 0 && active.len() as i64 >= project.max_parallel_tasks
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::MemoryPoolState;
    use conveyor_core::model::Template;
    use conveyor_core::store::MemoryStore;
    use conveyor_core::model::TemplateApp;

    fn test_pool(store: Arc<MemoryStore>, config: Config) -> TaskPool {
        TaskPool::new(
            store,
            Arc::new(MemoryPoolState::new()),
            Arc::new(RunnerRegistry::new()),
            config,
        )
    }

    fn runner_for(pool: &TaskPool, task_id: i64, template_id: i64) -> Arc<TaskRunner> {
        let mut task = Task::new(1, template_id);
        task.id = task_id;
        let runner = TaskRunner::new(&pool.shared, task, "tester");
        runner.set_template(Template {
            id: template_id,
            project_id: 1,
            name: "tpl".into(),
            app: TemplateApp::Bash,
            repository_id: 1,
            playbook: "run.sh".into(),
            ..Default::default()
        });
        runner
    }

    #[tokio::test]
    async fn memory_claims_are_exclusive_until_released() {
        let state = MemoryPoolState::new();
        assert!(state.try_claim(7).await);
        assert!(!state.try_claim(7).await);
        state.delete_claim(7).await;
        assert!(state.try_claim(7).await);
    }

    #[tokio::test]
    async fn global_cap_blocks_admission() {
        let store = Arc::new(MemoryStore::new());
        store.insert_project(conveyor_core::model::Project {
            id: 1,
            name: "p".into(),
            max_parallel_tasks: 0,
            alert: false,
        });

        let config = Config {
            max_parallel_tasks: 1,
            ..Default::default()
        };
        let pool = test_pool(store, config);

        let running = runner_for(&pool, 1, 1);
        pool.shared.state.set_running(running.clone()).await;

        let candidate = runner_for(&pool, 2, 2);
        assert!(pool.admission_blocks(&candidate).await);

        pool.shared.state.delete_running(1).await;
        assert!(!pool.admission_blocks(&candidate).await);
    }

    #[tokio::test]
    async fn same_template_blocks_unless_parallel_allowed() {
        let store = Arc::new(MemoryStore::new());
        store.insert_project(conveyor_core::model::Project {
            id: 1,
            name: "p".into(),
            max_parallel_tasks: 0,
            alert: false,
        });

        let pool = test_pool(store, Config::default());

        let active = runner_for(&pool, 1, 5);
        active.try_set_status(TaskStatus::Starting);
        pool.shared.state.add_active(1, active.clone()).await;

        let candidate = runner_for(&pool, 2, 5);
        assert!(pool.admission_blocks(&candidate).await);

        // a different template of the same project is admitted
        let other = runner_for(&pool, 3, 6);
        assert!(!pool.admission_blocks(&other).await);

        // a terminal active task no longer blocks
        active.try_set_status(TaskStatus::Running);
        active.try_set_status(TaskStatus::Success);
        assert!(!pool.admission_blocks(&candidate).await);
    }

    #[tokio::test]
    async fn terminal_active_tasks_do_not_count_toward_the_project_cap() {
        let store = Arc::new(MemoryStore::new());
        store.insert_project(conveyor_core::model::Project {
            id: 1,
            name: "p".into(),
            max_parallel_tasks: 1,
            alert: false,
        });

        let pool = test_pool(store, Config::default());

        // a finished task still sitting in the active set (release is
        // asynchronous) must not consume the project's only slot
        let finished = runner_for(&pool, 1, 5);
        finished.try_set_status(TaskStatus::Starting);
        finished.try_set_status(TaskStatus::Running);
        finished.try_set_status(TaskStatus::Success);
        pool.shared.state.add_active(1, finished.clone()).await;

        let candidate = runner_for(&pool, 2, 6);
        assert!(!pool.admission_blocks(&candidate).await);

        // a live task does
        let live = runner_for(&pool, 3, 7);
        live.try_set_status(TaskStatus::Starting);
        pool.shared.state.add_active(1, live.clone()).await;
        assert!(pool.admission_blocks(&candidate).await);
    }

    #[tokio::test]
    async fn confirm_and_reject_require_an_active_task() {
        let store = Arc::new(MemoryStore::new());
        let pool = test_pool(store.clone(), Config::default());

        let mut missing = Task::new(1, 1);
        missing.id = 9;
        assert!(matches!(
            pool.confirm_task(&missing).await,
            Err(Error::InvalidOperation(_))
        ));

        let runner = runner_for(&pool, 9, 1);
        // drive to waiting_confirmation the way a terraform plan would
        runner.try_set_status(TaskStatus::Starting);
        runner.try_set_status(TaskStatus::Running);
        runner.try_set_status(TaskStatus::WaitingConfirmation);
        pool.shared.state.set_running(runner.clone()).await;

        pool.confirm_task(&runner.task()).await.unwrap();
        assert_eq!(runner.status(), TaskStatus::Confirmed);

        // a confirmed task resumes running; rejection is no longer legal
        runner.try_set_status(TaskStatus::Running);
        assert!(pool.reject_task(&runner.task()).await.is_ok());
        assert_eq!(runner.status(), TaskStatus::Running);
    }
}

/// Apply queued durable side effects in order.
async fn run_command_writer(
    shared: Arc<PoolShared>,
    mut command_rx: mpsc::UnboundedReceiver<PoolCommand>,
) {
    while let Some(command) = command_rx.recv().await {
        match command {
            PoolCommand::Persist(task) => {
                if let Err(e) = shared.store.update_task(&task).await {
                    tracing::error!(task_id = task.id, error = %e, "task row update failed");
                }
            }
            PoolCommand::Event(event) => {
                if let Err(e) = shared.store.create_event(event).await {
                    tracing::error!(error = %e, "event write failed");
                }
            }
            PoolCommand::Release(runner) => {
                let task_id = runner.task_id();
                let project_id = runner.project_id();

                shared.state.delete_running(task_id).await;
                shared.state.remove_active(project_id, task_id).await;
                if let Some(alias) = runner.alias() {
                    shared.state.delete_alias(&alias).await;
                }
                shared.state.delete_claim(task_id).await;
                shared.registry.forget_pending(task_id);
            }
        }
    }
}
