// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Remote runner dispatch.
//!
//! The server side of the pull/push protocol with worker agents. Pending
//! jobs wait here, keyed by runner tag, until a polling agent claims them;
//! agent progress reports are translated into the same logger calls a local
//! job would make, so the log/stage pipeline is identical on both paths.

pub mod crypto;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use conveyor_core::model::{AccessKey, Runner};
use conveyor_core::wire::{JobDescriptor, JobState, RunnerState};
use conveyor_core::TaskStatus;
use conveyor_exec::job::JobResources;
use conveyor_exec::logger::TaskLogger;

use crate::pool::{Job, TaskRunner};

/// How often a remote job checks its status while waiting on agents.
const WATCH_INTERVAL: Duration = Duration::from_secs(1);

struct PendingJob {
    descriptor: JobDescriptor,
    access_keys: HashMap<i64, AccessKey>,
    tag: Option<String>,
    runner: Arc<TaskRunner>,
}

struct Assignment {
    runner_id: i64,
    task: Arc<TaskRunner>,
}

/// Server-side registry of pending and assigned remote jobs.
#[derive(Default)]
pub struct RunnerRegistry {
    pending: Mutex<Vec<PendingJob>>,
    assignments: Mutex<HashMap<i64, Assignment>>,
    cache_clears: Mutex<HashMap<i64, Option<i64>>>,
}

impl RunnerRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn submit(&self, job: PendingJob) {
        self.pending.lock().unwrap().push(job);
    }

    /// Remove a job that has not been claimed yet. True when one was
    /// removed.
    pub fn cancel_pending(&self, task_id: i64) -> bool {
        let mut pending = self.pending.lock().unwrap();
        let before = pending.len();
        pending.retain(|job| job.runner.task_id() != task_id);
        before != pending.len()
    }

    /// Drop every trace of a task (terminal release path).
    pub fn forget_pending(&self, task_id: i64) {
        self.cancel_pending(task_id);
        self.assignments.lock().unwrap().remove(&task_id);
    }

    /// Ask a runner to wipe its cache on its next poll.
    pub fn request_cache_clear(&self, runner_id: i64, project_id: Option<i64>) {
        self.cache_clears.lock().unwrap().insert(runner_id, project_id);
    }

    /// Whether a task is currently assigned to some runner.
    pub fn is_assigned(&self, task_id: i64) -> bool {
        self.assignments.lock().unwrap().contains_key(&task_id)
    }

    /// Number of tasks currently assigned to a runner.
    pub fn assigned_count(&self, runner_id: i64) -> usize {
        self.assignments
            .lock()
            .unwrap()
            .values()
            .filter(|a| a.runner_id == runner_id)
            .count()
    }

    /// Build the poll response for `runner`: authoritative state of its
    /// current jobs, plus new jobs matching its tag and capacity.
    pub fn poll_snapshot(&self, runner: &Runner) -> RunnerState {
        let mut state = RunnerState::default();

        {
            let assignments = self.assignments.lock().unwrap();
            for assignment in assignments.values() {
                if assignment.runner_id != runner.id {
                    continue;
                }
                state.current_jobs.push(JobState {
                    id: assignment.task.task_id(),
                    status: assignment.task.status(),
                });
            }
        }

        let mut capacity = if runner.max_parallel_tasks > 0 {
            let assigned = self.assigned_count(runner.id);
            (runner.max_parallel_tasks as usize).saturating_sub(assigned)
        } else {
            usize::MAX
        };

        {
            let mut pending = self.pending.lock().unwrap();
            let mut remaining = Vec::with_capacity(pending.len());

            for job in pending.drain(..) {
                let tag_matches = match &job.tag {
                    None => true,
                    Some(tag) => runner.tag.as_deref() == Some(tag.as_str()),
                };

                if capacity == 0 || !tag_matches {
                    remaining.push(job);
                    continue;
                }

                capacity -= 1;
                job.runner.set_runner_id(Some(runner.id));
                self.assignments.lock().unwrap().insert(
                    job.runner.task_id(),
                    Assignment {
                        runner_id: runner.id,
                        task: job.runner.clone(),
                    },
                );

                state.access_keys.extend(job.access_keys);
                state.new_jobs.push(job.descriptor);
            }

            *pending = remaining;
        }

        if let Some(project_id) = self.cache_clears.lock().unwrap().remove(&runner.id) {
            state.clear_cache = true;
            state.cache_clean_project_id = project_id;
        }

        state
    }

    /// Apply one progress report from an agent. Log records and status
    /// changes flow through the task's logger, identical to local jobs.
    pub fn apply_progress(&self, runner: &Runner, progress: conveyor_core::wire::RunnerProgress) {
        for job in progress.jobs {
            let task = {
                let assignments = self.assignments.lock().unwrap();
                match assignments.get(&job.id) {
                    Some(assignment) if assignment.runner_id == runner.id => {
                        assignment.task.clone()
                    }
                    _ => {
                        tracing::warn!(
                            task_id = job.id,
                            runner_id = runner.id,
                            "progress for unassigned task"
                        );
                        continue;
                    }
                }
            };

            for record in job.log_records {
                task.log_with_time(record.time, &record.message);
            }

            if let Some(commit) = &job.commit {
                task.set_commit(&commit.hash, &commit.message);
            }

            task.set_status(job.status);
        }
    }
}

/// Remote backend of one task: holds the descriptor until an agent claims
/// it, then observes agent-driven status until terminal.
pub struct RemoteJob {
    registry: Arc<RunnerRegistry>,
    task_id: i64,
    runner: Arc<TaskRunner>,
    tag: Option<String>,
    resources: Mutex<Option<JobResources>>,
}

impl RemoteJob {
    /// Remote job over populated resources.
    pub fn new(
        registry: Arc<RunnerRegistry>,
        tag: Option<String>,
        resources: JobResources,
        runner: Arc<TaskRunner>,
    ) -> Self {
        Self {
            registry,
            task_id: resources.task.id,
            runner,
            tag,
            resources: Mutex::new(Some(resources)),
        }
    }

    fn build_pending(&self) -> Option<PendingJob> {
        let resources = self.resources.lock().unwrap().take()?;

        let mut access_keys = HashMap::new();
        let mut collect = |key: &Option<AccessKey>| {
            if let Some(key) = key {
                access_keys.insert(key.id, key.clone());
            }
        };
        collect(&resources.repository_key);
        collect(&resources.inventory_ssh_key);
        collect(&resources.inventory_become_key);
        for key in resources.vault_keys.values() {
            access_keys.insert(key.id, key.clone());
        }

        let descriptor = JobDescriptor {
            task: resources.task,
            template: resources.template,
            inventory: resources.inventory,
            inventory_repository: resources.inventory_repository,
            repository: resources.repository,
            environment: resources.environment,
            username: self.runner.username(),
            incoming_version: self.runner.incoming_version(),
            alias: self.runner.alias(),
        };

        Some(PendingJob {
            descriptor,
            access_keys,
            tag: self.tag.clone(),
            runner: self.runner.clone(),
        })
    }
}

#[async_trait::async_trait]
impl Job for RemoteJob {
    async fn run(
        &self,
        _username: &str,
        _incoming_version: Option<&str>,
        _alias: &str,
    ) -> conveyor_exec::Result<()> {
        if let Some(pending) = self.build_pending() {
            self.registry.submit(pending);
        }

        loop {
            tokio::time::sleep(WATCH_INTERVAL).await;

            let status = self.runner.status();
            if status.is_terminal() {
                return Ok(());
            }

            // a stop before any agent claimed the job revokes it here; a
            // claimed job is killed by its agent on the next poll
            if status == TaskStatus::Stopping {
                self.registry.cancel_pending(self.task_id);
                if !self.registry.is_assigned(self.task_id) {
                    return Err(conveyor_exec::Error::Killed);
                }
            }
        }
    }

    fn kill(&self) {
        // an unclaimed job is revoked; a claimed one is killed by its agent
        // when it observes the stopping status on the next poll
        self.registry.cancel_pending(self.task_id);
    }
}
