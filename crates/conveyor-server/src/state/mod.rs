// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Pool state store.
//!
//! Holds the scheduler's mutable state: the ordered queue, the running set,
//! per-project active sets, the alias map, execution claims and the mirror
//! of runtime fields. The default backend is process-local memory; the
//! shared backend mirrors state into Postgres so several orchestrator
//! processes can cooperate on one logical pool.

pub mod postgres;

pub use postgres::SharedPoolState;

use async_trait::async_trait;
use std::collections::HashMap;
use std::pin::Pin;
use std::sync::{Arc, RwLock};

use conveyor_core::Result;

use crate::pool::TaskRunner;

/// Reconstructs a `TaskRunner` for a task this process has not seen,
/// without starting it.
pub type Hydrator = Arc<
    dyn Fn(
            i64,
            i64,
        )
            -> Pin<Box<dyn std::future::Future<Output = Result<Arc<TaskRunner>>> + Send>>
        + Send
        + Sync,
>;

/// Pluggable storage for the pool's scheduling state.
#[async_trait]
pub trait PoolStateStore: Send + Sync {
    /// Restore state from the backend and subscribe to cross-process
    /// events. In-memory backends no-op.
    async fn start(&self, hydrator: Hydrator) -> Result<()>;

    /// Append a task to the queue tail.
    async fn enqueue(&self, runner: Arc<TaskRunner>);

    /// Remove the queue item at `index`.
    async fn dequeue_at(&self, index: usize);

    /// Queue item at `index`.
    async fn queue_get(&self, index: usize) -> Option<Arc<TaskRunner>>;

    /// Queue length.
    async fn queue_len(&self) -> usize;

    /// Snapshot of the queue, head first.
    async fn queue_range(&self) -> Vec<Arc<TaskRunner>>;

    /// Add a task to the running set.
    async fn set_running(&self, runner: Arc<TaskRunner>);

    /// Remove a task from the running set.
    async fn delete_running(&self, task_id: i64);

    /// Snapshot of the running set.
    async fn running_range(&self) -> Vec<Arc<TaskRunner>>;

    /// Size of the running set.
    async fn running_count(&self) -> usize;

    /// Add a task to its project's active set.
    async fn add_active(&self, project_id: i64, runner: Arc<TaskRunner>);

    /// Remove a task from its project's active set.
    async fn remove_active(&self, project_id: i64, task_id: i64);

    /// Snapshot of a project's active set.
    async fn get_active(&self, project_id: i64) -> Vec<Arc<TaskRunner>>;

    /// Size of a project's active set.
    async fn active_count(&self, project_id: i64) -> usize;

    /// Bind a public alias to a task.
    async fn set_alias(&self, alias: &str, runner: Arc<TaskRunner>);

    /// Look a task up by alias.
    async fn get_by_alias(&self, alias: &str) -> Option<Arc<TaskRunner>>;

    /// Release an alias.
    async fn delete_alias(&self, alias: &str);

    /// Atomically claim a task for execution. Across all processes, at most
    /// one `try_claim` per task returns true until the claim is released.
    async fn try_claim(&self, task_id: i64) -> bool;

    /// Release an execution claim.
    async fn delete_claim(&self, task_id: i64);

    /// Persist transient runner fields (runner id, username, incoming
    /// version, alias) so peers and restarts can restore them.
    async fn update_runtime_fields(&self, runner: &TaskRunner);

    /// Restore transient runner fields from the backend.
    async fn load_runtime_fields(&self, runner: &TaskRunner);
}

/// Process-local [`PoolStateStore`].
#[derive(Default)]
pub struct MemoryPoolState {
    inner: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    queue: Vec<Arc<TaskRunner>>,
    running: HashMap<i64, Arc<TaskRunner>>,
    active: HashMap<i64, HashMap<i64, Arc<TaskRunner>>>,
    aliases: HashMap<String, Arc<TaskRunner>>,
    claims: std::collections::HashSet<i64>,
}

impl MemoryPoolState {
    /// Empty state.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl PoolStateStore for MemoryPoolState {
    async fn start(&self, _hydrator: Hydrator) -> Result<()> {
        Ok(())
    }

    async fn enqueue(&self, runner: Arc<TaskRunner>) {
        self.inner.write().unwrap().queue.push(runner);
    }

    async fn dequeue_at(&self, index: usize) {
        let mut inner = self.inner.write().unwrap();
        if index < inner.queue.len() {
            inner.queue.remove(index);
        }
    }

    async fn queue_get(&self, index: usize) -> Option<Arc<TaskRunner>> {
        self.inner.read().unwrap().queue.get(index).cloned()
    }

    async fn queue_len(&self) -> usize {
        self.inner.read().unwrap().queue.len()
    }

    async fn queue_range(&self) -> Vec<Arc<TaskRunner>> {
        self.inner.read().unwrap().queue.clone()
    }

    async fn set_running(&self, runner: Arc<TaskRunner>) {
        let task_id = runner.task_id();
        self.inner.write().unwrap().running.insert(task_id, runner);
    }

    async fn delete_running(&self, task_id: i64) {
        self.inner.write().unwrap().running.remove(&task_id);
    }

    async fn running_range(&self) -> Vec<Arc<TaskRunner>> {
        self.inner.read().unwrap().running.values().cloned().collect()
    }

    async fn running_count(&self) -> usize {
        self.inner.read().unwrap().running.len()
    }

    async fn add_active(&self, project_id: i64, runner: Arc<TaskRunner>) {
        let task_id = runner.task_id();
        self.inner
            .write()
            .unwrap()
            .active
            .entry(project_id)
            .or_default()
            .insert(task_id, runner);
    }

    async fn remove_active(&self, project_id: i64, task_id: i64) {
        let mut inner = self.inner.write().unwrap();
        if let Some(project) = inner.active.get_mut(&project_id) {
            project.remove(&task_id);
            if project.is_empty() {
                inner.active.remove(&project_id);
            }
        }
    }

    async fn get_active(&self, project_id: i64) -> Vec<Arc<TaskRunner>> {
        self.inner
            .read()
            .unwrap()
            .active
            .get(&project_id)
            .map(|project| project.values().cloned().collect())
            .unwrap_or_default()
    }

    async fn active_count(&self, project_id: i64) -> usize {
        self.inner
            .read()
            .unwrap()
            .active
            .get(&project_id)
            .map(|project| project.len())
            .unwrap_or(0)
    }

    async fn set_alias(&self, alias: &str, runner: Arc<TaskRunner>) {
        self.inner
            .write()
            .unwrap()
            .aliases
            .insert(alias.to_string(), runner);
    }

    async fn get_by_alias(&self, alias: &str) -> Option<Arc<TaskRunner>> {
        self.inner.read().unwrap().aliases.get(alias).cloned()
    }

    async fn delete_alias(&self, alias: &str) {
        self.inner.write().unwrap().aliases.remove(alias);
    }

    async fn try_claim(&self, task_id: i64) -> bool {
        self.inner.write().unwrap().claims.insert(task_id)
    }

    async fn delete_claim(&self, task_id: i64) {
        self.inner.write().unwrap().claims.remove(&task_id);
    }

    async fn update_runtime_fields(&self, _runner: &TaskRunner) {}

    async fn load_runtime_fields(&self, _runner: &TaskRunner) {}
}
