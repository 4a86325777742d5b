// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared pool state backed by Postgres.
//!
//! Task identifiers live in `pool_*` tables; this process keeps a pointer
//! cache resolving ids to `TaskRunner`s. Every mutation is mirrored to the
//! database and announced through `pg_notify`; peers consume the events,
//! hydrate runners they have not seen, and mirror the pointers into their
//! own caches. Claims are unique-index inserts, so exactly one process
//! admits a given task.
//!
//! Store errors are logged and swallowed: the scheduler keeps operating on
//! its local cache and reconciles on the next tick.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::{PgPool, Row};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use conveyor_core::{ids, Result};

use crate::pool::TaskRunner;

use super::{Hydrator, PoolStateStore};

const EVENT_CHANNEL: &str = "conveyor_pool_events";

/// Apply the pool-state migrations (entity tables must exist already).
///
/// The entity schema lives in conveyor-core's migrator; its versions are
/// ignored here since both record into the same migrations table.
pub async fn migrate(pool: &PgPool) -> Result<()> {
    let mut migrator = sqlx::migrate!("./migrations");
    migrator.set_ignore_missing(true);
    migrator
        .run(pool)
        .await
        .map_err(|e| conveyor_core::Error::Other(format!("pool state migration failed: {e}")))
}

#[derive(Debug, Serialize, Deserialize)]
struct PoolEvent {
    origin: String,
    #[serde(rename = "type")]
    kind: String,
    task_id: i64,
    #[serde(default)]
    project_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    alias: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    runner_id: Option<i64>,
    #[serde(default)]
    username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    incoming_version: Option<String>,
}

#[derive(Default)]
struct PointerCache {
    by_id: HashMap<i64, Arc<TaskRunner>>,
    by_alias: HashMap<String, Arc<TaskRunner>>,
}

/// Postgres-backed [`PoolStateStore`] for HA deployments.
pub struct SharedPoolState {
    pool: PgPool,
    /// Distinguishes this process's own notifications from peers'.
    origin: String,
    cache: RwLock<PointerCache>,
}

impl SharedPoolState {
    /// Shared state over an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            origin: ids::random_token(16),
            cache: RwLock::new(PointerCache::default()),
        }
    }

    fn cache_insert(&self, runner: &Arc<TaskRunner>) {
        let mut cache = self.cache.write().unwrap();
        cache.by_id.insert(runner.task_id(), runner.clone());
        if let Some(alias) = runner.alias() {
            cache.by_alias.insert(alias, runner.clone());
        }
    }

    fn cache_get(&self, task_id: i64) -> Option<Arc<TaskRunner>> {
        self.cache.read().unwrap().by_id.get(&task_id).cloned()
    }

    fn cache_remove(&self, task_id: i64) {
        self.cache.write().unwrap().by_id.remove(&task_id);
    }

    fn event(&self, kind: &str, runner: &TaskRunner) -> PoolEvent {
        PoolEvent {
            origin: self.origin.clone(),
            kind: kind.to_string(),
            task_id: runner.task_id(),
            project_id: runner.project_id(),
            alias: runner.alias(),
            runner_id: runner.runner_id(),
            username: runner.username(),
            incoming_version: runner.incoming_version(),
        }
    }

    async fn publish(&self, event: PoolEvent) {
        let payload = match serde_json::to_string(&event) {
            Ok(payload) => payload,
            Err(e) => {
                tracing::error!(error = %e, "pool event serialization failed");
                return;
            }
        };

        if let Err(e) = sqlx::query("SELECT pg_notify($1, $2)")
            .bind(EVENT_CHANNEL)
            .bind(&payload)
            .execute(&self.pool)
            .await
        {
            tracing::error!(error = %e, "pool event publish failed");
        }
    }

    async fn exec(&self, description: &str, query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>) {
        if let Err(e) = query.execute(&self.pool).await {
            tracing::error!(error = %e, "{description} failed");
        }
    }

    /// Hydrate one task reported by a restore query or a peer event.
    async fn hydrate(
        self: &Arc<Self>,
        hydrator: &Hydrator,
        task_id: i64,
        project_id: i64,
    ) -> Option<Arc<TaskRunner>> {
        if let Some(runner) = self.cache_get(task_id) {
            return Some(runner);
        }

        match hydrator(task_id, project_id).await {
            Ok(runner) => {
                self.load_runtime_fields(&runner).await;
                self.cache_insert(&runner);
                Some(runner)
            }
            Err(e) => {
                tracing::error!(task_id = task_id, error = %e, "task hydration failed");
                None
            }
        }
    }

    async fn apply_event(self: &Arc<Self>, hydrator: &Hydrator, event: PoolEvent) {
        match event.kind.as_str() {
            "enqueue" | "set_running" | "active_add" | "alias_set" => {
                if let Some(runner) = self
                    .hydrate(hydrator, event.task_id, event.project_id)
                    .await
                {
                    if !event.username.is_empty() {
                        runner.set_username(event.username.clone());
                    }
                    if event.runner_id.is_some() {
                        runner.set_runner_id(event.runner_id);
                    }
                    if event.incoming_version.is_some() {
                        runner.set_incoming_version(event.incoming_version.clone());
                    }
                    if let Some(alias) = &event.alias {
                        runner.set_alias(alias.clone());
                        self.cache
                            .write()
                            .unwrap()
                            .by_alias
                            .insert(alias.clone(), runner.clone());
                    }
                }
            }
            "dequeue" | "delete_running" | "active_remove" => {
                self.cache_remove(event.task_id);
            }
            "alias_delete" => {
                if let Some(alias) = &event.alias {
                    self.cache.write().unwrap().by_alias.remove(alias);
                }
            }
            other => {
                tracing::debug!(kind = other, "ignoring unknown pool event");
            }
        }
    }

    async fn restore(self: &Arc<Self>, hydrator: &Hydrator) -> Result<()> {
        let rows = sqlx::query(
            "SELECT task_id, project_id FROM pool_queue
             UNION SELECT task_id, project_id FROM pool_running
             UNION SELECT task_id, project_id FROM pool_active
             UNION SELECT task_id, project_id FROM pool_aliases",
        )
        .fetch_all(&self.pool)
        .await?;

        for row in rows {
            let task_id: i64 = row.try_get("task_id")?;
            let project_id: i64 = row.try_get("project_id")?;
            self.hydrate(hydrator, task_id, project_id).await;
        }

        Ok(())
    }

    /// Subscribe to peer events and start mirroring them into the cache.
    pub async fn start_listening(self: Arc<Self>, hydrator: Hydrator) -> Result<()> {
        let mut listener = PgListener::connect_with(&self.pool).await?;
        listener.listen(EVENT_CHANNEL).await?;

        tokio::spawn(async move {
            loop {
                match listener.recv().await {
                    Ok(notification) => {
                        let event: PoolEvent = match serde_json::from_str(notification.payload()) {
                            Ok(event) => event,
                            Err(e) => {
                                tracing::warn!(error = %e, "malformed pool event");
                                continue;
                            }
                        };
                        if event.origin == self.origin {
                            continue;
                        }
                        self.apply_event(&hydrator, event).await;
                    }
                    Err(e) => {
                        tracing::error!(error = %e, "pool event listener failed, reconnecting");
                        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
                    }
                }
            }
        });

        Ok(())
    }
}

#[async_trait]
impl PoolStateStore for Arc<SharedPoolState> {
    async fn start(&self, hydrator: Hydrator) -> Result<()> {
        self.restore(&hydrator).await?;
        self.clone().start_listening(hydrator).await
    }

    async fn enqueue(&self, runner: Arc<TaskRunner>) {
        self.cache_insert(&runner);
        self.exec(
            "pool enqueue",
            sqlx::query(
                "INSERT INTO pool_queue (task_id, project_id) VALUES ($1, $2)
                 ON CONFLICT (task_id) DO NOTHING",
            )
            .bind(runner.task_id())
            .bind(runner.project_id()),
        )
        .await;
        self.update_runtime_fields(&runner).await;
        self.publish(self.event("enqueue", &runner)).await;
    }

    async fn dequeue_at(&self, index: usize) {
        let row = sqlx::query(
            "SELECT task_id FROM pool_queue ORDER BY position LIMIT 1 OFFSET $1",
        )
        .bind(index as i64)
        .fetch_optional(&self.pool)
        .await;

        let task_id: i64 = match row {
            Ok(Some(row)) => row.try_get("task_id").unwrap_or(0),
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "pool dequeue failed");
                return;
            }
        };

        self.exec(
            "pool dequeue",
            sqlx::query("DELETE FROM pool_queue WHERE task_id = $1").bind(task_id),
        )
        .await;

        let event = PoolEvent {
            origin: self.origin.clone(),
            kind: "dequeue".into(),
            task_id,
            project_id: 0,
            alias: None,
            runner_id: None,
            username: String::new(),
            incoming_version: None,
        };
        self.publish(event).await;
    }

    async fn queue_get(&self, index: usize) -> Option<Arc<TaskRunner>> {
        let row = sqlx::query(
            "SELECT task_id FROM pool_queue ORDER BY position LIMIT 1 OFFSET $1",
        )
        .bind(index as i64)
        .fetch_optional(&self.pool)
        .await
        .ok()??;

        let task_id: i64 = row.try_get("task_id").ok()?;
        self.cache_get(task_id)
    }

    async fn queue_len(&self) -> usize {
        sqlx::query("SELECT COUNT(*) AS n FROM pool_queue")
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get::<i64, _>("n"))
            .map(|n| n as usize)
            .unwrap_or(0)
    }

    async fn queue_range(&self) -> Vec<Arc<TaskRunner>> {
        let rows = sqlx::query("SELECT task_id FROM pool_queue ORDER BY position")
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default();

        rows.iter()
            .filter_map(|row| row.try_get::<i64, _>("task_id").ok())
            .filter_map(|task_id| self.cache_get(task_id))
            .collect()
    }

    async fn set_running(&self, runner: Arc<TaskRunner>) {
        self.cache_insert(&runner);
        self.exec(
            "pool set running",
            sqlx::query(
                "INSERT INTO pool_running (task_id, project_id) VALUES ($1, $2)
                 ON CONFLICT (task_id) DO NOTHING",
            )
            .bind(runner.task_id())
            .bind(runner.project_id()),
        )
        .await;
        self.publish(self.event("set_running", &runner)).await;
    }

    async fn delete_running(&self, task_id: i64) {
        self.exec(
            "pool delete running",
            sqlx::query("DELETE FROM pool_running WHERE task_id = $1").bind(task_id),
        )
        .await;
        self.cache_remove(task_id);

        let event = PoolEvent {
            origin: self.origin.clone(),
            kind: "delete_running".into(),
            task_id,
            project_id: 0,
            alias: None,
            runner_id: None,
            username: String::new(),
            incoming_version: None,
        };
        self.publish(event).await;
    }

    async fn running_range(&self) -> Vec<Arc<TaskRunner>> {
        let rows = sqlx::query("SELECT task_id FROM pool_running")
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default();

        rows.iter()
            .filter_map(|row| row.try_get::<i64, _>("task_id").ok())
            .filter_map(|task_id| self.cache_get(task_id))
            .collect()
    }

    async fn running_count(&self) -> usize {
        sqlx::query("SELECT COUNT(*) AS n FROM pool_running")
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get::<i64, _>("n"))
            .map(|n| n as usize)
            .unwrap_or(0)
    }

    async fn add_active(&self, project_id: i64, runner: Arc<TaskRunner>) {
        self.cache_insert(&runner);
        self.exec(
            "pool add active",
            sqlx::query(
                "INSERT INTO pool_active (project_id, task_id) VALUES ($1, $2)
                 ON CONFLICT DO NOTHING",
            )
            .bind(project_id)
            .bind(runner.task_id()),
        )
        .await;
        self.publish(self.event("active_add", &runner)).await;
    }

    async fn remove_active(&self, project_id: i64, task_id: i64) {
        self.exec(
            "pool remove active",
            sqlx::query("DELETE FROM pool_active WHERE project_id = $1 AND task_id = $2")
                .bind(project_id)
                .bind(task_id),
        )
        .await;

        let event = PoolEvent {
            origin: self.origin.clone(),
            kind: "active_remove".into(),
            task_id,
            project_id,
            alias: None,
            runner_id: None,
            username: String::new(),
            incoming_version: None,
        };
        self.publish(event).await;
    }

    async fn get_active(&self, project_id: i64) -> Vec<Arc<TaskRunner>> {
        let rows = sqlx::query("SELECT task_id FROM pool_active WHERE project_id = $1")
            .bind(project_id)
            .fetch_all(&self.pool)
            .await
            .unwrap_or_default();

        rows.iter()
            .filter_map(|row| row.try_get::<i64, _>("task_id").ok())
            .filter_map(|task_id| self.cache_get(task_id))
            .collect()
    }

    async fn active_count(&self, project_id: i64) -> usize {
        sqlx::query("SELECT COUNT(*) AS n FROM pool_active WHERE project_id = $1")
            .bind(project_id)
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get::<i64, _>("n"))
            .map(|n| n as usize)
            .unwrap_or(0)
    }

    async fn set_alias(&self, alias: &str, runner: Arc<TaskRunner>) {
        self.cache_insert(&runner);
        self.cache
            .write()
            .unwrap()
            .by_alias
            .insert(alias.to_string(), runner.clone());

        self.exec(
            "pool set alias",
            sqlx::query(
                "INSERT INTO pool_aliases (alias, task_id, project_id) VALUES ($1, $2, $3)
                 ON CONFLICT (alias) DO NOTHING",
            )
            .bind(alias)
            .bind(runner.task_id())
            .bind(runner.project_id()),
        )
        .await;
        self.publish(self.event("alias_set", &runner)).await;
    }

    async fn get_by_alias(&self, alias: &str) -> Option<Arc<TaskRunner>> {
        if let Some(runner) = self.cache.read().unwrap().by_alias.get(alias).cloned() {
            return Some(runner);
        }

        let row = sqlx::query("SELECT task_id FROM pool_aliases WHERE alias = $1")
            .bind(alias)
            .fetch_optional(&self.pool)
            .await
            .ok()??;
        let task_id: i64 = row.try_get("task_id").ok()?;
        self.cache_get(task_id)
    }

    async fn delete_alias(&self, alias: &str) {
        self.exec(
            "pool delete alias",
            sqlx::query("DELETE FROM pool_aliases WHERE alias = $1").bind(alias),
        )
        .await;
        self.cache.write().unwrap().by_alias.remove(alias);

        let event = PoolEvent {
            origin: self.origin.clone(),
            kind: "alias_delete".into(),
            task_id: 0,
            project_id: 0,
            alias: Some(alias.to_string()),
            runner_id: None,
            username: String::new(),
            incoming_version: None,
        };
        self.publish(event).await;
    }

    async fn try_claim(&self, task_id: i64) -> bool {
        match sqlx::query("INSERT INTO pool_claims (task_id) VALUES ($1) ON CONFLICT DO NOTHING")
            .bind(task_id)
            .execute(&self.pool)
            .await
        {
            Ok(result) => result.rows_affected() == 1,
            Err(e) => {
                tracing::error!(task_id = task_id, error = %e, "pool claim failed");
                false
            }
        }
    }

    async fn delete_claim(&self, task_id: i64) {
        self.exec(
            "pool delete claim",
            sqlx::query("DELETE FROM pool_claims WHERE task_id = $1").bind(task_id),
        )
        .await;
    }

    async fn update_runtime_fields(&self, runner: &TaskRunner) {
        self.exec(
            "pool update runtime fields",
            sqlx::query(
                "INSERT INTO pool_runtime
                     (task_id, project_id, runner_id, username, incoming_version, alias)
                 VALUES ($1, $2, $3, $4, $5, $6)
                 ON CONFLICT (task_id) DO UPDATE SET
                     runner_id = EXCLUDED.runner_id,
                     username = EXCLUDED.username,
                     incoming_version = EXCLUDED.incoming_version,
                     alias = EXCLUDED.alias",
            )
            .bind(runner.task_id())
            .bind(runner.project_id())
            .bind(runner.runner_id())
            .bind(runner.username())
            .bind(runner.incoming_version())
            .bind(runner.alias()),
        )
        .await;
    }

    async fn load_runtime_fields(&self, runner: &TaskRunner) {
        let row = match sqlx::query(
            "SELECT runner_id, username, incoming_version, alias
             FROM pool_runtime WHERE task_id = $1",
        )
        .bind(runner.task_id())
        .fetch_optional(&self.pool)
        .await
        {
            Ok(Some(row)) => row,
            Ok(None) => return,
            Err(e) => {
                tracing::error!(error = %e, "pool load runtime fields failed");
                return;
            }
        };

        if let Ok(Some(runner_id)) = row.try_get::<Option<i64>, _>("runner_id") {
            runner.set_runner_id(Some(runner_id));
        }
        if let Ok(username) = row.try_get::<String, _>("username") {
            if !username.is_empty() {
                runner.set_username(username);
            }
        }
        if let Ok(Some(version)) = row.try_get::<Option<String>, _>("incoming_version") {
            runner.set_incoming_version(Some(version));
        }
        if let Ok(Some(alias)) = row.try_get::<Option<String>, _>("alias") {
            runner.set_alias(alias);
        }
    }
}
