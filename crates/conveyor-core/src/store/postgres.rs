// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL store backend.
//!
//! All queries are parameterized; JSON-shaped fields (task params, key
//! payloads) live in `jsonb` columns and are decoded through serde. The
//! relational schema is owned by this backend's `migrations/` directory and
//! is not part of the store contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use std::str::FromStr;

use super::Store;
use crate::error::{Error, Result};
use crate::model::{
    AccessKey, AliasLevel, Environment, EnvironmentSecret, Event, Integration,
    IntegrationExtractValue, IntegrationMatcher, Inventory, JsonMap, Project, Repository, Runner,
    Task, TaskOutput, TaskStage, TaskStageKind, Template, TemplateVault,
};
use crate::status::TaskStatus;

use crate::model::{
    BodyDataType, EnvironmentSecretKind, IntegrationAuthMethod, InventoryKind, MatchMethod,
    MatchType, TemplateApp, TemplateType, TemplateVaultKind, ValueSource, VariableKind,
};

/// PostgreSQL [`Store`] implementation.
#[derive(Clone)]
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Wrap an existing connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply the entity-table migrations.
    ///
    /// Other crates extend this schema with their own migrators against the
    /// same database, so versions applied by them are ignored here.
    pub async fn migrate(pool: &PgPool) -> Result<()> {
        let mut migrator = sqlx::migrate!("./migrations");
        migrator.set_ignore_missing(true);
        migrator
            .run(pool)
            .await
            .map_err(|e| Error::Other(format!("migration failed: {e}")))
    }

    /// The underlying pool, shared with the pool state store.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

fn json_map(value: Option<serde_json::Value>) -> JsonMap {
    match value {
        Some(serde_json::Value::Object(map)) => map,
        _ => JsonMap::new(),
    }
}

fn parse<T: FromStr<Err = Error>>(raw: &str) -> Result<T> {
    raw.parse()
}

fn task_from_row(row: &PgRow) -> Result<Task> {
    Ok(Task {
        id: row.try_get("id")?,
        template_id: row.try_get("template_id")?,
        project_id: row.try_get("project_id")?,
        status: parse::<TaskStatus>(row.try_get::<&str, _>("status")?)?,
        playbook: row.try_get("playbook")?,
        environment: row.try_get("environment")?,
        secret: String::new(),
        arguments: row.try_get("arguments")?,
        git_branch: row.try_get("git_branch")?,
        user_id: row.try_get("user_id")?,
        integration_id: row.try_get("integration_id")?,
        schedule_id: row.try_get("schedule_id")?,
        created: row.try_get("created")?,
        start: row.try_get("start")?,
        end: row.try_get("end")?,
        message: row.try_get("message")?,
        commit_hash: row.try_get("commit_hash")?,
        commit_message: row.try_get("commit_message")?,
        build_task_id: row.try_get("build_task_id")?,
        version: row.try_get("version")?,
        inventory_id: row.try_get("inventory_id")?,
        params: json_map(row.try_get("params")?),
        hosts_limit: row.try_get("hosts_limit")?,
    })
}

fn template_from_row(row: &PgRow) -> Result<Template> {
    Ok(Template {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        name: row.try_get("name")?,
        app: parse::<TemplateApp>(row.try_get::<&str, _>("app")?)?,
        kind: parse::<TemplateType>(row.try_get::<&str, _>("type")?)?,
        repository_id: row.try_get("repository_id")?,
        inventory_id: row.try_get("inventory_id")?,
        environment_id: row.try_get("environment_id")?,
        playbook: row.try_get("playbook")?,
        arguments: row.try_get("arguments")?,
        allow_override_args_in_task: row.try_get("allow_override_args_in_task")?,
        allow_override_branch_in_task: row.try_get("allow_override_branch_in_task")?,
        allow_parallel_tasks: row.try_get("allow_parallel_tasks")?,
        git_branch: row.try_get("git_branch")?,
        runner_tag: row.try_get("runner_tag")?,
        start_version: row.try_get("start_version")?,
        build_template_id: row.try_get("build_template_id")?,
        task_params: json_map(row.try_get("task_params")?),
        vaults: Vec::new(),
    })
}

fn integration_from_row(row: &PgRow) -> Result<Integration> {
    Ok(Integration {
        id: row.try_get("id")?,
        project_id: row.try_get("project_id")?,
        template_id: row.try_get("template_id")?,
        name: row.try_get("name")?,
        auth_method: parse::<IntegrationAuthMethod>(row.try_get::<&str, _>("auth_method")?)?,
        auth_secret_id: row.try_get("auth_secret_id")?,
        auth_header: row.try_get("auth_header")?,
        searchable: row.try_get("searchable")?,
        task_params: row
            .try_get::<Option<serde_json::Value>, _>("task_params")?
            .and_then(|v| v.as_object().cloned()),
    })
}

fn stage_from_row(row: &PgRow) -> Result<TaskStage> {
    Ok(TaskStage {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        start: row.try_get("start")?,
        end: row.try_get("end")?,
        start_output_id: row.try_get("start_output_id")?,
        end_output_id: row.try_get("end_output_id")?,
        kind: parse::<TaskStageKind>(row.try_get::<&str, _>("type")?)?,
    })
}

fn output_from_row(row: &PgRow) -> Result<TaskOutput> {
    Ok(TaskOutput {
        id: row.try_get("id")?,
        task_id: row.try_get("task_id")?,
        time: row.try_get("time")?,
        output: row.try_get("output")?,
        stage_id: row.try_get("stage_id")?,
    })
}

#[async_trait]
impl Store for PostgresStore {
    async fn get_project(&self, project_id: i64) -> Result<Project> {
        let row = sqlx::query(
            "SELECT id, name, max_parallel_tasks, alert FROM projects WHERE id = $1",
        )
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("project {project_id}")))?;

        Ok(Project {
            id: row.try_get("id")?,
            name: row.try_get("name")?,
            max_parallel_tasks: row.try_get("max_parallel_tasks")?,
            alert: row.try_get("alert")?,
        })
    }

    async fn get_template(&self, project_id: i64, template_id: i64) -> Result<Template> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, name, app, "type", repository_id, inventory_id,
                   environment_id, playbook, arguments, allow_override_args_in_task,
                   allow_override_branch_in_task, allow_parallel_tasks, git_branch,
                   runner_tag, start_version, build_template_id, task_params
            FROM templates WHERE id = $1 AND project_id = $2
            "#,
        )
        .bind(template_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("template {template_id}")))?;

        let mut template = template_from_row(&row)?;

        let vault_rows = sqlx::query(
            r#"SELECT id, template_id, vault_key_id, name, "type", script
               FROM template_vaults WHERE template_id = $1 ORDER BY id"#,
        )
        .bind(template_id)
        .fetch_all(&self.pool)
        .await?;

        for row in &vault_rows {
            template.vaults.push(TemplateVault {
                id: row.try_get("id")?,
                template_id: row.try_get("template_id")?,
                vault_key_id: row.try_get("vault_key_id")?,
                name: row.try_get("name")?,
                kind: match row.try_get::<&str, _>("type")? {
                    "script" => TemplateVaultKind::Script,
                    _ => TemplateVaultKind::Password,
                },
                script: row.try_get("script")?,
            });
        }

        Ok(template)
    }

    async fn get_template_tasks(
        &self,
        project_id: i64,
        template_id: i64,
        limit: i64,
    ) -> Result<Vec<Task>> {
        let rows = sqlx::query(
            r#"
            SELECT id, template_id, project_id, status, playbook, environment, arguments,
                   git_branch, user_id, integration_id, schedule_id, created, start, "end",
                   message, commit_hash, commit_message, build_task_id, version,
                   inventory_id, params, hosts_limit
            FROM tasks
            WHERE project_id = $1 AND template_id = $2
            ORDER BY id DESC
            LIMIT $3
            "#,
        )
        .bind(project_id)
        .bind(template_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(task_from_row).collect()
    }

    async fn get_inventory(&self, project_id: i64, inventory_id: i64) -> Result<Inventory> {
        let row = sqlx::query(
            r#"
            SELECT id, project_id, name, "type", inventory, repository_id, ssh_key_id,
                   become_key_id, runner_tag
            FROM inventories WHERE id = $1 AND project_id = $2
            "#,
        )
        .bind(inventory_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("inventory {inventory_id}")))?;

        Ok(Inventory {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            kind: parse::<InventoryKind>(row.try_get::<&str, _>("type")?)?,
            inventory: row.try_get("inventory")?,
            repository_id: row.try_get("repository_id")?,
            ssh_key_id: row.try_get("ssh_key_id")?,
            become_key_id: row.try_get("become_key_id")?,
            runner_tag: row.try_get("runner_tag")?,
        })
    }

    async fn get_repository(&self, project_id: i64, repository_id: i64) -> Result<Repository> {
        let row = sqlx::query(
            "SELECT id, project_id, name, git_url, git_branch, ssh_key_id
             FROM repositories WHERE id = $1 AND project_id = $2",
        )
        .bind(repository_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("repository {repository_id}")))?;

        Ok(Repository {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            git_url: row.try_get("git_url")?,
            git_branch: row.try_get("git_branch")?,
            ssh_key_id: row.try_get("ssh_key_id")?,
        })
    }

    async fn get_environment(&self, project_id: i64, environment_id: i64) -> Result<Environment> {
        let row = sqlx::query(
            "SELECT id, project_id, name, json, env
             FROM environments WHERE id = $1 AND project_id = $2",
        )
        .bind(environment_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("environment {environment_id}")))?;

        let mut environment = Environment {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            json: row.try_get("json")?,
            env: row.try_get("env")?,
            secrets: Vec::new(),
        };

        let secret_rows = sqlx::query(
            r#"SELECT id, "type", name, secret
               FROM environment_secrets WHERE environment_id = $1 ORDER BY id"#,
        )
        .bind(environment_id)
        .fetch_all(&self.pool)
        .await?;

        for row in &secret_rows {
            environment.secrets.push(EnvironmentSecret {
                id: row.try_get("id")?,
                kind: match row.try_get::<&str, _>("type")? {
                    "var" => EnvironmentSecretKind::Var,
                    _ => EnvironmentSecretKind::Env,
                },
                name: row.try_get("name")?,
                secret: row.try_get("secret")?,
            });
        }

        Ok(environment)
    }

    async fn get_access_key(&self, key_id: i64) -> Result<AccessKey> {
        let row = sqlx::query(
            r#"SELECT id, project_id, name, "type", ssh, login_password
               FROM access_keys WHERE id = $1"#,
        )
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("access key {key_id}")))?;

        Ok(AccessKey {
            id: row.try_get("id")?,
            project_id: row.try_get("project_id")?,
            name: row.try_get("name")?,
            kind: match row.try_get::<&str, _>("type")? {
                "ssh" => crate::model::AccessKeyKind::Ssh,
                "login_password" => crate::model::AccessKeyKind::LoginPassword,
                _ => crate::model::AccessKeyKind::None,
            },
            ssh: row
                .try_get::<Option<serde_json::Value>, _>("ssh")?
                .map(serde_json::from_value)
                .transpose()?,
            login_password: row
                .try_get::<Option<serde_json::Value>, _>("login_password")?
                .map(serde_json::from_value)
                .transpose()?,
        })
    }

    async fn create_task(&self, mut task: Task, max_per_template: i64) -> Result<Task> {
        let row = sqlx::query(
            r#"
            INSERT INTO tasks (
                template_id, project_id, status, playbook, environment, arguments,
                git_branch, user_id, integration_id, schedule_id, created, message,
                commit_hash, commit_message, build_task_id, version, inventory_id,
                params, hosts_limit
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                    $15, $16, $17, $18, $19)
            RETURNING id
            "#,
        )
        .bind(task.template_id)
        .bind(task.project_id)
        .bind(task.status.as_str())
        .bind(&task.playbook)
        .bind(&task.environment)
        .bind(&task.arguments)
        .bind(&task.git_branch)
        .bind(task.user_id)
        .bind(task.integration_id)
        .bind(task.schedule_id)
        .bind(task.created)
        .bind(&task.message)
        .bind(&task.commit_hash)
        .bind(&task.commit_message)
        .bind(task.build_task_id)
        .bind(&task.version)
        .bind(task.inventory_id)
        .bind(serde_json::Value::Object(task.params.clone()))
        .bind(&task.hosts_limit)
        .fetch_one(&self.pool)
        .await?;

        task.id = row.try_get("id")?;

        if max_per_template > 0 {
            sqlx::query(
                r#"
                DELETE FROM tasks
                WHERE template_id = $1 AND project_id = $2
                  AND status IN ('stopped', 'success', 'error')
                  AND id NOT IN (
                      SELECT id FROM tasks
                      WHERE template_id = $1 AND project_id = $2
                      ORDER BY id DESC
                      LIMIT $3
                  )
                "#,
            )
            .bind(task.template_id)
            .bind(task.project_id)
            .bind(max_per_template)
            .execute(&self.pool)
            .await?;
        }

        Ok(task)
    }

    async fn update_task(&self, task: &Task) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE tasks
            SET status = $2, start = $3, "end" = $4, commit_hash = $5,
                commit_message = $6, version = $7, environment = $8, params = $9
            WHERE id = $1
            "#,
        )
        .bind(task.id)
        .bind(task.status.as_str())
        .bind(task.start)
        .bind(task.end)
        .bind(&task.commit_hash)
        .bind(&task.commit_message)
        .bind(&task.version)
        .bind(&task.environment)
        .bind(serde_json::Value::Object(task.params.clone()))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task(&self, project_id: i64, task_id: i64) -> Result<Task> {
        let row = sqlx::query(
            r#"
            SELECT id, template_id, project_id, status, playbook, environment, arguments,
                   git_branch, user_id, integration_id, schedule_id, created, start, "end",
                   message, commit_hash, commit_message, build_task_id, version,
                   inventory_id, params, hosts_limit
            FROM tasks WHERE id = $1 AND project_id = $2
            "#,
        )
        .bind(task_id)
        .bind(project_id)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("task {task_id}")))?;

        task_from_row(&row)
    }

    async fn create_task_output(&self, mut output: TaskOutput) -> Result<TaskOutput> {
        let row = sqlx::query(
            "INSERT INTO task_outputs (task_id, time, output, stage_id)
             VALUES ($1, $2, $3, $4) RETURNING id",
        )
        .bind(output.task_id)
        .bind(output.time)
        .bind(&output.output)
        .bind(output.stage_id)
        .fetch_one(&self.pool)
        .await?;

        output.id = row.try_get("id")?;
        Ok(output)
    }

    async fn set_task_output_stage(
        &self,
        task_id: i64,
        output_id: i64,
        stage_id: Option<i64>,
    ) -> Result<()> {
        sqlx::query("UPDATE task_outputs SET stage_id = $3 WHERE id = $2 AND task_id = $1")
            .bind(task_id)
            .bind(output_id)
            .bind(stage_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_task_stage(
        &self,
        task_id: i64,
        kind: TaskStageKind,
        start: DateTime<Utc>,
        start_output_id: i64,
    ) -> Result<TaskStage> {
        let row = sqlx::query(
            r#"INSERT INTO task_stages (task_id, start, start_output_id, "type")
               VALUES ($1, $2, $3, $4)
               RETURNING id, task_id, start, "end", start_output_id, end_output_id, "type""#,
        )
        .bind(task_id)
        .bind(start)
        .bind(start_output_id)
        .bind(kind.as_str())
        .fetch_one(&self.pool)
        .await?;

        stage_from_row(&row)
    }

    async fn end_task_stage(
        &self,
        task_id: i64,
        stage_id: i64,
        end: DateTime<Utc>,
        end_output_id: i64,
    ) -> Result<()> {
        sqlx::query(
            r#"UPDATE task_stages SET "end" = $3, end_output_id = $4
               WHERE id = $2 AND task_id = $1"#,
        )
        .bind(task_id)
        .bind(stage_id)
        .bind(end)
        .bind(end_output_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_task_stage_outputs(&self, task_id: i64, stage_id: i64) -> Result<Vec<TaskOutput>> {
        let rows = sqlx::query(
            r#"
            SELECT o.id, o.task_id, o.time, o.output, o.stage_id
            FROM task_outputs o
            JOIN task_stages s ON s.id = $2 AND s.task_id = $1
            WHERE o.task_id = $1
              AND o.id >= COALESCE(s.start_output_id, o.id)
              AND o.id <= COALESCE(s.end_output_id, o.id)
            ORDER BY o.id
            "#,
        )
        .bind(task_id)
        .bind(stage_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(output_from_row).collect()
    }

    async fn create_task_stage_result(
        &self,
        task_id: i64,
        stage_id: i64,
        result: JsonMap,
    ) -> Result<()> {
        sqlx::query(
            "INSERT INTO task_stage_results (task_id, stage_id, result)
             VALUES ($1, $2, $3)
             ON CONFLICT (task_id, stage_id) DO UPDATE SET result = EXCLUDED.result",
        )
        .bind(task_id)
        .bind(stage_id)
        .bind(serde_json::Value::Object(result))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn get_integrations_by_alias(
        &self,
        alias: &str,
    ) -> Result<(Vec<Integration>, AliasLevel)> {
        let alias_row = sqlx::query(
            "SELECT project_id, integration_id FROM integration_aliases WHERE alias = $1",
        )
        .bind(alias)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound(format!("integration alias {alias}")))?;

        let project_id: i64 = alias_row.try_get("project_id")?;
        let integration_id: Option<i64> = alias_row.try_get("integration_id")?;

        match integration_id {
            Some(id) => {
                let row = sqlx::query(
                    "SELECT id, project_id, template_id, name, auth_method, auth_secret_id,
                            auth_header, searchable, task_params
                     FROM integrations WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&self.pool)
                .await?
                .ok_or_else(|| Error::NotFound(format!("integration {id}")))?;

                Ok((vec![integration_from_row(&row)?], AliasLevel::Single))
            }
            None => {
                let rows = sqlx::query(
                    "SELECT id, project_id, template_id, name, auth_method, auth_secret_id,
                            auth_header, searchable, task_params
                     FROM integrations
                     WHERE project_id = $1 AND searchable
                     ORDER BY id",
                )
                .bind(project_id)
                .fetch_all(&self.pool)
                .await?;

                let integrations = rows
                    .iter()
                    .map(integration_from_row)
                    .collect::<Result<Vec<_>>>()?;
                Ok((integrations, AliasLevel::Project))
            }
        }
    }

    async fn get_integration_matchers(
        &self,
        project_id: i64,
        integration_id: i64,
    ) -> Result<Vec<IntegrationMatcher>> {
        let rows = sqlx::query(
            r#"
            SELECT m.id, m.integration_id, m.name, m.match_type, m.method, m.key,
                   m.value, m.body_data_type
            FROM integration_matchers m
            JOIN integrations i ON i.id = m.integration_id
            WHERE m.integration_id = $1 AND i.project_id = $2
            ORDER BY m.id
            "#,
        )
        .bind(integration_id)
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let mut matchers = Vec::with_capacity(rows.len());
        for row in &rows {
            matchers.push(IntegrationMatcher {
                id: row.try_get("id")?,
                integration_id: row.try_get("integration_id")?,
                name: row.try_get("name")?,
                match_type: match row.try_get::<&str, _>("match_type")? {
                    "body" => MatchType::Body,
                    _ => MatchType::Header,
                },
                method: match row.try_get::<&str, _>("method")? {
                    "unequals" => MatchMethod::Unequals,
                    "contains" => MatchMethod::Contains,
                    _ => MatchMethod::Equals,
                },
                key: row.try_get("key")?,
                value: row.try_get("value")?,
                body_data_type: match row.try_get::<&str, _>("body_data_type")? {
                    "string" => BodyDataType::String,
                    _ => BodyDataType::Json,
                },
            });
        }
        Ok(matchers)
    }

    async fn get_integration_extract_values(
        &self,
        project_id: i64,
        integration_id: i64,
    ) -> Result<Vec<IntegrationExtractValue>> {
        let rows = sqlx::query(
            r#"
            SELECT v.id, v.integration_id, v.name, v.value_source, v.key, v.variable,
                   v.variable_type, v.body_data_type
            FROM integration_extract_values v
            JOIN integrations i ON i.id = v.integration_id
            WHERE v.integration_id = $1 AND i.project_id = $2
            ORDER BY v.id
            "#,
        )
        .bind(integration_id)
        .bind(project_id)
        .fetch_all(&self.pool)
        .await?;

        let mut values = Vec::with_capacity(rows.len());
        for row in &rows {
            values.push(IntegrationExtractValue {
                id: row.try_get("id")?,
                integration_id: row.try_get("integration_id")?,
                name: row.try_get("name")?,
                value_source: match row.try_get::<&str, _>("value_source")? {
                    "body" => ValueSource::Body,
                    _ => ValueSource::Header,
                },
                key: row.try_get("key")?,
                variable: row.try_get("variable")?,
                variable_type: match row.try_get::<&str, _>("variable_type")? {
                    "task_param" => VariableKind::TaskParam,
                    _ => VariableKind::Environment,
                },
                body_data_type: match row.try_get::<&str, _>("body_data_type")? {
                    "string" => BodyDataType::String,
                    _ => BodyDataType::Json,
                },
            });
        }
        Ok(values)
    }

    async fn create_runner(&self, mut runner: Runner) -> Result<Runner> {
        let row = sqlx::query(
            "INSERT INTO runners (token, tag, max_parallel_tasks, webhook, public_key, active)
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING id",
        )
        .bind(&runner.token)
        .bind(&runner.tag)
        .bind(runner.max_parallel_tasks)
        .bind(&runner.webhook)
        .bind(&runner.public_key)
        .bind(runner.active)
        .fetch_one(&self.pool)
        .await?;

        runner.id = row.try_get("id")?;
        Ok(runner)
    }

    async fn get_runner_by_token(&self, token: &str) -> Result<Runner> {
        let row = sqlx::query(
            "SELECT id, token, tag, max_parallel_tasks, webhook, public_key, active
             FROM runners WHERE token = $1 AND active",
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?
        .ok_or_else(|| Error::NotFound("runner".into()))?;

        Ok(Runner {
            id: row.try_get("id")?,
            token: row.try_get("token")?,
            tag: row.try_get("tag")?,
            max_parallel_tasks: row.try_get("max_parallel_tasks")?,
            webhook: row.try_get("webhook")?,
            public_key: row.try_get("public_key")?,
            active: row.try_get("active")?,
        })
    }

    async fn delete_runner(&self, runner_id: i64) -> Result<()> {
        sqlx::query("DELETE FROM runners WHERE id = $1")
            .bind(runner_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn create_event(&self, event: Event) -> Result<()> {
        sqlx::query(
            "INSERT INTO events (project_id, user_id, object_type, object_id, description, created)
             VALUES ($1, $2, $3, $4, $5, $6)",
        )
        .bind(event.project_id)
        .bind(event.user_id)
        .bind(&event.object_type)
        .bind(event.object_id)
        .bind(&event.description)
        .bind(event.created)
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}
