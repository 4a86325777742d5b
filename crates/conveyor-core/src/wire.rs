// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire types of the runner dispatch protocol.
//!
//! Exchanged between the orchestrator (`/api/internal/runners`) and worker
//! agents. Job descriptors embed full entity rows so an agent needs no
//! further lookups; access keys are carried once per response, referenced
//! by id.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::model::{AccessKey, Environment, Inventory, Repository, Task, Template};
use crate::status::TaskStatus;

/// Body of `POST /api/internal/runners`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerRegistration {
    /// Shared registration token configured on the server.
    pub registration_token: String,
    /// Webhook the server may call to wake the runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<String>,
    /// Maximum jobs the runner executes concurrently. 0 = unlimited.
    #[serde(default)]
    pub max_parallel_tasks: i64,
    /// PEM-encoded RSA public key; when present, poll responses are
    /// encrypted for this runner.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_key: Option<String>,
    /// Tag restricting which jobs the runner receives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tag: Option<String>,
}

/// Response of a successful registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerRegistrationResponse {
    /// Minted per-runner token.
    pub token: String,
}

/// One job offered to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDescriptor {
    /// The task row.
    pub task: Task,
    /// Its template, vaults included.
    pub template: Template,
    /// Template inventory, when bound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory: Option<Inventory>,
    /// Repository a file inventory lives in.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inventory_repository: Option<Repository>,
    /// Source repository.
    pub repository: Repository,
    /// Bound environment, when set.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment: Option<Environment>,
    /// Name of the submitting user.
    #[serde(default)]
    pub username: String,
    /// Version of the consumed build artefact (deploy tasks).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub incoming_version: Option<String>,
    /// Public task alias, when the app needs one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alias: Option<String>,
}

/// Authoritative server-side status of a job an agent already runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobState {
    /// Task id.
    pub id: i64,
    /// Server-side status.
    pub status: TaskStatus,
}

/// Response of `GET /api/internal/runners`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunnerState {
    /// Jobs the agent may start.
    #[serde(default)]
    pub new_jobs: Vec<JobDescriptor>,
    /// Server-side view of jobs the agent is running.
    #[serde(default)]
    pub current_jobs: Vec<JobState>,
    /// Access keys referenced by the job descriptors, by id.
    #[serde(default)]
    pub access_keys: HashMap<i64, AccessKey>,
    /// The agent must wipe its tmp directory.
    #[serde(default)]
    pub clear_cache: bool,
    /// Restrict the wipe to one project's cache.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_clean_project_id: Option<i64>,
}

/// One buffered output line in a progress report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogRecord {
    /// Emission time.
    pub time: DateTime<Utc>,
    /// The line.
    pub message: String,
}

/// Commit information recorded by the agent after checkout.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommitInfo {
    /// Commit hash.
    pub hash: String,
    /// Commit subject line.
    pub message: String,
}

/// Progress of one job in a `PUT /api/internal/runners` report.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobProgress {
    /// Task id.
    pub id: i64,
    /// Output lines buffered since the previous report.
    #[serde(default)]
    pub log_records: Vec<LogRecord>,
    /// Agent-side status.
    pub status: TaskStatus,
    /// Commit recorded after checkout, sent once known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit: Option<CommitInfo>,
}

/// Body of `PUT /api/internal/runners`.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunnerProgress {
    /// Progress of every job the agent holds.
    #[serde(default)]
    pub jobs: Vec<JobProgress>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn runner_state_round_trip() {
        let state = RunnerState {
            new_jobs: vec![],
            current_jobs: vec![JobState {
                id: 4,
                status: TaskStatus::Stopping,
            }],
            access_keys: HashMap::new(),
            clear_cache: true,
            cache_clean_project_id: Some(2),
        };

        let json = serde_json::to_string(&state).unwrap();
        let parsed: RunnerState = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.current_jobs[0].status, TaskStatus::Stopping);
        assert!(parsed.clear_cache);
        assert_eq!(parsed.cache_clean_project_id, Some(2));
    }

    #[test]
    fn registration_defaults() {
        let registration: RunnerRegistration =
            serde_json::from_str(r#"{"registration_token": "t0k3n"}"#).unwrap();
        assert_eq!(registration.max_parallel_tasks, 0);
        assert!(registration.public_key.is_none());
    }
}
