// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! History event entity.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// History record written on task lifecycle milestones.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Unique identifier.
    pub id: i64,
    /// Project context.
    pub project_id: Option<i64>,
    /// User context, when the action was user-initiated.
    pub user_id: Option<i64>,
    /// Entity family the event is about (`task`).
    pub object_type: String,
    /// Entity identifier.
    pub object_id: Option<i64>,
    /// Human-readable description.
    pub description: String,
    /// Creation time.
    pub created: DateTime<Utc>,
}

impl Event {
    /// Event about a task.
    pub fn for_task(
        project_id: i64,
        user_id: Option<i64>,
        task_id: i64,
        description: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            project_id: Some(project_id),
            user_id,
            object_type: "task".to_string(),
            object_id: Some(task_id),
            description: description.into(),
            created: Utc::now(),
        }
    }
}
