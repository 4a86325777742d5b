// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Project entity.

use serde::{Deserialize, Serialize};

/// Top-level tenant. Owns templates, inventories, repositories,
/// environments, access keys and integrations with cascading delete.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Project {
    /// Unique identifier.
    pub id: i64,
    /// Display name.
    pub name: String,
    /// Maximum concurrently active tasks in this project. 0 = unlimited.
    #[serde(default)]
    pub max_parallel_tasks: i64,
    /// Whether notifiable task statuses raise alerts for this project.
    #[serde(default)]
    pub alert: bool,
}
