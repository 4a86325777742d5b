// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Registered remote runner (agent) entity.

use serde::{Deserialize, Serialize};

/// Server-side record of a registered worker agent.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Runner {
    /// Unique identifier.
    pub id: i64,
    /// Per-runner authentication token presented in `X-Runner-Token`.
    pub token: String,
    /// Tag restricting which jobs this runner receives.
    pub tag: Option<String>,
    /// Maximum jobs the runner executes concurrently. 0 = unlimited.
    #[serde(default)]
    pub max_parallel_tasks: i64,
    /// Webhook the server may call to wake the runner.
    #[serde(default)]
    pub webhook: String,
    /// PEM-encoded RSA public key; when set, poll responses are encrypted.
    pub public_key: Option<String>,
    /// Whether the runner may poll for work.
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}
