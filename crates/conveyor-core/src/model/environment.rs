// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Environment entity.

use serde::{Deserialize, Serialize};

/// How an environment secret is injected at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum EnvironmentSecretKind {
    /// Injected into the child process environment.
    #[default]
    Env,
    /// Passed as a tool variable (`--extra-vars k=v` / `-var k=v` / `k=v`).
    Var,
}

/// Secret attached to an environment, resolved at run time.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EnvironmentSecret {
    /// Unique identifier.
    pub id: i64,
    /// Injection kind.
    #[serde(rename = "type", default)]
    pub kind: EnvironmentSecretKind,
    /// Variable name.
    pub name: String,
    /// Resolved secret value.
    pub secret: String,
}

/// Extra-vars and process environment bound to a template.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Environment {
    /// Unique identifier.
    pub id: i64,
    /// Owning project.
    pub project_id: i64,
    /// Display name.
    pub name: String,
    /// JSON object merged into tool input as extra vars.
    #[serde(default)]
    pub json: String,
    /// JSON object of process environment variables.
    pub env: Option<String>,
    /// Typed secrets injected at run time.
    #[serde(default)]
    pub secrets: Vec<EnvironmentSecret>,
}
