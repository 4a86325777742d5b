// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Access key entity.
//!
//! Secrets are stored encrypted and resolved through the secret-storage
//! abstraction before the key reaches this struct; by the time the execution
//! engine sees an `AccessKey` its payload is plaintext.

use serde::{Deserialize, Serialize};

/// Kind of credential a key holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum AccessKeyKind {
    /// No credential.
    #[default]
    None,
    /// SSH private key, loaded into an agent at run time.
    Ssh,
    /// Login and password pair.
    LoginPassword,
}

/// Role a key plays at the point of use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessKeyRole {
    /// Fetching a git repository.
    Git,
    /// Connecting to target hosts.
    AnsibleUser,
    /// Privilege escalation on target hosts.
    AnsibleBecomeUser,
    /// Unlocking an ansible vault.
    AnsiblePasswordVault,
}

/// SSH key payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SshKeyData {
    /// Login presented to the target host.
    pub login: Option<String>,
    /// Key passphrase.
    pub passphrase: Option<String>,
    /// PEM-encoded private key.
    pub private_key: String,
}

/// Login/password payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct LoginPassword {
    /// Login name.
    #[serde(default)]
    pub login: String,
    /// Password.
    #[serde(default)]
    pub password: String,
}

/// Credential record resolved through secret storage.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AccessKey {
    /// Unique identifier.
    pub id: i64,
    /// Owning project; global keys have none.
    pub project_id: Option<i64>,
    /// Display name.
    pub name: String,
    /// Credential kind.
    #[serde(rename = "type", default)]
    pub kind: AccessKeyKind,
    /// SSH payload (ssh kind).
    pub ssh: Option<SshKeyData>,
    /// Login/password payload (login_password kind).
    pub login_password: Option<LoginPassword>,
}
