// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inventory entity.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// How a template addresses its target hosts (or terraform workspace).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum InventoryKind {
    /// Inline INI inventory, written to a per-task file.
    #[default]
    Static,
    /// Inline YAML inventory, written to a per-task file.
    StaticYaml,
    /// File inside the repository or an absolute path.
    File,
    /// Terraform workspace name.
    TerraformWorkspace,
    /// OpenTofu workspace name.
    TofuWorkspace,
}

impl InventoryKind {
    /// Stable string form.
    pub fn as_str(self) -> &'static str {
        match self {
            InventoryKind::Static => "static",
            InventoryKind::StaticYaml => "static_yaml",
            InventoryKind::File => "file",
            InventoryKind::TerraformWorkspace => "terraform_workspace",
            InventoryKind::TofuWorkspace => "tofu_workspace",
        }
    }
}

impl fmt::Display for InventoryKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InventoryKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "static" => Ok(InventoryKind::Static),
            "static_yaml" => Ok(InventoryKind::StaticYaml),
            "file" => Ok(InventoryKind::File),
            "terraform_workspace" => Ok(InventoryKind::TerraformWorkspace),
            "tofu_workspace" => Ok(InventoryKind::TofuWorkspace),
            other => Err(Error::Validation(format!("unknown inventory type: {other}"))),
        }
    }
}

/// Target host definition bound to a template.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Inventory {
    /// Unique identifier.
    pub id: i64,
    /// Owning project.
    pub project_id: i64,
    /// Display name.
    pub name: String,
    /// Inventory kind.
    #[serde(rename = "type", default)]
    pub kind: InventoryKind,
    /// Payload: inline content, file path, or workspace name by kind.
    #[serde(default)]
    pub inventory: String,
    /// Repository a file inventory lives in.
    pub repository_id: Option<i64>,
    /// Key used to reach the target hosts.
    pub ssh_key_id: Option<i64>,
    /// Key used for privilege escalation.
    pub become_key_id: Option<i64>,
    /// Route tasks using this inventory to agents carrying this tag.
    pub runner_tag: Option<String>,
}

impl Inventory {
    /// Terraform workspace name carried by workspace-kind inventories;
    /// `default` otherwise.
    pub fn workspace(&self) -> &str {
        if self.inventory.is_empty() {
            "default"
        } else {
            &self.inventory
        }
    }
}
