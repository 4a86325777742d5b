// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Inventory materialization.
//!
//! Static inventories are written into the per-task artefact directory;
//! file inventories resolve to a path inside the cloned repository (when
//! bound to one) or to the configured path as-is. Workspace-kind
//! inventories have no file: they name the terraform workspace.

use std::path::{Path, PathBuf};

use conveyor_core::model::{Inventory, InventoryKind};

use crate::error::{Error, Result};

/// Produce the inventory path handed to `ansible-playbook -i`.
///
/// Returns `None` for workspace-kind inventories, which have no file form.
pub fn install_inventory(
    inventory: &Inventory,
    task_dir: &Path,
    repo_dir: &Path,
) -> Result<Option<PathBuf>> {
    match inventory.kind {
        InventoryKind::Static | InventoryKind::StaticYaml => {
            let file_name = match inventory.kind {
                InventoryKind::StaticYaml => "inventory.yml",
                _ => "inventory",
            };
            let path = task_dir.join(file_name);
            std::fs::write(&path, &inventory.inventory)?;
            Ok(Some(path))
        }

        InventoryKind::File => {
            if inventory.inventory.is_empty() {
                return Err(Error::InvalidInventory(
                    "file inventory has no path".into(),
                ));
            }
            if inventory.repository_id.is_some() {
                Ok(Some(repo_dir.join(&inventory.inventory)))
            } else {
                Ok(Some(PathBuf::from(&inventory.inventory)))
            }
        }

        InventoryKind::TerraformWorkspace | InventoryKind::TofuWorkspace => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn static_inventory_is_written_to_task_dir() {
        let tmp = tempfile::tempdir().unwrap();
        let inventory = Inventory {
            kind: InventoryKind::Static,
            inventory: "[web]\nweb1 ansible_host=10.0.0.5\n".into(),
            ..Default::default()
        };

        let path = install_inventory(&inventory, tmp.path(), Path::new("/repo"))
            .unwrap()
            .unwrap();
        assert_eq!(path, tmp.path().join("inventory"));
        assert!(std::fs::read_to_string(&path).unwrap().contains("web1"));
    }

    #[test]
    fn file_inventory_resolves_inside_repo_when_bound() {
        let inventory = Inventory {
            kind: InventoryKind::File,
            inventory: "inventories/prod.ini".into(),
            repository_id: Some(4),
            ..Default::default()
        };

        let path = install_inventory(&inventory, Path::new("/task"), Path::new("/repo"))
            .unwrap()
            .unwrap();
        assert_eq!(path, PathBuf::from("/repo/inventories/prod.ini"));
    }

    #[test]
    fn file_inventory_uses_absolute_path_when_unbound() {
        let inventory = Inventory {
            kind: InventoryKind::File,
            inventory: "/etc/ansible/hosts".into(),
            repository_id: None,
            ..Default::default()
        };

        let path = install_inventory(&inventory, Path::new("/task"), Path::new("/repo"))
            .unwrap()
            .unwrap();
        assert_eq!(path, PathBuf::from("/etc/ansible/hosts"));
    }

    #[test]
    fn workspace_inventory_has_no_file() {
        let inventory = Inventory {
            kind: InventoryKind::TerraformWorkspace,
            inventory: "staging".into(),
            ..Default::default()
        };
        assert!(install_inventory(&inventory, Path::new("/task"), Path::new("/repo"))
            .unwrap()
            .is_none());
        assert_eq!(inventory.workspace(), "staging");
    }
}
