// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Entity definitions.
//!
//! Every entity is a plain serde struct; JSON blobs (task params, extra
//! vars) stay as `serde_json` maps until a typed view is needed, at which
//! point [`Template::fill_params`] / [`Task::fill_params`] deserialize them
//! into the app-specific parameter structs.

mod access_key;
mod environment;
mod event;
mod integration;
mod inventory;
mod project;
mod repository;
mod runner;
mod task;
mod template;

pub use access_key::{AccessKey, AccessKeyKind, AccessKeyRole, LoginPassword, SshKeyData};
pub use environment::{Environment, EnvironmentSecret, EnvironmentSecretKind};
pub use event::Event;
pub use integration::{
    AliasLevel, BodyDataType, Integration, IntegrationAlias, IntegrationAuthMethod,
    IntegrationExtractValue, IntegrationMatcher, MatchMethod, MatchType, ValueSource, VariableKind,
};
pub use inventory::{Inventory, InventoryKind};
pub use project::Project;
pub use repository::{Repository, RepositoryKind};
pub use runner::Runner;
pub use task::{
    AnsibleTaskParams, DefaultTaskParams, Task, TaskOutput, TaskStage, TaskStageKind,
    TaskStageResult, TerraformTaskParams,
};
pub use template::{
    AnsibleTemplateParams, Template, TemplateApp, TemplateType, TemplateVault, TemplateVaultKind,
    TerraformTemplateParams,
};

/// JSON object used for loosely-typed parameter maps.
pub type JsonMap = serde_json::Map<String, serde_json::Value>;
