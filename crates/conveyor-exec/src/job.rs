// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Local job: drives one task through preparation, execution and teardown.
//!
//! The job owns the task's workspace artefacts (clone, inventory file,
//! installed keys) and composes the tool invocation for its app. Teardown
//! runs on every exit path; the per-task directory is removed even when
//! preparation fails half-way.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use conveyor_core::model::{
    AccessKey, AccessKeyKind, AccessKeyRole, AnsibleTaskParams, AnsibleTemplateParams,
    Environment, EnvironmentSecretKind, Inventory, JsonMap, Repository, RepositoryKind, Task,
    Template, TemplateApp, TemplateType, TemplateVaultKind, TerraformTaskParams,
};
use conveyor_core::TaskStatus;

use crate::apps::{create_app, AppRunArgs};
use crate::error::{Error, Result};
use crate::git::GitRepo;
use crate::inventory::install_inventory;
use crate::keys::{install_key, KeyInstallation};
use crate::logger::TaskLogger;
use crate::process::{kill_process, new_process_handle, ProcessHandle};
use crate::workdir::{TaskDir, WorkPaths};

/// Everything a job needs, resolved ahead of execution. The server's
/// populate step fills this from the store; agents fill it from the job
/// descriptor and the poll response's access key map.
pub struct JobResources {
    /// The task row.
    pub task: Task,
    /// Its template, vaults included.
    pub template: Template,
    /// Template inventory, when one is bound.
    pub inventory: Option<Inventory>,
    /// Repository a file inventory lives in, when bound to one.
    pub inventory_repository: Option<Repository>,
    /// Source repository.
    pub repository: Repository,
    /// Bound environment, when one is set.
    pub environment: Option<Environment>,
    /// Secret extra vars (JSON object), never persisted.
    pub secret: String,
    /// Key fetching the repository.
    pub repository_key: Option<AccessKey>,
    /// Inventory host access key.
    pub inventory_ssh_key: Option<AccessKey>,
    /// Inventory privilege escalation key.
    pub inventory_become_key: Option<AccessKey>,
    /// Vault keys by access key id.
    pub vault_keys: HashMap<i64, AccessKey>,
}

/// One locally executed task.
pub struct LocalJob {
    res: JobResources,
    logger: Arc<dyn TaskLogger>,
    paths: WorkPaths,
    web_host: String,

    process: ProcessHandle,
    task_dir: Mutex<Option<TaskDir>>,
    inventory_file: Mutex<Option<PathBuf>>,
    ssh_key_installation: Mutex<Option<KeyInstallation>>,
    become_key_installation: Mutex<Option<KeyInstallation>>,
    repo_key_installation: Mutex<Option<KeyInstallation>>,
    vault_installations: Mutex<HashMap<String, KeyInstallation>>,
}

impl LocalJob {
    /// Job over resolved resources.
    pub fn new(
        res: JobResources,
        logger: Arc<dyn TaskLogger>,
        paths: WorkPaths,
        web_host: impl Into<String>,
    ) -> Self {
        Self {
            res,
            logger,
            paths,
            web_host: web_host.into(),
            process: new_process_handle(),
            task_dir: Mutex::new(None),
            inventory_file: Mutex::new(None),
            ssh_key_installation: Mutex::new(None),
            become_key_installation: Mutex::new(None),
            repo_key_installation: Mutex::new(None),
            vault_installations: Mutex::new(HashMap::new()),
        }
    }

    /// The task this job runs.
    pub fn task(&self) -> &Task {
        &self.res.task
    }

    /// Kill the currently running child, if any.
    pub fn kill(&self) {
        kill_process(&self.process);
    }

    /// Drive the task to completion. Workspace artefacts are destroyed on
    /// every exit path.
    pub async fn run(
        &self,
        username: &str,
        incoming_version: Option<&str>,
        alias: &str,
    ) -> Result<()> {
        let result = self.run_inner(username, incoming_version, alias).await;
        self.teardown().await;
        result
    }

    async fn run_inner(
        &self,
        username: &str,
        incoming_version: Option<&str>,
        alias: &str,
    ) -> Result<()> {
        // required for local mode; the remote agent path sets it before run
        self.logger.set_status(TaskStatus::Running);

        let mut environment = self.environment_env()?;

        if self.res.template.app.is_terraform() && !alias.is_empty() && !self.web_host.is_empty() {
            environment.push((
                "TF_HTTP_ADDRESS".to_string(),
                format!("{}/api/terraform/{}", self.web_host, alias),
            ));
        }

        self.prepare_run(&environment).await?;

        let (cli_args, inputs) = match self.res.template.app {
            TemplateApp::Ansible => self.playbook_args(username, incoming_version)?,
            app if app.is_terraform() => {
                (self.terraform_args(username, incoming_version)?, HashMap::new())
            }
            _ => (self.shell_args(username, incoming_version)?, HashMap::new()),
        };

        if let Some(installation) = &*self.ssh_key_installation.lock().unwrap() {
            if let Some(agent) = &installation.ssh_agent {
                environment.push((
                    "SSH_AUTH_SOCK".to_string(),
                    agent.socket_file.display().to_string(),
                ));
            }
        }

        if self.res.template.kind != TemplateType::Task {
            environment.push((
                "SEMAPHORE_TASK_TYPE".to_string(),
                self.res.template.kind.to_string(),
            ));
            if let Some(version) = incoming_version {
                environment.push((
                    "SEMAPHORE_TASK_INCOMING_VERSION".to_string(),
                    version.to_string(),
                ));
            }
            if self.res.template.kind == TemplateType::Build {
                if let Some(version) = &self.res.task.version {
                    environment.push(("SEMAPHORE_TASK_TARGET_VERSION".to_string(), version.clone()));
                }
            }
        }

        let app = create_app(
            &self.res.template,
            self.res.inventory.as_ref(),
            &self.res.task,
            self.repo_dir(),
            self.paths.project_dir(self.res.task.project_id),
            self.logger.clone(),
            self.process.clone(),
        )?;

        app.run(AppRunArgs {
            cli_args,
            environment,
            inputs,
        })
        .await
    }

    fn repo_dir(&self) -> PathBuf {
        match self.res.repository.kind() {
            RepositoryKind::Local => PathBuf::from(self.res.repository.local_path()),
            RepositoryKind::Remote => self.paths.repository_dir(
                self.res.task.project_id,
                self.res.repository.id,
                self.res.template.id,
            ),
        }
    }

    async fn prepare_run(&self, environment: &[(String, String)]) -> Result<()> {
        self.logger
            .log(&format!("Preparing: {}", self.res.task.id));

        self.paths.ensure_tmp_dir()?;
        std::fs::create_dir_all(self.paths.project_dir(self.res.task.project_id))?;

        let task_dir = self
            .paths
            .acquire_task_dir(self.res.task.project_id, self.res.task.id)?;
        let task_dir_path = task_dir.path().to_path_buf();
        *self.task_dir.lock().unwrap() = Some(task_dir);

        // effective branch: task override > template override > repository default
        let mut repository = self.res.repository.clone();
        if let Some(branch) = &self.res.template.git_branch {
            if !branch.is_empty() {
                repository.git_branch = branch.clone();
            }
        }
        if let Some(branch) = &self.res.task.git_branch {
            if !branch.is_empty() {
                repository.git_branch = branch.clone();
            }
        }

        if repository.kind() == RepositoryKind::Local {
            if !std::path::Path::new(repository.local_path()).exists() {
                let message = format!(
                    "Failed to find local repository at {}",
                    repository.local_path()
                );
                self.logger.log(&message);
                return Err(Error::Other(message));
            }
        } else {
            let mut ssh_command = None;
            if let Some(key) = &self.res.repository_key {
                if key.kind == AccessKeyKind::Ssh {
                    let installation =
                        install_key(key, AccessKeyRole::Git, &task_dir_path, &self.logger).await?;
                    ssh_command = installation.ssh_command();
                    *self.repo_key_installation.lock().unwrap() = Some(installation);
                }
            }

            let repo = GitRepo {
                repository,
                clone_dir: self.repo_dir(),
                ssh_command,
                logger: self.logger.clone(),
            };

            if let Err(e) = repo.update(&self.process).await {
                self.logger.log(&format!("Failed updating repository: {e}"));
                return Err(e);
            }

            if let Err(e) = self.checkout(&repo).await {
                self.logger
                    .log(&format!("Failed to checkout repository: {e}"));
                return Err(e);
            }
        }

        if let Err(e) = self.install_inventory_artifacts(&task_dir_path).await {
            self.logger
                .log(&format!("Failed to install inventory: {e}"));
            return Err(e);
        }

        let app = create_app(
            &self.res.template,
            self.res.inventory.as_ref(),
            &self.res.task,
            self.repo_dir(),
            self.paths.project_dir(self.res.task.project_id),
            self.logger.clone(),
            self.process.clone(),
        )?;

        let mut requirement_env: Vec<(String, String)> = environment.to_vec();
        if let Some(installation) = &*self.repo_key_installation.lock().unwrap() {
            if let Some(ssh_command) = installation.ssh_command() {
                requirement_env.push(("GIT_SSH_COMMAND".to_string(), ssh_command));
            }
        }

        if let Err(e) = app.install_requirements(&requirement_env).await {
            self.logger
                .log(&format!("Failed to install requirements: {e}"));
            return Err(e);
        }

        if let Err(e) = self.install_vault_key_files(&task_dir_path).await {
            self.logger
                .log(&format!("Failed to install vault password files: {e}"));
            return Err(e);
        }

        Ok(())
    }

    async fn checkout(&self, repo: &GitRepo) -> Result<()> {
        if let Some(commit_hash) = &self.res.task.commit_hash {
            return repo.checkout(commit_hash).await;
        }

        // record what the task actually runs against, before any artefact
        // is produced from it
        let hash = repo.last_commit_hash().await?;
        let message = repo.last_commit_message().await.unwrap_or_default();
        self.logger.set_commit(&hash, &message);
        Ok(())
    }

    async fn install_inventory_artifacts(&self, task_dir: &std::path::Path) -> Result<()> {
        let Some(inventory) = &self.res.inventory else {
            return Ok(());
        };

        let repo_dir = self.repo_dir();
        let path = install_inventory(inventory, task_dir, &repo_dir)?;
        *self.inventory_file.lock().unwrap() = path;

        if let Some(key) = &self.res.inventory_ssh_key {
            let role = AccessKeyRole::AnsibleUser;
            let installation = install_key(key, role, task_dir, &self.logger).await?;
            *self.ssh_key_installation.lock().unwrap() = Some(installation);
        }

        if let Some(key) = &self.res.inventory_become_key {
            let role = AccessKeyRole::AnsibleBecomeUser;
            let installation = install_key(key, role, task_dir, &self.logger).await?;
            *self.become_key_installation.lock().unwrap() = Some(installation);
        }

        Ok(())
    }

    async fn install_vault_key_files(&self, task_dir: &std::path::Path) -> Result<()> {
        for vault in &self.res.template.vaults {
            let name = vault.vault_name().to_string();
            let mut installation = KeyInstallation::default();

            match vault.kind {
                TemplateVaultKind::Password => {
                    let Some(key_id) = vault.vault_key_id else {
                        continue;
                    };
                    let key = self.res.vault_keys.get(&key_id).ok_or_else(|| {
                        Error::Other(format!("vault key {key_id} not resolved"))
                    })?;
                    installation = install_key(
                        key,
                        AccessKeyRole::AnsiblePasswordVault,
                        task_dir,
                        &self.logger,
                    )
                    .await?;
                }
                TemplateVaultKind::Script => {
                    installation.script = vault.script.clone();
                }
            }

            self.vault_installations
                .lock()
                .unwrap()
                .insert(name, installation);
        }

        Ok(())
    }

    async fn teardown(&self) {
        for slot in [
            &self.ssh_key_installation,
            &self.become_key_installation,
            &self.repo_key_installation,
        ] {
            let taken = slot.lock().unwrap().take();
            if let Some(mut installation) = taken {
                installation.destroy().await;
            }
        }

        let vaults: Vec<KeyInstallation> = {
            let mut map = self.vault_installations.lock().unwrap();
            map.drain().map(|(_, v)| v).collect()
        };
        for mut installation in vaults {
            installation.destroy().await;
        }

        *self.inventory_file.lock().unwrap() = None;
        // dropping the guard removes the per-task directory
        *self.task_dir.lock().unwrap() = None;
    }

    // ---------------------------------------------------------------------
    // Variable materialization
    // ---------------------------------------------------------------------

    fn environment_env(&self) -> Result<Vec<(String, String)>> {
        let mut env = Vec::new();

        if let Some(environment) = &self.res.environment {
            if let Some(raw) = &environment.env {
                if !raw.is_empty() {
                    let vars: HashMap<String, String> = serde_json::from_str(raw)?;
                    env.extend(vars);
                }
            }

            for secret in &environment.secrets {
                if secret.kind == EnvironmentSecretKind::Env {
                    env.push((secret.name.clone(), secret.secret.clone()));
                }
            }
        }

        Ok(env)
    }

    fn base_extra_vars(&self) -> Result<JsonMap> {
        let mut vars = JsonMap::new();

        if let Some(environment) = &self.res.environment {
            if !environment.json.is_empty() {
                let parsed: JsonMap = serde_json::from_str(&environment.json)?;
                vars.extend(parsed);
            }
        }

        if !self.res.task.environment.is_empty() {
            let overrides: JsonMap = serde_json::from_str(&self.res.task.environment)?;
            vars.extend(overrides);
        }

        Ok(vars)
    }

    fn task_details(&self, username: &str, incoming_version: Option<&str>) -> JsonMap {
        let mut details = JsonMap::new();
        details.insert("id".into(), self.res.task.id.into());
        if !self.res.task.message.is_empty() {
            details.insert("message".into(), self.res.task.message.clone().into());
        }
        details.insert("username".into(), username.into());
        if let Some(url) = self.res.task.url(&self.web_host) {
            details.insert("url".into(), url.into());
        }

        if self.res.template.kind != TemplateType::Task {
            details.insert("type".into(), self.res.template.kind.to_string().into());
            if let Some(version) = incoming_version {
                details.insert("incoming_version".into(), version.into());
            }
            if self.res.template.kind == TemplateType::Build {
                if let Some(version) = &self.res.task.version {
                    details.insert("target_version".into(), version.clone().into());
                }
            }
        }

        details
    }

    /// Extra vars without secrets, used for `k=v` style argument forms.
    fn extra_vars(&self, username: &str, incoming_version: Option<&str>) -> Result<JsonMap> {
        let mut vars = self.base_extra_vars()?;
        let mut wrapper = JsonMap::new();
        wrapper.insert(
            "task_details".into(),
            serde_json::Value::Object(self.task_details(username, incoming_version)),
        );
        vars.insert("semaphore_vars".into(), serde_json::Value::Object(wrapper));
        Ok(vars)
    }

    /// Full extra-vars JSON: environment, task override, secret vars
    /// (overriding on collision), and the task details object.
    fn extra_vars_json(&self, username: &str, incoming_version: Option<&str>) -> Result<String> {
        let mut vars = self.base_extra_vars()?;

        if !self.res.secret.is_empty() {
            let secrets: JsonMap = serde_json::from_str(&self.res.secret)?;
            vars.extend(secrets);
        }

        let mut wrapper = JsonMap::new();
        wrapper.insert(
            "task_details".into(),
            serde_json::Value::Object(self.task_details(username, incoming_version)),
        );
        vars.insert("semaphore_vars".into(), serde_json::Value::Object(wrapper));

        Ok(serde_json::to_string(&serde_json::Value::Object(vars))?)
    }

    fn cli_args(&self) -> Result<(Vec<String>, Vec<String>)> {
        let template_args = self.res.template.parse_arguments()?;

        let mut task_args = Vec::new();
        if self.res.template.allow_override_args_in_task {
            if let Some(raw) = &self.res.task.arguments {
                task_args = serde_json::from_str(raw).map_err(|_| {
                    Error::Other(
                        "invalid format of the task extra arguments, must be valid JSON".into(),
                    )
                })?;
            }
        }

        Ok((template_args, task_args))
    }

    // ---------------------------------------------------------------------
    // Per-app argument builders
    // ---------------------------------------------------------------------

    fn playbook_args(
        &self,
        username: &str,
        incoming_version: Option<&str>,
    ) -> Result<(Vec<String>, HashMap<String, String>)> {
        let mut inputs = HashMap::new();

        let playbook = if self.res.task.playbook.is_empty() {
            self.res.template.playbook.clone()
        } else {
            self.res.task.playbook.clone()
        };

        let inventory_file = self
            .inventory_file
            .lock()
            .unwrap()
            .clone()
            .ok_or_else(|| Error::InvalidInventory("ansible requires an inventory".into()))?;

        let mut args = vec!["-i".to_string(), inventory_file.display().to_string()];

        if let Some(key) = &self.res.inventory_ssh_key {
            let installation = self.ssh_key_installation.lock().unwrap();
            let installation = installation
                .as_ref()
                .ok_or_else(|| Error::KeyUnsuitable("ansible_user"))?;

            match key.kind {
                AccessKeyKind::Ssh => {
                    if let Some(login) = &installation.login {
                        args.push("--user".to_string());
                        args.push(login.clone());
                    }
                }
                AccessKeyKind::LoginPassword => {
                    if let Some(login) = &installation.login {
                        args.push("--user".to_string());
                        args.push(login.clone());
                    }
                    if let Some(password) = &installation.password {
                        args.push("--ask-pass".to_string());
                        inputs.insert("SSH password:".to_string(), password.clone());
                    }
                }
                AccessKeyKind::None => {}
            }
        }

        if let Some(key) = &self.res.inventory_become_key {
            let installation = self.become_key_installation.lock().unwrap();
            let installation = installation
                .as_ref()
                .ok_or_else(|| Error::KeyUnsuitable("ansible_become_user"))?;

            match key.kind {
                AccessKeyKind::LoginPassword => {
                    if let Some(login) = &installation.login {
                        args.push("--become-user".to_string());
                        args.push(login.clone());
                    }
                    if let Some(password) = &installation.password {
                        args.push("--ask-become-pass".to_string());
                        inputs.insert("BECOME password".to_string(), password.clone());
                    }
                }
                AccessKeyKind::None => {}
                AccessKeyKind::Ssh => return Err(Error::KeyUnsuitable("ansible_become_user")),
            }
        }

        let template_params: AnsibleTemplateParams = self.res.template.fill_params()?;
        let task_params: AnsibleTaskParams = self.res.task.fill_params()?;

        if template_params.allow_debug && task_params.debug {
            args.push("-vvvv".to_string());
        }
        if task_params.diff {
            args.push("--diff".to_string());
        }
        if task_params.dry_run {
            args.push("--check".to_string());
        }

        for (name, installation) in self.vault_installations.lock().unwrap().iter() {
            if let Some(password) = &installation.password {
                args.push(format!("--vault-id={name}@prompt"));
                inputs.insert(format!("Vault password ({name}):"), password.clone());
            }
            if let Some(script) = &installation.script {
                args.push(format!("--vault-id={name}@{script}"));
            }
        }

        args.push("--extra-vars".to_string());
        args.push(self.extra_vars_json(username, incoming_version)?);

        if let Some(environment) = &self.res.environment {
            for secret in &environment.secrets {
                if secret.kind == EnvironmentSecretKind::Var {
                    args.push("--extra-vars".to_string());
                    args.push(format!("{}={}", secret.name, secret.secret));
                }
            }
        }

        let (template_args, task_args) = self.cli_args()?;
        args.extend(template_args);
        args.extend(task_args);

        let mut limit = template_params.limit.join(",");
        if !self.res.task.hosts_limit.is_empty() && template_params.allow_override_limit {
            self.logger.log(&format!("--limit={}", self.res.task.hosts_limit));
            limit = self.res.task.hosts_limit.clone();
        }
        if !limit.is_empty() {
            args.push(format!("--limit={limit}"));
        }

        if !template_params.tags.is_empty() {
            args.push(format!("--tags={}", template_params.tags.join(",")));
        }
        if !template_params.skip_tags.is_empty() {
            args.push(format!("--skip-tags={}", template_params.skip_tags.join(",")));
        }

        args.push(playbook);

        Ok((args, inputs))
    }

    fn terraform_args(
        &self,
        username: &str,
        incoming_version: Option<&str>,
    ) -> Result<Vec<String>> {
        let mut args = Vec::new();

        let task_params: TerraformTaskParams = self.res.task.fill_params()?;
        if task_params.destroy {
            args.push("-destroy".to_string());
        }

        let extra_vars = self.extra_vars(username, incoming_version)?;
        for (name, value) in &extra_vars {
            if name == "semaphore_vars" {
                continue;
            }
            args.push("-var".to_string());
            args.push(format!("{}={}", name, scalar_to_string(value)));
        }

        let (template_args, task_args) = self.cli_args()?;
        args.extend(template_args);
        args.extend(task_args);

        if let Some(environment) = &self.res.environment {
            for secret in &environment.secrets {
                if secret.kind == EnvironmentSecretKind::Var {
                    args.push("-var".to_string());
                    args.push(format!("{}={}", secret.name, secret.secret));
                }
            }
        }

        Ok(args)
    }

    fn shell_args(&self, username: &str, incoming_version: Option<&str>) -> Result<Vec<String>> {
        let mut args = vec![self.res.template.playbook.clone()];

        let extra_vars = self.extra_vars(username, incoming_version)?;
        for (name, value) in &extra_vars {
            if name == "semaphore_vars" {
                continue;
            }
            args.push(format!("{}={}", name, scalar_to_string(value)));
        }

        if let Some(environment) = &self.res.environment {
            for secret in &environment.secrets {
                if secret.kind == EnvironmentSecretKind::Var {
                    args.push(format!("{}={}", secret.name, secret.secret));
                }
            }
        }

        let (template_args, task_args) = self.cli_args()?;
        args.extend(template_args);
        args.extend(task_args);

        Ok(args)
    }
}

fn scalar_to_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logger::BufferedLogger;
    use conveyor_core::model::{EnvironmentSecret, LoginPassword};

    fn job(res: JobResources) -> LocalJob {
        LocalJob::new(
            res,
            Arc::new(BufferedLogger::new()),
            WorkPaths::new("/tmp/conveyor-test"),
            "https://conveyor.example.com",
        )
    }

    fn base_resources(app: TemplateApp) -> JobResources {
        let mut task = Task::new(1, 1);
        task.id = 10;
        JobResources {
            task,
            template: Template {
                id: 1,
                project_id: 1,
                name: "tpl".into(),
                app,
                repository_id: 1,
                playbook: "site.yml".into(),
                ..Default::default()
            },
            inventory: None,
            inventory_repository: None,
            repository: Repository {
                id: 1,
                project_id: 1,
                git_url: "https://github.com/acme/infra.git".into(),
                git_branch: "main".into(),
                ..Default::default()
            },
            environment: None,
            secret: String::new(),
            repository_key: None,
            inventory_ssh_key: None,
            inventory_become_key: None,
            vault_keys: HashMap::new(),
        }
    }

    #[test]
    fn extra_vars_json_merges_secret_over_environment() {
        let mut res = base_resources(TemplateApp::Ansible);
        res.environment = Some(Environment {
            id: 1,
            project_id: 1,
            json: r#"{"region": "eu-west-1", "replicas": 2}"#.into(),
            ..Default::default()
        });
        res.secret = r#"{"replicas": 5}"#.into();

        let job = job(res);
        let json = job.extra_vars_json("alice", None).unwrap();
        let parsed: serde_json::Value = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed["region"], "eu-west-1");
        assert_eq!(parsed["replicas"], 5);
        assert_eq!(parsed["semaphore_vars"]["task_details"]["id"], 10);
        assert_eq!(
            parsed["semaphore_vars"]["task_details"]["username"],
            "alice"
        );
        assert_eq!(
            parsed["semaphore_vars"]["task_details"]["url"],
            "https://conveyor.example.com/project/1/history?t=10"
        );
    }

    #[test]
    fn task_details_carries_build_versions() {
        let mut res = base_resources(TemplateApp::Bash);
        res.template.kind = TemplateType::Build;
        res.task.version = Some("v5-rc".into());

        let job = job(res);
        let details = job.task_details("ci", Some("v4-rc"));
        assert_eq!(details["type"], "build");
        assert_eq!(details["incoming_version"], "v4-rc");
        assert_eq!(details["target_version"], "v5-rc");
    }

    #[test]
    fn terraform_args_carry_vars_and_destroy() {
        let mut res = base_resources(TemplateApp::Terraform);
        res.task.params =
            serde_json::from_str(r#"{"destroy": true, "auto_approve": false}"#).unwrap();
        res.environment = Some(Environment {
            id: 1,
            project_id: 1,
            json: r#"{"region": "eu-central-1"}"#.into(),
            secrets: vec![EnvironmentSecret {
                id: 1,
                kind: EnvironmentSecretKind::Var,
                name: "db_password".into(),
                secret: "s3cr3t".into(),
            }],
            ..Default::default()
        });

        let job = job(res);
        let args = job.terraform_args("bob", None).unwrap();

        assert_eq!(args[0], "-destroy");
        assert!(args.windows(2).any(|w| w[0] == "-var" && w[1] == "region=eu-central-1"));
        assert!(args
            .windows(2)
            .any(|w| w[0] == "-var" && w[1] == "db_password=s3cr3t"));
        assert!(!args.iter().any(|a| a.contains("semaphore_vars")));
    }

    #[test]
    fn shell_args_start_with_script() {
        let mut res = base_resources(TemplateApp::Bash);
        res.template.playbook = "deploy.sh".into();
        res.template.arguments = Some(r#"["--fast"]"#.into());
        res.task.arguments = Some(r#"["--ignored"]"#.into());

        let job = job(res);
        let args = job.shell_args("bob", None).unwrap();
        assert_eq!(args[0], "deploy.sh");
        assert!(args.contains(&"--fast".to_string()));
        // task args are dropped unless the template allows overrides
        assert!(!args.contains(&"--ignored".to_string()));
    }

    #[test]
    fn task_args_require_template_permission() {
        let mut res = base_resources(TemplateApp::Bash);
        res.template.allow_override_args_in_task = true;
        res.template.playbook = "run.sh".into();
        res.task.arguments = Some(r#"["--now"]"#.into());

        let job = job(res);
        let args = job.shell_args("bob", None).unwrap();
        assert!(args.contains(&"--now".to_string()));
    }

    #[tokio::test]
    async fn playbook_args_follow_composition_order() {
        let mut res = base_resources(TemplateApp::Ansible);
        res.inventory = Some(Inventory {
            id: 1,
            project_id: 1,
            kind: conveyor_core::model::InventoryKind::Static,
            inventory: "[all]\nhost1\n".into(),
            ssh_key_id: Some(5),
            ..Default::default()
        });
        res.inventory_ssh_key = Some(AccessKey {
            id: 5,
            kind: AccessKeyKind::LoginPassword,
            login_password: Some(LoginPassword {
                login: "deploy".into(),
                password: "pw".into(),
            }),
            ..Default::default()
        });
        res.template.task_params = serde_json::from_str(
            r#"{"allow_debug": true, "limit": ["web"], "tags": ["fast"]}"#,
        )
        .unwrap();
        res.task.params = serde_json::from_str(r#"{"debug": true, "diff": true}"#).unwrap();

        let job = job(res);
        // simulate the prepared state
        *job.inventory_file.lock().unwrap() = Some(PathBuf::from("/task/inventory"));
        *job.ssh_key_installation.lock().unwrap() = Some(KeyInstallation {
            login: Some("deploy".into()),
            password: Some("pw".into()),
            ..Default::default()
        });

        let (args, inputs) = job.playbook_args("alice", None).unwrap();

        assert_eq!(&args[0..2], &["-i".to_string(), "/task/inventory".to_string()]);
        let user_pos = args.iter().position(|a| a == "--user").unwrap();
        assert_eq!(args[user_pos + 1], "deploy");
        assert!(args.contains(&"--ask-pass".to_string()));
        assert!(args.contains(&"-vvvv".to_string()));
        assert!(args.contains(&"--diff".to_string()));
        assert!(args.contains(&"--limit=web".to_string()));
        assert!(args.contains(&"--tags=fast".to_string()));
        assert_eq!(args.last().unwrap(), "site.yml");
        assert_eq!(inputs.get("SSH password:"), Some(&"pw".to_string()));

        // --extra-vars come before template/task extra args and the playbook
        let ev = args.iter().position(|a| a == "--extra-vars").unwrap();
        assert!(ev < args.len() - 1);
    }
}
