// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for conveyor-agent.

use std::path::PathBuf;

/// Agent configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Base URL of the orchestrator.
    pub web_host: String,
    /// Per-runner token. Loaded from `CONVEYOR_RUNNER_TOKEN` or, when set,
    /// from the token file (trailing whitespace trimmed).
    pub token: String,
    /// File the token is persisted to after registration.
    pub token_file: Option<PathBuf>,
    /// Shared registration token.
    pub registration_token: String,
    /// Maximum jobs executed concurrently. 0 = unlimited.
    pub max_parallel_tasks: i64,
    /// Exit after the first job finishes.
    pub one_off: bool,
    /// Tag restricting which jobs this agent receives.
    pub tag: Option<String>,
    /// RSA private key file; registering generates it and sends the public
    /// half, after which poll responses arrive encrypted.
    pub private_key_file: Option<PathBuf>,
    /// Webhook the server may call to wake this agent.
    pub webhook: Option<String>,
    /// Shared tmp directory for clones and task artefacts.
    pub tmp_path: PathBuf,
}

impl AgentConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let web_host = std::env::var("CONVEYOR_WEB_HOST")
            .map_err(|_| ConfigError::MissingEnvVar("CONVEYOR_WEB_HOST"))?;

        let token_file = std::env::var("CONVEYOR_RUNNER_TOKEN_FILE")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let mut token = std::env::var("CONVEYOR_RUNNER_TOKEN").unwrap_or_default();
        if token.is_empty() {
            if let Some(path) = &token_file {
                if let Ok(content) = std::fs::read_to_string(path) {
                    token = content.trim_end().to_string();
                }
            }
        }

        let registration_token =
            std::env::var("CONVEYOR_RUNNER_REGISTRATION_TOKEN").unwrap_or_default();

        let max_parallel_tasks = std::env::var("CONVEYOR_RUNNER_MAX_PARALLEL_TASKS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(0);

        let one_off = std::env::var("CONVEYOR_RUNNER_ONE_OFF")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let tag = std::env::var("CONVEYOR_RUNNER_TAG")
            .ok()
            .filter(|v| !v.is_empty());

        let private_key_file = std::env::var("CONVEYOR_RUNNER_PRIVATE_KEY_FILE")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let webhook = std::env::var("CONVEYOR_RUNNER_WEBHOOK")
            .ok()
            .filter(|v| !v.is_empty());

        let tmp_path = PathBuf::from(
            std::env::var("CONVEYOR_TMP_PATH").unwrap_or_else(|_| "/tmp/conveyor".to_string()),
        );

        Ok(Self {
            web_host,
            token,
            token_file,
            registration_token,
            max_parallel_tasks,
            one_off,
            tag,
            private_key_file,
            webhook,
            tmp_path,
        })
    }

    /// Persist a freshly minted token.
    pub fn save_token(&self, token: &str) -> std::io::Result<()> {
        match &self.token_file {
            Some(path) => std::fs::write(path, token),
            None => {
                // no file configured; the operator wires the token into the
                // environment themselves
                println!("{token}");
                Ok(())
            }
        }
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A required environment variable is missing.
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    #[test]
    fn token_file_is_trimmed() {
        let _lock = ENV_MUTEX.lock().unwrap();

        let dir = tempfile::tempdir().unwrap();
        let token_path = dir.path().join("token");
        std::fs::write(&token_path, "s3cret-token\n\n").unwrap();

        env::set_var("CONVEYOR_WEB_HOST", "http://localhost:3000");
        env::remove_var("CONVEYOR_RUNNER_TOKEN");
        env::set_var("CONVEYOR_RUNNER_TOKEN_FILE", token_path.to_str().unwrap());

        let config = AgentConfig::from_env().unwrap();
        assert_eq!(config.token, "s3cret-token");

        env::remove_var("CONVEYOR_RUNNER_TOKEN_FILE");
        env::remove_var("CONVEYOR_WEB_HOST");
    }

    #[test]
    fn web_host_is_required() {
        let _lock = ENV_MUTEX.lock().unwrap();
        env::remove_var("CONVEYOR_WEB_HOST");

        assert!(matches!(
            AgentConfig::from_env(),
            Err(ConfigError::MissingEnvVar("CONVEYOR_WEB_HOST"))
        ));
    }
}
