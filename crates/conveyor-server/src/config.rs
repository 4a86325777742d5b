// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for conveyor-server.

use std::net::SocketAddr;
use std::path::PathBuf;

/// Server configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// PostgreSQL connection string. Empty selects the in-memory store
    /// (development and tests only).
    pub database_url: String,
    /// HTTP listen address.
    pub listen_addr: SocketAddr,
    /// Public base URL of this server (task links, TF_HTTP_ADDRESS).
    pub web_host: String,
    /// Shared tmp directory for clones and task artefacts.
    pub tmp_path: PathBuf,
    /// Global cap on concurrently running tasks. 0 = unlimited.
    pub max_parallel_tasks: usize,
    /// Per-task runtime ceiling in seconds. 0 = unlimited.
    pub max_task_duration_sec: u64,
    /// Terminal tasks kept per template. 0 = keep all.
    pub max_tasks_per_template: i64,
    /// Run every task on remote agents regardless of tags.
    pub use_remote_runner: bool,
    /// Shared token agents present when registering.
    pub runner_registration_token: String,
    /// Cooperate with other orchestrator processes through the shared
    /// Postgres pool state.
    pub ha_mode: bool,
    /// Database connection pool size.
    pub db_pool_size: u32,
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let database_url = std::env::var("CONVEYOR_DATABASE_URL").unwrap_or_default();

        let port: u16 = std::env::var("CONVEYOR_PORT")
            .unwrap_or_else(|_| "3000".to_string())
            .parse()
            .map_err(|_| ConfigError::InvalidPort)?;
        let listen_addr = SocketAddr::from(([0, 0, 0, 0], port));

        let web_host = std::env::var("CONVEYOR_WEB_HOST").unwrap_or_default();

        let tmp_path = PathBuf::from(
            std::env::var("CONVEYOR_TMP_PATH").unwrap_or_else(|_| "/tmp/conveyor".to_string()),
        );

        let max_parallel_tasks = parse_env_number("CONVEYOR_MAX_PARALLEL_TASKS", 0);
        let max_task_duration_sec = parse_env_number("CONVEYOR_MAX_TASK_DURATION_SEC", 0);
        let max_tasks_per_template = parse_env_number("CONVEYOR_MAX_TASKS_PER_TEMPLATE", 0);

        let use_remote_runner = parse_env_bool("CONVEYOR_USE_REMOTE_RUNNER");
        let runner_registration_token =
            std::env::var("CONVEYOR_RUNNER_REGISTRATION_TOKEN").unwrap_or_default();

        let ha_mode = parse_env_bool("CONVEYOR_HA");
        if ha_mode && database_url.is_empty() {
            return Err(ConfigError::HaRequiresDatabase);
        }

        let db_pool_size = parse_env_number("CONVEYOR_DB_POOL_SIZE", 20) as u32;

        Ok(Self {
            database_url,
            listen_addr,
            web_host,
            tmp_path,
            max_parallel_tasks: max_parallel_tasks as usize,
            max_task_duration_sec,
            max_tasks_per_template: max_tasks_per_template as i64,
            use_remote_runner,
            runner_registration_token,
            ha_mode,
            db_pool_size,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: String::new(),
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 3000)),
            web_host: String::new(),
            tmp_path: PathBuf::from("/tmp/conveyor"),
            max_parallel_tasks: 0,
            max_task_duration_sec: 0,
            max_tasks_per_template: 0,
            use_remote_runner: false,
            runner_registration_token: String::new(),
            ha_mode: false,
            db_pool_size: 20,
        }
    }
}

fn parse_env_number(var: &str, default: u64) -> u64 {
    std::env::var(var)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn parse_env_bool(var: &str) -> bool {
    std::env::var(var)
        .map(|v| v == "true" || v == "1" || v == "yes")
        .unwrap_or(false)
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The port number is invalid.
    #[error("Invalid port number")]
    InvalidPort,
    /// HA mode needs a shared database.
    #[error("CONVEYOR_HA requires CONVEYOR_DATABASE_URL")]
    HaRequiresDatabase,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::env;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn new() -> Self {
            Self { vars: Vec::new() }
        }

        fn set(&mut self, key: &str, value: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            env::set_var(key, value);
        }

        fn remove(&mut self, key: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            env::remove_var(key);
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                match value {
                    Some(v) => env::set_var(&key, v),
                    None => env::remove_var(&key),
                }
            }
        }
    }

    fn clean(guard: &mut EnvGuard) {
        for key in [
            "CONVEYOR_DATABASE_URL",
            "CONVEYOR_PORT",
            "CONVEYOR_WEB_HOST",
            "CONVEYOR_TMP_PATH",
            "CONVEYOR_MAX_PARALLEL_TASKS",
            "CONVEYOR_MAX_TASK_DURATION_SEC",
            "CONVEYOR_MAX_TASKS_PER_TEMPLATE",
            "CONVEYOR_USE_REMOTE_RUNNER",
            "CONVEYOR_RUNNER_REGISTRATION_TOKEN",
            "CONVEYOR_HA",
            "CONVEYOR_DB_POOL_SIZE",
        ] {
            guard.remove(key);
        }
    }

    #[test]
    fn defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clean(&mut guard);

        let config = Config::from_env().unwrap();
        assert_eq!(config.listen_addr.port(), 3000);
        assert_eq!(config.tmp_path, PathBuf::from("/tmp/conveyor"));
        assert_eq!(config.max_parallel_tasks, 0);
        assert!(!config.use_remote_runner);
        assert!(!config.ha_mode);
    }

    #[test]
    fn custom_values() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clean(&mut guard);
        guard.set("CONVEYOR_PORT", "8088");
        guard.set("CONVEYOR_MAX_PARALLEL_TASKS", "12");
        guard.set("CONVEYOR_USE_REMOTE_RUNNER", "true");
        guard.set("CONVEYOR_WEB_HOST", "https://conveyor.example.com");

        let config = Config::from_env().unwrap();
        assert_eq!(config.listen_addr.port(), 8088);
        assert_eq!(config.max_parallel_tasks, 12);
        assert!(config.use_remote_runner);
        assert_eq!(config.web_host, "https://conveyor.example.com");
    }

    #[test]
    fn ha_requires_database() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clean(&mut guard);
        guard.set("CONVEYOR_HA", "true");

        assert!(matches!(
            Config::from_env(),
            Err(ConfigError::HaRequiresDatabase)
        ));
    }

    #[test]
    fn invalid_port_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::new();
        clean(&mut guard);
        guard.set("CONVEYOR_PORT", "not_a_port");

        assert!(matches!(Config::from_env(), Err(ConfigError::InvalidPort)));
    }
}
