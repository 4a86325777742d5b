// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for conveyor-exec.

use thiserror::Error;

/// Execution engine errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The tool binary could not be started.
    #[error("failed to start {binary}: {source}")]
    Spawn {
        /// Binary that failed to start.
        binary: String,
        /// Underlying IO error.
        source: std::io::Error,
    },

    /// The child exited with a non-zero code.
    #[error("exit code {0}")]
    ExitCode(i32),

    /// The child was terminated by a signal.
    #[error("process killed")]
    Killed,

    /// A git operation failed.
    #[error("git {action} failed: {message}")]
    Git {
        /// Subcommand that failed.
        action: String,
        /// Captured stderr or status.
        message: String,
    },

    /// The access key cannot be used in the requested role.
    #[error("access key does not suit the {0} role")]
    KeyUnsuitable(&'static str),

    /// The inventory shape is not runnable.
    #[error("invalid inventory: {0}")]
    InvalidInventory(String),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Core model error.
    #[error(transparent)]
    Core(#[from] conveyor_core::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the exec Error.
pub type Result<T> = std::result::Result<T, Error>;
