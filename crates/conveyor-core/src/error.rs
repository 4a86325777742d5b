// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for conveyor-core.

use thiserror::Error;

/// Core errors.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A referenced entity is absent.
    #[error("not found: {0}")]
    NotFound(String),

    /// The operation conflicts with current state (entity in use).
    #[error("invalid operation: {0}")]
    InvalidOperation(String),

    /// Input shape violates an invariant.
    #[error("{0}")]
    Validation(String),

    /// An external gate denied the operation. Surfaced verbatim.
    #[error("has no active subscription")]
    InvalidSubscription,

    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// I/O operation failed.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Other error.
    #[error("{0}")]
    Other(String),
}

/// Result type using the core Error.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// True when the error denotes a missing entity rather than a failure.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
            || matches!(self, Error::Database(sqlx::Error::RowNotFound))
    }
}
