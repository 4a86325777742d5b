// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP surface of the task execution core.
//!
//! Two route families: webhook intake (`/api/integrations/{alias}`) and the
//! internal runner protocol (`/api/internal/runners`). The management CRUD
//! surface lives outside this crate and mounts alongside these routes.

pub mod integrations;
pub mod runners;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use std::sync::Arc;

use conveyor_core::{Error, Store};

use crate::config::Config;
use crate::dispatch::RunnerRegistry;
use crate::pool::TaskPool;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    /// The task pool.
    pub pool: TaskPool,
    /// Entity store.
    pub store: Arc<dyn Store>,
    /// Remote runner registry.
    pub registry: Arc<RunnerRegistry>,
    /// Server configuration.
    pub config: Config,
}

/// Router over the core endpoints.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/integrations/{alias}", post(integrations::receive))
        .route(
            "/api/internal/runners",
            post(runners::register)
                .get(runners::poll)
                .put(runners::progress)
                .delete(runners::unregister),
        )
        .with_state(state)
}

/// Map a core error onto the HTTP surface.
pub fn error_response(error: &Error) -> Response {
    let (status, message) = match error {
        Error::Validation(message) => (StatusCode::BAD_REQUEST, message.clone()),
        Error::NotFound(_) => (StatusCode::NOT_FOUND, "not found".to_string()),
        Error::InvalidOperation(message) => (StatusCode::CONFLICT, message.clone()),
        Error::InvalidSubscription => (
            StatusCode::FORBIDDEN,
            "the subscription does not allow this operation".to_string(),
        ),
        _ => (StatusCode::BAD_REQUEST, "request failed".to_string()),
    };

    (status, Json(serde_json::json!({ "error": message }))).into_response()
}
