// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Internal runner endpoints.
//!
//! Registration mints a per-runner token; polls return the runner's job
//! snapshot (optionally RSA-encrypted for the runner's registered public
//! key); progress reports feed the task log pipeline.

use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use sha2::{Digest, Sha256};

use conveyor_core::model::Runner;
use conveyor_core::wire::{RunnerProgress, RunnerRegistration, RunnerRegistrationResponse};
use conveyor_core::{ids, Error};

use crate::dispatch::crypto::encrypt_chunked;

use super::{error_response, AppState};

fn token_eq(a: &str, b: &str) -> bool {
    !a.is_empty() && Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}

async fn runner_from_token(state: &AppState, headers: &HeaderMap) -> Result<Runner, Response> {
    let token = headers
        .get("x-runner-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    if token.is_empty() {
        return Err(error_response(&Error::NotFound("runner".into())));
    }

    state
        .store
        .get_runner_by_token(token)
        .await
        .map_err(|e| error_response(&e))
}

/// `POST /api/internal/runners`: register a new runner.
pub async fn register(
    State(state): State<AppState>,
    Json(registration): Json<RunnerRegistration>,
) -> Response {
    if !token_eq(
        &state.config.runner_registration_token,
        &registration.registration_token,
    ) {
        return error_response(&Error::Validation("invalid registration token".into()));
    }

    let runner = Runner {
        id: 0,
        token: ids::random_token(ids::RUNNER_TOKEN_LEN),
        tag: registration.tag.clone(),
        max_parallel_tasks: registration.max_parallel_tasks,
        webhook: registration.webhook.clone().unwrap_or_default(),
        public_key: registration.public_key.clone().filter(|k| !k.is_empty()),
        active: true,
    };

    match state.store.create_runner(runner).await {
        Ok(created) => {
            tracing::info!(runner_id = created.id, tag = ?created.tag, "runner registered");
            Json(RunnerRegistrationResponse {
                token: created.token,
            })
            .into_response()
        }
        Err(e) => {
            tracing::error!(error = %e, "runner registration failed");
            error_response(&e)
        }
    }
}

/// `GET /api/internal/runners`: poll for work.
pub async fn poll(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let runner = match runner_from_token(&state, &headers).await {
        Ok(runner) => runner,
        Err(response) => return response,
    };

    let snapshot = state.registry.poll_snapshot(&runner);

    let Some(public_key) = &runner.public_key else {
        return Json(snapshot).into_response();
    };

    let plaintext = match serde_json::to_vec(&snapshot) {
        Ok(plaintext) => plaintext,
        Err(e) => {
            tracing::error!(error = %e, "poll snapshot serialization failed");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    };

    match encrypt_chunked(public_key, &plaintext) {
        Ok(ciphertext) => ciphertext.into_response(),
        Err(e) => {
            tracing::error!(runner_id = runner.id, error = %e, "poll encryption failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// `PUT /api/internal/runners`: apply a progress report.
pub async fn progress(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(progress): Json<RunnerProgress>,
) -> Response {
    let runner = match runner_from_token(&state, &headers).await {
        Ok(runner) => runner,
        Err(response) => return response,
    };

    state.registry.apply_progress(&runner, progress);
    StatusCode::NO_CONTENT.into_response()
}

/// `DELETE /api/internal/runners`: unregister.
pub async fn unregister(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let runner = match runner_from_token(&state, &headers).await {
        Ok(runner) => runner,
        Err(response) => return response,
    };

    match state.store.delete_runner(runner.id).await {
        Ok(()) => StatusCode::NO_CONTENT.into_response(),
        Err(e) => {
            tracing::error!(runner_id = runner.id, error = %e, "runner unregistration failed");
            error_response(&e)
        }
    }
}
