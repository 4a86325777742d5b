// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP client for the orchestrator's internal runner endpoints.

use rsa::RsaPrivateKey;

use conveyor_core::wire::{
    RunnerProgress, RunnerRegistration, RunnerRegistrationResponse, RunnerState,
};

use crate::crypto::decrypt_chunked;
use crate::pool::Error;

const RUNNERS_PATH: &str = "/api/internal/runners";

/// Client bound to one orchestrator.
pub struct ApiClient {
    http: reqwest::Client,
    base_url: String,
}

impl ApiClient {
    /// Client for the orchestrator at `base_url`.
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
        }
    }

    fn url(&self) -> String {
        format!("{}{}", self.base_url.trim_end_matches('/'), RUNNERS_PATH)
    }

    async fn error_message(response: reqwest::Response) -> Error {
        let status = response.status().as_u16();
        let message = response
            .json::<serde_json::Value>()
            .await
            .ok()
            .and_then(|body| body["error"].as_str().map(str::to_string))
            .unwrap_or_default();
        Error::Server { status, message }
    }

    /// Register this agent; returns the minted per-runner token.
    pub async fn register(&self, registration: &RunnerRegistration) -> Result<String, Error> {
        let response = self.http.post(self.url()).json(registration).send().await?;

        if !response.status().is_success() {
            return Err(Self::error_message(response).await);
        }

        let body: RunnerRegistrationResponse = response.json().await?;
        Ok(body.token)
    }

    /// Remove this agent's registration. A 404 is tolerated.
    pub async fn unregister(&self, token: &str) -> Result<(), Error> {
        let response = self
            .http
            .delete(self.url())
            .header("X-Runner-Token", token)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() && status.as_u16() != 404 {
            return Err(Self::error_message(response).await);
        }
        Ok(())
    }

    /// Poll for work, decrypting the response when a private key is set.
    pub async fn poll(
        &self,
        token: &str,
        private_key: Option<&RsaPrivateKey>,
    ) -> Result<RunnerState, Error> {
        let response = self
            .http
            .get(self.url())
            .header("X-Runner-Token", token)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_message(response).await);
        }

        let body = response.bytes().await?;
        let plaintext = match private_key {
            Some(key) => decrypt_chunked(key, &body)?,
            None => body.to_vec(),
        };

        Ok(serde_json::from_slice(&plaintext)?)
    }

    /// Report job progress.
    pub async fn send_progress(&self, token: &str, progress: &RunnerProgress) -> Result<(), Error> {
        let response = self
            .http
            .put(self.url())
            .header("X-Runner-Token", token)
            .json(progress)
            .send()
            .await?;

        if !response.status().is_success() {
            return Err(Self::error_message(response).await);
        }
        Ok(())
    }
}
