// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Webhook dispatch tests: authentication, matching, extraction, enqueue.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use hmac::{Hmac, Mac};
use sha2::Sha256;

use conveyor_core::model::{
    AccessKey, AccessKeyKind, BodyDataType, Integration, IntegrationAlias, IntegrationAuthMethod,
    IntegrationExtractValue, IntegrationMatcher, LoginPassword, MatchMethod, MatchType, Project,
    Repository, Template, TemplateApp, ValueSource, VariableKind,
};
use conveyor_core::store::MemoryStore;
use conveyor_core::Store;
use conveyor_server::api::{integrations, AppState};
use conveyor_server::dispatch::RunnerRegistry;
use conveyor_server::pool::TaskPool;
use conveyor_server::state::MemoryPoolState;
use conveyor_server::Config;

const SECRET: &str = "wh-s3cret";
const ALIAS: &str = "abcdef0123456789";

fn github_signature(payload: &[u8]) -> String {
    let mut mac = Hmac::<Sha256>::new_from_slice(SECRET.as_bytes()).unwrap();
    mac.update(payload);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn seeded_state() -> (Arc<MemoryStore>, AppState) {
    let store = Arc::new(MemoryStore::new());

    store.insert_project(Project {
        id: 1,
        name: "p".into(),
        max_parallel_tasks: 0,
        alert: false,
    });
    store.insert_repository(Repository {
        id: 1,
        project_id: 1,
        name: "repo".into(),
        git_url: "/srv/repo".into(),
        git_branch: "main".into(),
        ssh_key_id: None,
    });
    store.insert_template(Template {
        id: 1,
        project_id: 1,
        name: "deploy".into(),
        app: TemplateApp::Bash,
        repository_id: 1,
        playbook: "deploy.sh".into(),
        ..Default::default()
    });
    store.insert_access_key(AccessKey {
        id: 10,
        project_id: Some(1),
        name: "webhook secret".into(),
        kind: AccessKeyKind::LoginPassword,
        ssh: None,
        login_password: Some(LoginPassword {
            login: "hook".into(),
            password: SECRET.into(),
        }),
    });
    store.insert_integration(Integration {
        id: 1,
        project_id: 1,
        template_id: 1,
        name: "github push".into(),
        auth_method: IntegrationAuthMethod::Github,
        auth_secret_id: Some(10),
        auth_header: String::new(),
        searchable: true,
        task_params: None,
    });
    store.insert_matcher(IntegrationMatcher {
        id: 1,
        integration_id: 1,
        match_type: MatchType::Body,
        method: MatchMethod::Equals,
        key: "hook_id".into(),
        value: "42".into(),
        body_data_type: BodyDataType::Json,
        ..Default::default()
    });
    store.insert_extract_value(IntegrationExtractValue {
        id: 1,
        integration_id: 1,
        value_source: ValueSource::Body,
        key: "branch".into(),
        variable: "BRANCH_NAME".into(),
        variable_type: VariableKind::Environment,
        body_data_type: BodyDataType::Json,
        ..Default::default()
    });
    // project-level alias so matchers apply
    store.insert_alias(IntegrationAlias {
        id: 1,
        alias: ALIAS.into(),
        project_id: 1,
        integration_id: None,
    });

    let pool = TaskPool::new(
        store.clone(),
        Arc::new(MemoryPoolState::new()),
        Arc::new(RunnerRegistry::new()),
        Config::default(),
    );

    let state = AppState {
        pool,
        store: store.clone(),
        registry: Arc::new(RunnerRegistry::new()),
        config: Config::default(),
    };

    (store, state)
}

async fn deliver(state: &AppState, alias: &str, headers: HeaderMap, body: &[u8]) -> StatusCode {
    integrations::receive(
        State(state.clone()),
        Path(alias.to_string()),
        headers,
        Bytes::copy_from_slice(body),
    )
    .await
}

#[tokio::test]
async fn matching_github_delivery_enqueues_one_task() {
    let (store, state) = seeded_state();

    let body = br#"{"hook_id": 42, "branch": "main"}"#;
    let mut headers = HeaderMap::new();
    headers.insert("x-hub-signature-256", github_signature(body).parse().unwrap());

    let status = deliver(&state, ALIAS, headers, body).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let tasks = store.get_template_tasks(1, 1, 10).await.unwrap();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].integration_id, Some(1));

    let env: serde_json::Value = serde_json::from_str(&tasks[0].environment).unwrap();
    assert_eq!(env["BRANCH_NAME"], "main");
}

#[tokio::test]
async fn invalid_signature_is_skipped_silently() {
    let (store, state) = seeded_state();

    let body = br#"{"hook_id": 42, "branch": "main"}"#;
    let mut headers = HeaderMap::new();
    headers.insert(
        "x-hub-signature-256",
        "sha256=0000000000000000000000000000000000000000000000000000000000000000"
            .parse()
            .unwrap(),
    );

    // dispatch still answers 204; the integration is skipped
    let status = deliver(&state, ALIAS, headers, body).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(store.get_template_tasks(1, 1, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn failed_matcher_prevents_enqueue() {
    let (store, state) = seeded_state();

    let body = br#"{"hook_id": 7, "branch": "main"}"#;
    let mut headers = HeaderMap::new();
    headers.insert("x-hub-signature-256", github_signature(body).parse().unwrap());

    let status = deliver(&state, ALIAS, headers, body).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(store.get_template_tasks(1, 1, 10).await.unwrap().is_empty());
}

#[tokio::test]
async fn single_level_alias_skips_matchers() {
    let (store, state) = seeded_state();
    store.insert_alias(IntegrationAlias {
        id: 2,
        alias: "single0123456789".into(),
        project_id: 1,
        integration_id: Some(1),
    });

    // hook_id would fail the matcher, but single aliases do not match
    let body = br#"{"hook_id": 7, "branch": "dev"}"#;
    let mut headers = HeaderMap::new();
    headers.insert("x-hub-signature-256", github_signature(body).parse().unwrap());

    let status = deliver(&state, "single0123456789", headers, body).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let tasks = store.get_template_tasks(1, 1, 10).await.unwrap();
    assert_eq!(tasks.len(), 1);
    let env: serde_json::Value = serde_json::from_str(&tasks[0].environment).unwrap();
    assert_eq!(env["BRANCH_NAME"], "dev");
}

#[tokio::test]
async fn unknown_alias_is_not_found() {
    let (_store, state) = seeded_state();
    let status = deliver(&state, "nosuchalias00000", HeaderMap::new(), b"{}").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn token_auth_compares_exactly() {
    let (store, state) = seeded_state();
    store.insert_integration(Integration {
        id: 2,
        project_id: 1,
        template_id: 1,
        name: "token hook".into(),
        auth_method: IntegrationAuthMethod::Token,
        auth_secret_id: Some(10),
        auth_header: "x-hook-token".into(),
        searchable: false,
        task_params: None,
    });
    store.insert_alias(IntegrationAlias {
        id: 3,
        alias: "token0123456789a".into(),
        project_id: 1,
        integration_id: Some(2),
    });

    let mut headers = HeaderMap::new();
    headers.insert("x-hook-token", SECRET.parse().unwrap());
    deliver(&state, "token0123456789a", headers, b"{}").await;
    assert_eq!(store.get_template_tasks(1, 1, 10).await.unwrap().len(), 1);

    let mut headers = HeaderMap::new();
    headers.insert("x-hook-token", "wrong".parse().unwrap());
    deliver(&state, "token0123456789a", headers, b"{}").await;
    assert_eq!(store.get_template_tasks(1, 1, 10).await.unwrap().len(), 1);
}

#[tokio::test]
async fn dispatch_decision_is_deterministic() {
    let (store, state) = seeded_state();

    let body = br#"{"hook_id": 42, "branch": "main"}"#;
    for _ in 0..3 {
        let mut headers = HeaderMap::new();
        headers.insert("x-hub-signature-256", github_signature(body).parse().unwrap());
        deliver(&state, ALIAS, headers, body).await;
    }

    // the same authenticated request selects the same integration each time
    let tasks = store.get_template_tasks(1, 1, 10).await.unwrap();
    assert_eq!(tasks.len(), 3);
    assert!(tasks.iter().all(|t| t.integration_id == Some(1)));
}
