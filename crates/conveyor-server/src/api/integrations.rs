// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Webhook intake.
//!
//! `POST /api/integrations/{alias}` authenticates the delivery per
//! integration, evaluates matchers (all must hold), extracts configured
//! values into the task environment or params, and enqueues one task per
//! matching integration. Failures of individual integrations are logged and
//! never abort the dispatch; the response is 204 once dispatch is reached.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use base64::Engine;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use conveyor_core::model::{
    AliasLevel, BodyDataType, Integration, IntegrationAuthMethod, IntegrationExtractValue,
    IntegrationMatcher, LoginPassword, MatchMethod, MatchType, Task, ValueSource, VariableKind,
};

use super::AppState;

type HmacSha256 = Hmac<Sha256>;

/// Verify a hex HMAC-SHA256 signature carried in a header, optionally
/// prefixed (`sha256=`). Comparison is constant time.
pub fn is_valid_hmac_payload(secret: &str, header: &str, payload: &[u8], prefix: &str) -> bool {
    let Some(signature) = header.strip_prefix(prefix) else {
        return false;
    };
    let Ok(signature) = hex::decode(signature) else {
        return false;
    };

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);
    mac.verify_slice(&signature).is_ok()
}

/// Length-hiding equality for token and password comparisons.
fn digest_eq(a: &str, b: &str) -> bool {
    Sha256::digest(a.as_bytes()) == Sha256::digest(b.as_bytes())
}

/// Query a JSON body with a dotted path. Integral numbers are coerced to
/// integers so `42.0` matches `"42"`.
pub fn json_lookup(body: &[u8], dotted_key: &str) -> Option<serde_json::Value> {
    let parsed: serde_json::Value = serde_json::from_slice(body).ok()?;

    let mut cursor = &parsed;
    for segment in dotted_key.split('.') {
        cursor = match cursor {
            serde_json::Value::Object(map) => map.get(segment)?,
            serde_json::Value::Array(items) => items.get(segment.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }

    Some(coerce_integral(cursor.clone()))
}

fn coerce_integral(value: serde_json::Value) -> serde_json::Value {
    if let serde_json::Value::Number(number) = &value {
        if let Some(float) = number.as_f64() {
            if float.fract() == 0.0 && float.abs() < i64::MAX as f64 {
                return serde_json::Value::from(float as i64);
            }
        }
    }
    value
}

fn value_as_string(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Compare an observed value against a matcher expectation.
pub fn match_compare(value: &str, method: MatchMethod, expected: &str) -> bool {
    match method {
        MatchMethod::Equals => value == expected,
        MatchMethod::Unequals => value != expected,
        MatchMethod::Contains => value.contains(expected),
    }
}

/// Evaluate one matcher against the request.
pub fn matches(matcher: &IntegrationMatcher, headers: &HeaderMap, payload: &[u8]) -> bool {
    match matcher.match_type {
        MatchType::Header => {
            let observed = headers
                .get(&matcher.key)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("");
            match_compare(observed, matcher.method, &matcher.value)
        }
        MatchType::Body => match matcher.body_data_type {
            BodyDataType::Json => match json_lookup(payload, &matcher.key) {
                Some(value) => {
                    match_compare(&value_as_string(&value), matcher.method, &matcher.value)
                }
                None => false,
            },
            BodyDataType::String => match_compare(
                &String::from_utf8_lossy(payload),
                matcher.method,
                &matcher.value,
            ),
        },
    }
}

/// Apply the integration's extract rules to the request.
fn extract(
    rules: &[IntegrationExtractValue],
    headers: &HeaderMap,
    payload: &[u8],
) -> (Vec<(String, serde_json::Value)>, Vec<(String, serde_json::Value)>) {
    let mut environment = Vec::new();
    let mut task_params = Vec::new();

    for rule in rules {
        let value = match rule.value_source {
            ValueSource::Header => headers
                .get(&rule.key)
                .and_then(|v| v.to_str().ok())
                .map(|v| serde_json::Value::from(v.to_string())),
            ValueSource::Body => match rule.body_data_type {
                BodyDataType::Json => json_lookup(payload, &rule.key),
                BodyDataType::String => Some(serde_json::Value::from(
                    String::from_utf8_lossy(payload).to_string(),
                )),
            },
        };

        let Some(value) = value else {
            continue;
        };

        match rule.variable_type {
            VariableKind::Environment => environment.push((rule.variable.clone(), value)),
            VariableKind::TaskParam => task_params.push((rule.variable.clone(), value)),
        }
    }

    (environment, task_params)
}

async fn auth_secret(state: &AppState, integration: &Integration) -> Option<LoginPassword> {
    let key_id = integration.auth_secret_id?;
    match state.store.get_access_key(key_id).await {
        Ok(key) => key.login_password,
        Err(e) => {
            tracing::error!(
                integration_id = integration.id,
                error = %e,
                "auth secret lookup failed"
            );
            None
        }
    }
}

async fn authenticate(
    state: &AppState,
    integration: &Integration,
    headers: &HeaderMap,
    payload: &[u8],
) -> bool {
    let header_value = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string()
    };

    let secret = match integration.auth_method {
        IntegrationAuthMethod::None => return true,
        _ => match auth_secret(state, integration).await {
            Some(secret) => secret,
            None => {
                tracing::error!(
                    integration_id = integration.id,
                    "integration has no usable auth secret"
                );
                return false;
            }
        },
    };

    let ok = match integration.auth_method {
        IntegrationAuthMethod::Github => is_valid_hmac_payload(
            &secret.password,
            &header_value("x-hub-signature-256"),
            payload,
            "sha256=",
        ),
        IntegrationAuthMethod::Bitbucket => is_valid_hmac_payload(
            &secret.password,
            &header_value("x-hub-signature"),
            payload,
            "sha256=",
        ),
        IntegrationAuthMethod::Hmac => is_valid_hmac_payload(
            &secret.password,
            &header_value(&integration.auth_header),
            payload,
            "",
        ),
        IntegrationAuthMethod::Token => {
            digest_eq(&secret.password, &header_value(&integration.auth_header))
        }
        IntegrationAuthMethod::Basic => {
            basic_credentials(headers).is_some_and(|(login, password)| {
                login == secret.login && digest_eq(&password, &secret.password)
            })
        }
        IntegrationAuthMethod::None => true,
    };

    if !ok {
        tracing::error!(
            integration_id = integration.id,
            method = %integration.auth_method,
            "webhook authentication failed"
        );
    }
    ok
}

fn basic_credentials(headers: &HeaderMap) -> Option<(String, String)> {
    let header = headers.get("authorization")?.to_str().ok()?;
    let encoded = header.strip_prefix("Basic ")?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .ok()?;
    let decoded = String::from_utf8(decoded).ok()?;
    let (login, password) = decoded.split_once(':')?;
    Some((login.to_string(), password.to_string()))
}

/// Compose the task an integration enqueues, with extracted values merged.
fn task_definition(
    integration: &Integration,
    environment: Vec<(String, serde_json::Value)>,
    task_params: Vec<(String, serde_json::Value)>,
) -> conveyor_core::Result<Task> {
    let mut task = match &integration.task_params {
        Some(params) => {
            serde_json::from_value(serde_json::Value::Object(params.clone()))
                .unwrap_or_else(|_| Task::new(integration.project_id, integration.template_id))
        }
        None => Task::new(integration.project_id, integration.template_id),
    };
    task.project_id = integration.project_id;
    task.template_id = integration.template_id;
    task.integration_id = Some(integration.id);

    let mut env: conveyor_core::model::JsonMap = if task.environment.is_empty() {
        conveyor_core::model::JsonMap::new()
    } else {
        serde_json::from_str(&task.environment)?
    };

    // the task definition wins on collision; extracted values only fill
    // keys it does not set
    for (key, value) in environment {
        env.entry(key).or_insert(value);
    }
    task.environment = serde_json::to_string(&serde_json::Value::Object(env))?;

    for (key, value) in task_params {
        task.params.insert(key, value);
    }

    Ok(task)
}

async fn run_integration(
    state: &AppState,
    integration: &Integration,
    headers: &HeaderMap,
    payload: &[u8],
) {
    tracing::info!(integration_id = integration.id, "running integration");

    let rules = match state
        .store
        .get_integration_extract_values(integration.project_id, integration.id)
        .await
    {
        Ok(rules) => rules,
        Err(e) => {
            tracing::error!(integration_id = integration.id, error = %e, "extract rules lookup failed");
            return;
        }
    };

    let (environment, task_params) = extract(&rules, headers, payload);

    let task = match task_definition(integration, environment, task_params) {
        Ok(task) => task,
        Err(e) => {
            tracing::error!(integration_id = integration.id, error = %e, "task composition failed");
            return;
        }
    };

    let template = match state
        .store
        .get_template(integration.project_id, integration.template_id)
        .await
    {
        Ok(template) => template,
        Err(e) => {
            tracing::error!(integration_id = integration.id, error = %e, "template lookup failed");
            return;
        }
    };

    if let Err(e) = state
        .pool
        .add_task(
            task,
            None,
            "",
            integration.project_id,
            template.app.need_task_alias(),
        )
        .await
    {
        tracing::error!(integration_id = integration.id, error = %e, "webhook task enqueue failed");
    }
}

/// `POST /api/integrations/{alias}`.
pub async fn receive(
    State(state): State<AppState>,
    Path(alias): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> StatusCode {
    let (integrations, level) = match state.store.get_integrations_by_alias(&alias).await {
        Ok(found) => found,
        Err(e) if e.is_not_found() => return StatusCode::NOT_FOUND,
        Err(e) => {
            tracing::error!(error = %e, "integration alias lookup failed");
            return StatusCode::NOT_FOUND;
        }
    };

    tracing::info!(
        alias = %alias,
        count = integrations.len(),
        "received integration delivery"
    );

    for integration in &integrations {
        // the project of the iterated integration, not of the first one
        if let Err(e) = state.store.get_project(integration.project_id).await {
            tracing::error!(
                integration_id = integration.id,
                error = %e,
                "integration project lookup failed"
            );
            continue;
        }

        if !authenticate(&state, integration, &headers, &body).await {
            continue;
        }

        if level != AliasLevel::Single {
            let matchers = match state
                .store
                .get_integration_matchers(integration.project_id, integration.id)
                .await
            {
                Ok(matchers) => matchers,
                Err(e) => {
                    tracing::error!(
                        integration_id = integration.id,
                        error = %e,
                        "matcher lookup failed"
                    );
                    continue;
                }
            };

            // all matchers of an integration must hold
            if !matchers.iter().all(|m| matches(m, &headers, &body)) {
                continue;
            }
        }

        run_integration(&state, integration, &headers, &body).await;
    }

    StatusCode::NO_CONTENT
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signature(secret: &str, payload: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn hmac_accepts_exactly_the_signed_payload() {
        let payload = br#"{"hook_id":42}"#;
        let signed = format!("sha256={}", signature("s3cret", payload));

        assert!(is_valid_hmac_payload("s3cret", &signed, payload, "sha256="));
        assert!(!is_valid_hmac_payload("s3cret", &signed, b"tampered", "sha256="));
        assert!(!is_valid_hmac_payload("wrong", &signed, payload, "sha256="));
        // prefix must be present
        let unprefixed = signature("s3cret", payload);
        assert!(!is_valid_hmac_payload("s3cret", &unprefixed, payload, "sha256="));
    }

    #[test]
    fn json_lookup_walks_dotted_paths() {
        let body = br#"{"repository": {"name": "infra"}, "commits": [{"id": "abc"}], "hook_id": 42.0}"#;

        assert_eq!(
            json_lookup(body, "repository.name").unwrap(),
            serde_json::Value::from("infra")
        );
        assert_eq!(
            json_lookup(body, "commits.0.id").unwrap(),
            serde_json::Value::from("abc")
        );
        // integral floats coerce to integers
        assert_eq!(json_lookup(body, "hook_id").unwrap(), serde_json::Value::from(42));
        assert!(json_lookup(body, "missing.key").is_none());
    }

    #[test]
    fn match_compare_methods() {
        assert!(match_compare("main", MatchMethod::Equals, "main"));
        assert!(!match_compare("dev", MatchMethod::Equals, "main"));
        assert!(match_compare("dev", MatchMethod::Unequals, "main"));
        assert!(match_compare("refs/heads/main", MatchMethod::Contains, "main"));
    }

    #[test]
    fn body_matcher_compares_coerced_numbers() {
        let matcher = IntegrationMatcher {
            match_type: MatchType::Body,
            method: MatchMethod::Equals,
            key: "hook_id".into(),
            value: "42".into(),
            body_data_type: BodyDataType::Json,
            ..Default::default()
        };

        assert!(matches(&matcher, &HeaderMap::new(), br#"{"hook_id": 42}"#));
        assert!(matches(&matcher, &HeaderMap::new(), br#"{"hook_id": 42.0}"#));
        assert!(!matches(&matcher, &HeaderMap::new(), br#"{"hook_id": 7}"#));
    }

    #[test]
    fn task_definition_prefers_existing_environment() {
        let integration = Integration {
            id: 5,
            project_id: 1,
            template_id: 2,
            task_params: Some(
                serde_json::from_str(r#"{"environment": "{\"BRANCH_NAME\": \"fixed\"}"}"#).unwrap(),
            ),
            ..Default::default()
        };

        let task = task_definition(
            &integration,
            vec![
                ("BRANCH_NAME".into(), serde_json::Value::from("main")),
                ("COMMIT".into(), serde_json::Value::from("abc")),
            ],
            vec![("limit".into(), serde_json::Value::from("web1"))],
        )
        .unwrap();

        let env: serde_json::Value = serde_json::from_str(&task.environment).unwrap();
        assert_eq!(env["BRANCH_NAME"], "fixed"); // task definition wins
        assert_eq!(env["COMMIT"], "abc");
        assert_eq!(task.params["limit"], "web1");
        assert_eq!(task.integration_id, Some(5));
    }
}
