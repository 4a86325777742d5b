// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Integration (webhook receiver) entities.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::JsonMap;
use crate::error::Error;

/// How an incoming webhook delivery is authenticated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum IntegrationAuthMethod {
    /// `X-Hub-Signature-256: sha256=<hex hmac-sha256(secret, body)>`.
    Github,
    /// `x-hub-signature: sha256=<hex hmac-sha256(secret, body)>`.
    Bitbucket,
    /// Custom header carrying `<hex hmac-sha256(secret, body)>`.
    Hmac,
    /// Custom header equal to the configured secret.
    Token,
    /// HTTP basic auth against the configured login/password.
    Basic,
    /// Accepted without verification.
    #[default]
    None,
}

impl fmt::Display for IntegrationAuthMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IntegrationAuthMethod::Github => "github",
            IntegrationAuthMethod::Bitbucket => "bitbucket",
            IntegrationAuthMethod::Hmac => "hmac",
            IntegrationAuthMethod::Token => "token",
            IntegrationAuthMethod::Basic => "basic",
            IntegrationAuthMethod::None => "none",
        };
        f.write_str(s)
    }
}

impl FromStr for IntegrationAuthMethod {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "github" => Ok(IntegrationAuthMethod::Github),
            "bitbucket" => Ok(IntegrationAuthMethod::Bitbucket),
            "hmac" => Ok(IntegrationAuthMethod::Hmac),
            "token" => Ok(IntegrationAuthMethod::Token),
            "basic" => Ok(IntegrationAuthMethod::Basic),
            "none" => Ok(IntegrationAuthMethod::None),
            other => Err(Error::Validation(format!("unknown auth method: {other}"))),
        }
    }
}

/// What part of the request a matcher inspects.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchType {
    /// A request header named by `key`.
    #[default]
    Header,
    /// The request body (JSON path or whole body).
    Body,
}

/// Comparison method of a matcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum MatchMethod {
    /// Values are equal.
    #[default]
    Equals,
    /// Values differ.
    Unequals,
    /// Value contains the expectation.
    Contains,
}

/// How body content is interpreted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum BodyDataType {
    /// Query the body JSON with a dotted path.
    #[default]
    Json,
    /// Treat the whole body as one string.
    String,
}

/// Where an extract rule reads its value from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ValueSource {
    /// A request header named by `key`.
    #[default]
    Header,
    /// The request body.
    Body,
}

/// Destination of an extracted value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum VariableKind {
    /// Merged into the task environment (task definition wins collisions).
    #[default]
    Environment,
    /// Merged into the task params map.
    TaskParam,
}

/// Webhook receiver bound to a template.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Integration {
    /// Unique identifier.
    pub id: i64,
    /// Owning project.
    pub project_id: i64,
    /// Template whose tasks this integration enqueues.
    pub template_id: i64,
    /// Display name.
    pub name: String,
    /// Authentication method for incoming deliveries.
    #[serde(default)]
    pub auth_method: IntegrationAuthMethod,
    /// Access key holding the auth secret (login/password payload).
    pub auth_secret_id: Option<i64>,
    /// Header inspected by hmac/token methods.
    #[serde(default)]
    pub auth_header: String,
    /// Whether a project-level alias considers this integration.
    #[serde(default)]
    pub searchable: bool,
    /// Task shape the integration enqueues; bare task when absent.
    pub task_params: Option<JsonMap>,
}

/// Predicate on an incoming delivery.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IntegrationMatcher {
    /// Unique identifier.
    pub id: i64,
    /// Owning integration.
    pub integration_id: i64,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Header or body.
    #[serde(default)]
    pub match_type: MatchType,
    /// Comparison method.
    #[serde(default)]
    pub method: MatchMethod,
    /// Header name or dotted JSON path.
    #[serde(default)]
    pub key: String,
    /// Expected value.
    #[serde(default)]
    pub value: String,
    /// Body interpretation for body matchers.
    #[serde(default)]
    pub body_data_type: BodyDataType,
}

/// Rule mapping a request fragment to a task variable.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IntegrationExtractValue {
    /// Unique identifier.
    pub id: i64,
    /// Owning integration.
    pub integration_id: i64,
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Header or body.
    #[serde(default)]
    pub value_source: ValueSource,
    /// Header name or dotted JSON path.
    #[serde(default)]
    pub key: String,
    /// Destination variable name.
    pub variable: String,
    /// Environment or task param.
    #[serde(default)]
    pub variable_type: VariableKind,
    /// Body interpretation for body sources.
    #[serde(default)]
    pub body_data_type: BodyDataType,
}

/// Scope of a webhook alias.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AliasLevel {
    /// The alias points at exactly one integration.
    Single,
    /// The alias points at every searchable integration of a project.
    Project,
}

/// Stable public path component for a webhook URL.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct IntegrationAlias {
    /// Unique identifier.
    pub id: i64,
    /// Opaque 16-character token in the URL.
    pub alias: String,
    /// Owning project.
    pub project_id: i64,
    /// Target integration; a project-level alias has none.
    pub integration_id: Option<i64>,
}

impl IntegrationAlias {
    /// Scope of this alias.
    pub fn level(&self) -> AliasLevel {
        if self.integration_id.is_some() {
            AliasLevel::Single
        } else {
            AliasLevel::Project
        }
    }
}
