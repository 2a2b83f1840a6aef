// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Scoped client for the remote key-value state store.
//!
//! Every entry carries a version. Writes submit the version they read and the
//! store rejects them with 409 when it has moved on, so concurrent writers
//! never overwrite each other silently. [`ScopedState::set`] wraps that in a
//! bounded read-modify-write loop.
//!
//! ```ignore
//! let state = StateClient::from_request(&request, ctx.http().clone())?.with_env_scope()?;
//! let counter = state
//!     .set("counter", |old| Ok::<_, FunctionError>(json!(old.and_then(|v| v.as_i64()).unwrap_or(0) + 1)))
//!     .await?;
//! ```

use reqwest::{RequestBuilder, StatusCode, Url};
use runfn_http::{HttpError, RetryingClient};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{FunctionError, Result};
use crate::types::{
    META_ENVIRONMENT_ID, META_ORGANIZATION_ID, META_PROJECT_ID, META_STATE_STORE_TOKEN, META_STATE_STORE_URL,
    Request,
};

/// Header carrying the state-store token.
pub const STATE_TOKEN_HEADER: &str = "X-Eaas-State-Token";
const ORGANIZATION_HEADER: &str = "X-Organization-ID";
const PROJECT_HEADER: &str = "X-Project-ID";
const ENVIRONMENT_HEADER: &str = "X-Environment-ID";

/// Default bound on read-modify-write attempts in [`ScopedState::set`].
pub const DEFAULT_MAX_SET_ATTEMPTS: u32 = 5;

/// Namespace of a state key: org, org+project, or org+project+environment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StateScope {
    pub organization_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub project_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub environment_id: Option<String>,
}

impl StateScope {
    pub fn organization(organization_id: impl Into<String>) -> Self {
        Self {
            organization_id: organization_id.into(),
            project_id: None,
            environment_id: None,
        }
    }

    pub fn project(organization_id: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            project_id: Some(project_id.into()),
            ..Self::organization(organization_id)
        }
    }

    pub fn environment(
        organization_id: impl Into<String>,
        project_id: impl Into<String>,
        environment_id: impl Into<String>,
    ) -> Self {
        Self {
            environment_id: Some(environment_id.into()),
            ..Self::project(organization_id, project_id)
        }
    }
}

/// A value read from the store with the version it was read at.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct StateEntry {
    #[serde(default)]
    pub value: Value,
    pub version: u32,
}

/// Store location, credentials and the caller's identifiers.
#[derive(Debug, Clone, Default)]
pub struct StateBinding {
    pub base_url: String,
    pub token: String,
    pub organization_id: String,
    pub project_id: String,
    pub environment_id: String,
}

impl StateBinding {
    /// Read the binding from the request's `metadata`.
    pub fn from_request(request: &Request) -> Result<Self> {
        let base_url = request
            .meta_str(META_STATE_STORE_URL)
            .ok_or_else(|| FunctionError::failed("state store is not configured for this invocation"))?;
        let meta = |name| request.meta_str(name).unwrap_or_default().to_string();

        Ok(Self {
            base_url: base_url.to_string(),
            token: meta(META_STATE_STORE_TOKEN),
            organization_id: meta(META_ORGANIZATION_ID),
            project_id: meta(META_PROJECT_ID),
            environment_id: meta(META_ENVIRONMENT_ID),
        })
    }
}

/// Builder that narrows a binding to a scope.
#[derive(Debug, Clone)]
pub struct StateClient {
    http: RetryingClient,
    binding: StateBinding,
    max_set_attempts: u32,
    cancel: Option<CancellationToken>,
}

impl StateClient {
    pub fn new(binding: StateBinding, http: RetryingClient) -> Self {
        Self {
            http,
            binding,
            max_set_attempts: DEFAULT_MAX_SET_ATTEMPTS,
            cancel: None,
        }
    }

    /// Bind to the store described by the request's `metadata`.
    pub fn from_request(request: &Request, http: RetryingClient) -> Result<Self> {
        Ok(Self::new(StateBinding::from_request(request)?, http))
    }

    /// Bound the optimistic retry loop in [`ScopedState::set`] (minimum 1).
    pub fn with_max_set_attempts(mut self, attempts: u32) -> Self {
        self.max_set_attempts = attempts.max(1);
        self
    }

    /// Abort store requests when `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    pub fn with_org_scope(&self) -> Result<ScopedState> {
        self.with_custom_scope(StateScope::organization(&self.binding.organization_id))
    }

    pub fn with_project_scope(&self) -> Result<ScopedState> {
        self.with_custom_scope(StateScope::project(
            &self.binding.organization_id,
            &self.binding.project_id,
        ))
    }

    pub fn with_env_scope(&self) -> Result<ScopedState> {
        self.with_custom_scope(StateScope::environment(
            &self.binding.organization_id,
            &self.binding.project_id,
            &self.binding.environment_id,
        ))
    }

    pub fn with_custom_scope(&self, scope: StateScope) -> Result<ScopedState> {
        let base_url = Url::parse(&self.binding.base_url)
            .map_err(|err| FunctionError::failed(format!("invalid state store url {}: {err}", self.binding.base_url)))?;
        Ok(ScopedState {
            client: self.clone(),
            base_url,
            scope,
        })
    }
}

#[derive(Serialize)]
struct PutBody<'a> {
    scope: &'a StateScope,
    key: &'a str,
    value: &'a Value,
    version: u32,
}

#[derive(Serialize)]
struct DeleteBody<'a> {
    scope: &'a StateScope,
    key: &'a str,
}

/// Key-value access within one scope.
#[derive(Debug, Clone)]
pub struct ScopedState {
    client: StateClient,
    base_url: Url,
    scope: StateScope,
}

impl ScopedState {
    pub fn scope(&self) -> &StateScope {
        &self.scope
    }

    /// Read `key`. Absence is a `NotFound` error.
    pub async fn get(&self, key: &str) -> Result<StateEntry> {
        let mut url = self.base_url.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("organization_id", &self.scope.organization_id);
            query.append_pair("key", key);
            if let Some(project_id) = &self.scope.project_id {
                query.append_pair("project_id", project_id);
            }
            if let Some(environment_id) = &self.scope.environment_id {
                query.append_pair("environment_id", environment_id);
            }
        }

        let response = self.send(self.client.http.get(url)).await?;
        match response.status() {
            StatusCode::OK => {}
            StatusCode::NOT_FOUND => return Err(FunctionError::not_found(format!("key not found: {key}"))),
            status => {
                let body = response.text().await.unwrap_or_default();
                return Err(FunctionError::failed(format!("get kv state failed ({status}): {body}")));
            }
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|err| FunctionError::transient(format!("reading state store response: {err}")))?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Write `value` if the stored version still equals `version`.
    ///
    /// A stale version is a `Conflict` and leaves the entry untouched.
    pub async fn set_kv(&self, key: &str, value: &Value, version: u32) -> Result<()> {
        let body = PutBody {
            scope: &self.scope,
            key,
            value,
            version,
        };
        let response = self
            .send(self.client.http.put(self.base_url.clone()).json(&body))
            .await?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::CONFLICT => Err(FunctionError::conflict("version conflict on set")),
            _ => {
                let body = response.text().await.unwrap_or_default();
                Err(FunctionError::failed(format!("set failed: {body}")))
            }
        }
    }

    /// Read-modify-write `key` with optimistic retries.
    ///
    /// `update` receives the current value (`None` when absent) and may run
    /// several times. Returns the value that was written. Exhausting the
    /// attempt bound on conflicts yields `Transient`.
    pub async fn set<F, E>(&self, key: &str, mut update: F) -> Result<Value>
    where
        F: FnMut(Option<Value>) -> std::result::Result<Value, E>,
        E: Into<FunctionError>,
    {
        for attempt in 1..=self.client.max_set_attempts {
            let (current, version) = match self.get(key).await {
                Ok(entry) => (Some(entry.value), entry.version),
                Err(err) if err.is_not_found() => (None, 0),
                Err(err) => return Err(err),
            };

            let next = update(current).map_err(Into::into)?;
            match self.set_kv(key, &next, version).await {
                Ok(()) => return Ok(next),
                Err(err) if err.is_conflict() => {
                    debug!(key, attempt, version, "state version conflict, retrying");
                }
                Err(err) => return Err(err),
            }
        }

        Err(FunctionError::transient(
            "set failed after max retries due to version conflicts",
        ))
    }

    /// Remove `key` from this scope.
    pub async fn delete(&self, key: &str) -> Result<()> {
        let body = DeleteBody {
            scope: &self.scope,
            key,
        };
        let response = self
            .send(self.client.http.delete(self.base_url.clone()).json(&body))
            .await?;

        if response.status() != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(FunctionError::failed(format!("delete failed: {body}")));
        }
        Ok(())
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let binding = &self.client.binding;
        let request = request
            .header(STATE_TOKEN_HEADER, &binding.token)
            .header(ORGANIZATION_HEADER, &binding.organization_id)
            .header(PROJECT_HEADER, &binding.project_id)
            .header(ENVIRONMENT_HEADER, &binding.environment_id)
            .header(reqwest::header::CONTENT_TYPE, "application/json");

        self.client
            .http
            .send(request, self.client.cancel.as_ref())
            .await
            .map_err(transport_error)
    }
}

fn transport_error(err: HttpError) -> FunctionError {
    match &err {
        HttpError::Request { failure, .. } if failure.is_permanent() => {
            FunctionError::failed(format!("state store request failed: {err}"))
        }
        _ => FunctionError::transient(format!("state store unavailable: {err}")),
    }
}
