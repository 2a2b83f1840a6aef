// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared fixtures for runfn-sdk integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use axum::extract::{Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use runfn_sdk::state::STATE_TOKEN_HEADER;
use runfn_sdk::{FunctionHandler, FunctionServer, Readiness, SdkError, ServerConfig, StateScope};
use serde::Deserialize;
use serde_json::{Value, json};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Serve `router` on an ephemeral local port.
pub async fn spawn_router(router: Router) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    addr
}

/// A URL on a port nothing listens on.
pub async fn refused_url() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);
    format!("http://{addr}/kv")
}

// ============================================================================
// Fake state store with real version gating
// ============================================================================

type EntryKey = (String, String);

#[derive(Clone)]
pub struct FakeStateStore {
    token: String,
    entries: Arc<Mutex<HashMap<EntryKey, (Value, u32)>>>,
}

#[derive(Deserialize)]
struct GetParams {
    organization_id: String,
    key: String,
    project_id: Option<String>,
    environment_id: Option<String>,
}

#[derive(Deserialize)]
struct PutBody {
    scope: StateScope,
    key: String,
    value: Value,
    version: u32,
}

#[derive(Deserialize)]
struct DeleteBody {
    scope: StateScope,
    key: String,
}

impl FakeStateStore {
    /// Start the store and return it with its base URL.
    pub async fn start(token: &str) -> (Self, String) {
        let store = Self {
            token: token.to_string(),
            entries: Arc::default(),
        };
        let router = Router::new()
            .route("/kv", get(get_entry).put(put_entry).delete(delete_entry))
            .with_state(store.clone());
        let addr = spawn_router(router).await;
        (store, format!("http://{addr}/kv"))
    }

    /// Stored value and version of `key` in `scope`.
    pub fn entry(&self, scope: &StateScope, key: &str) -> Option<(Value, u32)> {
        self.entries
            .lock()
            .unwrap()
            .get(&(scope_key(scope), key.to_string()))
            .cloned()
    }

    fn authorized(&self, headers: &HeaderMap) -> bool {
        headers
            .get(STATE_TOKEN_HEADER)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == self.token)
    }
}

fn scope_key(scope: &StateScope) -> String {
    serde_json::to_string(scope).unwrap()
}

async fn get_entry(
    State(store): State<FakeStateStore>,
    headers: HeaderMap,
    Query(params): Query<GetParams>,
) -> Response {
    if !store.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "bad token").into_response();
    }
    let scope = StateScope {
        organization_id: params.organization_id,
        project_id: params.project_id,
        environment_id: params.environment_id,
    };
    match store.entry(&scope, &params.key) {
        Some((value, version)) => Json(json!({"value": value, "version": version})).into_response(),
        None => (StatusCode::NOT_FOUND, "not found").into_response(),
    }
}

async fn put_entry(State(store): State<FakeStateStore>, headers: HeaderMap, Json(body): Json<PutBody>) -> Response {
    if !store.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "bad token").into_response();
    }
    let mut entries = store.entries.lock().unwrap();
    let key = (scope_key(&body.scope), body.key);
    let current = entries.get(&key).map(|(_, version)| *version).unwrap_or(0);
    if current != body.version {
        return (StatusCode::CONFLICT, "version conflict").into_response();
    }
    entries.insert(key, (body.value, current + 1));
    StatusCode::OK.into_response()
}

async fn delete_entry(
    State(store): State<FakeStateStore>,
    headers: HeaderMap,
    Json(body): Json<DeleteBody>,
) -> Response {
    if !store.authorized(&headers) {
        return (StatusCode::UNAUTHORIZED, "bad token").into_response();
    }
    store
        .entries
        .lock()
        .unwrap()
        .remove(&(scope_key(&body.scope), body.key));
    StatusCode::OK.into_response()
}

// ============================================================================
// Log collector helpers
// ============================================================================

/// Split a multipart request into its first part's headers and content.
pub fn multipart_part(request: &wiremock::Request) -> (String, Vec<u8>) {
    let content_type = request
        .headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap()
        .to_string();
    let boundary = content_type
        .split("boundary=")
        .nth(1)
        .unwrap()
        .trim_matches('"')
        .to_string();

    let body = &request.body;
    let opening = format!("--{boundary}\r\n");
    let start = find(body, opening.as_bytes()).unwrap() + opening.len();
    let headers_end = start + find(&body[start..], b"\r\n\r\n").unwrap();
    let content_start = headers_end + 4;
    let closing = format!("\r\n--{boundary}");
    let content_end = content_start + find(&body[content_start..], closing.as_bytes()).unwrap();

    let headers = String::from_utf8_lossy(&body[start..headers_end]).to_string();
    (headers, body[content_start..content_end].to_vec())
}

/// Content of every upload received so far, in arrival order.
pub async fn uploaded_contents(server: &wiremock::MockServer) -> Vec<Vec<u8>> {
    server
        .received_requests()
        .await
        .unwrap_or_default()
        .iter()
        .map(|request| multipart_part(request).1)
        .collect()
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|window| window == needle)
}

// ============================================================================
// Function server harness
// ============================================================================

pub struct TestServer {
    pub addr: SocketAddr,
    pub shutdown: CancellationToken,
    pub readiness: Readiness,
    pub handle: JoinHandle<Result<(), SdkError>>,
}

impl TestServer {
    pub async fn start(config: ServerConfig, handler: impl FunctionHandler) -> Self {
        let server = FunctionServer::new(config, handler).unwrap();
        let readiness = server.readiness();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(server.serve(listener, shutdown.clone()));

        Self {
            addr,
            shutdown,
            readiness,
            handle,
        }
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}
