// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! HTTP server hosting a single [`FunctionHandler`].
//!
//! Routes:
//! - `POST /` invokes the handler. `200 {"data": ...}` on success, `500` with
//!   the [`FunctionError`] envelope on failure, `400 Invalid input` when the
//!   body is not a JSON object.
//! - `GET /_/ready` reports `{"ready": bool, "num_connections": int}`.
//!
//! Shutdown is driven by a [`CancellationToken`]. Cancelling it drops
//! readiness to zero, stops accepting connections and lets in-flight
//! invocations finish. Invocations still running after `shutdown_timeout`
//! are terminated and answered with a `Transient` error.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicI32, Ordering};
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response as HttpResponse};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::FutureExt;
use runfn_http::RetryingClient;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::instrument::WithSubscriber;
use tracing::{Instrument, dispatcher, error, info, info_span, instrument, warn};

use crate::activity_log::ActivityLogWriter;
use crate::config::ServerConfig;
use crate::error::{FunctionError, SdkError, find_function_error};
use crate::handler::{FunctionHandler, InvocationContext};
use crate::telemetry::{Logger, invocation_dispatch};
use crate::types::*;

/// Shared "accepting connections" flag of one server instance.
#[derive(Debug, Clone, Default)]
pub struct Readiness {
    accepting: Arc<AtomicI32>,
}

impl Readiness {
    pub fn is_ready(&self) -> bool {
        self.connections() > 0
    }

    /// 1 while the listener accepts connections, 0 otherwise.
    pub fn connections(&self) -> i32 {
        self.accepting.load(Ordering::SeqCst)
    }

    fn set_accepting(&self, accepting: bool) {
        self.accepting.store(i32::from(accepting), Ordering::SeqCst);
    }
}

/// Body of `GET /_/ready`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub num_connections: i32,
}

#[derive(Serialize)]
struct SuccessBody {
    data: Response,
}

#[derive(Clone)]
struct AppState {
    config: Arc<ServerConfig>,
    handler: Arc<dyn FunctionHandler>,
    http: RetryingClient,
    readiness: Readiness,
    shutdown: CancellationToken,
    terminate: CancellationToken,
}

/// Serves one [`FunctionHandler`] over HTTP.
pub struct FunctionServer {
    state: AppState,
}

impl FunctionServer {
    /// Create a server with an outbound client built from `config`.
    pub fn new(config: ServerConfig, handler: impl FunctionHandler) -> Result<Self, SdkError> {
        let http = RetryingClient::new(config.http_client_config())?;
        Ok(Self {
            state: AppState {
                config: Arc::new(config),
                handler: Arc::new(handler),
                http,
                readiness: Readiness::default(),
                shutdown: CancellationToken::new(),
                terminate: CancellationToken::new(),
            },
        })
    }

    /// Replace the outbound client used for activity logs and state access.
    pub fn with_http_client(mut self, client: RetryingClient) -> Self {
        self.state.http = client;
        self
    }

    pub fn config(&self) -> &ServerConfig {
        &self.state.config
    }

    /// Handle on this server's readiness flag.
    pub fn readiness(&self) -> Readiness {
        self.state.readiness.clone()
    }

    /// The router without a listener, for embedding or in-process tests.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/", post(invoke))
            .route("/_/ready", get(ready))
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// Bind `config.port` on all interfaces and serve until `shutdown` is cancelled.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), SdkError> {
        let listener = TcpListener::bind(self.state.config.listen_addr()).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on `listener` until `shutdown` is cancelled and in-flight
    /// invocations have completed or been terminated.
    #[instrument(name = "function_server", skip_all)]
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<(), SdkError> {
        let addr = listener.local_addr()?;

        let router = self.router();
        let state = self.state;

        // Before the watcher starts, so an early cancellation always wins
        state.readiness.set_accepting(true);
        let watcher = tokio::spawn(watch_shutdown(
            shutdown.clone(),
            state.shutdown.clone(),
            state.terminate.clone(),
            state.readiness.clone(),
            state.config.shutdown_timeout,
        ));

        info!(addr = %addr, "function server listening");

        let signal = state.shutdown.clone();
        let served = axum::serve(listener, router)
            .with_graceful_shutdown(async move { signal.cancelled().await })
            .await;

        // Covers the case where serving failed before shutdown was requested
        state.readiness.set_accepting(false);
        watcher.abort();

        served?;
        info!("function server stopped");
        Ok(())
    }
}

/// Resolves on SIGINT or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(error = %err, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received SIGINT, shutting down"),
        _ = terminate => info!("received SIGTERM, shutting down"),
    }
}

async fn watch_shutdown(
    root: CancellationToken,
    shutdown: CancellationToken,
    terminate: CancellationToken,
    readiness: Readiness,
    grace: Duration,
) {
    root.cancelled().await;
    readiness.set_accepting(false);
    info!(grace = ?grace, "shutdown requested, draining in-flight invocations");
    shutdown.cancel();

    tokio::time::sleep(grace).await;
    warn!("shutdown grace period elapsed, terminating in-flight invocations");
    terminate.cancel();
}

async fn ready(State(state): State<AppState>) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        ready: state.readiness.is_ready(),
        num_connections: state.readiness.connections(),
    })
}

fn invalid_input() -> HttpResponse {
    (StatusCode::BAD_REQUEST, "Invalid input").into_response()
}

/// Decode an invocation body. Empty and `null` bodies become an empty object.
fn parse_request(body: &[u8]) -> Option<Request> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Some(Request::new());
    }
    match serde_json::from_slice::<Value>(body).ok()? {
        Value::Null => Some(Request::new()),
        value => Request::try_from(value).ok(),
    }
}

/// Identifiers and endpoints carried by the invocation headers.
#[derive(Debug, Default)]
struct InvocationHeaders {
    activity_id: String,
    environment_id: String,
    environment_name: String,
    workflow_token: Option<String>,
    engine_endpoint: Option<String>,
    upload_path: Option<String>,
    state_store_url: Option<String>,
    state_store_token: Option<String>,
    organization_id: Option<String>,
    project_id: Option<String>,
}

impl InvocationHeaders {
    fn from_headers(headers: &HeaderMap) -> Self {
        let value = |name: &str| {
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
        };

        Self {
            activity_id: value(ACTIVITY_ID_HEADER).unwrap_or_default(),
            environment_id: value(ENVIRONMENT_ID_HEADER).unwrap_or_default(),
            environment_name: value(ENVIRONMENT_NAME_HEADER).unwrap_or_default(),
            workflow_token: value(WORKFLOW_TOKEN_HEADER),
            engine_endpoint: value(ENGINE_ENDPOINT_HEADER),
            upload_path: value(ACTIVITY_FILE_UPLOAD_HEADER),
            state_store_url: value(STATE_STORE_URL_HEADER),
            state_store_token: value(STATE_STORE_TOKEN_HEADER),
            organization_id: value(ORGANIZATION_ID_HEADER),
            project_id: value(PROJECT_ID_HEADER),
        }
    }

    /// The reserved `metadata` object; replaces anything the caller sent.
    fn metadata(&self) -> Map<String, Value> {
        let mut meta = Map::new();
        meta.insert(META_ACTIVITY_ID.into(), self.activity_id.clone().into());
        meta.insert(META_ENVIRONMENT_ID.into(), self.environment_id.clone().into());
        meta.insert(META_ENVIRONMENT_NAME.into(), self.environment_name.clone().into());

        let optional = [
            (META_STATE_STORE_URL, &self.state_store_url),
            (META_STATE_STORE_TOKEN, &self.state_store_token),
            (META_ORGANIZATION_ID, &self.organization_id),
            (META_PROJECT_ID, &self.project_id),
        ];
        for (key, value) in optional {
            if let Some(value) = value {
                meta.insert(key.into(), value.clone().into());
            }
        }
        meta
    }

    /// Collector URL for this invocation's activity log.
    fn activity_log_url(&self) -> Option<String> {
        let endpoint = self.engine_endpoint.as_deref()?;
        Some(match self.upload_path.as_deref() {
            Some(path) => format!("{}/{}", endpoint.trim_end_matches('/'), path.trim_start_matches('/')),
            None => endpoint.to_string(),
        })
    }
}

async fn invoke(State(state): State<AppState>, headers: HeaderMap, body: Body) -> HttpResponse {
    let config = &state.config;
    let bytes = match tokio::time::timeout(config.read_timeout, to_bytes(body, config.max_body_bytes)).await {
        Ok(Ok(bytes)) => bytes,
        Ok(Err(err)) => {
            warn!(error = %err, "error reading request body");
            return invalid_input();
        }
        Err(_) => {
            warn!(timeout = ?config.read_timeout, "timed out reading request body");
            return (StatusCode::REQUEST_TIMEOUT, "Request timeout").into_response();
        }
    };

    let Some(mut request) = parse_request(&bytes) else {
        return invalid_input();
    };

    let invocation = InvocationHeaders::from_headers(&headers);
    request.insert(METADATA_KEY.to_string(), Value::Object(invocation.metadata()));

    let writer = invocation.activity_log_url().and_then(|url| {
        ActivityLogWriter::with_client(
            &url,
            invocation.workflow_token.clone(),
            config.activity_log_config(),
            state.http.clone(),
        )
        .map_err(|err| warn!(error = %err, "activity log disabled for this invocation"))
        .ok()
    });

    let dispatch = invocation_dispatch(&config.log_level, writer.as_ref().map(ActivityLogWriter::sink));
    let span = dispatcher::with_default(&dispatch, || {
        info_span!(
            "invocation",
            activity_id = %invocation.activity_id,
            environment_id = %invocation.environment_id,
            environment_name = %invocation.environment_name,
        )
    });
    let logger = Logger::new(dispatch, span);
    logger.info("invoking function");

    let ctx = InvocationContext::new(state.http.clone())
        .with_ids(
            invocation.activity_id.clone(),
            invocation.environment_id.clone(),
            invocation.environment_name.clone(),
        )
        .with_cancellation(state.terminate.child_token())
        .with_shutdown(state.shutdown.clone());

    // Runs detached from the connection: a caller hanging up must not skip the final flush
    let activity_id = invocation.activity_id;
    let task = tokio::spawn(async move {
        let result = run_handler(&state, ctx, logger, request).await;

        // Flush outside the invocation dispatch so upload diagnostics stay out of the activity log
        if let Some(writer) = writer
            && let Err(err) = writer.close().await
        {
            warn!(error = %err, activity_id = %activity_id, "error closing activity log");
        }
        result
    });

    let result = task.await.unwrap_or_else(|err| {
        error!(error = %err, "invocation task failed");
        Err(FunctionError::transient("invocation aborted"))
    });

    match result {
        Ok(data) => (StatusCode::OK, Json(SuccessBody { data })).into_response(),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(err)).into_response(),
    }
}

async fn run_handler(
    state: &AppState,
    ctx: InvocationContext,
    logger: Logger,
    request: Request,
) -> Result<Response, FunctionError> {
    let cancel = ctx.cancellation().clone();
    let deadline = state.config.write_timeout;
    let handler = state.handler.clone();
    let log = logger.clone();

    let call = AssertUnwindSafe(async move { handler.handle(ctx, logger, request).await })
        .catch_unwind()
        .instrument(log.span().clone())
        .with_subscriber(log.dispatch().clone());

    tokio::select! {
        biased;

        _ = cancel.cancelled() => {
            log.warn("function terminated during shutdown");
            Err(FunctionError::transient("function terminated: server shutting down"))
        }
        outcome = tokio::time::timeout(deadline, call) => match outcome {
            Err(_) => {
                log.warn(format_args!("function exceeded its deadline of {deadline:?}"));
                Err(FunctionError::transient(format!("function timed out after {deadline:?}")))
            }
            Ok(Err(panic)) => {
                let message = panic_message(panic.as_ref());
                log.in_scope(|| error!(panic = %message, "panic in function"));
                Err(FunctionError::failed_with_trace(format!("Panic in function: {message}")))
            }
            Ok(Ok(Ok(response))) => Ok(response),
            Ok(Ok(Err(err))) => {
                let envelope = into_envelope(err);
                log.in_scope(|| error!(code = envelope.kind.code(), error = %envelope.message, "function returned an error"));
                Err(envelope)
            }
        }
    }
}

/// Classify a handler error. Errors nobody tagged also get a stack trace.
fn into_envelope(err: anyhow::Error) -> FunctionError {
    let tagged = find_function_error(err.as_ref()).is_some();
    let envelope = FunctionError::from(err);
    if tagged {
        envelope
    } else {
        FunctionError::failed_with_trace(envelope.message)
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        (*message).to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
