// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The handler seam between the invocation server and user code.

use std::future::Future;

use async_trait::async_trait;
use runfn_http::RetryingClient;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::state::StateClient;
use crate::telemetry::Logger;
use crate::types::{Request, Response};

/// A function hosted by [`FunctionServer`](crate::FunctionServer).
///
/// Return a [`FunctionError`](crate::FunctionError) (directly or wrapped in
/// `anyhow` context) to control how a failure is classified. Any other error
/// is reported as `Failed`.
#[async_trait]
pub trait FunctionHandler: Send + Sync + 'static {
    async fn handle(&self, ctx: InvocationContext, logger: Logger, request: Request) -> anyhow::Result<Response>;
}

/// Adapter returned by [`handler_fn`].
pub struct HandlerFn<F> {
    f: F,
}

/// Use an async closure as a [`FunctionHandler`].
///
/// ```ignore
/// let handler = handler_fn(|_ctx, logger, request| async move {
///     logger.info("hello");
///     Ok::<_, anyhow::Error>(Response::new().with("echo", request))
/// });
/// ```
pub fn handler_fn<F, Fut>(f: F) -> HandlerFn<F>
where
    F: Fn(InvocationContext, Logger, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
{
    HandlerFn { f }
}

#[async_trait]
impl<F, Fut> FunctionHandler for HandlerFn<F>
where
    F: Fn(InvocationContext, Logger, Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<Response>> + Send + 'static,
{
    async fn handle(&self, ctx: InvocationContext, logger: Logger, request: Request) -> anyhow::Result<Response> {
        (self.f)(ctx, logger, request).await
    }
}

/// Per-invocation context handed to a [`FunctionHandler`].
#[derive(Debug, Clone)]
pub struct InvocationContext {
    cancellation: CancellationToken,
    shutdown: CancellationToken,
    http: RetryingClient,
    activity_id: String,
    environment_id: String,
    environment_name: String,
}

impl InvocationContext {
    /// A context with empty identifiers and fresh tokens.
    pub fn new(http: RetryingClient) -> Self {
        Self {
            cancellation: CancellationToken::new(),
            shutdown: CancellationToken::new(),
            http,
            activity_id: String::new(),
            environment_id: String::new(),
            environment_name: String::new(),
        }
    }

    pub fn with_ids(
        mut self,
        activity_id: impl Into<String>,
        environment_id: impl Into<String>,
        environment_name: impl Into<String>,
    ) -> Self {
        self.activity_id = activity_id.into();
        self.environment_id = environment_id.into();
        self.environment_name = environment_name.into();
        self
    }

    /// Set the token that aborts this invocation.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = token;
        self
    }

    /// Set the token that signals the server started shutting down.
    pub fn with_shutdown(mut self, token: CancellationToken) -> Self {
        self.shutdown = token;
        self
    }

    /// Cancelled when the invocation is being terminated.
    ///
    /// The server stops polling the handler right after; long-running work
    /// spawned by the handler should watch this token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// True once the server stopped accepting new invocations.
    ///
    /// In-flight invocations may still run to completion.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    /// Shared outbound client.
    pub fn http(&self) -> &RetryingClient {
        &self.http
    }

    pub fn activity_id(&self) -> &str {
        &self.activity_id
    }

    pub fn environment_id(&self) -> &str {
        &self.environment_id
    }

    pub fn environment_name(&self) -> &str {
        &self.environment_name
    }

    /// State client bound by the request's `metadata`, aborted with this invocation.
    pub fn state(&self, request: &Request) -> Result<StateClient> {
        Ok(StateClient::from_request(request, self.http.clone())?.with_cancellation(self.cancellation.clone()))
    }
}
