// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function runtime for runfn.
//!
//! A host binary wraps one [`FunctionHandler`] in a [`FunctionServer`]. For
//! every `POST /` the server parses the JSON body, injects the invocation
//! `metadata`, routes the handler's logs to both the process log and the
//! invocation's [`ActivityLogWriter`], and maps the outcome to
//! `200 {"data": ...}` or `500` with a [`FunctionError`] envelope.
//!
//! Handlers reach the remote key-value store through a [`StateClient`]
//! narrowed to an org, project or environment [`StateScope`].
//!
//! # Example
//!
//! ```ignore
//! use runfn_sdk::{FunctionServer, ServerConfig, handler_fn, Response};
//! use tokio_util::sync::CancellationToken;
//!
//! let handler = handler_fn(|_ctx, logger, request| async move {
//!     logger.info("hello");
//!     Ok::<_, anyhow::Error>(Response::new().with("request", request))
//! });
//!
//! let server = FunctionServer::new(ServerConfig::from_env()?, handler)?;
//! server.run(CancellationToken::new()).await?;
//! ```

pub mod activity_log;
pub mod config;
pub mod error;
pub mod handler;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod types;

pub use activity_log::{ActivityLogConfig, ActivityLogError, ActivityLogWriter, ActivitySink};
pub use config::{ConfigError, ServerConfig};
pub use error::{ErrorKind, FunctionError, SdkError, StackFrame, as_function_error};
pub use handler::{FunctionHandler, HandlerFn, InvocationContext, handler_fn};
pub use server::{FunctionServer, Readiness, ReadyResponse, shutdown_signal};
pub use state::{ScopedState, StateBinding, StateClient, StateEntry, StateScope};
pub use telemetry::{Logger, init_subscriber};
pub use types::{Object, ObjectError, Request, Response};

// Re-exported so handlers can use the shared client without a direct dependency.
pub use runfn_http;
