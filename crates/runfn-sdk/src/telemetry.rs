// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Process and per-invocation logging.
//!
//! The process log is a stderr `fmt` layer behind an `EnvFilter`. Every
//! invocation additionally gets its own [`Dispatch`] with a second `fmt` layer
//! writing into that invocation's [`ActivityLogWriter`](crate::ActivityLogWriter),
//! so anything the handler logs reaches both sinks.
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: overrides the configured level for both sinks

use std::fmt::Display;

use tracing::dispatcher::{self, Dispatch};
use tracing::subscriber::SetGlobalDefaultError;
use tracing::{Level, Span};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::{EnvFilter, Registry, fmt};

use crate::activity_log::ActivitySink;

fn filter(level: &str) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level))
}

/// Install the process-wide subscriber.
///
/// Fails if a global subscriber is already set.
pub fn init_subscriber(level: &str) -> Result<(), SetGlobalDefaultError> {
    let fmt = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true);

    let subscriber = Registry::default().with(fmt).with(filter(level));
    tracing::subscriber::set_global_default(subscriber)
}

/// Build the dispatch for one invocation.
///
/// Without a sink the dispatch only writes to the process log.
pub fn invocation_dispatch(level: &str, sink: Option<ActivitySink>) -> Dispatch {
    let process = fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true);
    let activity = sink.map(|sink| fmt::layer().with_writer(sink).with_ansi(false).with_target(false));

    let subscriber = Registry::default().with(process).with(activity).with(filter(level));
    Dispatch::new(subscriber)
}

/// Logger handed to function handlers.
///
/// Cheap to clone. Messages are emitted inside the invocation span on the
/// invocation's dispatch, so they reach the activity log even when logged
/// from a task the handler spawned. The activity log is closed when the
/// handler returns; lines logged by clones that outlive the invocation only
/// reach the process log.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
    span: Span,
}

impl Logger {
    pub fn new(dispatch: Dispatch, span: Span) -> Self {
        Self { dispatch, span }
    }

    /// Logger bound to whatever dispatch is current, with no span.
    pub fn current() -> Self {
        Self {
            dispatch: dispatcher::get_default(Dispatch::clone),
            span: Span::none(),
        }
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    pub fn span(&self) -> &Span {
        &self.span
    }

    /// Run `f` with this logger's dispatch and span active, for use with the
    /// `tracing` macros directly.
    pub fn in_scope<T>(&self, f: impl FnOnce() -> T) -> T {
        dispatcher::with_default(&self.dispatch, || self.span.in_scope(f))
    }

    pub fn log(&self, level: Level, message: impl Display) {
        self.in_scope(|| match level {
            Level::TRACE => tracing::trace!("{message}"),
            Level::DEBUG => tracing::debug!("{message}"),
            Level::INFO => tracing::info!("{message}"),
            Level::WARN => tracing::warn!("{message}"),
            _ => tracing::error!("{message}"),
        })
    }

    pub fn debug(&self, message: impl Display) {
        self.log(Level::DEBUG, message)
    }

    pub fn info(&self, message: impl Display) {
        self.log(Level::INFO, message)
    }

    pub fn warn(&self, message: impl Display) {
        self.log(Level::WARN, message)
    }

    pub fn error(&self, message: impl Display) {
        self.log(Level::ERROR, message)
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").field("span", &self.span).finish()
    }
}
