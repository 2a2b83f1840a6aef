// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Function error taxonomy and SDK infrastructure errors.
//!
//! Handlers report failures as [`FunctionError`]s, usually wrapped in an
//! `anyhow::Error` so that `?` and `.context()` work as usual. The invocation
//! server classifies whatever comes back with [`as_function_error`], which
//! finds the innermost tagged error anywhere in the `source()` chain.

use std::backtrace::Backtrace;
use std::error::Error as StdError;
use std::fmt;
use std::panic::Location;

use serde::de::{self, Deserializer};
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;

/// Maximum number of frames kept in a captured stack trace.
pub const MAX_STACK_FRAMES: usize = 32;

/// Classification of a terminal function error.
///
/// Serialized as its integer code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ErrorKind {
    #[default]
    Unspecified,
    /// Re-invoke later with the carried data as `previous` context
    ExecuteAgain,
    /// Terminal failure
    Failed,
    /// Safe to retry as a fresh invocation
    Transient,
    /// State-store key absent
    NotFound,
    /// Version mismatch on a state-store write
    Conflict,
}

impl ErrorKind {
    /// Integer code used on the wire.
    pub fn code(&self) -> u8 {
        match self {
            ErrorKind::Unspecified => 0,
            ErrorKind::ExecuteAgain => 1,
            ErrorKind::Failed => 2,
            ErrorKind::Transient => 3,
            ErrorKind::NotFound => 4,
            ErrorKind::Conflict => 5,
        }
    }

    /// Inverse of [`code`](Self::code).
    pub fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => ErrorKind::Unspecified,
            1 => ErrorKind::ExecuteAgain,
            2 => ErrorKind::Failed,
            3 => ErrorKind::Transient,
            4 => ErrorKind::NotFound,
            5 => ErrorKind::Conflict,
            _ => return None,
        })
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Unspecified => "unspecified",
            ErrorKind::ExecuteAgain => "execute_again",
            ErrorKind::Failed => "failed",
            ErrorKind::Transient => "transient",
            ErrorKind::NotFound => "not_found",
            ErrorKind::Conflict => "conflict",
        };
        f.write_str(name)
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.code())
    }
}

impl<'de> Deserialize<'de> for ErrorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let code = u8::deserialize(deserializer)?;
        ErrorKind::from_code(code).ok_or_else(|| de::Error::custom(format!("unknown error code {code}")))
    }
}

/// One frame of a captured stack trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StackFrame {
    pub file: String,
    pub line: u32,
    pub function: String,
}

/// The error envelope returned to callers of a function.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{message}")]
pub struct FunctionError {
    #[serde(rename = "error_code", alias = "code")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<Vec<StackFrame>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Map<String, Value>>,
}

impl FunctionError {
    /// Build an error of the given kind with no trace or data.
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            stack_trace: None,
            data: None,
        }
    }

    /// Ask the orchestrator to invoke the function again with `data` as `previous`.
    pub fn execute_again(message: impl Into<String>, data: Option<Map<String, Value>>) -> Self {
        Self {
            data,
            ..Self::new(ErrorKind::ExecuteAgain, message)
        }
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Transient, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn conflict(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Conflict, message)
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failed, message)
    }

    /// A `Failed` error carrying the current call stack.
    ///
    /// Reserved for panics and errors nobody classified.
    #[track_caller]
    pub fn failed_with_trace(message: impl Into<String>) -> Self {
        let caller = Location::caller();
        Self {
            stack_trace: Some(capture_stack(caller)),
            ..Self::new(ErrorKind::Failed, message)
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn is_execute_again(&self) -> bool {
        self.kind == ErrorKind::ExecuteAgain
    }

    pub fn is_transient(&self) -> bool {
        self.kind == ErrorKind::Transient
    }

    pub fn is_not_found(&self) -> bool {
        self.kind == ErrorKind::NotFound
    }

    pub fn is_conflict(&self) -> bool {
        self.kind == ErrorKind::Conflict
    }

    pub fn is_failed(&self) -> bool {
        self.kind == ErrorKind::Failed
    }

    /// Prefix the message with `context`, keeping kind, trace and data.
    pub fn context(mut self, context: impl fmt::Display) -> Self {
        self.message = format!("{context}: {}", self.message);
        self
    }

    /// Attach a data payload.
    pub fn with_data(mut self, data: Map<String, Value>) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<serde_json::Error> for FunctionError {
    fn from(err: serde_json::Error) -> Self {
        FunctionError::failed(err.to_string())
    }
}

impl From<anyhow::Error> for FunctionError {
    fn from(err: anyhow::Error) -> Self {
        as_function_error(err.as_ref())
    }
}

/// Find the first [`FunctionError`] in an error's `source()` chain.
pub fn find_function_error<'a>(err: &'a (dyn StdError + 'static)) -> Option<&'a FunctionError> {
    let mut current = Some(err);
    while let Some(e) = current {
        if let Some(found) = e.downcast_ref::<FunctionError>() {
            return Some(found);
        }
        current = e.source();
    }
    None
}

/// Kind of the first tagged error in the chain, if any.
pub fn kind_of(err: &(dyn StdError + 'static)) -> Option<ErrorKind> {
    find_function_error(err).map(FunctionError::kind)
}

pub fn is_execute_again(err: &(dyn StdError + 'static)) -> bool {
    kind_of(err) == Some(ErrorKind::ExecuteAgain)
}

pub fn is_transient(err: &(dyn StdError + 'static)) -> bool {
    kind_of(err) == Some(ErrorKind::Transient)
}

pub fn is_not_found(err: &(dyn StdError + 'static)) -> bool {
    kind_of(err) == Some(ErrorKind::NotFound)
}

pub fn is_conflict(err: &(dyn StdError + 'static)) -> bool {
    kind_of(err) == Some(ErrorKind::Conflict)
}

pub fn is_failed(err: &(dyn StdError + 'static)) -> bool {
    kind_of(err) == Some(ErrorKind::Failed)
}

/// Extract or synthesize the envelope for any error.
///
/// The message is the rendered chain down to the tagged error, so context
/// added by wrappers survives. Untagged errors become `Failed`.
pub fn as_function_error(err: &(dyn StdError + 'static)) -> FunctionError {
    let mut message = String::new();
    let mut current = Some(err);
    while let Some(e) = current {
        let segment = e.to_string();
        // thiserror-style wrappers often already print their source
        if !message.ends_with(&segment) {
            if !message.is_empty() {
                message.push_str(": ");
            }
            message.push_str(&segment);
        }
        if let Some(found) = e.downcast_ref::<FunctionError>() {
            return FunctionError {
                message,
                ..found.clone()
            };
        }
        current = e.source();
    }
    FunctionError::failed(message)
}

fn capture_stack(caller: &'static Location<'static>) -> Vec<StackFrame> {
    let rendered = Backtrace::force_capture().to_string();
    let mut frames = parse_backtrace(&rendered);
    if frames.is_empty() {
        frames.push(StackFrame {
            file: caller.file().to_string(),
            line: caller.line(),
            function: "<unknown>".to_string(),
        });
    }
    frames
}

/// Parse the std backtrace rendering:
///
/// ```text
///    3: runfn_sdk::server::invoke
///              at ./crates/runfn-sdk/src/server.rs:120:9
/// ```
fn parse_backtrace(rendered: &str) -> Vec<StackFrame> {
    let mut frames: Vec<StackFrame> = Vec::new();
    for line in rendered.lines() {
        let trimmed = line.trim();
        if let Some(location) = trimmed.strip_prefix("at ") {
            if let Some(frame) = frames.last_mut()
                && frame.file.is_empty()
            {
                let (file, line) = split_location(location);
                frame.file = file;
                frame.line = line;
            }
            continue;
        }

        let Some((index, function)) = trimmed.split_once(": ") else {
            continue;
        };
        if index.parse::<usize>().is_err() || is_capture_frame(function) {
            continue;
        }
        if frames.len() == MAX_STACK_FRAMES {
            break;
        }
        frames.push(StackFrame {
            file: String::new(),
            line: 0,
            function: function.to_string(),
        });
    }
    frames
}

fn is_capture_frame(function: &str) -> bool {
    function.starts_with("std::backtrace")
        || function.starts_with("<std::backtrace")
        || function.contains("capture_stack")
        || function.contains("failed_with_trace")
}

fn split_location(location: &str) -> (String, u32) {
    // file:line:column
    let mut parts = location.rsplitn(3, ':');
    let _column = parts.next();
    let line = parts.next().and_then(|l| l.parse().ok());
    match (line, parts.next()) {
        (Some(line), Some(file)) => (file.to_string(), line),
        _ => (location.to_string(), 0),
    }
}

/// Errors from the SDK's own infrastructure (binding, serving, configuration).
#[derive(Debug, Error)]
pub enum SdkError {
    /// Configuration error (missing or invalid setting)
    #[error("configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    /// Outbound client could not be built
    #[error("http client error: {0}")]
    Http(#[from] runfn_http::HttpError),

    /// Listener could not be bound or the server failed while serving
    #[error("server error: {0}")]
    Io(#[from] std::io::Error),
}

/// Type alias for state and SDK operations that fail with a classified error.
pub type Result<T, E = FunctionError> = std::result::Result<T, E>;
