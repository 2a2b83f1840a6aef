// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Error types for the retrying client.

use thiserror::Error;

use crate::retry::{TransportFailure, classify};

/// Errors produced by [`RetryingClient`](crate::RetryingClient).
#[derive(Debug, Error)]
pub enum HttpError {
    /// The underlying client could not be constructed (bad CA bundle, bad proxy URL, ...)
    #[error("failed to build http client: {0}")]
    Build(#[source] reqwest::Error),

    /// The request failed at the transport level and was not (or no longer) retried
    #[error("request failed after {attempts} attempt(s): {source}")]
    Request {
        /// Number of attempts made, including the first one
        attempts: u32,
        /// Classification of the final transport failure
        failure: TransportFailure,
        /// The last transport error
        #[source]
        source: reqwest::Error,
    },

    /// The caller's cancellation token fired before a response arrived
    #[error("request cancelled after {attempts} attempt(s)")]
    Cancelled {
        /// Number of attempts started before cancellation
        attempts: u32,
    },
}

impl HttpError {
    pub(crate) fn request(attempts: u32, source: reqwest::Error) -> Self {
        HttpError::Request {
            attempts,
            failure: classify(&source),
            source,
        }
    }

    /// Number of attempts made before giving up. Zero for build errors.
    pub fn attempts(&self) -> u32 {
        match self {
            HttpError::Build(_) => 0,
            HttpError::Request { attempts, .. } | HttpError::Cancelled { attempts } => *attempts,
        }
    }

    /// Transport failure class, if the error came from a sent request.
    pub fn failure(&self) -> Option<TransportFailure> {
        match self {
            HttpError::Request { failure, .. } => Some(*failure),
            _ => None,
        }
    }

    /// Whether the error is a timeout, either from the client or a caller deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self.failure(), Some(TransportFailure::Timeout))
    }
}

/// Type alias for client results.
pub type Result<T> = std::result::Result<T, HttpError>;
