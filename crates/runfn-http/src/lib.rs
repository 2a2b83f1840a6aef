// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Shared outbound HTTP client for runfn.
//!
//! One [`RetryingClient`] is built per process and cloned into every component
//! that talks to the outside world (the activity log uploader, the state
//! client, user handlers). It wraps a pooled `reqwest::Client` with a retry
//! loop that only looks at transport failures:
//!
//! | Failure | Retried |
//! |---------|---------|
//! | connection refused / reset, DNS, timeouts | yes, up to `max_retries` |
//! | too many redirects | no |
//! | unsupported URL scheme | no |
//! | untrusted server certificate | no |
//! | caller token cancelled | no |
//!
//! HTTP status codes are returned to the caller untouched.
//!
//! # Example
//!
//! ```ignore
//! use runfn_http::{HttpClientConfig, RetryingClient};
//!
//! let client = RetryingClient::new(HttpClientConfig::new(3))?;
//! let response = client.send(client.get("https://example.com"), None).await?;
//! ```

mod client;
mod config;
mod error;
mod retry;

pub use client::RetryingClient;
pub use config::HttpClientConfig;
pub use error::{HttpError, Result};
pub use retry::{
    Backoff, DefaultRetryPolicy, ExponentialBackoff, RetryConfig, RetryPolicy, TransportFailure,
    classify, classify_message,
};

// Re-exported so callers can build requests without a direct reqwest dependency.
pub use reqwest;
