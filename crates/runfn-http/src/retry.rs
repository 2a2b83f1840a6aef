// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry policy, backoff and transport failure classification.
//!
//! Only transport failures are considered here. HTTP status codes are never
//! inspected: a 500 from the remote side is a response, and what to do with it
//! is the caller's decision.

use std::error::Error as StdError;
use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use once_cell::sync::Lazy;
use regex::Regex;

static BAD_SCHEME: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)URL scheme is not allowed|unsupported protocol scheme").expect("valid regex")
});

static UNTRUSTED_CERT: Lazy<Regex> = Lazy::new(|| {
    Regex::new(
        r"(?i)invalid peer certificate|unknown ?issuer|certificate verify failed|self[- ]signed certificate|certificate is not trusted|certificate signed by unknown authority",
    )
    .expect("valid regex")
});

/// Classification of a failed request attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportFailure {
    /// The redirect limit was exceeded
    TooManyRedirects,
    /// The URL scheme is not http or https
    UnsupportedScheme,
    /// The server certificate was not trusted
    UntrustedCertificate,
    /// The request could not be built (bad header value, malformed URL, ...)
    InvalidRequest,
    /// Connect or overall request timeout
    Timeout,
    /// Connection could not be established (refused, reset, DNS)
    Connect,
    /// Anything else at the transport level
    Other,
}

impl TransportFailure {
    /// Permanent failures are configuration or programmer errors that will
    /// fail identically on every attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            TransportFailure::TooManyRedirects
                | TransportFailure::UnsupportedScheme
                | TransportFailure::UntrustedCertificate
                | TransportFailure::InvalidRequest
        )
    }
}

/// Classify a message from anywhere in an error chain.
///
/// Returns `None` when the message carries no recognizable permanent failure.
pub fn classify_message(message: &str) -> Option<TransportFailure> {
    if BAD_SCHEME.is_match(message) {
        Some(TransportFailure::UnsupportedScheme)
    } else if UNTRUSTED_CERT.is_match(message) {
        Some(TransportFailure::UntrustedCertificate)
    } else {
        None
    }
}

/// Classify a reqwest transport error.
pub fn classify(err: &reqwest::Error) -> TransportFailure {
    if err.is_redirect() {
        return TransportFailure::TooManyRedirects;
    }
    if let Some(url) = err.url()
        && !matches!(url.scheme(), "http" | "https")
    {
        return TransportFailure::UnsupportedScheme;
    }

    // TLS errors are reported as connect errors, so walk the chain before
    // falling back to the coarse reqwest flags.
    let mut source: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(current) = source {
        if let Some(failure) = classify_message(&current.to_string()) {
            return failure;
        }
        source = current.source();
    }

    if err.is_builder() {
        TransportFailure::InvalidRequest
    } else if err.is_timeout() {
        TransportFailure::Timeout
    } else if err.is_connect() {
        TransportFailure::Connect
    } else {
        TransportFailure::Other
    }
}

/// Decides whether a failed attempt should be retried.
pub trait RetryPolicy: Send + Sync + Debug {
    /// `cancelled` is true when the caller's token has fired or its deadline passed.
    fn should_retry(&self, cancelled: bool, failure: &TransportFailure) -> bool;
}

/// Retries every transport failure except permanent ones, and never after cancellation.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultRetryPolicy;

impl RetryPolicy for DefaultRetryPolicy {
    fn should_retry(&self, cancelled: bool, failure: &TransportFailure) -> bool {
        !cancelled && !failure.is_permanent()
    }
}

/// Computes the wait before a retry.
pub trait Backoff: Send + Sync + Debug {
    /// `attempt` is 1 for the first retry.
    fn delay(&self, attempt: u32, min: Duration, max: Duration) -> Duration;
}

/// Exponential backoff: `min * 2^(attempt-1)`, capped at `max`.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExponentialBackoff;

impl Backoff for ExponentialBackoff {
    fn delay(&self, attempt: u32, min: Duration, max: Duration) -> Duration {
        let multiplier = 2u32.saturating_pow(attempt.saturating_sub(1));
        min.saturating_mul(multiplier).min(max)
    }
}

/// Retry settings for the shared client.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt (0 = no retries).
    pub max_retries: u32,
    /// Shortest wait between attempts (default: 100ms)
    pub min_wait: Duration,
    /// Longest wait between attempts (default: 5s)
    pub max_wait: Duration,
    /// Backoff curve (default: exponential)
    pub backoff: Arc<dyn Backoff>,
    /// Retry predicate (default: [`DefaultRetryPolicy`])
    pub policy: Arc<dyn RetryPolicy>,
}

impl RetryConfig {
    /// Create a retry configuration with the default waits and policy.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    /// Set the minimum and maximum wait.
    pub fn with_wait(mut self, min_wait: Duration, max_wait: Duration) -> Self {
        self.min_wait = min_wait;
        self.max_wait = max_wait;
        self
    }

    /// Replace the backoff curve.
    pub fn with_backoff(mut self, backoff: impl Backoff + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    /// Replace the retry predicate.
    pub fn with_policy(mut self, policy: impl RetryPolicy + 'static) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    /// Wait before the given retry (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        self.backoff.delay(attempt, self.min_wait, self.max_wait)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 0,
            min_wait: Duration::from_millis(100),
            max_wait: Duration::from_secs(5),
            backoff: Arc::new(ExponentialBackoff),
            policy: Arc::new(DefaultRetryPolicy),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_permanent_failures_never_retried() {
        let policy = DefaultRetryPolicy;
        for failure in [
            TransportFailure::TooManyRedirects,
            TransportFailure::UnsupportedScheme,
            TransportFailure::UntrustedCertificate,
            TransportFailure::InvalidRequest,
        ] {
            assert!(!policy.should_retry(false, &failure), "{failure:?}");
        }
    }

    #[test]
    fn test_transient_failures_retried_unless_cancelled() {
        let policy = DefaultRetryPolicy;
        for failure in [
            TransportFailure::Timeout,
            TransportFailure::Connect,
            TransportFailure::Other,
        ] {
            assert!(policy.should_retry(false, &failure));
            assert!(!policy.should_retry(true, &failure));
        }
    }

    #[test]
    fn test_classify_certificate_messages() {
        assert_eq!(
            classify_message("invalid peer certificate: UnknownIssuer"),
            Some(TransportFailure::UntrustedCertificate)
        );
        assert_eq!(
            classify_message("x509: certificate signed by unknown authority"),
            Some(TransportFailure::UntrustedCertificate)
        );
        assert_eq!(
            classify_message("error:0A000086:SSL routines::certificate verify failed"),
            Some(TransportFailure::UntrustedCertificate)
        );
    }

    #[test]
    fn test_classify_scheme_messages() {
        assert_eq!(
            classify_message("URL scheme is not allowed"),
            Some(TransportFailure::UnsupportedScheme)
        );
        assert_eq!(
            classify_message("unsupported protocol scheme \"ftp\""),
            Some(TransportFailure::UnsupportedScheme)
        );
        assert_eq!(classify_message("connection refused"), None);
    }

    #[test]
    fn test_exponential_backoff() {
        let config = RetryConfig::new(5).with_wait(Duration::from_millis(100), Duration::from_millis(350));

        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        // Capped at max_wait
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(40), Duration::from_millis(350));
    }

    #[test]
    fn test_retry_config_default() {
        let config = RetryConfig::default();
        assert_eq!(config.max_retries, 0);
        assert_eq!(config.min_wait, Duration::from_millis(100));
        assert_eq!(config.max_wait, Duration::from_secs(5));
    }
}
