// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! The shared retrying client.

use std::future::Future;
use std::sync::Arc;

use reqwest::{Body, Certificate, IntoUrl, Proxy, Request, RequestBuilder, Response};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::{HttpClientConfig, SharedResolver};
use crate::error::{HttpError, Result};
use crate::retry::{RetryConfig, classify};

/// Process-wide outbound HTTP client.
///
/// Cloning is cheap: clones share the connection pool and the retry settings.
#[derive(Debug, Clone)]
pub struct RetryingClient {
    inner: reqwest::Client,
    retry: Arc<RetryConfig>,
}

impl RetryingClient {
    /// Build a client from the given configuration.
    pub fn new(config: HttpClientConfig) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .tcp_keepalive(config.keep_alive)
            .pool_idle_timeout(config.idle_timeout)
            .pool_max_idle_per_host(config.max_idle_connections)
            .danger_accept_invalid_certs(config.tls_skip_verify);

        if let Some(timeout) = config.request_timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(pem) = &config.ca_cert_pem {
            builder = builder.add_root_certificate(Certificate::from_pem(pem).map_err(HttpError::Build)?);
        }
        if let Some(proxy) = &config.proxy {
            builder = builder.proxy(Proxy::all(proxy.as_str()).map_err(HttpError::Build)?);
        }
        if let Some(resolver) = config.dns_resolver {
            builder = builder.dns_resolver(Arc::new(SharedResolver(resolver)));
        }
        if config.tls_skip_verify {
            warn!("TLS certificate verification is disabled for outbound requests");
        }

        Ok(Self {
            inner: builder.build().map_err(HttpError::Build)?,
            retry: Arc::new(config.retry),
        })
    }

    /// The underlying reqwest client, for requests that must bypass retries.
    pub fn inner(&self) -> &reqwest::Client {
        &self.inner
    }

    /// Retry settings in effect.
    pub fn retry_config(&self) -> &RetryConfig {
        &self.retry
    }

    /// Start a GET request.
    pub fn get(&self, url: impl IntoUrl) -> RequestBuilder {
        self.inner.get(url)
    }

    /// Start a POST request.
    pub fn post(&self, url: impl IntoUrl) -> RequestBuilder {
        self.inner.post(url)
    }

    /// Start a PUT request.
    pub fn put(&self, url: impl IntoUrl) -> RequestBuilder {
        self.inner.put(url)
    }

    /// Start a DELETE request.
    pub fn delete(&self, url: impl IntoUrl) -> RequestBuilder {
        self.inner.delete(url)
    }

    /// Send a request, retrying transport failures per the configured policy.
    ///
    /// Requests with a streaming body cannot be replayed and get exactly one attempt.
    pub async fn send(&self, request: RequestBuilder, cancel: Option<&CancellationToken>) -> Result<Response> {
        let request = request.build().map_err(|err| HttpError::request(1, err))?;

        if request.body().is_some_and(|body| body.as_bytes().is_none()) {
            debug!(url = %request.url(), "streaming request body, sending once");
            let outcome = match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(HttpError::Cancelled { attempts: 1 }),
                    outcome = self.inner.execute(request) => outcome,
                },
                None => self.inner.execute(request).await,
            };
            return outcome.map_err(|err| HttpError::request(1, err));
        }

        self.execute_with(cancel, |client| client.execute(replay(&request)))
            .await
    }

    /// Run `attempt` until it yields a response, the policy refuses a retry,
    /// or the retry budget is spent.
    ///
    /// `attempt` rebuilds the request each time so bodies that are produced
    /// on the fly can be regenerated for every try.
    pub async fn execute_with<F, Fut>(&self, cancel: Option<&CancellationToken>, mut attempt: F) -> Result<Response>
    where
        F: FnMut(&reqwest::Client) -> Fut,
        Fut: Future<Output = reqwest::Result<Response>>,
    {
        let mut attempts: u32 = 0;
        loop {
            attempts += 1;
            let outcome = match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(HttpError::Cancelled { attempts }),
                    outcome = attempt(&self.inner) => outcome,
                },
                None => attempt(&self.inner).await,
            };

            let err = match outcome {
                Ok(response) => return Ok(response),
                Err(err) => err,
            };

            let failure = classify(&err);
            let cancelled = cancel.is_some_and(CancellationToken::is_cancelled);
            if attempts > self.retry.max_retries || !self.retry.policy.should_retry(cancelled, &failure) {
                return Err(HttpError::Request {
                    attempts,
                    failure,
                    source: err,
                });
            }

            let delay = self.retry.delay_for_attempt(attempts);
            debug!(
                attempt = attempts,
                ?failure,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying request"
            );

            match cancel {
                Some(token) => tokio::select! {
                    biased;
                    _ = token.cancelled() => return Err(HttpError::Cancelled { attempts }),
                    _ = tokio::time::sleep(delay) => {}
                },
                None => tokio::time::sleep(delay).await,
            }
        }
    }
}

/// Copy a request whose body, if any, is held in memory.
fn replay(request: &Request) -> Request {
    let mut copy = Request::new(request.method().clone(), request.url().clone());
    *copy.headers_mut() = request.headers().clone();
    *copy.timeout_mut() = request.timeout().copied();
    *copy.version_mut() = request.version();
    if let Some(bytes) = request.body().and_then(Body::as_bytes) {
        *copy.body_mut() = Some(Body::from(bytes.to_vec()));
    }
    copy
}
