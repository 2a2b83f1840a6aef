// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Configuration for the shared outbound client.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use reqwest::dns::{Name, Resolve, Resolving};

use crate::retry::RetryConfig;

/// Pool, TLS and retry settings for [`RetryingClient`](crate::RetryingClient).
#[derive(Clone)]
pub struct HttpClientConfig {
    /// TCP connect timeout (default: 30s)
    pub connect_timeout: Duration,
    /// TCP keep-alive interval (default: 120s)
    pub keep_alive: Duration,
    /// How long an idle pooled connection is kept (default: 90s)
    pub idle_timeout: Duration,
    /// Idle connections kept per host (default: 20)
    pub max_idle_connections: usize,
    /// Overall per-attempt timeout (default: none)
    pub request_timeout: Option<Duration>,
    /// Accept any server certificate (default: false, development only)
    pub tls_skip_verify: bool,
    /// Extra trusted root certificate in PEM format
    pub ca_cert_pem: Option<Vec<u8>>,
    /// Proxy URL applied to all schemes
    pub proxy: Option<String>,
    /// Custom name resolution, used in place of the system resolver
    pub dns_resolver: Option<Arc<dyn Resolve>>,
    /// Retry settings
    pub retry: RetryConfig,
}

impl HttpClientConfig {
    /// Create a configuration with default pool settings and the given retry count.
    pub fn new(max_retries: u32) -> Self {
        Self {
            retry: RetryConfig::new(max_retries),
            ..Self::default()
        }
    }

    /// Set the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the overall per-attempt timeout.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Skip TLS certificate verification (for development only!).
    pub fn with_tls_skip_verify(mut self, skip: bool) -> Self {
        self.tls_skip_verify = skip;
        self
    }

    /// Trust an additional CA certificate.
    pub fn with_ca_cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.ca_cert_pem = Some(pem.into());
        self
    }

    /// Route all requests through a proxy.
    pub fn with_proxy(mut self, url: impl Into<String>) -> Self {
        self.proxy = Some(url.into());
        self
    }

    /// Use a custom resolver for outbound connections.
    pub fn with_dns_resolver(mut self, resolver: Arc<dyn Resolve>) -> Self {
        self.dns_resolver = Some(resolver);
        self
    }

    /// Replace the retry settings.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            keep_alive: Duration::from_secs(120),
            idle_timeout: Duration::from_secs(90),
            max_idle_connections: 20,
            request_timeout: None,
            tls_skip_verify: false,
            ca_cert_pem: None,
            proxy: None,
            dns_resolver: None,
            retry: RetryConfig::default(),
        }
    }
}

impl fmt::Debug for HttpClientConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpClientConfig")
            .field("connect_timeout", &self.connect_timeout)
            .field("keep_alive", &self.keep_alive)
            .field("idle_timeout", &self.idle_timeout)
            .field("max_idle_connections", &self.max_idle_connections)
            .field("request_timeout", &self.request_timeout)
            .field("tls_skip_verify", &self.tls_skip_verify)
            .field("ca_cert_pem", &self.ca_cert_pem.as_ref().map(|_| "<pem>"))
            .field("proxy", &self.proxy)
            .field("dns_resolver", &self.dns_resolver.as_ref().map(|_| "<custom>"))
            .field("retry", &self.retry)
            .finish()
    }
}

/// Adapter so a shared trait object can be handed to reqwest.
pub(crate) struct SharedResolver(pub(crate) Arc<dyn Resolve>);

impl Resolve for SharedResolver {
    fn resolve(&self, name: Name) -> Resolving {
        self.0.resolve(name)
    }
}
