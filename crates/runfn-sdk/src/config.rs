// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation server configuration.

use std::env;
use std::net::SocketAddr;
use std::time::Duration;

use runfn_http::HttpClientConfig;

use crate::activity_log::ActivityLogConfig;

/// Default listen port.
pub const DEFAULT_PORT: u16 = 8082;
/// Default read, write and shutdown timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Settings for [`FunctionServer`](crate::FunctionServer).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen port (default: 8082)
    pub port: u16,
    /// Time allowed to receive a request body (default: 10s)
    pub read_timeout: Duration,
    /// Time allowed for the handler to produce a result (default: 10s)
    pub write_timeout: Duration,
    /// Grace period for in-flight invocations once shutdown starts (default: 10s)
    pub shutdown_timeout: Duration,
    /// Largest accepted request body (default: 16 MiB)
    pub max_body_bytes: usize,
    /// Log filter directive when `RUST_LOG` is unset (default: "info")
    pub log_level: String,
    /// Activity log flush interval (default: 1s)
    pub log_flush_interval: Duration,
    /// Timeout of a single activity log upload (default: 10s)
    pub log_upload_timeout: Duration,
    /// Transport retries for outbound requests, including log uploads (default: 3)
    pub http_retry_count: u32,
    /// Skip TLS verification on outbound requests (default: false)
    pub skip_tls_verify: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            read_timeout: DEFAULT_TIMEOUT,
            write_timeout: DEFAULT_TIMEOUT,
            shutdown_timeout: DEFAULT_TIMEOUT,
            max_body_bytes: 16 * 1024 * 1024,
            log_level: "info".to_string(),
            log_flush_interval: Duration::from_secs(1),
            log_upload_timeout: Duration::from_secs(10),
            http_retry_count: 3,
            skip_tls_verify: false,
        }
    }
}

impl ServerConfig {
    /// Load configuration from environment variables.
    ///
    /// All variables are optional:
    /// - `RUNFN_PORT` (default: 8082)
    /// - `RUNFN_READ_TIMEOUT`, `RUNFN_WRITE_TIMEOUT` (default: 10s)
    /// - `RUNFN_SHUTDOWN_TIMEOUT` (default: the write timeout)
    /// - `RUNFN_MAX_BODY_BYTES` (default: 16 MiB)
    /// - `RUNFN_LOG_LEVEL` (default: "info")
    /// - `RUNFN_LOG_FLUSH_INTERVAL` (default: 1s)
    /// - `RUNFN_LOG_UPLOAD_TIMEOUT` (default: 10s)
    /// - `RUNFN_HTTP_RETRY_COUNT` (default: 3)
    /// - `RUNFN_SKIP_TLS_VERIFY` (default: false)
    ///
    /// Durations are either whole seconds (`"30"`) or humantime strings (`"1500ms"`, `"2m"`).
    pub fn from_env() -> Result<Self, ConfigError> {
        let defaults = Self::default();

        let port = parse_var("RUNFN_PORT", defaults.port, "must be a valid port number")?;
        let read_timeout = duration_var("RUNFN_READ_TIMEOUT", defaults.read_timeout)?;
        let write_timeout = duration_var("RUNFN_WRITE_TIMEOUT", defaults.write_timeout)?;
        let shutdown_timeout = duration_var("RUNFN_SHUTDOWN_TIMEOUT", write_timeout)?;
        let max_body_bytes = parse_var(
            "RUNFN_MAX_BODY_BYTES",
            defaults.max_body_bytes,
            "must be a positive integer",
        )?;
        let log_level = env::var("RUNFN_LOG_LEVEL").unwrap_or(defaults.log_level);
        let log_flush_interval = duration_var("RUNFN_LOG_FLUSH_INTERVAL", defaults.log_flush_interval)?;
        let log_upload_timeout = duration_var("RUNFN_LOG_UPLOAD_TIMEOUT", defaults.log_upload_timeout)?;
        let http_retry_count = parse_var(
            "RUNFN_HTTP_RETRY_COUNT",
            defaults.http_retry_count,
            "must be a non-negative integer",
        )?;
        let skip_tls_verify = env::var("RUNFN_SKIP_TLS_VERIFY")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        if log_flush_interval.is_zero() {
            return Err(ConfigError::Invalid("RUNFN_LOG_FLUSH_INTERVAL", "must be greater than zero"));
        }

        Ok(Self {
            port,
            read_timeout,
            write_timeout,
            shutdown_timeout,
            max_body_bytes,
            log_level,
            log_flush_interval,
            log_upload_timeout,
            http_retry_count,
            skip_tls_verify,
        })
    }

    /// Address the server binds when no listener is supplied.
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from(([0, 0, 0, 0], self.port))
    }

    /// Client settings for the process-wide outbound client.
    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig::new(self.http_retry_count).with_tls_skip_verify(self.skip_tls_verify)
    }

    /// Settings for each invocation's activity log writer.
    pub fn activity_log_config(&self) -> ActivityLogConfig {
        ActivityLogConfig {
            flush_interval: self.log_flush_interval,
            upload_timeout: self.log_upload_timeout,
            skip_tls_verify: self.skip_tls_verify,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_read_timeout(mut self, timeout: Duration) -> Self {
        self.read_timeout = timeout;
        self
    }

    pub fn with_write_timeout(mut self, timeout: Duration) -> Self {
        self.write_timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_max_body_bytes(mut self, bytes: usize) -> Self {
        self.max_body_bytes = bytes;
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_log_flush_interval(mut self, interval: Duration) -> Self {
        self.log_flush_interval = interval;
        self
    }

    pub fn with_log_upload_timeout(mut self, timeout: Duration) -> Self {
        self.log_upload_timeout = timeout;
        self
    }

    pub fn with_http_retry_count(mut self, retries: u32) -> Self {
        self.http_retry_count = retries;
        self
    }

    /// Skip TLS certificate verification (for development only!).
    pub fn with_skip_tls_verify(mut self, skip: bool) -> Self {
        self.skip_tls_verify = skip;
        self
    }
}

/// Parse a duration given as whole seconds or as a humantime string.
pub fn parse_duration(value: &str) -> Option<Duration> {
    let value = value.trim();
    if let Ok(secs) = value.parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    humantime::parse_duration(value).ok()
}

fn duration_var(name: &'static str, default: Duration) -> Result<Duration, ConfigError> {
    match env::var(name) {
        Ok(value) => parse_duration(&value)
            .ok_or(ConfigError::Invalid(name, "must be seconds or a duration like 1500ms")),
        Err(_) => Ok(default),
    }
}

fn parse_var<T: std::str::FromStr>(name: &'static str, default: T, reason: &'static str) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(value) => value.trim().parse().map_err(|_| ConfigError::Invalid(name, reason)),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("invalid value for {0}: {1}")]
    Invalid(&'static str, &'static str),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    // Mutex to serialize tests that modify environment variables
    static ENV_MUTEX: Mutex<()> = Mutex::new(());

    const VARS: &[&str] = &[
        "RUNFN_PORT",
        "RUNFN_READ_TIMEOUT",
        "RUNFN_WRITE_TIMEOUT",
        "RUNFN_SHUTDOWN_TIMEOUT",
        "RUNFN_MAX_BODY_BYTES",
        "RUNFN_LOG_LEVEL",
        "RUNFN_LOG_FLUSH_INTERVAL",
        "RUNFN_LOG_UPLOAD_TIMEOUT",
        "RUNFN_HTTP_RETRY_COUNT",
        "RUNFN_SKIP_TLS_VERIFY",
    ];

    /// Helper to set env vars for a test and restore them after
    struct EnvGuard {
        vars: Vec<(String, Option<String>)>,
    }

    impl EnvGuard {
        fn clean() -> Self {
            let mut guard = Self { vars: Vec::new() };
            for name in VARS {
                guard.remove(name);
            }
            guard
        }

        fn set(&mut self, key: &str, value: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::set_var(key, value) };
        }

        fn remove(&mut self, key: &str) {
            self.vars.push((key.to_string(), env::var(key).ok()));
            // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
            unsafe { env::remove_var(key) };
        }
    }

    impl Drop for EnvGuard {
        fn drop(&mut self) {
            for (key, value) in self.vars.drain(..).rev() {
                // SAFETY: Tests are serialized via ENV_MUTEX, so no concurrent access
                unsafe {
                    match value {
                        Some(v) => env::set_var(&key, v),
                        None => env::remove_var(&key),
                    }
                }
            }
        }
    }

    #[test]
    fn test_from_env_defaults() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let _guard = EnvGuard::clean();

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.port, 8082);
        assert_eq!(config.read_timeout, Duration::from_secs(10));
        assert_eq!(config.write_timeout, Duration::from_secs(10));
        assert_eq!(config.shutdown_timeout, Duration::from_secs(10));
        assert_eq!(config.log_level, "info");
        assert_eq!(config.http_retry_count, 3);
        assert!(!config.skip_tls_verify);
    }

    #[test]
    fn test_from_env_overrides() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("RUNFN_PORT", "9000");
        guard.set("RUNFN_READ_TIMEOUT", "30");
        guard.set("RUNFN_WRITE_TIMEOUT", "1m 30s");
        guard.set("RUNFN_LOG_FLUSH_INTERVAL", "250ms");
        guard.set("RUNFN_HTTP_RETRY_COUNT", "0");
        guard.set("RUNFN_SKIP_TLS_VERIFY", "true");

        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.read_timeout, Duration::from_secs(30));
        assert_eq!(config.write_timeout, Duration::from_secs(90));
        // Shutdown grace follows the write timeout unless set
        assert_eq!(config.shutdown_timeout, Duration::from_secs(90));
        assert_eq!(config.log_flush_interval, Duration::from_millis(250));
        assert_eq!(config.http_retry_count, 0);
        assert!(config.skip_tls_verify);
    }

    #[test]
    fn test_from_env_rejects_garbage() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("RUNFN_READ_TIMEOUT", "-5");
        let err = ServerConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("RUNFN_READ_TIMEOUT", _)));

        guard.set("RUNFN_READ_TIMEOUT", "5");
        guard.set("RUNFN_PORT", "not-a-port");
        let err = ServerConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid("RUNFN_PORT", _)));
    }

    #[test]
    fn test_zero_flush_interval_rejected() {
        let _lock = ENV_MUTEX.lock().unwrap();
        let mut guard = EnvGuard::clean();

        guard.set("RUNFN_LOG_FLUSH_INTERVAL", "0");
        assert!(ServerConfig::from_env().is_err());
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("15"), Some(Duration::from_secs(15)));
        assert_eq!(parse_duration("1500ms"), Some(Duration::from_millis(1500)));
        assert_eq!(parse_duration("2m"), Some(Duration::from_secs(120)));
        assert_eq!(parse_duration("soon"), None);
    }

    #[test]
    fn test_builder_pattern() {
        let config = ServerConfig::default()
            .with_port(0)
            .with_write_timeout(Duration::from_secs(20))
            .with_http_retry_count(1);

        assert_eq!(config.port, 0);
        assert_eq!(config.write_timeout, Duration::from_secs(20));
        assert_eq!(config.http_retry_count, 1);
        assert_eq!(config.listen_addr().port(), 0);
        assert_eq!(config.http_client_config().retry.max_retries, 1);
    }
}
