// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Buffered activity log shipping.
//!
//! Writes land in an in-memory buffer and never touch the network. A single
//! background task wakes every `flush_interval`, swaps the buffer out and
//! uploads it to `<url>?append=true` as the multipart file field `content`.
//! [`ActivityLogWriter::close`] stops that task and flushes whatever is left.
//!
//! Each upload runs two tasks: one streams the swapped bytes into a pipe, the
//! other sends the request whose body reads from that pipe.

use std::io;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use reqwest::{Body, StatusCode, Url};
use runfn_http::{HttpClientConfig, HttpError, RetryingClient};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::io::ReaderStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use tracing_subscriber::fmt::MakeWriter;

use crate::types::WORKFLOW_TOKEN_HEADER;

const PIPE_CAPACITY: usize = 64 * 1024;
const MIN_FLUSH_INTERVAL: Duration = Duration::from_millis(10);

/// Settings for an [`ActivityLogWriter`].
#[derive(Debug, Clone)]
pub struct ActivityLogConfig {
    /// Time between background flushes (default: 1s)
    pub flush_interval: Duration,
    /// Upper bound on a single flush, retries included (default: 10s)
    pub upload_timeout: Duration,
    /// Skip TLS verification when the writer builds its own client (default: false)
    pub skip_tls_verify: bool,
}

impl Default for ActivityLogConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_secs(1),
            upload_timeout: Duration::from_secs(10),
            skip_tls_verify: false,
        }
    }
}

impl ActivityLogConfig {
    pub fn with_flush_interval(mut self, interval: Duration) -> Self {
        self.flush_interval = interval;
        self
    }

    pub fn with_upload_timeout(mut self, timeout: Duration) -> Self {
        self.upload_timeout = timeout;
        self
    }

    /// Skip TLS certificate verification (for development only!).
    pub fn with_skip_tls_verify(mut self, skip: bool) -> Self {
        self.skip_tls_verify = skip;
        self
    }
}

/// Errors from flushing or building an activity log writer.
#[derive(Debug, Error)]
pub enum ActivityLogError {
    #[error("invalid activity log url {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("activity log upload failed: {0}")]
    Http(#[from] HttpError),

    #[error("activity log upload rejected with status {status}: {body}")]
    Status { status: StatusCode, body: String },

    #[error("activity log upload timed out after {0:?}")]
    Timeout(Duration),
}

struct Shared {
    upload_url: Url,
    token: Option<String>,
    buffer: Mutex<Vec<u8>>,
    // Serializes flushes so uploads reach the collector in write order
    flush_lock: tokio::sync::Mutex<()>,
    client: RetryingClient,
    upload_timeout: Duration,
}

impl Shared {
    fn append(&self, bytes: &[u8]) {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend_from_slice(bytes);
    }

    fn take(&self) -> Vec<u8> {
        std::mem::take(&mut *self.buffer.lock().unwrap_or_else(PoisonError::into_inner))
    }

    async fn flush(&self) -> Result<(), ActivityLogError> {
        let _serial = self.flush_lock.lock().await;

        let pending = self.take();
        if pending.is_empty() {
            return Ok(());
        }

        let len = pending.len();
        debug!(bytes = len, url = %self.upload_url, "flushing activity log");
        match tokio::time::timeout(self.upload_timeout, self.upload(Bytes::from(pending))).await {
            Ok(result) => result,
            Err(_) => Err(ActivityLogError::Timeout(self.upload_timeout)),
        }
    }

    async fn upload(&self, data: Bytes) -> Result<(), ActivityLogError> {
        let response = self
            .client
            .execute_with(None, |client| {
                let (reader, mut pipe) = tokio::io::duplex(PIPE_CAPACITY);
                let payload = data.clone();
                let producer = tokio::spawn(async move {
                    pipe.write_all(&payload).await?;
                    pipe.shutdown().await
                });

                let part = Part::stream(Body::wrap_stream(ReaderStream::new(reader))).file_name("stdout");
                let mut request = client
                    .post(self.upload_url.clone())
                    .multipart(Form::new().part("content", part));
                if let Some(token) = &self.token {
                    request = request.header(WORKFLOW_TOKEN_HEADER, token);
                }

                async move {
                    let (sent, produced) = tokio::join!(request.send(), producer);
                    match produced {
                        Ok(Ok(())) => {}
                        // The request side hung up first; its own error is the one that matters
                        Ok(Err(err)) => debug!(error = %err, "activity log body stream closed early"),
                        Err(err) => warn!(error = %err, "activity log body task failed"),
                    }
                    sent
                }
            })
            .await?;

        let status = response.status();
        if status != StatusCode::OK {
            let body = response.text().await.unwrap_or_default();
            return Err(ActivityLogError::Status { status, body });
        }
        Ok(())
    }
}

impl Drop for Shared {
    fn drop(&mut self) {
        let left = self.buffer.get_mut().unwrap_or_else(PoisonError::into_inner).len();
        if left > 0 {
            debug!(bytes = left, url = %self.upload_url, "discarding activity log bytes written after close");
        }
    }
}

/// A cloneable `io::Write` handle feeding an [`ActivityLogWriter`]'s buffer.
///
/// Suitable as a `tracing_subscriber` writer. Bytes written once the writer
/// is closed or dropped are never uploaded.
#[derive(Clone)]
pub struct ActivitySink {
    shared: Arc<Shared>,
}

impl io::Write for ActivitySink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.shared.append(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<'a> MakeWriter<'a> for ActivitySink {
    type Writer = ActivitySink;

    fn make_writer(&'a self) -> Self::Writer {
        self.clone()
    }
}

/// Per-invocation log writer that ships its buffer to a collector.
pub struct ActivityLogWriter {
    shared: Arc<Shared>,
    stop: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl ActivityLogWriter {
    /// Create a writer with its own outbound client.
    ///
    /// Must be called inside a tokio runtime.
    pub fn new(
        url: &str,
        token: Option<String>,
        config: ActivityLogConfig,
    ) -> Result<Self, ActivityLogError> {
        let client = RetryingClient::new(HttpClientConfig::default().with_tls_skip_verify(config.skip_tls_verify))?;
        Self::with_client(url, token, config, client)
    }

    /// Create a writer sharing an existing client and its connection pool.
    ///
    /// Must be called inside a tokio runtime.
    pub fn with_client(
        url: &str,
        token: Option<String>,
        config: ActivityLogConfig,
        client: RetryingClient,
    ) -> Result<Self, ActivityLogError> {
        let mut upload_url = Url::parse(url).map_err(|err| ActivityLogError::InvalidUrl {
            url: url.to_string(),
            reason: err.to_string(),
        })?;
        upload_url.query_pairs_mut().append_pair("append", "true");

        let shared = Arc::new(Shared {
            upload_url,
            token: token.filter(|t| !t.is_empty()),
            buffer: Mutex::new(Vec::new()),
            flush_lock: tokio::sync::Mutex::new(()),
            client,
            upload_timeout: config.upload_timeout,
        });

        let stop = CancellationToken::new();
        let period = config.flush_interval.max(MIN_FLUSH_INTERVAL);
        let task = tokio::spawn(flush_loop(shared.clone(), period, stop.clone()));

        Ok(Self {
            shared,
            stop,
            task: Some(task),
        })
    }

    /// Append bytes to the buffer. Always accepts the full slice.
    pub fn write(&self, bytes: &[u8]) -> usize {
        self.shared.append(bytes);
        bytes.len()
    }

    /// A writer handle for logging layers.
    pub fn sink(&self) -> ActivitySink {
        ActivitySink {
            shared: self.shared.clone(),
        }
    }

    /// Upload whatever is buffered right now.
    pub async fn flush(&self) -> Result<(), ActivityLogError> {
        self.shared.flush().await
    }

    /// Stop the background task and flush the remaining bytes.
    ///
    /// Every byte written before this call has had its upload attempted
    /// when it returns.
    pub async fn close(mut self) -> Result<(), ActivityLogError> {
        self.stop.cancel();
        if let Some(task) = self.task.take()
            && let Err(err) = task.await
        {
            warn!(error = %err, "activity log flush task ended abnormally");
        }
        self.shared.flush().await
    }
}

impl Drop for ActivityLogWriter {
    fn drop(&mut self) {
        // Unclosed writers stop flushing; anything still buffered is dropped
        self.stop.cancel();
    }
}

async fn flush_loop(shared: Arc<Shared>, period: Duration, stop: CancellationToken) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;

            _ = stop.cancelled() => {
                debug!("activity log flush loop stopped");
                break;
            }
            _ = ticker.tick() => {
                if let Err(err) = shared.flush().await {
                    warn!(error = %err, "error flushing activity log");
                }
            }
        }
    }
}
