use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{CONNECTION, CONTENT_LENGTH, HeaderMap, HeaderValue, USER_AGENT};
use reqwest::{Body, Client, StatusCode};
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::error::MigrateError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one.
    pub max_retries: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_secs(5),
        }
    }
}

/// Result of one transfer attempt, before any retry decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success { bytes: Option<u64> },
    RateLimited,
    Failed { status: Option<u16>, message: String },
}

impl AttemptOutcome {
    pub fn from_status(status: StatusCode, message: impl Into<String>) -> Self {
        if status == StatusCode::TOO_MANY_REQUESTS {
            AttemptOutcome::RateLimited
        } else {
            AttemptOutcome::Failed {
                status: Some(status.as_u16()),
                message: message.into(),
            }
        }
    }

    pub fn from_error(err: &reqwest::Error) -> Self {
        if err.status() == Some(StatusCode::TOO_MANY_REQUESTS) {
            return AttemptOutcome::RateLimited;
        }
        let kind = if err.is_timeout() {
            "timeout"
        } else if err.is_connect() {
            "connection error"
        } else {
            "transport error"
        };
        AttemptOutcome::Failed {
            status: err.status().map(|status| status.as_u16()),
            message: format!("{kind}: {err}"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferReport {
    pub attempts: u32,
    pub bytes: Option<u64>,
}

#[async_trait]
pub trait Sleeper: Send + Sync {
    async fn sleep(&self, delay: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, delay: Duration) {
        tokio::time::sleep(delay).await;
    }
}

/// A single, non-retrying streamed transfer.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn download_once(&self, source: &str, destination: &Path) -> AttemptOutcome;
    async fn upload_once(&self, source: &str, destination: &str) -> AttemptOutcome;
}

/// Drives `attempt` until it succeeds or the policy is exhausted.
///
/// Rate-limited attempts wait a flat `base_delay`; other failures wait
/// `base_delay * n` where `n` counts the generic failures so far. Every
/// attempt, rate-limited or not, consumes one unit of `max_retries`.
pub async fn run_with_retry<F, Fut>(
    policy: RetryPolicy,
    sleeper: &dyn Sleeper,
    cancel: &CancellationToken,
    source: &str,
    destination: &str,
    mut attempt: F,
) -> Result<TransferReport, MigrateError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = AttemptOutcome>,
{
    let mut attempts = 0u32;
    let mut failures = 0u32;
    let mut last_status = None;

    loop {
        if cancel.is_cancelled() {
            return Err(MigrateError::Cancelled);
        }
        attempts += 1;
        let delay = match attempt().await {
            AttemptOutcome::Success { bytes } => {
                debug!(source, destination, attempts, "transfer finished");
                return Ok(TransferReport { attempts, bytes });
            }
            AttemptOutcome::RateLimited => {
                last_status = Some(StatusCode::TOO_MANY_REQUESTS.as_u16());
                if attempts >= policy.max_retries {
                    break;
                }
                warn!(
                    source,
                    destination,
                    delay_secs = policy.base_delay.as_secs_f64(),
                    "rate limit hit, retrying"
                );
                policy.base_delay
            }
            AttemptOutcome::Failed { status, message } => {
                last_status = status.or(last_status);
                failures += 1;
                if attempts >= policy.max_retries {
                    warn!(source, destination, status, "{message}");
                    break;
                }
                let delay = policy
                    .base_delay
                    .checked_mul(failures)
                    .unwrap_or(Duration::MAX);
                warn!(
                    source,
                    destination,
                    status,
                    attempt = attempts,
                    delay_secs = delay.as_secs_f64(),
                    "{message}, retrying"
                );
                delay
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => return Err(MigrateError::Cancelled),
            _ = sleeper.sleep(delay) => {}
        }
    }

    error!(source, destination, attempts, "transfer failed after {attempts} attempts");
    Err(MigrateError::Transfer {
        source_url: source.to_string(),
        destination: destination.to_string(),
        attempts,
        last_status,
    })
}

/// Retrying download/upload built on a [`Transport`].
#[derive(Clone)]
pub struct RetryingTransfer<T: Transport> {
    transport: T,
    policy: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
    cancel: CancellationToken,
}

impl<T: Transport> RetryingTransfer<T> {
    pub fn new(transport: T, policy: RetryPolicy, cancel: CancellationToken) -> Self {
        Self::with_sleeper(transport, policy, Arc::new(TokioSleeper), cancel)
    }

    pub fn with_sleeper(
        transport: T,
        policy: RetryPolicy,
        sleeper: Arc<dyn Sleeper>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            transport,
            policy,
            sleeper,
            cancel,
        }
    }

    pub fn policy(&self) -> RetryPolicy {
        self.policy
    }

    pub fn transport(&self) -> &T {
        &self.transport
    }

    pub async fn download(
        &self,
        source: &str,
        destination: &Path,
    ) -> Result<TransferReport, MigrateError> {
        let label = destination.display().to_string();
        run_with_retry(
            self.policy,
            self.sleeper.as_ref(),
            &self.cancel,
            source,
            &label,
            || self.transport.download_once(source, destination),
        )
        .await
    }

    pub async fn upload(
        &self,
        source: &str,
        destination: &str,
    ) -> Result<TransferReport, MigrateError> {
        run_with_retry(
            self.policy,
            self.sleeper.as_ref(),
            &self.cancel,
            source,
            destination,
            || self.transport.upload_once(source, destination),
        )
        .await
    }
}

/// Streams bytes between HTTP endpoints without buffering whole files.
#[derive(Clone)]
pub struct HttpTransport {
    client: Client,
}

impl HttpTransport {
    pub fn new(timeout: Duration) -> Result<Self, MigrateError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_str(&format!("shareloc-migrate/{}", env!("CARGO_PKG_VERSION")))
                .map_err(|err| MigrateError::InvalidSetting(err.to_string()))?,
        );
        headers.insert(CONNECTION, HeaderValue::from_static("close"));
        let client = Client::builder()
            .default_headers(headers)
            .connect_timeout(timeout)
            .read_timeout(timeout)
            .build()
            .map_err(|err| MigrateError::FetchHttp {
                url: String::new(),
                message: err.to_string(),
            })?;
        Ok(Self { client })
    }

    async fn open_source(&self, source: &str) -> Result<reqwest::Response, AttemptOutcome> {
        let response = self
            .client
            .get(source)
            .send()
            .await
            .map_err(|err| AttemptOutcome::from_error(&err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(AttemptOutcome::from_status(
                status,
                format!("download of {source} returned status {}", status.as_u16()),
            ));
        }
        Ok(response)
    }

    async fn write_to(
        response: reqwest::Response,
        destination: &Path,
    ) -> Result<u64, MigrateError> {
        let parent = destination
            .parent()
            .filter(|parent| !parent.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|err| MigrateError::Filesystem(err.to_string()))?;
        let temp = tempfile::Builder::new()
            .prefix(".shareloc-download")
            .tempfile_in(parent)
            .map_err(|err| MigrateError::Filesystem(err.to_string()))?;
        let (file, temp_path) = temp.into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut written = 0u64;
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|err| MigrateError::FetchHttp {
                url: destination.display().to_string(),
                message: err.to_string(),
            })?;
            file.write_all(&chunk)
                .await
                .map_err(|err| MigrateError::Filesystem(err.to_string()))?;
            written += chunk.len() as u64;
        }
        file.flush()
            .await
            .map_err(|err| MigrateError::Filesystem(err.to_string()))?;
        drop(file);
        temp_path
            .persist(destination)
            .map_err(|err| MigrateError::Filesystem(err.to_string()))?;
        Ok(written)
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn download_once(&self, source: &str, destination: &Path) -> AttemptOutcome {
        let response = match self.open_source(source).await {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        match Self::write_to(response, destination).await {
            Ok(bytes) => AttemptOutcome::Success { bytes: Some(bytes) },
            Err(err) => AttemptOutcome::Failed {
                status: None,
                message: err.to_string(),
            },
        }
    }

    async fn upload_once(&self, source: &str, destination: &str) -> AttemptOutcome {
        let response = match self.open_source(source).await {
            Ok(response) => response,
            Err(outcome) => return outcome,
        };
        let length = response.content_length();
        let mut request = self
            .client
            .put(destination)
            .body(Body::wrap_stream(response.bytes_stream()));
        if let Some(length) = length {
            request = request.header(CONTENT_LENGTH, length);
        }

        let upload = match request.send().await {
            Ok(upload) => upload,
            Err(err) => return AttemptOutcome::from_error(&err),
        };
        let status = upload.status();
        if status.is_success() {
            return AttemptOutcome::Success { bytes: length };
        }
        let body = upload.text().await.unwrap_or_default();
        AttemptOutcome::from_status(
            status,
            format!("upload returned status {}: {body}", status.as_u16()),
        )
    }
}
