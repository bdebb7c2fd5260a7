//! HTTP client configuration + bounded retry executor shared by sources and destinations.

use std::borrow::Cow;
use std::time::Duration;

use anyhow::Context;
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tracing::{debug, warn, Instrument};

pub const CRATE_NAME: &str = "sodp-http";

/// Longest response body excerpt kept in errors and logs.
pub const BODY_EXCERPT_CHARS: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// Exponential backoff: attempt `n` (1-based) waits `base_delay * 2^(n-1)`.
///
/// With the default 2 s base this is `2^n` seconds: 2, 4, 8, ...
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl BackoffPolicy {
    pub fn with_max_attempts(self, max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..self
        }
    }

    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1);
        let factor = 1u32.checked_shl(exponent).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: Some(format!("sodp/{}", env!("CARGO_PKG_VERSION"))),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}: {body}")]
    HttpStatus {
        status: u16,
        url: String,
        body: String,
    },
    #[error("giving up on {url} after {attempts} attempts: {last_error}")]
    Exhausted {
        attempts: u32,
        url: String,
        last_error: String,
    },
    #[error("decoding response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

impl FetchError {
    /// True when the remote answered with a permanent (non-retryable) status.
    pub fn is_rejection(&self) -> bool {
        matches!(self, FetchError::HttpStatus { .. })
    }
}

/// Truncates a body to [`BODY_EXCERPT_CHARS`] characters.
pub fn body_excerpt(body: &str) -> String {
    body.chars().take(BODY_EXCERPT_CHARS).collect()
}

/// Fixed courtesy delay between successive requests to the same remote.
pub async fn politeness_pause(delay: Duration) {
    if !delay.is_zero() {
        tokio::time::sleep(delay).await;
    }
}

#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            backoff: config.backoff,
        })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    pub fn backoff(&self) -> &BackoffPolicy {
        &self.backoff
    }

    /// Sends the request built by `build` until it succeeds, is rejected, or
    /// runs out of attempts.
    ///
    /// `label` identifies the request in logs and errors (usually its URL).
    pub async fn send<F>(&self, label: &str, build: F) -> Result<reqwest::Response, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let span = tracing::info_span!("http_request", request = label);
        self.send_inner(label, build).instrument(span).await
    }

    async fn send_inner<F>(&self, label: &str, build: F) -> Result<reqwest::Response, FetchError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let max_attempts = self.backoff.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            let last_error = match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        debug!(attempt, status = status.as_u16(), "request succeeded");
                        return Ok(resp);
                    }
                    if classify_status(status) == RetryDisposition::NonRetryable {
                        let body = resp.text().await.unwrap_or_default();
                        return Err(FetchError::HttpStatus {
                            status: status.as_u16(),
                            url: label.to_string(),
                            body: body_excerpt(&body),
                        });
                    }
                    format!("http status {}", status.as_u16())
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable {
                        return Err(FetchError::Request {
                            url: label.to_string(),
                            source: err,
                        });
                    }
                    err.to_string()
                }
            };

            if attempt == max_attempts {
                return Err(FetchError::Exhausted {
                    attempts: max_attempts,
                    url: label.to_string(),
                    last_error,
                });
            }

            let delay = self.backoff.delay_for_attempt(attempt);
            warn!(
                attempt,
                max_attempts,
                delay_ms = delay.as_millis() as u64,
                reason = %last_error,
                "transient failure, retrying"
            );
            tokio::time::sleep(delay).await;
        }
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str) -> Result<T, FetchError> {
        let resp = self.send(url, || self.client.get(url)).await?;
        resp.json::<T>().await.map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })
    }

    /// Fetches a body as text, decoding it as UTF-8 regardless of the declared charset.
    /// Invalid sequences become U+FFFD and are reported with a warning.
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let resp = self.send(url, || self.client.get(url)).await?;
        let bytes = resp.bytes().await.map_err(|source| FetchError::Decode {
            url: url.to_string(),
            source,
        })?;
        let (text, replaced) = decode_utf8_lossy(&bytes);
        if replaced {
            warn!(url, "response body was not valid UTF-8, invalid bytes replaced");
        }
        Ok(text)
    }
}

/// Decodes `bytes` as UTF-8, returning whether any invalid sequence was replaced.
pub fn decode_utf8_lossy(bytes: &[u8]) -> (String, bool) {
    match String::from_utf8_lossy(bytes) {
        Cow::Borrowed(text) => (text.to_string(), false),
        Cow::Owned(text) => (text, true),
    }
}
