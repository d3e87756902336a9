//! Bearer-token HTTPS client for the hub API.
//!
//! Every call runs through the retry driver (exponential backoff with
//! jitter) and the circuit breaker. Errors are classified as retryable
//! (connection/DNS/timeout, 5xx, 429) or terminal (other 4xx, certificate
//! failures, unexpected statuses). HTTP 204 surfaces as the distinguished
//! `NoContent` signal so the job loop can see "no job available" without
//! treating it as an error.

use crate::retry::{Backoff, BackoffConfig, BreakerConfig, CircuitBreaker};
use serde::Serialize;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_IDLE_CONNS: usize = 10;
const IDLE_CONN_TIMEOUT: Duration = Duration::from_secs(90);

/// Transport-level errors.
#[derive(Debug, Error)]
pub enum TransportError {
    /// HTTP 204: no content. Terminal but not a failure; the job loop
    /// interprets it as an idle tick.
    #[error("no content")]
    NoContent,

    /// HTTP 429; retried with honored backoff.
    #[error("rate limited (429)")]
    RateLimited,

    /// HTTP 4xx other than 429.
    #[error("client error ({status}): {body}")]
    Client { status: u16, body: String },

    /// HTTP 5xx.
    #[error("server error ({status})")]
    Server { status: u16 },

    /// Status outside the handled set.
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),

    /// Certificate or TLS validity failure.
    #[error("tls failure: {0}")]
    Tls(String),

    /// Connection, DNS, or timeout failure.
    #[error("network failure: {0}")]
    Network(String),

    /// Circuit breaker is open; the call was not attempted.
    #[error("circuit breaker is open")]
    BreakerOpen,

    #[error("failed to build client: {0}")]
    Build(#[source] reqwest::Error),

    #[error("failed to encode request body: {0}")]
    Encode(#[from] serde_json::Error),
}

impl TransportError {
    /// Whether the retry driver may try this call again.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::RateLimited | Self::Server { .. } | Self::Network(_) => true,
            Self::NoContent
            | Self::Client { .. }
            | Self::UnexpectedStatus(_)
            | Self::Tls(_)
            | Self::BreakerOpen
            | Self::Build(_)
            | Self::Encode(_) => false,
        }
    }
}

/// Hub API client.
///
/// One instance is shared by the heartbeat and job loops; backoff state
/// persists across calls and resets on the first success.
pub struct HubClient {
    http: reqwest::Client,
    base_url: String,
    token: Option<String>,
    backoff: Mutex<Backoff>,
    breaker: CircuitBreaker,
}

impl HubClient {
    /// Build a client for `base_url`, attaching `token` as a bearer
    /// credential when present.
    pub fn new(base_url: &str, token: Option<String>) -> Result<Self, TransportError> {
        Self::with_config(base_url, token, BackoffConfig::default(), BreakerConfig::default())
    }

    pub fn with_config(
        base_url: &str,
        token: Option<String>,
        retry: BackoffConfig,
        breaker: BreakerConfig,
    ) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .min_tls_version(reqwest::tls::Version::TLS_1_2)
            .timeout(REQUEST_TIMEOUT)
            .pool_max_idle_per_host(MAX_IDLE_CONNS)
            .pool_idle_timeout(IDLE_CONN_TIMEOUT)
            .build()
            .map_err(TransportError::Build)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
            backoff: Mutex::new(Backoff::new(retry)),
            breaker: CircuitBreaker::new(breaker),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// GET `path`, returning the raw response body.
    pub async fn get(&self, path: &str) -> Result<Vec<u8>, TransportError> {
        self.request_with_retry(path, None).await
    }

    /// POST `body` as JSON to `path`, returning the raw response body.
    pub async fn post<T: Serialize>(
        &self,
        path: &str,
        body: &T,
    ) -> Result<Vec<u8>, TransportError> {
        let encoded = serde_json::to_vec(body)?;
        self.request_with_retry(path, Some(encoded)).await
    }

    /// Connectivity probe against the hub's ping endpoint.
    pub async fn ping(&self) -> Result<(), TransportError> {
        self.get("/api/v1/agent/ping").await.map(|_| ())
    }

    async fn request_with_retry(
        &self,
        path: &str,
        body: Option<Vec<u8>>,
    ) -> Result<Vec<u8>, TransportError> {
        loop {
            if !self.breaker.allow() {
                return Err(TransportError::BreakerOpen);
            }

            match self.request_once(path, body.as_deref()).await {
                Ok(data) => {
                    self.breaker.record_success();
                    self.backoff.lock().unwrap().reset();
                    return Ok(data);
                }
                // 204 is not a failure; it must not trip the breaker.
                Err(TransportError::NoContent) => {
                    self.breaker.record_success();
                    self.backoff.lock().unwrap().reset();
                    return Err(TransportError::NoContent);
                }
                Err(err) if err.is_retryable() => {
                    self.breaker.record_failure();
                    let delay = {
                        let mut backoff = self.backoff.lock().unwrap();
                        let delay = backoff.next();
                        if !backoff.should_continue() {
                            backoff.reset();
                            return Err(err);
                        }
                        delay
                    };
                    warn!(
                        path,
                        error = %err,
                        retry_in_secs = delay.as_secs(),
                        "hub request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(err) => {
                    self.breaker.record_failure();
                    return Err(err);
                }
            }
        }
    }

    async fn request_once(
        &self,
        path: &str,
        body: Option<&[u8]>,
    ) -> Result<Vec<u8>, TransportError> {
        let url = format!("{}{}", self.base_url, path);

        let mut req = match body {
            Some(bytes) => self
                .http
                .post(&url)
                .header("Content-Type", "application/json")
                .body(bytes.to_vec()),
            None => self.http.get(&url),
        };

        if let Some(token) = &self.token {
            req = req.bearer_auth(token);
        }

        let resp = req.send().await.map_err(classify_request_error)?;
        let status = resp.status();

        if status.as_u16() == 204 {
            return Err(TransportError::NoContent);
        }

        let bytes = resp
            .bytes()
            .await
            .map_err(classify_request_error)?
            .to_vec();

        match status.as_u16() {
            200..=299 => {
                debug!(path, status = status.as_u16(), "hub request ok");
                Ok(bytes)
            }
            429 => Err(TransportError::RateLimited),
            s @ 400..=499 => Err(TransportError::Client {
                status: s,
                body: String::from_utf8_lossy(&bytes).into_owned(),
            }),
            s @ 500..=599 => Err(TransportError::Server { status: s }),
            s => Err(TransportError::UnexpectedStatus(s)),
        }
    }
}

/// Map a reqwest error onto the retryable/terminal split.
///
/// Certificate failures are terminal even though they surface as connect
/// errors; handshake timeouts stay retryable.
fn classify_request_error(err: reqwest::Error) -> TransportError {
    let text = err.to_string();
    let chain = {
        let mut parts = vec![text.clone()];
        let mut source: Option<&(dyn std::error::Error + 'static)> = std::error::Error::source(&err);
        while let Some(cause) = source {
            parts.push(cause.to_string());
            source = cause.source();
        }
        parts.join(": ").to_ascii_lowercase()
    };

    for terminal in ["certificate", "unknownissuer", "invalid peer", "x509"] {
        if chain.contains(terminal) {
            return TransportError::Tls(text);
        }
    }

    TransportError::Network(text)
}
