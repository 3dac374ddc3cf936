//! HTTP client module for POSTing payloads to the ingestion endpoint.
//!
//! [`IngestClient`] performs exactly one request per call. Retrying is left
//! to the caller: direct delivery never retries, queued delivery is retried by
//! the job system.

use std::time::Duration;

use reqwest::{Client, StatusCode};
use tracing::debug;

use crate::config::Config;
use crate::normalize::Payload;

/// Header carrying the API key.
pub const API_KEY_HEADER: &str = "X-API-KEY";

/// Total timeout for background delivery.
pub const BACKGROUND_TIMEOUT: Duration = Duration::from_secs(30);

/// Connect timeout for background delivery.
pub const BACKGROUND_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors that can occur while delivering a payload.
#[derive(Debug)]
pub enum TransportError {
    /// HTTP request failed before a response arrived
    Request(reqwest::Error),

    /// Endpoint answered with a non-success status
    Status(StatusCode),

    /// Request timed out
    Timeout,

    /// HTTP client could not be built
    Build(String),
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Request(e) => write!(f, "HTTP request failed: {}", e),
            TransportError::Status(code) => write!(f, "Ingestion endpoint returned {}", code),
            TransportError::Timeout => write!(f, "Request timed out"),
            TransportError::Build(e) => write!(f, "HTTP client configuration error: {}", e),
        }
    }
}

impl std::error::Error for TransportError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            TransportError::Request(e) => Some(e),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for TransportError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            TransportError::Timeout
        } else {
            TransportError::Request(err)
        }
    }
}

/// HTTP client bound to one endpoint and API key.
///
/// The underlying `reqwest::Client` is reused across calls for connection
/// pooling.
#[derive(Debug, Clone)]
pub struct IngestClient {
    client: Client,
    api_url: String,
    api_key: String,
    timeout: Duration,
}

impl IngestClient {
    /// Create a client with explicit timeouts.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Build` if the HTTP client cannot be built.
    pub fn new(
        api_url: impl Into<String>,
        api_key: impl Into<String>,
        timeout: Duration,
        connect_timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(connect_timeout)
            .pool_idle_timeout(Duration::from_secs(90))
            .user_agent(format!("log-forwarder/{}", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| TransportError::Build(e.to_string()))?;

        Ok(Self {
            client,
            api_url: api_url.into(),
            api_key: api_key.into(),
            timeout,
        })
    }

    /// Client tuned for request-path delivery (`direct.*` timeouts).
    pub fn for_direct(config: &Config) -> Result<Self, TransportError> {
        Self::new(
            &config.api_url,
            &config.api_key,
            config.direct.timeout(),
            config.direct.connect_timeout(),
        )
    }

    /// Client tuned for background delivery, where latency matters less.
    pub fn for_background(config: &Config) -> Result<Self, TransportError> {
        Self::new(
            &config.api_url,
            &config.api_key,
            BACKGROUND_TIMEOUT,
            BACKGROUND_CONNECT_TIMEOUT,
        )
    }

    /// POST one payload. Success is decided by the status code alone; the
    /// response body is ignored.
    pub async fn post(&self, payload: &Payload) -> Result<(), TransportError> {
        let response = self
            .client
            .post(&self.api_url)
            .header(API_KEY_HEADER, &self.api_key)
            .json(payload)
            .send()
            .await?;

        let status = response.status();
        if status.is_success() {
            debug!(status = %status, url = %self.api_url, "Payload accepted");
            Ok(())
        } else {
            Err(TransportError::Status(status))
        }
    }

    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }
}
