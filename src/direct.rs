//! Synchronous delivery: one POST on the caller's task, failures dropped.

use tracing::debug;

use crate::client::{IngestClient, TransportError};
use crate::config::Config;
use crate::normalize::Payload;

/// Sends each payload immediately with the short `direct.*` timeouts.
#[derive(Debug, Clone)]
pub struct DirectSender {
    client: IngestClient,
}

impl DirectSender {
    /// # Errors
    ///
    /// Returns `TransportError::Build` if the HTTP client cannot be built.
    pub fn new(config: &Config) -> Result<Self, TransportError> {
        Ok(Self {
            client: IngestClient::for_direct(config)?,
        })
    }

    /// Deliver `payload`, discarding any transport failure.
    ///
    /// Logging must never destabilise the host, so network errors, timeouts
    /// and non-success statuses end here.
    pub async fn send(&self, payload: &Payload) {
        if let Err(e) = self.try_send(payload).await {
            debug!(error = %e, url = %self.client.api_url(), "Direct delivery failed, record dropped");
        }
    }

    /// Deliver `payload` and report the outcome.
    pub async fn try_send(&self, payload: &Payload) -> Result<(), TransportError> {
        self.client.post(payload).await
    }
}
