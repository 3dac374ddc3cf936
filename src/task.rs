//! Deferred delivery of one payload.
//!
//! A [`DeliveryTask`] owns a copy of the payload and of the configuration as it
//! was at enqueue time, so it can be serialized, persisted and executed long
//! after the originating sender is gone. The HTTP client is built on the
//! first attempt and reused by later ones; it is never serialized.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::OnceCell;
use uuid::Uuid;

use crate::client::{IngestClient, TransportError};
use crate::config::Config;
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::normalize::Payload;
use crate::queue::Job;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveryTask {
    id: Uuid,
    payload: Payload,
    config: Config,
    #[serde(skip)]
    client: OnceCell<IngestClient>,
}

impl DeliveryTask {
    pub fn new(payload: Payload, config: Config) -> Self {
        Self {
            id: Uuid::new_v4(),
            payload,
            config,
            client: OnceCell::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// One POST with the background timeouts.
    pub async fn execute(&self) -> Result<(), TransportError> {
        let client = self
            .client
            .get_or_try_init(|| async { IngestClient::for_background(&self.config) })
            .await?;
        client.post(&self.payload).await
    }

    pub fn max_tries(&self) -> u32 {
        self.config.queue.max_tries
    }

    /// `retry_after * 2^(attempts - 1)`: the first retry waits `retry_after`,
    /// each further one twice as long as the last.
    pub fn backoff(&self, attempts: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempts.saturating_sub(1));
        Duration::from_secs(self.config.queue.retry_after_secs.saturating_mul(factor))
    }

    /// Report a delivery that used up every attempt.
    pub fn report_failure(
        &self,
        error: &TransportError,
        attempts: u32,
        diagnostics: &dyn Diagnostics,
    ) {
        let log_data = serde_json::to_value(&self.payload).unwrap_or(Value::Null);
        diagnostics.log(Diagnostic::error(
            "delivery_task",
            "Queued log delivery failed after all retries",
            json!({
                "task_id": self.id.to_string(),
                "exception": error.to_string(),
                "log_data": log_data,
                "attempts": attempts,
                "max_tries": self.max_tries(),
            }),
        ));
    }
}

// The cached client is not part of a task's identity
impl PartialEq for DeliveryTask {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.payload == other.payload && self.config == other.config
    }
}

#[async_trait]
impl Job for DeliveryTask {
    type Error = TransportError;

    async fn execute(&self) -> Result<(), TransportError> {
        DeliveryTask::execute(self).await
    }

    fn max_tries(&self) -> u32 {
        DeliveryTask::max_tries(self)
    }

    fn backoff(&self, attempts: u32) -> Duration {
        DeliveryTask::backoff(self, attempts)
    }

    fn failed(&self, error: TransportError, attempts: u32, diagnostics: &dyn Diagnostics) {
        self.report_failure(&error, attempts, diagnostics);
    }
}
