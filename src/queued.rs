//! Deferred delivery through the host's job system, with a direct fallback.

use std::fmt;
use std::sync::Arc;

use serde_json::json;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::config::Config;
use crate::diagnostics::{Diagnostic, Diagnostics, SOURCE_TAG};
use crate::direct::DirectSender;
use crate::normalize::Payload;
use crate::queue::{EnqueueError, JobQueue, QueueRoute};
use crate::sender::SendError;
use crate::task::DeliveryTask;

pub struct QueuedSender {
    config: Config,
    queue: Arc<dyn JobQueue>,
    route: QueueRoute,
    fallback: OnceCell<DirectSender>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl QueuedSender {
    pub fn new(config: Config, queue: Arc<dyn JobQueue>, diagnostics: Arc<dyn Diagnostics>) -> Self {
        let route = QueueRoute::from_config(&config.queue);
        Self {
            config,
            queue,
            route,
            fallback: OnceCell::new(),
            diagnostics,
        }
    }

    pub fn route(&self) -> &QueueRoute {
        &self.route
    }

    /// Enqueue a [`DeliveryTask`] for `payload`; if the job system refuses
    /// it, deliver directly instead.
    ///
    /// # Errors
    ///
    /// Returns `SendError::FallbackUnavailable` only when enqueue failed and
    /// the direct fallback could not be built either.
    pub async fn send(&self, payload: &Payload) -> Result<(), SendError> {
        let task = DeliveryTask::new(payload.clone(), self.config.clone());
        let task_id = task.id();

        match self.queue.enqueue(task, &self.route).await {
            Ok(()) => {
                debug!(task_id = %task_id, queue = %self.route.queue_name, "Record queued for delivery");
                Ok(())
            }
            Err(e) => {
                self.report_enqueue_failure(&e);
                let fallback = self.fallback().await?;
                fallback.send(payload).await;
                Ok(())
            }
        }
    }

    fn report_enqueue_failure(&self, error: &EnqueueError) {
        // Errors raised by this crate are not reported again
        if error.originates_from(SOURCE_TAG) {
            return;
        }

        self.diagnostics.log(Diagnostic::warning(
            "queued_sender",
            "Failed to queue log, falling back to direct delivery",
            json!({
                "error": error.to_string(),
                "connection": self.route.connection,
                "queue": self.route.queue_name,
            }),
        ));
    }

    async fn fallback(&self) -> Result<&DirectSender, SendError> {
        self.fallback
            .get_or_try_init(|| async { DirectSender::new(&self.config.as_direct()) })
            .await
            .map_err(SendError::FallbackUnavailable)
    }
}

impl fmt::Debug for QueuedSender {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueuedSender")
            .field("route", &self.route)
            .field("api_url", &self.config.api_url)
            .field("fallback_ready", &self.fallback.initialized())
            .finish()
    }
}
