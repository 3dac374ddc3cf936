//! Builds the [`Sender`] variant a configuration asks for.

use std::sync::Arc;

use serde_json::json;
use tracing::info;

use crate::config::{Config, ConfigError, SendMode};
use crate::diagnostics::{Diagnostic, Diagnostics};
use crate::direct::DirectSender;
use crate::queue::{EnqueueError, JobQueue};
use crate::queued::QueuedSender;
use crate::sender::Sender;

/// Chooses between direct and queued delivery.
///
/// Queued delivery needs a [`JobQueue`]; without one, or when the configured
/// connection is not usable, the factory downgrades to direct delivery.
#[derive(Clone)]
pub struct SenderFactory {
    queue: Option<Arc<dyn JobQueue>>,
    diagnostics: Arc<dyn Diagnostics>,
}

impl SenderFactory {
    pub fn new(diagnostics: Arc<dyn Diagnostics>) -> Self {
        Self {
            queue: None,
            diagnostics,
        }
    }

    pub fn with_queue(mut self, queue: Arc<dyn JobQueue>) -> Self {
        self.queue = Some(queue);
        self
    }

    /// Mode names `create` accepts.
    pub fn available_modes() -> &'static [&'static str] {
        &SendMode::NAMES
    }

    /// Build the sender for `config`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::UnsupportedMode` for an unknown mode and
    /// `ConfigError::Invalid` for missing or unusable settings. An unusable
    /// queue is not an error: it yields a direct sender and one diagnostic
    /// warning.
    pub async fn create(&self, config: &Config) -> Result<Sender, ConfigError> {
        let mode = config.send_mode()?;
        config.validate()?;

        match mode {
            SendMode::Direct => direct(config),
            SendMode::Queue => match self.usable_queue(config).await {
                Ok(queue) => {
                    info!(
                        connection = %config.queue.connection,
                        queue = %config.queue.queue_name,
                        "Queued log delivery enabled"
                    );
                    Ok(Sender::Queued(QueuedSender::new(
                        config.clone(),
                        queue,
                        self.diagnostics.clone(),
                    )))
                }
                Err(e) => {
                    self.diagnostics.log(Diagnostic::warning(
                        "factory",
                        "Queue transport unavailable, using direct delivery",
                        json!({
                            "error": e.to_string(),
                            "connection": config.queue.connection,
                        }),
                    ));
                    direct(&config.as_direct())
                }
            },
        }
    }

    async fn usable_queue(&self, config: &Config) -> Result<Arc<dyn JobQueue>, EnqueueError> {
        let connection = &config.queue.connection;
        let queue = self
            .queue
            .clone()
            .ok_or_else(|| EnqueueError::UnknownConnection {
                connection: connection.clone(),
            })?;

        queue.check_connection(connection).await?;
        Ok(queue)
    }
}

fn direct(config: &Config) -> Result<Sender, ConfigError> {
    DirectSender::new(config)
        .map(Sender::Direct)
        .map_err(|e| ConfigError::invalid("direct", e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::{DiagnosticLevel, MemoryDiagnostics};
    use crate::queue::QueueRoute;
    use crate::task::DeliveryTask;
    use async_trait::async_trait;

    /// Knows a single connection, `default`.
    struct SingleConnectionQueue;

    #[async_trait]
    impl JobQueue for SingleConnectionQueue {
        async fn check_connection(&self, connection: &str) -> Result<(), EnqueueError> {
            if connection == "default" {
                Ok(())
            } else {
                Err(EnqueueError::UnknownConnection {
                    connection: connection.to_string(),
                })
            }
        }

        async fn enqueue(&self, _task: DeliveryTask, _route: &QueueRoute) -> Result<(), EnqueueError> {
            Ok(())
        }
    }

    fn queue_config(connection: &str) -> Config {
        let mut config = Config::new("secret", "http://localhost/logs", "billing");
        config.mode = "queue".to_string();
        config.queue.connection = connection.to_string();
        config
    }

    fn factory() -> (SenderFactory, Arc<MemoryDiagnostics>) {
        let diagnostics = Arc::new(MemoryDiagnostics::new());
        let factory = SenderFactory::new(diagnostics.clone()).with_queue(Arc::new(SingleConnectionQueue));
        (factory, diagnostics)
    }

    #[test]
    fn test_available_modes() {
        assert_eq!(SenderFactory::available_modes(), &["direct", "queue"]);
    }

    #[tokio::test]
    async fn test_unknown_mode_is_rejected() {
        let (factory, _) = factory();
        let mut config = Config::new("secret", "http://localhost/logs", "billing");
        config.mode = "bogus".to_string();

        let err = factory.create(&config).await.unwrap_err();
        assert_eq!(
            err,
            ConfigError::UnsupportedMode {
                mode: "bogus".to_string()
            }
        );
        let message = err.to_string();
        assert!(message.contains("bogus"));
        assert!(message.contains("direct, queue"));
    }

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let (factory, diagnostics) = factory();
        let config = Config::new("", "http://localhost/logs", "billing");

        assert!(matches!(
            factory.create(&config).await,
            Err(ConfigError::Invalid { .. })
        ));
        assert!(diagnostics.entries().is_empty());
    }

    #[tokio::test]
    async fn test_direct_mode() {
        let (factory, diagnostics) = factory();
        let config = Config::new("secret", "http://localhost/logs", "billing");

        let sender = factory.create(&config).await.unwrap();
        assert_eq!(sender.mode(), SendMode::Direct);
        assert!(diagnostics.entries().is_empty());
    }

    #[tokio::test]
    async fn test_missing_connection_downgrades_to_direct() {
        let (factory, diagnostics) = factory();

        let sender = factory.create(&queue_config("nonexistent")).await.unwrap();

        assert_eq!(sender.mode(), SendMode::Direct);
        assert_eq!(diagnostics.entries().len(), 1);
        assert_eq!(diagnostics.count(DiagnosticLevel::Warning), 1);
        assert_eq!(diagnostics.entries()[0].context["connection"], "nonexistent");
    }

    #[tokio::test]
    async fn test_no_job_system_downgrades_to_direct() {
        let diagnostics = Arc::new(MemoryDiagnostics::new());
        let factory = SenderFactory::new(diagnostics.clone());

        let sender = factory.create(&queue_config("default")).await.unwrap();

        assert_eq!(sender.mode(), SendMode::Direct);
        assert_eq!(diagnostics.count(DiagnosticLevel::Warning), 1);
    }

    #[tokio::test]
    async fn test_usable_queue_gives_queued_sender() {
        let (factory, diagnostics) = factory();

        let sender = factory.create(&queue_config("default")).await.unwrap();

        assert_eq!(sender.mode(), SendMode::Queue);
        assert!(diagnostics.entries().is_empty());
    }
}
