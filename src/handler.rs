//! Entry point for the host logging front-end.

use tracing::debug;

use crate::config::{Config, ConfigError};
use crate::factory::SenderFactory;
use crate::normalize::normalize;
use crate::record::{LogRecord, Severity};
use crate::sender::Sender;

/// Forwards records to the ingestion endpoint through one [`Sender`].
///
/// The sender is chosen when the handler is built and kept for its lifetime;
/// changing the configuration means building a new handler.
#[derive(Debug)]
pub struct Handler {
    config: Config,
    sender: Sender,
    level: Severity,
}

impl Handler {
    /// # Errors
    ///
    /// Returns `ConfigError` if the configuration is invalid or names an
    /// unsupported mode.
    pub async fn new(config: Config, factory: &SenderFactory) -> Result<Self, ConfigError> {
        let sender = factory.create(&config).await?;
        debug!(mode = %sender.mode(), level = %config.level, app = %config.app_name, "Log handler ready");

        Ok(Self {
            level: config.level,
            config,
            sender,
        })
    }

    /// Whether records at `level` are forwarded.
    pub fn handles(&self, level: Severity) -> bool {
        level >= self.level
    }

    /// Forward `record` if its level passes the handler's minimum.
    /// Returns whether the record was forwarded.
    pub async fn handle(&self, record: &LogRecord) -> bool {
        if !self.handles(record.level) {
            return false;
        }

        self.write(record).await;
        true
    }

    /// Normalize and send `record`. Never fails: whatever the sender could
    /// not absorb is dropped here.
    pub async fn write(&self, record: &LogRecord) {
        let payload = normalize(record, &self.config);

        if let Err(e) = self.sender.send(&payload).await {
            debug!(error = %e, level = %record.level, "Log record dropped");
        }
    }

    pub fn sender(&self) -> &Sender {
        &self.sender
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SendMode;
    use crate::diagnostics::MemoryDiagnostics;
    use std::sync::Arc;
    use wiremock::matchers::{body_partial_json, method};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn factory() -> SenderFactory {
        SenderFactory::new(Arc::new(MemoryDiagnostics::new()))
    }

    #[tokio::test]
    async fn test_level_threshold() {
        let mut config = Config::new("secret", "http://localhost/logs", "billing");
        config.level = Severity::Warning;
        let handler = Handler::new(config, &factory()).await.unwrap();

        assert!(!handler.handles(Severity::Debug));
        assert!(!handler.handles(Severity::Notice));
        assert!(handler.handles(Severity::Warning));
        assert!(handler.handles(Severity::Emergency));
    }

    #[tokio::test]
    async fn test_handle_skips_records_below_level() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(body_partial_json(serde_json::json!({ "log_level": "ERROR" })))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let mut config = Config::new("secret", format!("{}/logs", server.uri()), "billing");
        config.level = Severity::Error;
        let handler = Handler::new(config, &factory()).await.unwrap();

        assert!(!handler.handle(&LogRecord::new(Severity::Info, "ignored")).await);
        assert!(handler.handle(&LogRecord::new(Severity::Error, "forwarded")).await);
    }

    #[tokio::test]
    async fn test_unsupported_mode_fails_construction() {
        let mut config = Config::new("secret", "http://localhost/logs", "billing");
        config.mode = "syslog".to_string();

        let err = Handler::new(config, &factory()).await.unwrap_err();
        assert!(err.to_string().contains("syslog"));
    }

    #[tokio::test]
    async fn test_handler_keeps_its_sender() {
        let config = Config::new("secret", "http://localhost/logs", "billing");
        let handler = Handler::new(config.clone(), &factory()).await.unwrap();

        assert_eq!(handler.sender().mode(), SendMode::Direct);
        assert_eq!(handler.config(), &config);
    }
}
