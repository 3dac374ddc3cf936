//! The delivery strategy a handler owns for its lifetime.

use std::fmt;

use crate::client::TransportError;
use crate::config::SendMode;
use crate::direct::DirectSender;
use crate::normalize::Payload;
use crate::queued::QueuedSender;

/// Errors a sender could not absorb itself.
#[derive(Debug)]
pub enum SendError {
    /// Enqueue failed and the direct fallback could not be built
    FallbackUnavailable(TransportError),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::FallbackUnavailable(e) => {
                write!(f, "Direct fallback could not be created: {}", e)
            }
        }
    }
}

impl std::error::Error for SendError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SendError::FallbackUnavailable(e) => Some(e),
        }
    }
}

/// Chosen once by [`SenderFactory`](crate::factory::SenderFactory).
#[derive(Debug)]
pub enum Sender {
    Direct(DirectSender),
    Queued(QueuedSender),
}

impl Sender {
    /// Hand `payload` to the transport.
    ///
    /// Delivery failures are absorbed by the variant; an error here means the
    /// record could not be handed to any transport at all.
    pub async fn send(&self, payload: &Payload) -> Result<(), SendError> {
        match self {
            Sender::Direct(sender) => {
                sender.send(payload).await;
                Ok(())
            }
            Sender::Queued(sender) => sender.send(payload).await,
        }
    }

    pub fn mode(&self) -> SendMode {
        match self {
            Sender::Direct(_) => SendMode::Direct,
            Sender::Queued(_) => SendMode::Queue,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::normalize::normalize;
    use crate::record::{LogRecord, Severity};
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn test_send_error_display() {
        let err = SendError::FallbackUnavailable(TransportError::Build("no TLS backend".to_string()));
        assert_eq!(
            err.to_string(),
            "Direct fallback could not be created: HTTP client configuration error: no TLS backend"
        );
        assert!(std::error::Error::source(&err).is_some());
    }

    #[tokio::test]
    async fn test_direct_variant_absorbs_failures() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(1)
            .mount(&server)
            .await;

        let config = Config::new("key", format!("{}/logs", server.uri()), "billing");
        let sender = Sender::Direct(DirectSender::new(&config).unwrap());
        let payload = normalize(&LogRecord::new(Severity::Critical, "disk full"), &config);

        assert_eq!(sender.mode(), SendMode::Direct);
        assert!(sender.send(&payload).await.is_ok());
    }
}
