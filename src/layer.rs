//! Bridge from `tracing` events to a [`Handler`].
//!
//! [`ForwardingLayer`] sits in a `tracing_subscriber` stack next to the usual
//! fmt layer. Every event at or above the handler's level becomes a
//! [`LogRecord`] whose fields make up the context; the write itself runs on a
//! tokio task so the emitting thread never waits on the network.
//!
//! Events from this crate and from the HTTP stack it uses are skipped, or
//! forwarding a record would produce more records to forward.

use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tracing::field::{Field, Visit};
use tracing::{Event, Subscriber};
use tracing_subscriber::layer::{Context as LayerContext, Layer};

use crate::diagnostics::is_own_target;
use crate::handler::Handler;
use crate::record::{Context, LogRecord, ObjectRef, Severity};

/// Targets whose events are never forwarded.
const IGNORED_TARGETS: [&str; 4] = ["hyper", "reqwest", "h2", "rustls"];

#[derive(Clone)]
pub struct ForwardingLayer {
    handler: Arc<Handler>,
    runtime: Handle,
    ignored_targets: Vec<String>,
    in_flight: Arc<AtomicUsize>,
}

impl ForwardingLayer {
    pub fn new(handler: Arc<Handler>, runtime: Handle) -> Self {
        Self {
            handler,
            runtime,
            ignored_targets: IGNORED_TARGETS.iter().map(|t| t.to_string()).collect(),
            in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Also skip events whose target starts with `target`.
    pub fn ignore_target(mut self, target: impl Into<String>) -> Self {
        self.ignored_targets.push(target.into());
        self
    }

    /// Number of writes started but not yet finished.
    pub fn pending(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// Wait until every started write has finished. Returns `false` if some
    /// were still running after `timeout`.
    pub async fn flush(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        while self.pending() > 0 {
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        true
    }

    fn forwards(&self, target: &str) -> bool {
        !is_own_target(target)
            && !self
                .ignored_targets
                .iter()
                .any(|ignored| target == ignored || target.starts_with(&format!("{}::", ignored)))
    }
}

impl fmt::Debug for ForwardingLayer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardingLayer")
            .field("ignored_targets", &self.ignored_targets)
            .field("pending", &self.pending())
            .finish()
    }
}

impl<S> Layer<S> for ForwardingLayer
where
    S: Subscriber,
{
    fn on_event(&self, event: &Event<'_>, _ctx: LayerContext<'_, S>) {
        let metadata = event.metadata();
        let level = Severity::from(*metadata.level());

        if !self.handler.handles(level) || !self.forwards(metadata.target()) {
            return;
        }

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);
        let record = LogRecord::new(level, visitor.message).with_context(visitor.context);

        let handler = self.handler.clone();
        let guard = InFlight::start(&self.in_flight);
        self.runtime.spawn(async move {
            handler.write(&record).await;
            drop(guard);
        });
    }
}

/// Decrements the in-flight count when dropped, including on abort.
struct InFlight(Arc<AtomicUsize>);

impl InFlight {
    fn start(counter: &Arc<AtomicUsize>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter.clone())
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    context: Context,
}

impl Visit for RecordVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        if field.name() == "message" {
            self.message = format!("{:?}", value);
        } else {
            self.context.insert(field.name(), format!("{:?}", value));
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        if field.name() == "message" {
            self.message = value.to_string();
        } else {
            self.context.insert(field.name(), value);
        }
    }

    fn record_i64(&mut self, field: &Field, value: i64) {
        self.context.insert(field.name(), value);
    }

    fn record_u64(&mut self, field: &Field, value: u64) {
        self.context.insert(field.name(), value);
    }

    fn record_f64(&mut self, field: &Field, value: f64) {
        self.context.insert(field.name(), value);
    }

    fn record_bool(&mut self, field: &Field, value: bool) {
        self.context.insert(field.name(), value);
    }

    fn record_error(&mut self, field: &Field, value: &(dyn std::error::Error + 'static)) {
        self.context.insert(field.name(), ObjectRef::displayable(value));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::diagnostics::{MemoryDiagnostics, DIAGNOSTIC_TARGET};
    use crate::factory::SenderFactory;
    use serde_json::Value;
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::Registry;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn layer_for(server: &MockServer, level: Severity) -> ForwardingLayer {
        let mut config = Config::new("secret", format!("{}/logs", server.uri()), "billing");
        config.level = level;
        let factory = SenderFactory::new(Arc::new(MemoryDiagnostics::new()));
        let handler = Handler::new(config, &factory).await.unwrap();
        ForwardingLayer::new(Arc::new(handler), Handle::current())
    }

    #[tokio::test]
    async fn test_event_is_forwarded_with_fields() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let layer = layer_for(&server, Severity::Debug).await;
        let subscriber = Registry::default().with(layer.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::warn!(target: "billing", order_id = 17u64, customer = "acme", retried = true, "payment declined");
        });

        assert!(layer.flush(Duration::from_secs(5)).await);

        let requests = server.received_requests().await.unwrap();
        let body: Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert_eq!(body["log_level"], "WARNING");
        assert_eq!(body["message"], "payment declined");
        assert_eq!(body["context"]["order_id"], 17);
        assert_eq!(body["context"]["customer"], "acme");
        assert_eq!(body["context"]["retried"], true);
    }

    #[tokio::test]
    async fn test_own_and_transport_targets_are_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let layer = layer_for(&server, Severity::Debug).await;
        let subscriber = Registry::default().with(layer.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::error!(target: DIAGNOSTIC_TARGET, "fallback failed");
            tracing::error!(target: "log_forwarder", "own event");
            tracing::error!(target: "hyper::proto::h1", "connection reset");
            tracing::error!(target: "reqwest", "request failed");
        });

        assert_eq!(layer.pending(), 0);
        assert!(layer.flush(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn test_events_below_level_are_skipped() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .expect(1)
            .mount(&server)
            .await;

        let layer = layer_for(&server, Severity::Error).await;
        let subscriber = Registry::default().with(layer.clone());
        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(target: "billing", "routine");
            tracing::warn!(target: "billing", "suspicious");
            tracing::error!(target: "billing", "broken");
        });

        assert!(layer.flush(Duration::from_secs(5)).await);
    }

    #[test]
    fn test_target_filter() {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let config = Config::new("secret", "http://localhost/logs", "billing");
        let factory = SenderFactory::new(Arc::new(MemoryDiagnostics::new()));
        let handler = runtime.block_on(Handler::new(config, &factory)).unwrap();
        let layer = ForwardingLayer::new(Arc::new(handler), runtime.handle().clone()).ignore_target("sqlx");

        assert!(layer.forwards("billing::payments"));
        assert!(layer.forwards("hyperion"));
        assert!(!layer.forwards("hyper"));
        assert!(!layer.forwards("sqlx::query"));
        assert!(!layer.forwards("log_forwarder::worker"));
    }
}
