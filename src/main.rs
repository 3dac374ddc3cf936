//! Log Forwarder - demo service for the log forwarding client
//!
//! This binary installs the forwarding `tracing` layer, emits sample records at
//! every severity and ships them to the configured ingestion endpoint.
//!
//! ## Features
//!
//! - Direct or queued delivery selected by `LOG_FORWARDER_MODE`
//! - In-process job system with retries and exponential backoff in queue mode
//! - Graceful shutdown on Ctrl+C, draining queued deliveries
//!
//! ## Configuration
//!
//! Configuration is loaded from environment variables:
//!
//! - `LOG_FORWARDER_API_KEY`: API key sent as `X-API-KEY` (required)
//! - `LOG_FORWARDER_API_URL`: Ingestion endpoint (default: http://localhost:8000/logs)
//! - `LOG_FORWARDER_APP_NAME`: Application name (default: app)
//! - `LOG_FORWARDER_MODE`: `direct` or `queue` (default: direct)
//! - `LOG_FORWARDER_QUEUE_*`: Queue routing and retry settings
//! - `RUST_LOG`: Logging level filter (default: info)

use std::sync::Arc;
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::time::interval;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::reload;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Registry};

use log_forwarder::config::{Config, SendMode};
use log_forwarder::diagnostics::{Diagnostics, TracingDiagnostics};
use log_forwarder::factory::SenderFactory;
use log_forwarder::handler::Handler;
use log_forwarder::layer::ForwardingLayer;
use log_forwarder::record::{Context, ContextValue, LogRecord, ObjectRef, Severity};
use log_forwarder::worker::{InProcessQueue, WorkerConfig};

/// Target of the sample events; this crate's own targets are never forwarded
const SAMPLE_TARGET: &str = "checkout";

/// Number of sample rounds before the demo finishes on its own
const SAMPLE_ROUNDS: u32 = 3;

/// Pause between sample rounds in milliseconds
const DEFAULT_SAMPLE_INTERVAL_MS: u64 = 500;

/// Random wait added to each queued retry, as a fraction of the backoff
const RETRY_JITTER_RATIO: f64 = 0.1;

/// How long shutdown waits for outstanding deliveries
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(10);

type ForwardingHandle = reload::Handle<Option<ForwardingLayer>, Registry>;

#[tokio::main]
async fn main() {
    // Initialize tracing; forwarding is switched on once the handler exists
    let forwarding = init_tracing();

    info!("Starting Log Forwarder demo...");

    // Load configuration from environment
    let config = match Config::from_env() {
        Ok(config) => {
            info!(
                api_url = %config.api_url,
                app_name = %config.app_name,
                mode = %config.mode,
                level = %config.level,
                "Configuration loaded"
            );
            config
        }
        Err(e) => {
            error!(error = %e, "Failed to load configuration");
            std::process::exit(1);
        }
    };

    let diagnostics: Arc<dyn Diagnostics> = Arc::new(TracingDiagnostics);
    let mut factory = SenderFactory::new(diagnostics.clone());

    // Queue mode runs deliveries through the in-process job system
    let queue = match config.send_mode() {
        Ok(SendMode::Queue) => {
            let queue = Arc::new(InProcessQueue::start(
                [config.queue.connection.clone()],
                WorkerConfig {
                    jitter_ratio: RETRY_JITTER_RATIO,
                    ..WorkerConfig::default()
                },
                diagnostics.clone(),
            ));
            factory = factory.with_queue(queue.clone());
            Some(queue)
        }
        _ => None,
    };

    let handler = match Handler::new(config, &factory).await {
        Ok(handler) => {
            info!(mode = %handler.sender().mode(), "Log handler initialized");
            Arc::new(handler)
        }
        Err(e) => {
            error!(error = %e, "Failed to create log handler");
            std::process::exit(1);
        }
    };

    let layer = ForwardingLayer::new(handler.clone(), Handle::current());
    if let Err(e) = forwarding.reload(Some(layer.clone())) {
        error!(error = %e, "Failed to install forwarding layer");
        std::process::exit(1);
    }

    // Spawn sample task - emits records at every severity
    let mut sample_handle = tokio::spawn(async move {
        info!("Sample task started");
        run_samples(&handler).await;
        info!("Sample task completed");
    });

    // Wait for the samples to finish or a shutdown signal
    info!("Log Forwarder running. Press Ctrl+C to stop.");
    tokio::select! {
        result = &mut sample_handle => {
            if let Err(e) = result {
                warn!(error = %e, "Sample task panicked");
            }
        }
        signal = tokio::signal::ctrl_c() => {
            match signal {
                Ok(()) => info!("Shutdown signal received, stopping..."),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            sample_handle.abort();
        }
    }

    // Graceful shutdown
    info!("Initiating graceful shutdown...");

    if !layer.flush(SHUTDOWN_TIMEOUT).await {
        warn!(pending = layer.pending(), "Forwarded writes still running after {:?}", SHUTDOWN_TIMEOUT);
    }

    if let Some(queue) = queue {
        if queue.shutdown(SHUTDOWN_TIMEOUT).await {
            info!("Queue drained gracefully");
        }
        let stats = queue.stats();
        info!(
            enqueued = stats.enqueued,
            delivered = stats.delivered,
            exhausted = stats.exhausted,
            retries = stats.retries,
            "Queue statistics"
        );
    }

    info!("Log Forwarder stopped");
}

/// Initialize the tracing subscriber with environment-based filtering and an
/// initially empty slot for the forwarding layer.
fn init_tracing() -> ForwardingHandle {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info"));
    let (forwarding, handle) = reload::Layer::new(None);

    tracing_subscriber::registry()
        .with(forwarding)
        .with(filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(true)
                .with_thread_ids(false)
                .with_file(false)
                .with_line_number(false)
                .compact(),
        )
        .init();

    handle
}

/// Emit a few rounds of sample records.
///
/// `tracing` covers debug through error; the severities it has no level for
/// go straight to the handler.
async fn run_samples(handler: &Handler) {
    let mut ticker = interval(Duration::from_millis(DEFAULT_SAMPLE_INTERVAL_MS));

    for round in 1..=SAMPLE_ROUNDS {
        ticker.tick().await;

        tracing::debug!(target: SAMPLE_TARGET, round = round, cart_items = 3u64, "Cart loaded");
        tracing::info!(target: SAMPLE_TARGET, round = round, order_id = 1042u64, "Order placed");
        tracing::warn!(target: SAMPLE_TARGET, round = round, latency_ms = 870u64, "Payment provider slow");
        tracing::error!(target: SAMPLE_TARGET, round = round, provider = "acme-pay", "Payment declined");

        for record in sample_records(round) {
            handler.handle(&record).await;
        }
    }
}

/// Records for the severities `tracing` cannot express, with nested context.
fn sample_records(round: u32) -> Vec<LogRecord> {
    let order = Context::new()
        .with("id", 1042)
        .with("items", vec!["book", "pen"])
        .with("coupon", None::<String>)
        .with("total", 49.90);

    let context = Context::new()
        .with("round", round)
        .with("order", order)
        .with("peer", ObjectRef::displayable(&std::net::Ipv4Addr::LOCALHOST))
        .with("socket", ContextValue::resource("tcp stream"));

    [
        (Severity::Notice, "Refund requested"),
        (Severity::Critical, "Inventory service unreachable"),
        (Severity::Alert, "Order backlog above threshold"),
        (Severity::Emergency, "Checkout unavailable"),
    ]
    .into_iter()
    .map(|(level, message)| LogRecord::new(level, message).with_context(context.clone()))
    .collect()
}
