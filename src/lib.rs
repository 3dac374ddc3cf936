//! Log Forwarder Library
//!
//! This library ships application log records to a remote ingestion endpoint:
//!
//! - **record**: Log records, severities and structured context
//! - **normalize**: Conversion of records into the JSON wire payload
//! - **config**: Configuration from a host map or the environment
//! - **client**: HTTP client for the ingestion endpoint
//! - **direct** / **queued** / **sender**: Delivery strategies
//! - **factory**: Chooses the delivery strategy from configuration
//! - **queue** / **task** / **worker**: Job system boundary, delivery tasks and
//!   an in-process job system
//! - **handler**: Entry point for the host logging front-end
//! - **layer**: `tracing` bridge
//! - **diagnostics**: Local channel for the forwarder's own failures
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use log_forwarder::config::Config;
//! use log_forwarder::diagnostics::TracingDiagnostics;
//! use log_forwarder::factory::SenderFactory;
//! use log_forwarder::handler::Handler;
//! use log_forwarder::record::{LogRecord, Severity};
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Build a handler; queue mode needs a job system via `with_queue`
//!     let factory = SenderFactory::new(Arc::new(TracingDiagnostics));
//!     let handler = Handler::new(config, &factory).await.expect("Invalid config");
//!
//!     // Forward a record
//!     let record = LogRecord::new(Severity::Info, "user signed in").with_field("user_id", 42);
//!     handler.write(&record).await;
//! }
//! ```

// Module declarations
pub mod client;
pub mod config;
pub mod diagnostics;
pub mod direct;
pub mod factory;
pub mod handler;
pub mod layer;
pub mod normalize;
pub mod queue;
pub mod queued;
pub mod record;
pub mod sender;
pub mod task;
pub mod worker;

// Re-export commonly used types at crate root for convenience
pub use client::{IngestClient, TransportError};
pub use config::{Config, ConfigError, DirectConfig, QueueConfig, SendMode};
pub use diagnostics::{Diagnostic, DiagnosticLevel, Diagnostics, MemoryDiagnostics, TracingDiagnostics};
pub use direct::DirectSender;
pub use factory::SenderFactory;
pub use handler::Handler;
pub use layer::ForwardingLayer;
pub use normalize::{normalize, Payload};
pub use queue::{EnqueueError, Job, JobQueue, QueueRoute};
pub use queued::QueuedSender;
pub use record::{Context, ContextValue, LogRecord, ObjectRef, ResourceRef, Severity};
pub use sender::{SendError, Sender};
pub use task::DeliveryTask;
pub use worker::{InProcessQueue, JobOutcome, TaskWorker, WorkerConfig, WorkerStats};
