//! Boundary with the background job system.
//!
//! The forwarder only produces serializable [`DeliveryTask`]s and hands them to
//! a [`JobQueue`] together with a [`QueueRoute`]. Whoever implements the queue
//! owns persistence, scheduling and retries; retries are driven through the
//! [`Job`] contract the task implements.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::QueueConfig;
use crate::diagnostics::Diagnostics;
use crate::task::DeliveryTask;

/// Where and when a task should run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueRoute {
    pub connection: String,
    pub queue_name: String,
    /// Start delay; zero means run as soon as possible
    pub delay: Duration,
}

impl QueueRoute {
    pub fn from_config(queue: &QueueConfig) -> Self {
        Self {
            connection: queue.connection.clone(),
            queue_name: queue.queue_name.clone(),
            delay: queue.delay(),
        }
    }
}

/// Errors raised when a task cannot be handed to the job system.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueError {
    /// No connection with this name is configured
    UnknownConnection { connection: String },

    /// The connection exists but its broker cannot take work
    Unavailable { connection: String, reason: String },

    /// The connection has been shut down
    Closed { connection: String },

    /// An error tagged with the component that raised it
    Tagged {
        origin: String,
        error: Box<EnqueueError>,
    },
}

impl EnqueueError {
    /// Tag this error with the component it originates from.
    pub fn with_origin(self, origin: impl Into<String>) -> Self {
        EnqueueError::Tagged {
            origin: origin.into(),
            error: Box::new(self),
        }
    }

    /// Outermost origin tag, if any.
    pub fn origin(&self) -> Option<&str> {
        match self {
            EnqueueError::Tagged { origin, .. } => Some(origin),
            _ => None,
        }
    }

    /// Whether any tag in the chain equals `tag`.
    pub fn originates_from(&self, tag: &str) -> bool {
        match self {
            EnqueueError::Tagged { origin, error } => origin == tag || error.originates_from(tag),
            _ => false,
        }
    }
}

impl fmt::Display for EnqueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EnqueueError::UnknownConnection { connection } => {
                write!(f, "Queue connection [{}] is not configured", connection)
            }
            EnqueueError::Unavailable { connection, reason } => {
                write!(f, "Queue connection [{}] is unavailable: {}", connection, reason)
            }
            EnqueueError::Closed { connection } => {
                write!(f, "Queue connection [{}] is closed", connection)
            }
            EnqueueError::Tagged { origin, error } => write!(f, "{} (raised by {})", error, origin),
        }
    }
}

impl std::error::Error for EnqueueError {}

/// Scheduling side of the job system.
///
/// An implementation whose failure was itself caused by this crate (for
/// example a broker client whose own logging is forwarded through a
/// [`Handler`](crate::handler::Handler)) should return the error tagged with
/// `.with_origin(SOURCE_TAG)` ([`SOURCE_TAG`](crate::diagnostics::SOURCE_TAG)).
/// The queued sender still falls back to direct delivery for tagged errors
/// but does not report them again, so a failing queue cannot feed its own
/// failures back into the forwarder.
#[async_trait]
pub trait JobQueue: Send + Sync {
    /// Check that `connection` exists and can accept work right now.
    async fn check_connection(&self, connection: &str) -> Result<(), EnqueueError>;

    /// Hand `task` over for execution according to `route`.
    async fn enqueue(&self, task: DeliveryTask, route: &QueueRoute) -> Result<(), EnqueueError>;
}

/// Execution side of the job system: a unit of work that can be attempted,
/// retried with backoff, and reported once it gives up.
#[async_trait]
pub trait Job: Send + Sync + 'static {
    type Error: fmt::Display + Send;

    /// Make one attempt.
    async fn execute(&self) -> Result<(), Self::Error>;

    /// Total number of attempts allowed.
    fn max_tries(&self) -> u32;

    /// Wait before the next attempt, given how many attempts have been made.
    fn backoff(&self, attempts: u32) -> Duration;

    /// Called once after the final failed attempt.
    fn failed(&self, error: Self::Error, attempts: u32, diagnostics: &dyn Diagnostics);
}
