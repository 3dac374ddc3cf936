//! Local diagnostic channel for the forwarder's own failures.
//!
//! Fallback warnings, downgrade warnings and exhausted deliveries are reported
//! here rather than through the forwarding path, so a broken forwarder cannot
//! feed its own failures back into itself. The default sink writes to
//! `tracing` under [`DIAGNOSTIC_TARGET`], which the tracing bridge never
//! forwards.

use std::fmt;
use std::sync::Mutex;

use serde_json::Value;
use tracing::{error, warn};

/// Source tag carried by errors and diagnostics raised inside this crate.
pub const SOURCE_TAG: &str = "log_forwarder";

/// `tracing` target used by [`TracingDiagnostics`].
pub const DIAGNOSTIC_TARGET: &str = "log_forwarder::diagnostics";

/// Severity of a diagnostic entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiagnosticLevel {
    Warning,
    Error,
}

/// One operational message about the forwarder itself.
#[derive(Debug, Clone, PartialEq)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,

    /// Component that raised the entry, e.g. `queued_sender`
    pub source: &'static str,

    pub message: String,

    /// Structured details (error text, payload, attempt counts)
    pub context: Value,
}

impl Diagnostic {
    pub fn warning(source: &'static str, message: impl Into<String>, context: Value) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            source,
            message: message.into(),
            context,
        }
    }

    pub fn error(source: &'static str, message: impl Into<String>, context: Value) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            source,
            message: message.into(),
            context,
        }
    }
}

/// Sink for diagnostics; the forwarder never routes these through itself.
pub trait Diagnostics: Send + Sync {
    fn log(&self, diagnostic: Diagnostic);
}

/// Writes diagnostics as `tracing` events on [`DIAGNOSTIC_TARGET`].
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl Diagnostics for TracingDiagnostics {
    fn log(&self, diagnostic: Diagnostic) {
        match diagnostic.level {
            DiagnosticLevel::Warning => warn!(
                target: DIAGNOSTIC_TARGET,
                source = diagnostic.source,
                context = %diagnostic.context,
                "{}",
                diagnostic.message
            ),
            DiagnosticLevel::Error => error!(
                target: DIAGNOSTIC_TARGET,
                source = diagnostic.source,
                context = %diagnostic.context,
                "{}",
                diagnostic.message
            ),
        }
    }
}

/// Keeps diagnostics in memory so they can be inspected later.
#[derive(Default)]
pub struct MemoryDiagnostics {
    entries: Mutex<Vec<Diagnostic>>,
}

impl MemoryDiagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything logged so far.
    pub fn entries(&self) -> Vec<Diagnostic> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }

    pub fn count(&self, level: DiagnosticLevel) -> usize {
        self.entries()
            .iter()
            .filter(|d| d.level == level)
            .count()
    }
}

impl fmt::Debug for MemoryDiagnostics {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryDiagnostics")
            .field("entries", &self.entries().len())
            .finish()
    }
}

impl Diagnostics for MemoryDiagnostics {
    fn log(&self, diagnostic: Diagnostic) {
        if let Ok(mut entries) = self.entries.lock() {
            entries.push(diagnostic);
        }
    }
}

/// Whether a `tracing` target belongs to this crate.
pub fn is_own_target(target: &str) -> bool {
    target == SOURCE_TAG
        || target
            .strip_prefix(SOURCE_TAG)
            .is_some_and(|rest| rest.starts_with("::"))
}
