//! Log records as produced by the host application.
//!
//! A [`LogRecord`] carries a timestamp with whatever offset the host used, an
//! ordered [`Severity`], a message and a free-form [`Context`]. Context values
//! may hold things JSON cannot express directly (opaque objects, OS handles);
//! the normalizer degrades those into strings before anything hits the wire.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use serde::{Deserialize, Serialize};

/// Log severity, ordered from least to most severe.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase", try_from = "String")]
pub enum Severity {
    #[default]
    Debug,
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl Severity {
    /// Get all severities, least severe first.
    pub fn all() -> &'static [Severity] {
        &[
            Severity::Debug,
            Severity::Info,
            Severity::Notice,
            Severity::Warning,
            Severity::Error,
            Severity::Critical,
            Severity::Alert,
            Severity::Emergency,
        ]
    }

    /// Uppercase wire name, e.g. `WARNING`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Debug => "DEBUG",
            Severity::Info => "INFO",
            Severity::Notice => "NOTICE",
            Severity::Warning => "WARNING",
            Severity::Error => "ERROR",
            Severity::Critical => "CRITICAL",
            Severity::Alert => "ALERT",
            Severity::Emergency => "EMERGENCY",
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when a severity name is not recognised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSeverityError(String);

impl fmt::Display for ParseSeverityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "'{}' is not a known log level", self.0)
    }
}

impl std::error::Error for ParseSeverityError {}

impl FromStr for Severity {
    type Err = ParseSeverityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "DEBUG" => Ok(Severity::Debug),
            "INFO" => Ok(Severity::Info),
            "NOTICE" => Ok(Severity::Notice),
            "WARN" | "WARNING" => Ok(Severity::Warning),
            "ERROR" => Ok(Severity::Error),
            "CRITICAL" => Ok(Severity::Critical),
            "ALERT" => Ok(Severity::Alert),
            "EMERGENCY" => Ok(Severity::Emergency),
            _ => Err(ParseSeverityError(s.to_string())),
        }
    }
}

impl TryFrom<String> for Severity {
    type Error = ParseSeverityError;

    fn try_from(value: String) -> Result<Self, ParseSeverityError> {
        value.parse()
    }
}

impl From<tracing::Level> for Severity {
    fn from(level: tracing::Level) -> Self {
        match level {
            tracing::Level::TRACE | tracing::Level::DEBUG => Severity::Debug,
            tracing::Level::INFO => Severity::Info,
            tracing::Level::WARN => Severity::Warning,
            tracing::Level::ERROR => Severity::Error,
        }
    }
}

/// A value with no JSON form, captured by its type name and, when it has one,
/// its string rendering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectRef {
    type_name: &'static str,
    display: Option<String>,
}

impl ObjectRef {
    /// Capture a value that knows how to render itself as a string.
    pub fn displayable<T: fmt::Display + ?Sized>(value: &T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            display: Some(value.to_string()),
        }
    }

    /// Capture a value by type name only.
    pub fn opaque<T: ?Sized>(_value: &T) -> Self {
        Self {
            type_name: std::any::type_name::<T>(),
            display: None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn display(&self) -> Option<&str> {
        self.display.as_deref()
    }
}

/// An OS-level handle (file, socket, stream) described by its kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
    kind: String,
}

impl ResourceRef {
    pub fn new(kind: impl Into<String>) -> Self {
        Self { kind: kind.into() }
    }

    pub fn kind(&self) -> &str {
        &self.kind
    }
}

impl From<&std::fs::File> for ResourceRef {
    fn from(_: &std::fs::File) -> Self {
        ResourceRef::new("file")
    }
}

impl From<&std::net::TcpStream> for ResourceRef {
    fn from(_: &std::net::TcpStream) -> Self {
        ResourceRef::new("tcp stream")
    }
}

/// A single context value.
#[derive(Debug, Clone, PartialEq)]
pub enum ContextValue {
    Null,
    Bool(bool),
    Integer(i64),
    Unsigned(u64),
    Float(f64),
    String(String),
    Map(Context),
    List(Vec<ContextValue>),
    Object(ObjectRef),
    Resource(ResourceRef),
}

impl ContextValue {
    pub fn is_null(&self) -> bool {
        matches!(self, ContextValue::Null)
    }

    /// Shorthand for a resource handle of the given kind.
    pub fn resource(kind: impl Into<String>) -> Self {
        ContextValue::Resource(ResourceRef::new(kind))
    }
}

impl From<bool> for ContextValue {
    fn from(value: bool) -> Self {
        ContextValue::Bool(value)
    }
}

impl From<i32> for ContextValue {
    fn from(value: i32) -> Self {
        ContextValue::Integer(value.into())
    }
}

impl From<i64> for ContextValue {
    fn from(value: i64) -> Self {
        ContextValue::Integer(value)
    }
}

impl From<u32> for ContextValue {
    fn from(value: u32) -> Self {
        ContextValue::Unsigned(value.into())
    }
}

impl From<u64> for ContextValue {
    fn from(value: u64) -> Self {
        ContextValue::Unsigned(value)
    }
}

impl From<f64> for ContextValue {
    fn from(value: f64) -> Self {
        ContextValue::Float(value)
    }
}

impl From<&str> for ContextValue {
    fn from(value: &str) -> Self {
        ContextValue::String(value.to_string())
    }
}

impl From<String> for ContextValue {
    fn from(value: String) -> Self {
        ContextValue::String(value)
    }
}

impl From<Context> for ContextValue {
    fn from(value: Context) -> Self {
        ContextValue::Map(value)
    }
}

impl From<ObjectRef> for ContextValue {
    fn from(value: ObjectRef) -> Self {
        ContextValue::Object(value)
    }
}

impl From<ResourceRef> for ContextValue {
    fn from(value: ResourceRef) -> Self {
        ContextValue::Resource(value)
    }
}

impl<T: Into<ContextValue>> From<Option<T>> for ContextValue {
    fn from(value: Option<T>) -> Self {
        value.map_or(ContextValue::Null, Into::into)
    }
}

impl<T: Into<ContextValue>> From<Vec<T>> for ContextValue {
    fn from(values: Vec<T>) -> Self {
        ContextValue::List(values.into_iter().map(Into::into).collect())
    }
}

impl From<serde_json::Value> for ContextValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;

        match value {
            Value::Null => ContextValue::Null,
            Value::Bool(b) => ContextValue::Bool(b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    ContextValue::Integer(i)
                } else if let Some(u) = n.as_u64() {
                    ContextValue::Unsigned(u)
                } else {
                    ContextValue::Float(n.as_f64().unwrap_or(f64::NAN))
                }
            }
            Value::String(s) => ContextValue::String(s),
            Value::Array(items) => {
                ContextValue::List(items.into_iter().map(ContextValue::from).collect())
            }
            Value::Object(map) => ContextValue::Map(
                map.into_iter()
                    .map(|(k, v)| (k, ContextValue::from(v)))
                    .collect(),
            ),
        }
    }
}

/// Insertion-ordered mapping from key to [`ContextValue`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Context {
    entries: Vec<(String, ContextValue)>,
}

impl Context {
    pub fn new() -> Self {
        Self::default()
    }

    /// Set `key`, replacing an existing value in place.
    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<ContextValue>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Builder-style [`Context::insert`].
    pub fn with(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn get(&self, key: &str) -> Option<&ContextValue> {
        self.entries.iter().find(|(k, _)| k == key).map(|(_, v)| v)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &ContextValue)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<ContextValue>> FromIterator<(K, V)> for Context {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut context = Context::new();
        for (key, value) in iter {
            context.insert(key, value);
        }
        context
    }
}

/// A single log record handed over by the host logging front-end.
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    /// When the record was produced, in the producer's offset
    pub timestamp: DateTime<FixedOffset>,

    pub level: Severity,

    pub message: String,

    pub context: Context,
}

impl LogRecord {
    /// Create a record stamped with the current time.
    pub fn new(level: Severity, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now().fixed_offset(),
            level,
            message: message.into(),
            context: Context::new(),
        }
    }

    /// Replace the timestamp, keeping the offset it was given in.
    pub fn at<Tz: TimeZone>(mut self, timestamp: DateTime<Tz>) -> Self {
        self.timestamp = timestamp.fixed_offset();
        self
    }

    pub fn with_context(mut self, context: Context) -> Self {
        self.context = context;
        self
    }

    /// Add a single context entry.
    pub fn with_field(mut self, key: impl Into<String>, value: impl Into<ContextValue>) -> Self {
        self.context.insert(key, value);
        self
    }
}
