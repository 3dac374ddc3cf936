//! Conversion of [`LogRecord`]s into the wire payload.
//!
//! Normalization never fails. Anything JSON cannot represent is degraded to a
//! descriptive string instead of being rejected.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

use crate::config::Config;
use crate::record::{Context, ContextValue, LogRecord};

/// JSON body POSTed to the ingestion endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payload {
    /// ISO-8601 UTC timestamp with a `Z` designator
    pub timestamp: String,

    /// Uppercase severity name
    pub log_level: String,

    pub message: String,

    pub app_name: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_uuid: Option<String>,

    /// Sanitized context, always a JSON object
    #[serde(default)]
    pub context: Map<String, Value>,
}

/// Build the wire payload for `record`, stamped with the application identity
/// from `config`.
pub fn normalize(record: &LogRecord, config: &Config) -> Payload {
    Payload {
        timestamp: record
            .timestamp
            .with_timezone(&Utc)
            .to_rfc3339_opts(SecondsFormat::Secs, true),
        log_level: record.level.as_str().to_string(),
        message: record.message.clone(),
        app_name: config.app_name.clone(),
        app_uuid: config.app_uuid.clone(),
        context: sanitize_context(&record.context),
    }
}

/// Recursively turn a context into a JSON object, dropping null entries.
pub fn sanitize_context(context: &Context) -> Map<String, Value> {
    context
        .iter()
        .filter_map(|(key, value)| sanitize_value(value).map(|v| (key.to_string(), v)))
        .collect()
}

/// Sanitize a single value; `None` means the value is dropped.
fn sanitize_value(value: &ContextValue) -> Option<Value> {
    let sanitized = match value {
        ContextValue::Null => return None,
        ContextValue::Bool(b) => Value::Bool(*b),
        ContextValue::Integer(i) => Value::Number((*i).into()),
        ContextValue::Unsigned(u) => Value::Number((*u).into()),
        // NaN and infinities have no JSON number form
        ContextValue::Float(f) => Number::from_f64(*f)
            .map(Value::Number)
            .unwrap_or_else(|| Value::String(f.to_string())),
        ContextValue::String(s) => Value::String(s.clone()),
        ContextValue::Map(map) => Value::Object(sanitize_context(map)),
        ContextValue::List(items) => Value::Array(items.iter().filter_map(sanitize_value).collect()),
        ContextValue::Object(object) => Value::String(
            object
                .display()
                .unwrap_or_else(|| object.type_name())
                .to_string(),
        ),
        ContextValue::Resource(resource) => Value::String(resource.kind().to_string()),
    };

    Some(sanitized)
}
