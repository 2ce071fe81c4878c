use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{Map, Value};

use super::identifier;

/// One parsed access-log entry
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub timestamp: DateTime<Utc>,
    /// Extracted fields in grammar order
    pub fields: Map<String, Value>,
    /// The original line, kept when some field could not be parsed cleanly
    pub raw_line: Option<String>,
}

impl LogRecord {
    pub fn new(timestamp: DateTime<Utc>, fields: Map<String, Value>) -> Self {
        Self {
            timestamp,
            fields,
            raw_line: None,
        }
    }

    /// Deterministic document id, see [`identifier::record_id`].
    pub fn id(&self) -> String {
        identifier::record_id(self)
    }

    pub fn is_partial(&self) -> bool {
        self.raw_line.is_some()
    }

    /// Document body sent to the store.
    pub fn to_document(&self) -> Value {
        let mut doc = Map::with_capacity(self.fields.len() + 2);
        doc.insert(
            "@timestamp".to_string(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true)),
        );
        for (name, value) in &self.fields {
            doc.insert(name.clone(), value.clone());
        }
        if let Some(raw) = &self.raw_line {
            doc.insert("raw_line".to_string(), Value::String(raw.clone()));
        }
        Value::Object(doc)
    }
}
