use std::collections::BTreeMap;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Severity of an event ingested through log ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Emergency,
    Error,
    Alert,
    Critical,
    Severe,
    Warn,
    Notice,
    #[default]
    Info,
    Debug,
}

impl Severity {
    pub fn as_str(self) -> &'static str {
        match self {
            Severity::Emergency => "EMERGENCY",
            Severity::Error => "ERROR",
            Severity::Alert => "ALERT",
            Severity::Critical => "CRITICAL",
            Severity::Severe => "SEVERE",
            Severity::Warn => "WARN",
            Severity::Notice => "NOTICE",
            Severity::Info => "INFO",
            Severity::Debug => "DEBUG",
        }
    }
}

/// A titled event destined for log ingest.
#[derive(Debug, Clone, PartialEq)]
pub struct Event {
    pub title: String,
    pub description: String,
    pub severity: Severity,
    pub timestamp: DateTime<Utc>,
    pub properties: BTreeMap<String, String>,
}

impl Event {
    pub fn new(title: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            description: description.into(),
            severity: Severity::Info,
            timestamp: Utc::now(),
            properties: BTreeMap::new(),
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Render as a log-ingest JSON object. `metadata` is merged before the
    /// event's own properties, so properties override metadata.
    pub fn to_json(&self, metadata: &BTreeMap<String, String>) -> Value {
        let mut obj = Map::new();
        obj.insert(
            "content".into(),
            Value::String(format!("{}\n{}", self.title, self.description)),
        );
        obj.insert("title".into(), Value::String(self.title.clone()));
        obj.insert("description".into(), Value::String(self.description.clone()));
        obj.insert(
            "timestamp".into(),
            Value::String(self.timestamp.to_rfc3339_opts(SecondsFormat::Secs, true)),
        );
        obj.insert("severity".into(), Value::String(self.severity.as_str().into()));
        for (k, v) in metadata.iter().chain(self.properties.iter()) {
            obj.insert(k.clone(), Value::String(v.clone()));
        }
        Value::Object(obj)
    }
}

/// Wrap a raw log line as a log-ingest record.
pub fn log_line(content: impl Into<String>) -> Value {
    serde_json::json!({ "content": content.into() })
}
