//! Raw events delivered by external watchers.
//!
//! Filesystem watchers, process supervisors, schedulers and webhook
//! receivers all deliver through this one shape. No validation happens here
//! beyond type coercion; classification is downstream.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An unclassified event as received at the ingestion boundary.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RawEvent {
    /// When the event happened. Defaults to ingestion time if absent.
    #[serde(default)]
    pub timestamp: Option<DateTime<Utc>>,
    /// Which watcher delivered the event (e.g. "fs", "supervisor", "cron").
    #[serde(default = "default_source")]
    pub source: String,
    /// Event type string, coerced to an observation type by the classifier.
    pub event_type: String,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
    #[serde(default)]
    pub description: String,
}

fn default_source() -> String {
    "external".to_string()
}

impl RawEvent {
    pub fn new(source: &str, event_type: &str, description: &str) -> Self {
        Self {
            timestamp: Some(Utc::now()),
            source: source.to_string(),
            event_type: event_type.to_string(),
            metadata: serde_json::Map::new(),
            description: description.to_string(),
        }
    }

    /// Convenience for filesystem events: sets `metadata.path`.
    pub fn file(event_type: &str, path: &str) -> Self {
        Self::new("fs", event_type, &format!("{event_type}: {path}"))
            .with_metadata("path", serde_json::Value::String(path.to_string()))
    }

    pub fn with_metadata(mut self, key: &str, value: serde_json::Value) -> Self {
        self.metadata.insert(key.to_string(), value);
        self
    }

    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    /// The `path` metadata entry, if it is a non-empty string.
    pub fn path(&self) -> Option<&str> {
        self.metadata
            .get("path")
            .and_then(|v| v.as_str())
            .filter(|p| !p.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_json_line_parses() {
        let event: RawEvent =
            serde_json::from_str(r#"{"event_type":"file_modified","metadata":{"path":"a.md"}}"#)
                .unwrap();
        assert_eq!(event.source, "external");
        assert_eq!(event.path(), Some("a.md"));
        assert!(event.timestamp.is_none());
    }

    #[test]
    fn file_helper_sets_path() {
        let event = RawEvent::file("file_deleted", "vault/secret.md");
        assert_eq!(event.source, "fs");
        assert_eq!(event.path(), Some("vault/secret.md"));
    }
}
