//! Logical document types stored by the content store.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A catalog entry. `id` is the caller-supplied slug and the natural key;
/// everything else (title, media metadata, nested season/episode structures)
/// is carried as an opaque payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContentItem {
    pub id: String,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl ContentItem {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with_field(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    /// The primary display field. Required to be non-empty on write.
    pub fn title(&self) -> Option<&str> {
        self.fields.get("title").and_then(Value::as_str)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    #[default]
    Info,
    Warning,
    Error,
}

/// Append-only audit record. The collection is capped; oldest entries are
/// pruned once the cap is exceeded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub kind: String,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
    #[serde(default)]
    pub level: LogLevel,
    pub at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(kind: &str, title: &str) -> Self {
        Self {
            kind: kind.to_string(),
            title: title.to_string(),
            detail: None,
            level: LogLevel::Info,
            at: Utc::now(),
        }
    }

    pub fn detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }

    pub fn level(mut self, level: LogLevel) -> Self {
        self.level = level;
        self
    }
}

/// Per-user summary produced by the user-data stats enumeration.
#[derive(Debug, Clone, Serialize)]
pub struct UserStats {
    pub user_id: String,
    pub namespaces: Vec<String>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// In-memory scheduler state. Never persisted.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BackupStatus {
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_message: Option<String>,
    /// A write occurred since the last run and a trigger is armed.
    pub pending: bool,
    pub last_error: Option<String>,
    pub runs: u64,
    pub next_interval_at: Option<DateTime<Utc>>,
}

/// Everything `run_backup` exports: the content set, the site config and all
/// user-data blobs, each read independently (no cross-collection snapshot).
#[derive(Debug, Clone)]
pub struct StateDump {
    pub content: Vec<ContentItem>,
    pub config: Value,
    /// (user_id, namespace, payload)
    pub user_blobs: Vec<(String, String, Value)>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_item_flatten_round_trip() {
        let json = serde_json::json!({
            "id": "frieren",
            "title": "Frieren: Beyond Journey's End",
            "seasons": [{ "number": 1, "episodes": 28 }],
        });
        let item: ContentItem = serde_json::from_value(json.clone()).unwrap();
        assert_eq!(item.id, "frieren");
        assert_eq!(item.title(), Some("Frieren: Beyond Journey's End"));
        assert_eq!(serde_json::to_value(&item).unwrap(), json);
    }

    #[test]
    fn test_log_level_defaults_to_info() {
        let entry: LogEntry = serde_json::from_value(serde_json::json!({
            "kind": "content",
            "title": "Saved frieren",
            "at": "2026-01-01T00:00:00Z",
        }))
        .unwrap();
        assert_eq!(entry.level, LogLevel::Info);
    }
}
