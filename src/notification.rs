//! Notification payload pushed by the backend.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;

/// A notification as pushed under `ReceiveNotification`.
///
/// The JSON object is kept exactly as received. The accessors read the
/// well-known fields (`id`, `type`, `title`, `message`, `isRead`,
/// `createdAt`) and fall back to an empty value when a field is missing,
/// `null` or of an unexpected type, so any object payload can be delivered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Notification {
    payload: Map<String, Value>,
}

impl Notification {
    pub fn new(kind: impl Into<String>, title: impl Into<String>, message: impl Into<String>) -> Self {
        let mut payload = Map::new();
        payload.insert("type".to_string(), Value::String(kind.into()));
        payload.insert("title".to_string(), Value::String(title.into()));
        payload.insert("message".to_string(), Value::String(message.into()));
        payload.insert("isRead".to_string(), Value::Bool(false));
        Self { payload }
    }

    /// Decode the first argument of a hub invocation. Fails only when the
    /// argument is not a JSON object.
    pub fn from_value(value: Value) -> serde_json::Result<Self> {
        serde_json::from_value(value)
    }

    pub fn id(&self) -> Option<&Value> {
        self.payload.get("id").filter(|v| !v.is_null())
    }

    /// Notification kind (`appointment`, `inventory`, ...)
    pub fn kind(&self) -> &str {
        self.text("type")
    }

    pub fn title(&self) -> &str {
        self.text("title")
    }

    pub fn message(&self) -> &str {
        self.text("message")
    }

    pub fn is_read(&self) -> bool {
        self.payload.get("isRead").and_then(Value::as_bool).unwrap_or(false)
    }

    /// `createdAt` exactly as sent
    pub fn created_at_raw(&self) -> Option<&str> {
        self.payload.get("createdAt").and_then(Value::as_str)
    }

    /// Best-effort parse of `createdAt`. A timestamp without an offset is
    /// taken as UTC.
    pub fn created_at(&self) -> Option<DateTime<Utc>> {
        let raw = self.created_at_raw()?;
        if let Ok(t) = DateTime::parse_from_rfc3339(raw) {
            return Some(t.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
            .ok()
            .map(|t| t.and_utc())
    }

    /// Any field of the payload, known or not
    pub fn get(&self, key: &str) -> Option<&Value> {
        self.payload.get(key)
    }

    pub fn payload(&self) -> &Map<String, Value> {
        &self.payload
    }

    pub fn into_payload(self) -> Map<String, Value> {
        self.payload
    }

    fn text(&self, key: &str) -> &str {
        self.payload.get(key).and_then(Value::as_str).unwrap_or("")
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.title().is_empty() {
            write!(f, "[{}] {}", self.kind(), self.message())
        } else {
            write!(f, "[{}] {}: {}", self.kind(), self.title(), self.message())
        }
    }
}

/// Subscriber callback. Shared so the same handler can be attached more than once.
pub type NotificationCallback = Arc<dyn Fn(&Notification) + Send + Sync>;
