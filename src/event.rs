/// Raw error events reported by the host application
///
/// Events are untrusted: the message or stack may be missing, the context may
/// hold arbitrary JSON. Nothing in the engine assumes a well-formed event.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A single runtime failure as observed by the host
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ErrorEvent {
    /// Error message, `None` when the thrown value carried none
    #[serde(default)]
    pub message: Option<String>,

    /// Raw stack trace text
    #[serde(default)]
    pub stack: Option<String>,

    /// Free-form context (subsystem, operation, measurements)
    #[serde(default)]
    pub context: HashMap<String, serde_json::Value>,

    /// When the error occurred
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl ErrorEvent {
    /// Create an event carrying only a message
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: Some(message.into()),
            stack: None,
            context: HashMap::new(),
            timestamp: Utc::now(),
        }
    }

    /// Create an event with neither message nor stack
    pub fn empty() -> Self {
        Self {
            timestamp: Utc::now(),
            ..Default::default()
        }
    }

    /// Attach a stack trace
    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }

    /// Add a context entry
    pub fn with_context(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.context.insert(key.into(), value.into());
        self
    }

    /// Tag the event with the subsystem that raised it
    pub fn in_subsystem(self, subsystem: impl Into<String>) -> Self {
        self.with_context("subsystem", subsystem.into())
    }

    /// Set the timestamp
    pub fn at(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    /// Message with surrounding whitespace removed, `None` if blank
    pub fn message_text(&self) -> Option<&str> {
        self.message
            .as_deref()
            .map(str::trim)
            .filter(|m| !m.is_empty())
    }

    /// Stack with surrounding whitespace removed, `None` if blank
    pub fn stack_text(&self) -> Option<&str> {
        self.stack
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
    }

    /// An event without any usable message or stack
    pub fn is_malformed(&self) -> bool {
        self.message_text().is_none() && self.stack_text().is_none()
    }

    /// Read a numeric context value, accepting numbers and numeric strings
    pub fn context_number(&self, key: &str) -> Option<f64> {
        match self.context.get(key)? {
            serde_json::Value::Number(n) => n.as_f64(),
            serde_json::Value::String(s) => s.trim().parse().ok(),
            serde_json::Value::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
            _ => None,
        }
    }

    /// Read a string context value
    pub fn context_str(&self, key: &str) -> Option<&str> {
        self.context.get(key).and_then(|v| v.as_str())
    }

    /// Whether a context flag is set to a truthy value
    pub fn context_flag(&self, key: &str) -> bool {
        match self.context.get(key) {
            Some(serde_json::Value::Bool(b)) => *b,
            Some(serde_json::Value::Number(n)) => n.as_f64().map(|v| v != 0.0).unwrap_or(false),
            Some(serde_json::Value::String(s)) => matches!(s.as_str(), "true" | "1" | "yes"),
            _ => false,
        }
    }
}
