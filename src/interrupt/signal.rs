// src/interrupt/signal.rs
//! Interrupt signal types

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// How an interrupt affects in-flight work
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InterruptType {
    /// Deliver messages at the next check point; nothing is cancelled
    Graceful,
    /// Cancel in-flight work immediately
    Force,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

/// A message carried by an interrupt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptMessage {
    pub role: Role,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}

impl InterruptMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
            name: None,
        }
    }
}

/// An interrupt delivered to a running context
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InterruptSignal {
    #[serde(rename = "type")]
    pub kind: InterruptType,

    #[serde(default)]
    pub messages: Vec<InterruptMessage>,

    /// Milliseconds since the Unix epoch
    pub timestamp: i64,

    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl InterruptSignal {
    pub fn new(kind: InterruptType, messages: Vec<InterruptMessage>) -> Self {
        Self {
            kind,
            messages,
            timestamp: chrono::Utc::now().timestamp_millis(),
            metadata: Map::new(),
        }
    }

    pub fn graceful(messages: Vec<InterruptMessage>) -> Self {
        Self::new(InterruptType::Graceful, messages)
    }

    pub fn force(messages: Vec<InterruptMessage>) -> Self {
        Self::new(InterruptType::Force, messages)
    }

    /// Force signal with no messages: stop without appending anything
    pub fn cancel() -> Self {
        Self::force(Vec::new())
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: Value) -> Self {
        self.metadata.insert(key.into(), value);
        self
    }

    pub fn is_force(&self) -> bool {
        self.kind == InterruptType::Force
    }

    /// Whether this signal is the product of a merge
    pub fn is_merged(&self) -> bool {
        self.metadata.get("merged").and_then(Value::as_bool).unwrap_or(false)
    }

    /// Fold several signals into one
    ///
    /// Messages are concatenated in the given order. The result is force if
    /// any input is, carries the latest timestamp, and has the union of the
    /// inputs' metadata (later keys win) plus `merged`/`merged_count`.
    pub fn merge(signals: Vec<InterruptSignal>) -> Option<InterruptSignal> {
        let count = signals.len();
        let mut iter = signals.into_iter();
        let mut merged = iter.next()?;
        for signal in iter {
            if signal.is_force() {
                merged.kind = InterruptType::Force;
            }
            merged.timestamp = merged.timestamp.max(signal.timestamp);
            merged.messages.extend(signal.messages);
            merged.metadata.extend(signal.metadata);
        }
        if count > 1 {
            merged.metadata.insert("merged".to_string(), Value::Bool(true));
            merged
                .metadata
                .insert("merged_count".to_string(), Value::from(count as u64));
        }
        Some(merged)
    }
}
