// Copyright 2026 Layne Penney
// SPDX-License-Identifier: AGPL-3.0-or-later

//! Progress event wire types.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// What an event describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    /// The model is producing text.
    Thinking,
    /// A tool call against the sandbox.
    Action,
    /// A workflow phase (sandbox setup, saving, ...).
    Step,
}

/// Lifecycle position of an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EventPhase {
    Started,
    InProgress,
    Completed,
    Failed,
}

impl EventPhase {
    /// Whether this phase closes a `started` event.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }
}

/// A structured status update for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub kind: EventKind,
    pub phase: EventPhase,
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub timestamp_millis: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_seconds: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<BTreeMap<String, serde_json::Value>>,
}

impl ProgressEvent {
    pub fn new(kind: EventKind, phase: EventPhase, title: impl Into<String>) -> Self {
        Self {
            kind,
            phase,
            title: title.into(),
            description: None,
            timestamp_millis: 0,
            duration_seconds: None,
            metadata: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }

    /// Events sharing this key form a started/completed pair.
    pub fn pairing_key(&self) -> (EventKind, &str) {
        (self.kind, self.title.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_shape() {
        let mut event = ProgressEvent::new(EventKind::Action, EventPhase::InProgress, "npm install")
            .with_metadata("stream", serde_json::json!("stdout"));
        event.timestamp_millis = 1_700_000_000_000;

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["kind"], "action");
        assert_eq!(json["phase"], "in-progress");
        assert_eq!(json["timestampMillis"], 1_700_000_000_000i64);
        assert_eq!(json["metadata"]["stream"], "stdout");
        assert!(json.get("description").is_none());
        assert!(json.get("durationSeconds").is_none());
    }

    #[test]
    fn test_terminal_phases() {
        assert!(EventPhase::Completed.is_terminal());
        assert!(EventPhase::Failed.is_terminal());
        assert!(!EventPhase::Started.is_terminal());
        assert!(!EventPhase::InProgress.is_terminal());
    }
}
