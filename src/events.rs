//! Core event types for the problem-detection pipeline
//!
//! Upstream events stay untyped (`serde_json::Value`) because their payloads have
//! arbitrary depth; this module wraps them with the accessors the classifier and
//! the batcher need.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeSet;
use std::fmt;

/// Timestamp type for consistent time handling across the application
pub type Timestamp = DateTime<Utc>;

static NULL: Value = Value::Null;

/// A single event received from the Home Assistant event bus
///
/// Holds the `event` object of an `{"type":"event","event":{...}}` message
/// verbatim: `event_type`, `data`, `time_fired` and whatever else the server sent.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEvent {
    body: Value,
}

impl RawEvent {
    /// Wrap an event object
    pub fn new(body: Value) -> Self {
        Self { body }
    }

    /// Extract the event from a decoded server message
    ///
    /// Returns `None` for anything that is not an event message (auth replies,
    /// subscription results, pongs) or whose `event` field is not an object.
    pub fn from_message(mut message: Value) -> Option<Self> {
        if message.get("type").and_then(Value::as_str) != Some("event") {
            return None;
        }
        match message.get_mut("event").map(Value::take) {
            Some(body @ Value::Object(_)) => Some(Self { body }),
            _ => None,
        }
    }

    /// Event type tag, e.g. `state_changed`
    pub fn kind(&self) -> Option<&str> {
        self.body.get("event_type").and_then(Value::as_str)
    }

    /// Event payload; `Value::Null` when missing
    pub fn data(&self) -> &Value {
        self.body.get("data").unwrap_or(&NULL)
    }

    /// When the server fired the event, if it sent a parseable ISO-8601 timestamp
    pub fn time_fired(&self) -> Option<Timestamp> {
        let raw = self.body.get("time_fired")?.as_str()?;
        DateTime::parse_from_rfc3339(raw)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }

    /// The event object exactly as received
    pub fn as_value(&self) -> &Value {
        &self.body
    }
}

/// Classification label for an event that should be escalated for analysis
///
/// Variants are declared in lexical order of their wire names so that sorted
/// sets of kinds render the same way everywhere.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    /// An automation or script trace contains a failure marker
    AutomationFailure,
    /// An entity transitioned to `unavailable`
    EntityUnavailable,
    /// A log record at ERROR or CRITICAL severity
    ErrorLog,
}

impl TriggerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerKind::AutomationFailure => "automation_failure",
            TriggerKind::EntityUnavailable => "entity_unavailable",
            TriggerKind::ErrorLog => "error_log",
        }
    }
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An event that passed classification, tagged with its trigger kind
#[derive(Debug, Clone, PartialEq)]
pub struct TriggeredEvent {
    pub event: RawEvent,
    pub trigger: TriggerKind,
}

impl TriggeredEvent {
    pub fn new(event: RawEvent, trigger: TriggerKind) -> Self {
        Self { event, trigger }
    }

    /// The event object with a `trigger_type` field added
    pub fn to_value(&self) -> Value {
        let mut value = self.event.as_value().clone();
        if let Value::Object(map) = &mut value {
            map.insert(
                "trigger_type".to_string(),
                Value::String(self.trigger.as_str().to_string()),
            );
        }
        value
    }
}

/// Both serializations of a batch used for fingerprint matching
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchText {
    /// Indented, sorted keys
    pub pretty: String,
    /// No whitespace, sorted keys
    pub compact: String,
}

/// Temporally correlated triggered events analysed as one unit
#[derive(Debug, Clone, PartialEq)]
pub struct EventBatch {
    events: Vec<TriggeredEvent>,
}

impl EventBatch {
    /// Batch of events in arrival order
    pub fn new(events: Vec<TriggeredEvent>) -> Self {
        Self { events }
    }

    /// Events in arrival order
    pub fn events(&self) -> &[TriggeredEvent] {
        &self.events
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    /// The JSON context for this batch
    ///
    /// A single event is used as-is; several events are wrapped as
    /// `{"events": [...]}`.
    pub fn context(&self) -> Value {
        match self.events.as_slice() {
            [single] => single.to_value(),
            events => {
                let mut map = Map::new();
                map.insert(
                    "events".to_string(),
                    Value::Array(events.iter().map(TriggeredEvent::to_value).collect()),
                );
                Value::Object(map)
            }
        }
    }

    /// Deterministic pretty and compact serializations of [`EventBatch::context`]
    ///
    /// Keys come out sorted because `serde_json::Map` is ordered.
    pub fn text(&self) -> Result<BatchText, serde_json::Error> {
        let context = self.context();
        Ok(BatchText {
            pretty: serde_json::to_string_pretty(&context)?,
            compact: serde_json::to_string(&context)?,
        })
    }

    /// Distinct trigger kinds observed in the batch
    pub fn trigger_kinds(&self) -> BTreeSet<TriggerKind> {
        self.events.iter().map(|e| e.trigger).collect()
    }

    /// Comma-joined sorted trigger kinds, `None` for an empty batch
    pub fn trigger_label(&self) -> Option<String> {
        let kinds = self.trigger_kinds();
        if kinds.is_empty() {
            return None;
        }
        Some(
            kinds
                .iter()
                .map(TriggerKind::as_str)
                .collect::<Vec<_>>()
                .join(","),
        )
    }

    /// Event type of the first event, for log lines
    pub fn primary_kind(&self) -> &str {
        self.events
            .first()
            .and_then(|e| e.event.kind())
            .unwrap_or("unknown")
    }

    /// Payload of the first event, for log lines
    pub fn primary_data(&self) -> &Value {
        self.events.first().map_or(&NULL, |e| e.event.data())
    }
}
