//! Built-in classification rules for Home Assistant events
//!
//! Each rule applies to one `event_type` and inspects the event payload. Rules
//! never fail: missing or mistyped fields simply do not trigger.

use crate::events::TriggerKind;
use serde_json::{Map, Value};

/// Trait for rules mapping an event payload to a trigger kind
pub trait TriggerRule: Send + Sync {
    /// The `event_type` this rule applies to
    fn event_kind(&self) -> &str;

    /// Evaluate the payload of a matching event
    fn evaluate(&self, data: &Value) -> Option<TriggerKind>;

    /// Get a human-readable name for this rule
    fn name(&self) -> &str;
}

/// Numeric level at which Python-style log records count as errors
const ERROR_LEVEL: f64 = 40.0;

/// Whether a log `level` field denotes ERROR or worse
///
/// Accepts numeric levels (>= 40) and the textual names `ERROR` / `CRITICAL`
/// in any case.
pub fn is_error_level(level: &Value) -> bool {
    match level {
        Value::Number(n) => n.as_f64().is_some_and(|l| l >= ERROR_LEVEL),
        Value::String(s) => {
            let upper = s.to_ascii_uppercase();
            upper == "ERROR" || upper == "CRITICAL"
        }
        _ => false,
    }
}

/// Truthiness of a JSON value: null, false, 0, "" and empty containers are false
pub fn is_truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(items) => !items.is_empty(),
        Value::Object(map) => !map.is_empty(),
    }
}

/// Walk every object reachable from `root` and report whether any satisfies
/// `predicate`
///
/// Descends into all object values and all array elements; strings are leaves.
/// Iterative so arbitrarily deep traces cannot overflow the stack.
pub fn any_object<F>(root: &Value, mut predicate: F) -> bool
where
    F: FnMut(&Map<String, Value>) -> bool,
{
    let mut stack = vec![root];
    while let Some(node) = stack.pop() {
        match node {
            Value::Object(map) => {
                if predicate(map) {
                    return true;
                }
                stack.extend(map.values());
            }
            Value::Array(items) => stack.extend(items.iter()),
            _ => {}
        }
    }
    false
}

/// Whether any object in `value` carries a truthy `error` or `success == false`
pub fn contains_failure(value: &Value) -> bool {
    any_object(value, |map| {
        map.get("error").is_some_and(is_truthy)
            || map.get("success") == Some(&Value::Bool(false))
    })
}

/// `system_log_event` at ERROR or CRITICAL
pub struct SystemLogRule;

impl TriggerRule for SystemLogRule {
    fn event_kind(&self) -> &str {
        "system_log_event"
    }

    fn evaluate(&self, data: &Value) -> Option<TriggerKind> {
        data.get("level")
            .filter(|level| is_error_level(level))
            .map(|_| TriggerKind::ErrorLog)
    }

    fn name(&self) -> &str {
        "SystemLogRule"
    }
}

/// Automation or script `trace` with a failure marker anywhere in the result tree
pub struct TraceFailureRule;

impl TriggerRule for TraceFailureRule {
    fn event_kind(&self) -> &str {
        "trace"
    }

    fn evaluate(&self, data: &Value) -> Option<TriggerKind> {
        contains_failure(data).then_some(TriggerKind::AutomationFailure)
    }

    fn name(&self) -> &str {
        "TraceFailureRule"
    }
}

/// `state_changed` whose new state is `unavailable`
pub struct UnavailableStateRule;

impl TriggerRule for UnavailableStateRule {
    fn event_kind(&self) -> &str {
        "state_changed"
    }

    fn evaluate(&self, data: &Value) -> Option<TriggerKind> {
        let state = data.get("new_state")?.get("state")?.as_str()?;
        (state == "unavailable").then_some(TriggerKind::EntityUnavailable)
    }

    fn name(&self) -> &str {
        "UnavailableStateRule"
    }
}

/// Supervisor add-on log record at ERROR or CRITICAL
pub struct SupervisorAddonRule;

impl TriggerRule for SupervisorAddonRule {
    fn event_kind(&self) -> &str {
        "supervisor_event"
    }

    fn evaluate(&self, data: &Value) -> Option<TriggerKind> {
        if data.get("event").and_then(Value::as_str) != Some("addon") {
            return None;
        }
        data.get("data")?
            .get("level")
            .filter(|level| is_error_level(level))
            .map(|_| TriggerKind::ErrorLog)
    }

    fn name(&self) -> &str {
        "SupervisorAddonRule"
    }
}
