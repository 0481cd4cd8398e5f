use crate::events::{RawEvent, TriggerKind};
use crate::triggers::rules::{
    SupervisorAddonRule, SystemLogRule, TraceFailureRule, TriggerRule, UnavailableStateRule,
};
use std::sync::OnceLock;

/// Maps raw events to trigger kinds using a set of per-event-type rules
///
/// Classification is pure: it reads the event and nothing else, so the same
/// event always classifies the same way.
pub struct EventClassifier {
    rules: Vec<Box<dyn TriggerRule>>,
}

impl Default for EventClassifier {
    fn default() -> Self {
        Self::with_default_rules()
    }
}

impl EventClassifier {
    /// Create a classifier with no rules (classifies nothing)
    pub fn new() -> Self {
        Self { rules: Vec::new() }
    }

    /// Create a classifier with the built-in Home Assistant rules
    pub fn with_default_rules() -> Self {
        let mut classifier = Self::new();
        classifier.add_rule(Box::new(SystemLogRule));
        classifier.add_rule(Box::new(TraceFailureRule));
        classifier.add_rule(Box::new(UnavailableStateRule));
        classifier.add_rule(Box::new(SupervisorAddonRule));
        classifier
    }

    /// Add a rule; rules for the same event type are tried in insertion order
    pub fn add_rule(&mut self, rule: Box<dyn TriggerRule>) {
        self.rules.push(rule);
    }

    /// Get the number of configured rules
    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Classify an event, `None` meaning "ignore"
    pub fn classify(&self, event: &RawEvent) -> Option<TriggerKind> {
        let kind = event.kind()?;
        self.rules
            .iter()
            .filter(|rule| rule.event_kind() == kind)
            .find_map(|rule| rule.evaluate(event.data()))
    }
}

/// Classify an event with the built-in rules
pub fn classify(event: &RawEvent) -> Option<TriggerKind> {
    static DEFAULT: OnceLock<EventClassifier> = OnceLock::new();
    DEFAULT
        .get_or_init(EventClassifier::with_default_rules)
        .classify(event)
}
