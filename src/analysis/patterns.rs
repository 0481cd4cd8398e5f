//! Recurrence fingerprints and the registry that matches batches against them

use crate::events::{BatchText, Timestamp};
use crate::storage::ProblemRecord;
use log::{debug, warn};
use regex::{Regex, RegexBuilder};
use std::collections::HashMap;
use std::fmt;

/// Strategy deciding whether a serialized batch belongs to a known problem
#[cfg_attr(test, mockall::automock)]
pub trait Matcher: Send + Sync {
    fn is_match(&self, candidate: &str) -> bool;
}

/// Regex matcher where `.` also spans newlines
///
/// A pattern that does not compile is matched literally instead.
pub struct RegexMatcher {
    regex: Regex,
    literal: bool,
}

fn build_regex(pattern: &str) -> Result<Regex, regex::Error> {
    RegexBuilder::new(pattern).dot_matches_new_line(true).build()
}

impl RegexMatcher {
    /// Compile `pattern` with `.` matching newlines
    ///
    /// A pattern that is not a valid regex is matched as escaped literal text
    /// instead, see [`RegexMatcher::is_literal`].
    ///
    /// # Errors
    ///
    /// Only when even the escaped literal cannot be compiled, e.g. it exceeds the
    /// regex size limit.
    pub fn new(pattern: &str) -> Result<Self, regex::Error> {
        match build_regex(pattern) {
            Ok(regex) => Ok(Self {
                regex,
                literal: false,
            }),
            Err(e) => {
                warn!(
                    "Pattern {:?} does not compile ({}); matching it literally",
                    pattern, e
                );
                Ok(Self {
                    regex: build_regex(&regex::escape(pattern))?,
                    literal: true,
                })
            }
        }
    }

    /// Whether the pattern fell back to literal matching
    pub fn is_literal(&self) -> bool {
        self.literal
    }
}

impl Matcher for RegexMatcher {
    fn is_match(&self, candidate: &str) -> bool {
        self.regex.is_match(candidate)
    }
}

const MIN_PATTERN_LEN: usize = 5;
const DEGENERATE_PATTERNS: &[&str] = &[".*", "^.*$", ".*error.*"];
const MAX_DIGIT_RUN: usize = 3;

fn longest_digit_run(text: &str) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for c in text.chars() {
        if c.is_ascii_digit() {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

/// Whether a suggested recurrence pattern is neither too generic nor too specific
///
/// Rejects short patterns, catch-alls, and patterns embedding four or more
/// consecutive digits (timestamps, ids). Compilability is not checked here.
pub fn validate_pattern(pattern: &str) -> bool {
    let text = pattern.trim();
    if text.chars().count() < MIN_PATTERN_LEN {
        return false;
    }
    if DEGENERATE_PATTERNS.contains(&text) {
        return false;
    }
    longest_digit_run(text) <= MAX_DIGIT_RUN
}

/// A known problem: its pattern text, matcher and occurrence bookkeeping
pub struct Fingerprint {
    pattern: String,
    matcher: Box<dyn Matcher>,
    occurrences: u64,
    last_seen: Option<Timestamp>,
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Fingerprint")
            .field("pattern", &self.pattern)
            .field("occurrences", &self.occurrences)
            .field("last_seen", &self.last_seen)
            .finish()
    }
}

impl Fingerprint {
    pub fn new(
        pattern: impl Into<String>,
        matcher: Box<dyn Matcher>,
        occurrences: u64,
        last_seen: Option<Timestamp>,
    ) -> Self {
        Self {
            pattern: pattern.into(),
            matcher,
            occurrences,
            last_seen,
        }
    }

    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    /// Times this problem has been seen, the first diagnosis included
    pub fn occurrences(&self) -> u64 {
        self.occurrences
    }

    pub fn last_seen(&self) -> Option<Timestamp> {
        self.last_seen
    }

    /// Try the pretty form first, then the compact one
    pub fn matches(&self, text: &BatchText) -> bool {
        self.matcher.is_match(&text.pretty) || self.matcher.is_match(&text.compact)
    }

    /// Count another occurrence and return the new total
    pub fn record_occurrence(&mut self, at: Timestamp) -> u64 {
        self.occurrences += 1;
        self.last_seen = Some(at);
        self.occurrences
    }
}

/// Ordered set of fingerprints; the first registered match wins
#[derive(Debug, Default)]
pub struct ProblemRegistry {
    fingerprints: Vec<Fingerprint>,
}

impl ProblemRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild the registry from historical records
    ///
    /// Keeps the highest occurrence seen per distinct pattern text, in the
    /// order patterns first appear. Patterns failing validation are dropped.
    pub fn rehydrate(records: &[ProblemRecord]) -> Self {
        let mut order: Vec<(String, u64, Option<Timestamp>)> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();

        for record in records {
            let Some(pattern) = record.pattern() else {
                continue;
            };
            match index.get(pattern) {
                Some(&i) => {
                    let entry = &mut order[i];
                    entry.1 = entry.1.max(record.occurrence);
                    entry.2 = entry.2.max(record.recorded_at);
                }
                None => {
                    index.insert(pattern.to_string(), order.len());
                    order.push((pattern.to_string(), record.occurrence, record.recorded_at));
                }
            }
        }

        let mut registry = Self::new();
        for (pattern, occurrences, last_seen) in order {
            if !validate_pattern(&pattern) {
                warn!("Ignoring stored pattern that fails validation: {:?}", pattern);
                continue;
            }
            match RegexMatcher::new(&pattern) {
                Ok(matcher) => registry.fingerprints.push(Fingerprint::new(
                    pattern,
                    Box::new(matcher),
                    occurrences,
                    last_seen,
                )),
                Err(e) => warn!("Ignoring stored pattern {:?}: {}", pattern, e),
            }
        }
        debug!("Rehydrated {} fingerprint(s)", registry.len());
        registry
    }

    /// Number of registered fingerprints
    pub fn len(&self) -> usize {
        self.fingerprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fingerprints.is_empty()
    }

    /// Fingerprints in registration order
    pub fn iter(&self) -> impl Iterator<Item = &Fingerprint> {
        self.fingerprints.iter()
    }

    /// Look up a fingerprint by its exact pattern text
    pub fn get(&self, pattern: &str) -> Option<&Fingerprint> {
        self.fingerprints.iter().find(|f| f.pattern == pattern)
    }

    /// First registered fingerprint matching either form of `text`
    pub fn find(&self, text: &BatchText) -> Option<&Fingerprint> {
        self.fingerprints.iter().find(|f| f.matches(text))
    }

    pub fn find_mut(&mut self, text: &BatchText) -> Option<&mut Fingerprint> {
        self.fingerprints.iter_mut().find(|f| f.matches(text))
    }

    /// Register a regex fingerprint with one occurrence
    ///
    /// Returns `None` when the pattern is rejected. Registering a pattern that
    /// is already known returns the existing fingerprint unchanged.
    pub fn register(&mut self, pattern: &str, at: Timestamp) -> Option<&Fingerprint> {
        if !validate_pattern(pattern) {
            warn!("Rejecting recurrence pattern {:?}", pattern);
            return None;
        }
        if let Some(i) = self.fingerprints.iter().position(|f| f.pattern == pattern) {
            debug!("Pattern {:?} already registered", pattern);
            return self.fingerprints.get(i);
        }
        let matcher = match RegexMatcher::new(pattern) {
            Ok(matcher) => matcher,
            Err(e) => {
                warn!("Rejecting recurrence pattern {:?}: {}", pattern, e);
                return None;
            }
        };
        Some(self.register_matcher(pattern, Box::new(matcher), at))
    }

    /// Register a fingerprint backed by any matching strategy
    pub fn register_matcher(
        &mut self,
        pattern: impl Into<String>,
        matcher: Box<dyn Matcher>,
        at: Timestamp,
    ) -> &Fingerprint {
        let index = self.fingerprints.len();
        self.fingerprints
            .push(Fingerprint::new(pattern, matcher, 1, Some(at)));
        &self.fingerprints[index]
    }
}


#[cfg(test)]
mod property_tests {
    use super::*;
    use quickcheck_macros::quickcheck;

    #[quickcheck]
    fn prop_long_digit_runs_rejected(prefix: String, number: u16) -> bool {
        let pattern = format!("{}abcde{}", prefix, 1000 + u32::from(number) % 9000);
        !validate_pattern(&pattern)
    }

    #[quickcheck]
    fn prop_matcher_never_panics(pattern: String, candidate: String) -> bool {
        match RegexMatcher::new(&pattern) {
            Ok(matcher) => {
                let _ = matcher.is_match(&candidate);
                true
            }
            Err(_) => true,
        }
    }
}
