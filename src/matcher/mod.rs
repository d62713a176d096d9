//! Predicate and wildcard matching for delivery filters.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;

use crate::errors::ConfigurationError;

/// Compiled regular expression that (de)serializes as its source text.
#[derive(Clone)]
pub struct Pattern(Regex);

impl Pattern {
    /// Compile a pattern.
    pub fn new(source: &str) -> Result<Self, ConfigurationError> {
        Regex::new(source)
            .map(Self)
            .map_err(|e| ConfigurationError::InvalidPattern {
                pattern: source.to_string(),
                message: e.to_string(),
            })
    }

    pub fn as_str(&self) -> &str {
        self.0.as_str()
    }

    pub fn is_match(&self, value: &str) -> bool {
        self.0.is_match(value)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Pattern").field(&self.as_str()).finish()
    }
}

impl PartialEq for Pattern {
    fn eq(&self, other: &Self) -> bool {
        self.as_str() == other.as_str()
    }
}

impl Serialize for Pattern {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Pattern {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let source = String::deserialize(deserializer)?;
        Pattern::new(&source).map_err(serde::de::Error::custom)
    }
}

/// A typed matching rule applied to one string field.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum Predicate {
    /// Exact equality.
    Equals(String),
    /// Unanchored regular-expression match.
    Matches(Pattern),
    /// `*contains*`, `*suffix`, `prefix*` or literal.
    Wildcard(String),
}

impl Predicate {
    pub fn equals(value: impl Into<String>) -> Self {
        Self::Equals(value.into())
    }

    pub fn wildcard(pattern: impl Into<String>) -> Self {
        Self::Wildcard(pattern.into())
    }

    pub fn regex(source: &str) -> Result<Self, ConfigurationError> {
        Pattern::new(source).map(Self::Matches)
    }
}

/// How a predicate list combines.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchMode {
    /// At least one predicate matches.
    #[default]
    Any,
    /// Every predicate matches.
    All,
}

/// Evaluate one predicate.
pub fn matches(value: &str, predicate: &Predicate) -> bool {
    match predicate {
        Predicate::Equals(expected) => value == expected,
        Predicate::Matches(pattern) => pattern.is_match(value),
        Predicate::Wildcard(pattern) => wildcard_matches(value, pattern),
    }
}

/// Evaluate the restricted wildcard grammar.
///
/// A two-sided `*x*` is tested before the one-sided forms.
pub fn wildcard_matches(value: &str, pattern: &str) -> bool {
    if pattern.is_empty() || pattern == "*" {
        return true;
    }

    if pattern.len() >= 2 && pattern.starts_with('*') && pattern.ends_with('*') {
        return value.contains(&pattern[1..pattern.len() - 1]);
    }

    if let Some(suffix) = pattern.strip_prefix('*') {
        return value.ends_with(suffix);
    }

    if let Some(prefix) = pattern.strip_suffix('*') {
        return value.starts_with(prefix);
    }

    value == pattern
}

/// Evaluate a predicate list. An empty list matches everything.
pub fn matches_predicates(value: &str, predicates: &[Predicate], mode: MatchMode) -> bool {
    if predicates.is_empty() {
        return true;
    }
    match mode {
        MatchMode::Any => predicates.iter().any(|p| matches(value, p)),
        MatchMode::All => predicates.iter().all(|p| matches(value, p)),
    }
}

/// Evaluate a predicate list against a string field of a payload.
///
/// A missing or non-string field only passes an empty predicate list.
pub fn matches_field(
    payload: &Value,
    pointer: &str,
    predicates: &[Predicate],
    mode: MatchMode,
) -> bool {
    if predicates.is_empty() {
        return true;
    }
    payload
        .pointer(pointer)
        .and_then(Value::as_str)
        .map(|value| matches_predicates(value, predicates, mode))
        .unwrap_or(false)
}
