//! Equality-only label selectors
//!
//! Selectors are a set of exact `key=value` pairs combined with AND.
//! Inequality and set-based operators are not supported.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// An AND-ed set of exact label matches
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelSelector(BTreeMap<String, String>);

impl LabelSelector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a comma-separated `key=value` list.
    ///
    /// Pairs that do not split into exactly one key and one value, or that
    /// have an empty key, are dropped.
    pub fn parse(raw: &str) -> Self {
        let mut pairs = BTreeMap::new();
        for pair in raw.split(',') {
            let parts: Vec<&str> = pair.trim().split('=').collect();
            if let [key, value] = parts.as_slice() {
                if !key.is_empty() {
                    pairs.insert(key.to_string(), value.to_string());
                }
            }
        }
        Self(pairs)
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(key.into(), value.into());
        self
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn pairs(&self) -> &BTreeMap<String, String> {
        &self.0
    }

    /// True when every selector pair is present with the same value
    pub fn matches(&self, labels: &BTreeMap<String, String>) -> bool {
        self.0
            .iter()
            .all(|(key, value)| labels.get(key).map(|v| v == value).unwrap_or(false))
    }
}

impl fmt::Display for LabelSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (key, value) in &self.0 {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{}={}", key, value)?;
            first = false;
        }
        Ok(())
    }
}

impl From<BTreeMap<String, String>> for LabelSelector {
    fn from(pairs: BTreeMap<String, String>) -> Self {
        Self(pairs)
    }
}
