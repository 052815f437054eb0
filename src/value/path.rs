//! Dotted field paths
//!
//! Paths only traverse objects. A path that runs into an array or a scalar
//! resolves to missing, and writes through a non-object are ignored; the
//! embedded engine's `json_extract`/`json_set` behave the same way.

use std::fmt;

use serde_json::{Map, Value};

use crate::errors::{AggregationError, AggregationResult};

/// A parsed dotted field path such as `address.city`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FieldPath {
    segments: Vec<String>,
}

impl FieldPath {
    /// Parses a dotted path (without a leading `$`)
    pub fn parse(path: &str) -> AggregationResult<Self> {
        if path.is_empty() {
            return Err(AggregationError::invalid_expression("empty field path"));
        }
        if path.starts_with('$') {
            return Err(AggregationError::invalid_expression(format!(
                "field path '{}' must not start with '$'",
                path
            )));
        }
        let segments: Vec<String> = path.split('.').map(str::to_string).collect();
        if segments.iter().any(|s| s.is_empty()) {
            return Err(AggregationError::invalid_expression(format!(
                "field path '{}' has an empty segment",
                path
            )));
        }
        Ok(Self { segments })
    }

    /// Returns the path segments
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Returns the top-level field name
    pub fn root(&self) -> &str {
        &self.segments[0]
    }

    /// Returns the dotted form
    pub fn dotted(&self) -> String {
        self.segments.join(".")
    }

    /// Returns a path extended by `other`
    pub fn join(&self, other: &FieldPath) -> FieldPath {
        let mut segments = self.segments.clone();
        segments.extend(other.segments.iter().cloned());
        FieldPath { segments }
    }

    /// Renders the SQL JSON path (`$.a."b c"`).
    ///
    /// Returns `None` when a segment cannot be quoted in JSON-path syntax.
    pub fn json_path(&self) -> Option<String> {
        let mut out = String::from("$");
        for segment in &self.segments {
            if segment.contains('"') {
                return None;
            }
            let plain = segment
                .chars()
                .enumerate()
                .all(|(i, c)| c == '_' || c.is_ascii_alphabetic() || (i > 0 && c.is_ascii_digit()));
            out.push('.');
            if plain {
                out.push_str(segment);
            } else {
                out.push('"');
                out.push_str(segment);
                out.push('"');
            }
        }
        Some(out)
    }

    /// True when one path is a prefix of the other
    pub fn overlaps(&self, other: &FieldPath) -> bool {
        let n = self.segments.len().min(other.segments.len());
        self.segments[..n] == other.segments[..n]
    }

    /// Resolves the path; `None` when missing
    pub fn resolve<'a>(&self, doc: &'a Value) -> Option<&'a Value> {
        let mut current = doc;
        for segment in &self.segments {
            match current {
                Value::Object(map) => current = map.get(segment)?,
                _ => return None,
            }
        }
        Some(current)
    }

    /// Sets the value at the path, creating intermediate objects.
    ///
    /// Existing keys keep their position; new keys are appended.
    pub fn set(&self, doc: &mut Value, value: Value) {
        let (last, parents) = match self.segments.split_last() {
            Some(split) => split,
            None => return,
        };
        let mut current = doc;
        for segment in parents {
            let map = match current {
                Value::Object(map) => map,
                _ => return,
            };
            current = map
                .entry(segment.clone())
                .or_insert_with(|| Value::Object(Map::new()));
        }
        if let Value::Object(map) = current {
            map.insert(last.clone(), value);
        }
    }

    /// Removes the value at the path, preserving the order of the remaining keys
    pub fn remove(&self, doc: &mut Value) -> Option<Value> {
        let (last, parents) = self.segments.split_last()?;
        let mut current = doc;
        for segment in parents {
            match current {
                Value::Object(map) => current = map.get_mut(segment)?,
                _ => return None,
            }
        }
        match current {
            Value::Object(map) => map.shift_remove(last),
            _ => None,
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.dotted())
    }
}
