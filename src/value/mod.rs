//! Value model for aeropipe
//!
//! Documents are `serde_json::Value` trees built with `preserve_order`, so
//! object keys keep insertion order. This module makes the implicit rules
//! explicit:
//!
//! - [`compare`]: the canonical cross-type ordering shared by every tier
//! - [`coerce`]: numeric coercion, truthiness, type names
//! - [`path`]: dotted field paths and their SQL JSON-path rendering
//! - [`pattern`]: regex compilation shared with the engine-side function
//!
//! # Canonical ordering
//!
//! Null (and missing) < Numbers < Strings < Objects < Arrays < Booleans.
//! Numbers compare numerically across int/float, strings bytewise, objects
//! and arrays by compact JSON text.

pub mod coerce;
pub mod compare;
pub mod path;
pub mod pattern;

pub use coerce::{float_value, is_truthy, numeric, type_name, Numeric, NumericSum};
pub use compare::{compare_optional, compare_values, type_rank, values_equal, SortKey};
pub use path::FieldPath;
pub use pattern::compile_pattern;

use serde_json::Value;

/// Field holding the document identifier inside the pipeline view
pub const ID_FIELD: &str = "_id";

/// A stored document: an externally-assigned identifier plus its payload
#[derive(Debug, Clone, PartialEq)]
pub struct Document {
    /// Identifier assigned by the storage collaborator
    pub id: i64,
    /// Document payload (an object)
    pub body: Value,
}

impl Document {
    /// Creates a new document
    pub fn new(id: i64, body: Value) -> Self {
        Self { id, body }
    }

    /// Returns the payload as pipeline stages see it: `_id` set to the identifier.
    ///
    /// An existing `_id` is replaced in place; otherwise it is appended.
    pub fn pipeline_view(&self) -> Value {
        let mut view = self.body.clone();
        if let Value::Object(map) = &mut view {
            map.insert(ID_FIELD.to_string(), Value::from(self.id));
        }
        view
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_pipeline_view_appends_id() {
        let doc = Document::new(7, json!({"a": 1}));
        let view = doc.pipeline_view();
        assert_eq!(view, json!({"a": 1, "_id": 7}));
        let keys: Vec<_> = view.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["a", "_id"]);
    }

    #[test]
    fn test_pipeline_view_replaces_id_in_place() {
        let doc = Document::new(3, json!({"_id": "x", "a": 1}));
        let view = doc.pipeline_view();
        let keys: Vec<_> = view.as_object().unwrap().keys().cloned().collect();
        assert_eq!(keys, vec!["_id", "a"]);
        assert_eq!(view["_id"], json!(3));
    }
}
