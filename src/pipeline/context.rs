//! Per-execution pipeline state

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use crate::config::ExecutionOptions;
use crate::expression::{Expression, SqlKind};
use crate::storage::{Capabilities, CollectionSource, DocumentStore};
use crate::value::Document;

use super::filter::TextMatches;

/// One document flowing through the interpreter
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Identifier of the stored document the row came from
    pub id: i64,
    /// `$$ROOT`
    pub root: Arc<Value>,
    /// `$$CURRENT`
    pub current: Value,
}

impl Row {
    /// A row whose root and current document are both `doc`
    pub fn new(id: i64, doc: Value) -> Self {
        Self {
            id,
            root: Arc::new(doc.clone()),
            current: doc,
        }
    }

    /// A row for a stored document
    pub fn from_document(doc: &Document) -> Self {
        Self::new(doc.id, doc.pipeline_view())
    }

    /// Same root, new current document
    pub fn with_current(&self, current: Value) -> Self {
        Self {
            id: self.id,
            root: Arc::clone(&self.root),
            current,
        }
    }
}

/// Where a field introduced by an earlier stage came from
#[derive(Debug, Clone, PartialEq)]
pub struct FieldOrigin {
    /// Index of the defining stage
    pub stage: usize,
    /// Defining expression
    pub expression: Expression,
    /// SQL kind of the value when the stage was compiled; `None` when unknown
    pub kind: Option<SqlKind>,
}

/// State shared by the stages of one execution.
///
/// Cloned for each `$facet` branch, so a branch never sees fields another
/// branch introduced.
#[derive(Clone)]
pub struct PipelineContext<'a> {
    /// Collection the pipeline reads
    pub collection: String,
    /// Whole-collection reads (`$lookup` in the interpreter)
    pub source: &'a dyn CollectionSource,
    /// SQL access for the compiling tiers
    pub store: Option<&'a dyn DocumentStore>,
    /// Options of this execution
    pub options: &'a ExecutionOptions,
    /// Engine capabilities (all off without a store)
    pub capabilities: Capabilities,
    /// `$text` match sets
    pub text: TextMatches,
    /// Name prefix for CTEs of this (sub-)pipeline
    pub label: String,
    /// Index of the stage being processed
    pub stage_index: usize,
    fields: HashMap<String, FieldOrigin>,
}

impl<'a> PipelineContext<'a> {
    /// Context for an interpreter-only execution
    pub fn new(collection: &str, source: &'a dyn CollectionSource, options: &'a ExecutionOptions) -> Self {
        Self {
            collection: collection.to_string(),
            source,
            store: None,
            options,
            capabilities: Capabilities::default(),
            text: TextMatches::unavailable(),
            label: "stage".to_string(),
            stage_index: 0,
            fields: HashMap::new(),
        }
    }

    /// Context with SQL access
    pub fn with_store(
        collection: &str,
        source: &'a dyn CollectionSource,
        store: &'a dyn DocumentStore,
        options: &'a ExecutionOptions,
    ) -> Self {
        let mut ctx = Self::new(collection, source, options);
        ctx.capabilities = store.capabilities();
        ctx.store = Some(store);
        ctx
    }

    /// Sets the `$text` match sets
    pub fn with_text(mut self, text: TextMatches) -> Self {
        self.text = text;
        self
    }

    /// Context for branch `index` of the current `$facet` stage
    pub fn facet_branch(&self, index: usize) -> Self {
        let mut branch = self.clone();
        branch.label = format!("{}_{}_f{}", self.label, self.stage_index, index);
        branch.stage_index = 0;
        branch
    }

    /// CTE name of the current stage
    pub fn stage_label(&self) -> String {
        format!("{}_{}", self.label, self.stage_index)
    }

    /// Records a field introduced by the current stage
    pub fn introduce_field(&mut self, name: &str, expression: Expression, kind: Option<SqlKind>) {
        self.fields.insert(
            name.to_string(),
            FieldOrigin {
                stage: self.stage_index,
                expression,
                kind,
            },
        );
    }

    /// Forgets a field whose value a stage replaced or removed
    pub fn forget_field(&mut self, name: &str) {
        self.fields.remove(name);
    }

    /// Forgets every introduced field (after a reshaping stage)
    pub fn reset_fields(&mut self) {
        self.fields.clear();
    }

    /// Origin of an introduced top-level field
    pub fn field_origin(&self, name: &str) -> Option<&FieldOrigin> {
        self.fields.get(name)
    }

    /// Kinds of the introduced fields whose SQL kind is known
    pub fn known_kinds(&self) -> HashMap<String, SqlKind> {
        self.fields
            .iter()
            .filter_map(|(name, origin)| origin.kind.map(|k| (name.clone(), k)))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_row_shares_root() {
        let row = Row::from_document(&Document::new(4, json!({"a": 1})));
        let next = row.with_current(json!({"b": 2}));
        assert!(Arc::ptr_eq(&row.root, &next.root));
        assert_eq!(next.root["_id"], json!(4));
        assert_eq!(next.id, 4);
    }

    #[test]
    fn test_fields_are_tracked_per_branch() {
        let source: HashMap<String, Vec<Document>> = HashMap::new();
        let options = ExecutionOptions::default();
        let mut ctx = PipelineContext::new("orders", &source, &options);
        ctx.stage_index = 2;
        ctx.introduce_field("total", Expression::Literal(json!(1)), Some(SqlKind::Number));
        assert_eq!(ctx.field_origin("total").map(|o| o.stage), Some(2));

        let mut branch = ctx.facet_branch(1);
        assert_eq!(branch.label, "stage_2_f1");
        branch.forget_field("total");
        assert!(branch.field_origin("total").is_none());
        assert!(ctx.field_origin("total").is_some());
        assert_eq!(ctx.known_kinds().get("total"), Some(&SqlKind::Number));
    }
}
