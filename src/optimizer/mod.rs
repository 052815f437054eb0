//! Cost-based reordering
//!
//! Builds one candidate (indexed filters pushed towards the start), prices
//! both pipelines with the [`cost`] model and keeps the candidate only when
//! it is strictly cheaper. A reordered pipeline always returns the same
//! documents in the same order as the original.

pub mod cost;
pub mod reorder;

pub use cost::{pipeline_cost, stage_cost, StageCost, DEFAULT_INPUT_ROWS};
pub use reorder::{can_move_before, push_down_filters};

use std::collections::HashSet;

use crate::observability::{log_event_with_fields, Event};
use crate::pipeline::Pipeline;
use crate::storage::IndexCatalog;
use crate::value::ID_FIELD;

/// Indexed fields of one collection
#[derive(Debug, Clone, Default)]
pub struct IndexHints {
    /// Dotted paths of indexed fields (`_id` is always indexed)
    pub indexed_fields: HashSet<String>,
}

impl IndexHints {
    /// Only `_id` indexed
    pub fn new() -> Self {
        Self::default()
    }

    /// Hints with the given indexed fields
    pub fn with_indexes(fields: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            indexed_fields: fields.into_iter().map(Into::into).collect(),
        }
    }

    /// Hints for a collection from an index catalog
    pub fn from_catalog(catalog: &dyn IndexCatalog, collection: &str) -> Self {
        Self {
            indexed_fields: catalog.indexed_fields(collection),
        }
    }

    /// Checks if a field is indexed
    pub fn is_indexed(&self, field: &str) -> bool {
        field == ID_FIELD || self.indexed_fields.contains(field)
    }
}

/// Outcome of an optimization pass
#[derive(Debug, Clone)]
pub struct Optimized {
    /// Pipeline to execute
    pub pipeline: Pipeline,
    /// Cost of the input pipeline
    pub original_cost: f64,
    /// Cost of the returned pipeline
    pub chosen_cost: f64,
    /// True when the returned pipeline differs from the input
    pub reordered: bool,
}

/// Returns the cheaper of `pipeline` and its filter-pushdown candidate
pub fn optimize(pipeline: &Pipeline, indexes: &IndexHints) -> Optimized {
    let original_cost = pipeline_cost(pipeline, DEFAULT_INPUT_ROWS, indexes);
    let candidate = push_down_filters(pipeline, indexes);
    let candidate_cost = pipeline_cost(&candidate, DEFAULT_INPUT_ROWS, indexes);

    if candidate != *pipeline && candidate_cost < original_cost {
        log_event_with_fields(
            Event::PipelineReordered,
            &[
                ("original_cost", &format!("{:.1}", original_cost)),
                ("chosen_cost", &format!("{:.1}", candidate_cost)),
            ],
        );
        return Optimized {
            pipeline: candidate,
            original_cost,
            chosen_cost: candidate_cost,
            reordered: true,
        };
    }

    log_event_with_fields(
        Event::PipelineKept,
        &[("cost", &format!("{:.1}", original_cost))],
    );
    Optimized {
        pipeline: pipeline.clone(),
        original_cost,
        chosen_cost: original_cost,
        reordered: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    #[test]
    fn test_reorders_when_cheaper() {
        let indexes = IndexHints::with_indexes(["status"]);
        let pipeline = Pipeline::from_json(&json!([
            {"$unwind": "$items"},
            {"$match": {"status": "A"}}
        ]))
        .unwrap();

        let result = optimize(&pipeline, &indexes);
        assert!(result.reordered);
        assert!(result.chosen_cost < result.original_cost);
        assert_eq!(result.pipeline.stages()[0].name(), "$match");
    }

    #[test]
    fn test_keeps_pipeline_already_in_order() {
        let indexes = IndexHints::with_indexes(["status"]);
        let pipeline = Pipeline::from_json(&json!([
            {"$match": {"status": "A"}},
            {"$unwind": "$items"}
        ]))
        .unwrap();

        let result = optimize(&pipeline, &indexes);
        assert!(!result.reordered);
        assert_eq!(result.pipeline, pipeline);
        assert_eq!(result.chosen_cost, result.original_cost);
    }

    #[test]
    fn test_id_is_always_indexed() {
        let mut catalog: HashMap<String, HashSet<String>> = HashMap::new();
        catalog.insert("orders".into(), ["sku".to_string()].into_iter().collect());
        let hints = IndexHints::from_catalog(&catalog, "orders");
        assert!(hints.is_indexed("_id"));
        assert!(hints.is_indexed("sku"));
        assert!(!hints.is_indexed("qty"));
    }
}
