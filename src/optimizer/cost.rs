//! Per-stage cost model
//!
//! Cost is work per input row times the estimated rows reaching the stage.
//! The weights only have to rank pipelines, not predict run time:
//!
//! | stage | work per row | rows out |
//! |---|---|---|
//! | indexed `$match` | 0.1 | 30% |
//! | unindexed `$match` | 1 | 50% |
//! | `$project` / `$addFields` / `$unset` | 1.5 | all |
//! | `$unwind` | 2 | x3 |
//! | `$sort` | 3 | all |
//! | `$group` | 4 | 10% |
//! | `$facet` | 5 | 1 |
//! | `$lookup` | 8 | all |
//! | `$skip` / `$limit` / `$sample` / `$count` | 0.1 | bounded |

use crate::pipeline::{FilterExpr, Pipeline, Stage, StageKind};

use super::IndexHints;

/// Rows assumed to enter a pipeline
pub const DEFAULT_INPUT_ROWS: f64 = 1000.0;

const INDEXED_MATCH_WORK: f64 = 0.1;
const INDEXED_MATCH_SELECTIVITY: f64 = 0.3;
const MATCH_WORK: f64 = 1.0;
const MATCH_SELECTIVITY: f64 = 0.5;
const RESHAPE_WORK: f64 = 1.5;
const UNWIND_WORK: f64 = 2.0;
const UNWIND_FANOUT: f64 = 3.0;
const SORT_WORK: f64 = 3.0;
const GROUP_WORK: f64 = 4.0;
const GROUP_REDUCTION: f64 = 10.0;
const FACET_WORK: f64 = 5.0;
const LOOKUP_WORK: f64 = 8.0;
const BOUND_WORK: f64 = 0.1;

/// Estimated cost and output size of one stage
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StageCost {
    pub cost: f64,
    pub rows_out: f64,
}

/// True when the filter reads at least one indexed field
pub fn is_indexed_filter(filter: &FilterExpr, indexes: &IndexHints) -> bool {
    if filter.has_text() {
        return false;
    }
    match filter.referenced_paths() {
        Some(paths) => paths.iter().any(|p| indexes.is_indexed(&p.dotted())),
        None => false,
    }
}

/// Cost of `stage` given `rows_in` input rows
pub fn stage_cost(stage: &Stage, rows_in: f64, indexes: &IndexHints) -> StageCost {
    let (work, rows_out) = match &stage.kind {
        StageKind::Match(filter) if is_indexed_filter(filter, indexes) => {
            (INDEXED_MATCH_WORK, rows_in * INDEXED_MATCH_SELECTIVITY)
        }
        StageKind::Match(_) => (MATCH_WORK, rows_in * MATCH_SELECTIVITY),
        StageKind::Project(_) | StageKind::AddFields(_) | StageKind::Unset(_) => (RESHAPE_WORK, rows_in),
        StageKind::Unwind(_) => (UNWIND_WORK, rows_in * UNWIND_FANOUT),
        StageKind::Sort(_) => (SORT_WORK, rows_in),
        StageKind::Group(_) => (GROUP_WORK, (rows_in / GROUP_REDUCTION).max(1.0).min(rows_in)),
        StageKind::Facet(_) => (FACET_WORK, 1.0_f64.min(rows_in)),
        StageKind::Lookup(_) => (LOOKUP_WORK, rows_in),
        StageKind::Skip(n) => (BOUND_WORK, (rows_in - *n as f64).max(0.0)),
        StageKind::Limit(n) | StageKind::Sample(n) => (BOUND_WORK, rows_in.min(*n as f64)),
        StageKind::Count(_) => (BOUND_WORK, 1.0_f64.min(rows_in)),
    };
    StageCost {
        cost: work * rows_in,
        rows_out,
    }
}

/// Total cost of a pipeline over `rows` input rows
pub fn pipeline_cost(pipeline: &Pipeline, rows: f64, indexes: &IndexHints) -> f64 {
    let mut rows = rows;
    let mut total = 0.0;
    for stage in pipeline.stages() {
        let estimate = stage_cost(stage, rows, indexes);
        total += estimate.cost;
        rows = estimate.rows_out;
    }
    total
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn stage(spec: serde_json::Value) -> Stage {
        Pipeline::from_json(&json!([spec])).unwrap().stages()[0].clone()
    }

    #[test]
    fn test_stage_ranking() {
        let indexes = IndexHints::with_indexes(["status"]);
        let n = 100.0;
        let indexed = stage_cost(&stage(json!({"$match": {"status": "A"}})), n, &indexes).cost;
        let unindexed = stage_cost(&stage(json!({"$match": {"qty": 1}})), n, &indexes).cost;
        let unwind = stage_cost(&stage(json!({"$unwind": "$xs"})), n, &indexes).cost;
        let group = stage_cost(&stage(json!({"$group": {"_id": "$k"}})), n, &indexes).cost;
        let lookup = stage_cost(
            &stage(json!({"$lookup": {"from": "o", "localField": "a", "foreignField": "b", "as": "j"}})),
            n,
            &indexes,
        )
        .cost;
        assert!(indexed < unindexed);
        assert!(unindexed < unwind);
        assert!(unwind < group);
        assert!(group < lookup);
    }

    #[test]
    fn test_cardinality_flows_through() {
        let indexes = IndexHints::new();
        let pipeline = Pipeline::from_json(&json!([
            {"$limit": 10},
            {"$unwind": "$xs"},
            {"$count": "n"}
        ]))
        .unwrap();
        // limit: 0.1 * 1000, unwind: 2 * 10, count: 0.1 * 30
        let cost = pipeline_cost(&pipeline, DEFAULT_INPUT_ROWS, &indexes);
        assert!((cost - (100.0 + 20.0 + 3.0)).abs() < 1e-9);
    }

    #[test]
    fn test_text_filter_is_never_indexed() {
        let indexes = IndexHints::with_indexes(["body"]);
        let filter = FilterExpr::parse(&json!({"$text": {"$search": "x"}})).unwrap();
        assert!(!is_indexed_filter(&filter, &indexes));
    }
}
