//! Filter pushdown
//!
//! An indexed `$match` moves towards the start of the pipeline while the
//! stage before it neither reshapes the document nor changes which rows
//! exist, and does not write a field the filter reads.

use crate::pipeline::{FilterExpr, Pipeline, Stage, StageKind};

use super::cost::is_indexed_filter;
use super::IndexHints;

/// True when `filter` gives the same answer before and after `stage`
pub fn can_move_before(filter: &FilterExpr, stage: &Stage) -> bool {
    if matches!(
        stage.kind,
        StageKind::Group(_)
            | StageKind::Skip(_)
            | StageKind::Limit(_)
            | StageKind::Sample(_)
            | StageKind::Count(_)
            | StageKind::Facet(_)
            | StageKind::Project(_)
    ) {
        return false;
    }
    if let StageKind::Match(other) = &stage.kind {
        // $text must stay first
        if other.has_text() {
            return false;
        }
    }
    let read = match filter.referenced_paths() {
        Some(paths) => paths,
        None => return false,
    };
    let written = match stage.written_fields() {
        Some(fields) => fields,
        None => return false,
    };
    !read.iter().any(|path| written.iter().any(|w| w == path.root()))
}

/// Pipeline with every indexed filter moved as early as it can go
pub fn push_down_filters(pipeline: &Pipeline, indexes: &IndexHints) -> Pipeline {
    let mut stages: Vec<Stage> = pipeline.stages().to_vec();
    for i in 0..stages.len() {
        let movable = match &stages[i].kind {
            StageKind::Match(filter) => !filter.has_text() && is_indexed_filter(filter, indexes),
            _ => false,
        };
        if !movable {
            continue;
        }
        let mut at = i;
        while at > 0 {
            let can_move = match &stages[at].kind {
                StageKind::Match(filter) => can_move_before(filter, &stages[at - 1]),
                _ => false,
            };
            if !can_move {
                break;
            }
            stages.swap(at - 1, at);
            at -= 1;
        }
    }
    Pipeline::new(stages)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn kinds(pipeline: &Pipeline) -> Vec<&'static str> {
        pipeline.stages().iter().map(|s| s.name()).collect()
    }

    #[test]
    fn test_moves_past_unrelated_stages() {
        let indexes = IndexHints::with_indexes(["status"]);
        let pipeline = Pipeline::from_json(&json!([
            {"$unwind": "$items"},
            {"$addFields": {"total": {"$multiply": ["$price", "$qty"]}}},
            {"$match": {"status": "A"}}
        ]))
        .unwrap();

        let moved = push_down_filters(&pipeline, &indexes);
        assert_eq!(kinds(&moved), vec!["$match", "$unwind", "$addFields"]);
    }

    #[test]
    fn test_stops_at_written_field() {
        let indexes = IndexHints::with_indexes(["total"]);
        let pipeline = Pipeline::from_json(&json!([
            {"$sort": {"a": 1}},
            {"$addFields": {"total": 1}},
            {"$match": {"total": 1}}
        ]))
        .unwrap();

        let moved = push_down_filters(&pipeline, &indexes);
        assert_eq!(moved, pipeline);
    }

    #[test]
    fn test_never_crosses_barriers() {
        let indexes = IndexHints::with_indexes(["status"]);
        for barrier in [
            json!({"$group": {"_id": "$status"}}),
            json!({"$limit": 5}),
            json!({"$skip": 5}),
            json!({"$sample": {"size": 5}}),
            json!({"$project": {"status": 1}}),
            json!({"$facet": {"a": []}}),
        ] {
            let pipeline =
                Pipeline::from_json(&json!([barrier, {"$match": {"status": "A"}}])).unwrap();
            assert_eq!(push_down_filters(&pipeline, &indexes), pipeline);
        }
    }

    #[test]
    fn test_unindexed_filter_stays() {
        let indexes = IndexHints::new();
        let pipeline = Pipeline::from_json(&json!([
            {"$unwind": "$items"},
            {"$match": {"status": "A"}}
        ]))
        .unwrap();
        assert_eq!(push_down_filters(&pipeline, &indexes), pipeline);
    }
}
