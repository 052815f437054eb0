//! Interpreter tier
//!
//! Runs every stage over in-memory rows. It accepts every pipeline the parser
//! accepts and is the reference the SQL tiers are tested against.
//!
//! With a SQL store, a leading `$match` that translates to SQL is pushed into
//! the storage read so only matching documents are loaded.

use crate::aggregator::Tier;
use crate::errors::AggregationResult;
use crate::expression::ExprTranslator;
use crate::observability::{log_event_with_fields, Event};
use crate::pipeline::{Pipeline, PipelineContext, Row, Stage, StageKind};
use crate::stages::handler_for;
use crate::stream::DocumentStream;
use crate::value::Document;

/// Pipeline view of a stored row inside a storage filter
const STORED_DOCUMENT: &str = "json_set(data, '$._id', id)";

/// Runs `pipeline` over `documents`
pub fn run(
    pipeline: &Pipeline,
    documents: Vec<Document>,
    ctx: &mut PipelineContext<'_>,
) -> AggregationResult<DocumentStream> {
    let rows = documents.iter().map(Row::from_document).collect();
    let rows = run_stages(pipeline.stages(), rows, ctx)?;
    Ok(DocumentStream::new(
        rows.into_iter().map(|row| row.current).collect(),
        Tier::Interpreter,
    ))
}

/// Loads the collection and runs the whole pipeline
pub fn execute(pipeline: &Pipeline, ctx: &mut PipelineContext<'_>) -> AggregationResult<DocumentStream> {
    let (documents, consumed) = load(pipeline, ctx)?;
    ctx.stage_index = consumed;
    let rows = documents.iter().map(Row::from_document).collect();
    let rows = run_stages(&pipeline.stages()[consumed..], rows, ctx)?;
    Ok(DocumentStream::new(
        rows.into_iter().map(|row| row.current).collect(),
        Tier::Interpreter,
    ))
}

/// Applies `stages` in order, numbering them from `ctx.stage_index`
pub fn run_stages(
    stages: &[Stage],
    mut rows: Vec<Row>,
    ctx: &mut PipelineContext<'_>,
) -> AggregationResult<Vec<Row>> {
    for stage in stages {
        let handler = handler_for(stage);
        rows = handler.interpret(rows, ctx)?;
        handler.update_context(ctx);
        ctx.stage_index += 1;
    }
    Ok(rows)
}

/// Reads the input documents; returns them with the number of leading
/// stages already applied by the read
fn load(pipeline: &Pipeline, ctx: &PipelineContext<'_>) -> AggregationResult<(Vec<Document>, usize)> {
    let (store, filter) = match (ctx.store, pipeline.stages().first().map(|s| &s.kind)) {
        (Some(store), Some(StageKind::Match(filter))) => (store, filter),
        _ => return Ok((ctx.source.get_all(&ctx.collection)?, 0)),
    };
    if store.collection_table(&ctx.collection)?.is_none() {
        return Ok((Vec::new(), 0));
    }

    let translator = ExprTranslator::new(STORED_DOCUMENT, STORED_DOCUMENT, ctx.capabilities);
    match filter.to_sql(&translator, "id", &ctx.text) {
        Ok(condition) => {
            log_event_with_fields(
                Event::FilterPushedDown,
                &[("collection", &ctx.collection)],
            );
            let docs = store.get_by_filter_sql(&ctx.collection, &condition.sql, &condition.params)?;
            Ok((docs, 1))
        }
        Err(err) if err.is_fallback() => Ok((ctx.source.get_all(&ctx.collection)?, 0)),
        Err(err) => Err(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionOptions;
    use crate::storage::SqliteStore;
    use serde_json::json;
    use std::collections::HashMap;

    fn docs() -> Vec<Document> {
        vec![
            Document::new(1, json!({"k": "a", "n": 1})),
            Document::new(2, json!({"k": "b", "n": 2})),
            Document::new(3, json!({"k": "a", "n": 3})),
        ]
    }

    #[test]
    fn test_run_applies_stages_in_order() {
        let source: HashMap<String, Vec<Document>> = HashMap::new();
        let options = ExecutionOptions::default();
        let mut ctx = PipelineContext::new("c", &source, &options);
        let pipeline = Pipeline::from_json(&json!([
            {"$match": {"k": "a"}},
            {"$group": {"_id": "$k", "total": {"$sum": "$n"}}}
        ]))
        .unwrap();

        let out = run(&pipeline, docs(), &mut ctx).unwrap();
        assert_eq!(out.tier(), Tier::Interpreter);
        assert_eq!(out.into_vec(), vec![json!({"_id": "a", "total": 4})]);
        assert_eq!(ctx.stage_index, 2);
    }

    #[test]
    fn test_execute_pushes_leading_match_into_read() {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_many("c", &[json!({"k": "a"}), json!({"k": "b"}), json!({"k": "a"})])
            .unwrap();
        let options = ExecutionOptions::default();
        let mut ctx = PipelineContext::with_store("c", &store, &store, &options);
        let pipeline = Pipeline::from_json(&json!([{"$match": {"k": "a"}}, {"$project": {"k": 0}}])).unwrap();

        let out = execute(&pipeline, &mut ctx).unwrap().into_vec();
        assert_eq!(out, vec![json!({"_id": 1}), json!({"_id": 3})]);
    }

    #[test]
    fn test_execute_missing_collection_is_empty() {
        let store = SqliteStore::open_in_memory().unwrap();
        let options = ExecutionOptions::default();
        let mut ctx = PipelineContext::with_store("absent", &store, &store, &options);
        let pipeline = Pipeline::from_json(&json!([{"$match": {"k": 1}}])).unwrap();
        assert!(execute(&pipeline, &mut ctx).unwrap().is_empty());
    }
}
