//! SQL tier
//!
//! Compiles a whole pipeline into one statement: a `source` CTE over the
//! collection, then one CTE per stage, each selecting from the previous one.
//! Every value, JSON path and object key is a bound parameter; the only
//! identifier spliced into the text is the validated, quoted table name.
//!
//! Any stage or expression without an exact SQL form makes the whole tier
//! decline with a [`FallbackSignal`](crate::errors::FallbackSignal).

pub mod builder;

pub use builder::{CteBuilder, RELATION_COLUMNS};

use serde_json::Value;

use crate::aggregator::Tier;
use crate::errors::{AggregationError, AggregationResult, FallbackSignal, TierError, TierResult};
use crate::expression::SqlFragment;
use crate::pipeline::{Pipeline, PipelineContext, Stage};
use crate::stages::handler_for;
use crate::storage::{DocumentStore, SqlValue};
use crate::stream::DocumentStream;
use crate::value::ID_FIELD;

/// Name of the relation over the stored collection
pub const SOURCE_RELATION: &str = "source";

/// A single statement producing the pipeline output
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledQuery {
    pub sql: String,
    pub params: Vec<SqlValue>,
}

/// Compiles `pipeline` against `ctx.collection`
pub fn compile(pipeline: &Pipeline, ctx: &mut PipelineContext<'_>) -> TierResult<CompiledQuery> {
    if pipeline.len() > ctx.options.max_sql_stages {
        return Err(FallbackSignal::stage_limit(pipeline.len(), ctx.options.max_sql_stages).into());
    }
    let store = ctx
        .store
        .ok_or_else(|| AggregationError::unsupported_stage("pipeline", "no SQL store"))?;

    let mut builder = CteBuilder::new();
    builder.push(SOURCE_RELATION, source_select(store, &ctx.collection)?);
    ctx.stage_index = 0;
    let last = compile_chain(pipeline.stages(), SOURCE_RELATION, &mut builder, ctx)?;

    let query = builder.select_documents(&last);
    Ok(CompiledQuery {
        sql: query.sql,
        params: query.params,
    })
}

/// Appends `stages` to `builder` starting from relation `input`; returns the
/// name of the last relation. Stages are numbered from `ctx.stage_index`.
pub fn compile_chain(
    stages: &[Stage],
    input: &str,
    builder: &mut CteBuilder,
    ctx: &mut PipelineContext<'_>,
) -> AggregationResult<String> {
    let mut relation = input.to_string();
    for stage in stages {
        let handler = handler_for(stage);
        relation = handler.materialize_sql(&relation, builder, ctx)?;
        handler.update_context(ctx);
        ctx.stage_index += 1;
    }
    Ok(relation)
}

/// SELECT over the stored collection in relation layout; an absent
/// collection yields no rows
pub fn source_select(store: &dyn DocumentStore, collection: &str) -> AggregationResult<SqlFragment> {
    Ok(match store.collection_table(collection)? {
        Some(table) => {
            let mut f = SqlFragment::raw(
                "SELECT id AS seq, id, d AS root_payload, d AS data FROM (SELECT id, json_set(data, ",
            );
            f.bind(format!("$.{}", ID_FIELD))
                .push(", id) AS d FROM ")
                .push(&table)
                .push(")");
            f
        }
        None => SqlFragment::raw("SELECT 0 AS seq, 0 AS id, NULL AS root_payload, NULL AS data WHERE 0"),
    })
}

/// Runs a compiled query
pub fn run(store: &dyn DocumentStore, query: &CompiledQuery) -> TierResult<DocumentStream> {
    let rows = store.query_rows(&query.sql, &query.params)?;
    let documents = parse_documents(rows.into_iter().map(|mut row| row.swap_remove(0)))?;
    Ok(DocumentStream::new(documents, Tier::Sql))
}

/// Compiles and runs in one step
pub fn execute(pipeline: &Pipeline, ctx: &mut PipelineContext<'_>) -> TierResult<DocumentStream> {
    let query = compile(pipeline, ctx)?;
    let store = ctx
        .store
        .ok_or_else(|| AggregationError::unsupported_stage("pipeline", "no SQL store"))?;
    run(store, &query)
}

/// Parses JSON text columns into documents
pub(crate) fn parse_documents(values: impl Iterator<Item = SqlValue>) -> TierResult<Vec<Value>> {
    values
        .map(|value| match value {
            SqlValue::Text(text) => serde_json::from_str(&text).map_err(|e| {
                TierError::Fatal(AggregationError::storage(e.into()))
            }),
            SqlValue::Null => Ok(Value::Null),
            other => Err(TierError::Fatal(AggregationError::invalid_pipeline(format!(
                "unexpected result column {:?}",
                other
            )))),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ExecutionOptions;
    use crate::storage::SqliteStore;
    use serde_json::json;

    fn store() -> SqliteStore {
        let store = SqliteStore::open_in_memory().unwrap();
        store
            .insert_many(
                "orders",
                &[
                    json!({"item": "a", "qty": 2}),
                    json!({"item": "b", "qty": 5}),
                    json!({"item": "a", "qty": 1}),
                ],
            )
            .unwrap();
        store
    }

    #[test]
    fn test_compile_names_ctes_by_stage() {
        let store = store();
        let options = ExecutionOptions::default();
        let mut ctx = PipelineContext::with_store("orders", &store, &store, &options);
        let pipeline = Pipeline::from_json(&json!([
            {"$match": {"qty": {"$gt": 1}}},
            {"$sort": {"qty": -1}}
        ]))
        .unwrap();

        let query = compile(&pipeline, &mut ctx).unwrap();
        assert!(query.sql.starts_with("WITH source AS MATERIALIZED"));
        assert!(query.sql.contains("stage_0 AS MATERIALIZED"));
        assert!(query.sql.ends_with("SELECT json(data) FROM stage_1 ORDER BY seq"));
        assert!(query.params.contains(&SqlValue::from("$.qty")));
    }

    #[test]
    fn test_execute_returns_documents() {
        let store = store();
        let options = ExecutionOptions::default();
        let mut ctx = PipelineContext::with_store("orders", &store, &store, &options);
        let pipeline = Pipeline::from_json(&json!([
            {"$match": {"item": "a"}},
            {"$project": {"_id": 0, "qty": 1}}
        ]))
        .unwrap();

        let out = execute(&pipeline, &mut ctx).unwrap();
        assert_eq!(out.tier(), Tier::Sql);
        assert_eq!(out.into_vec(), vec![json!({"qty": 2}), json!({"qty": 1})]);
    }

    #[test]
    fn test_stage_limit_declines() {
        let store = store();
        let options = ExecutionOptions::default().with_max_sql_stages(1);
        let mut ctx = PipelineContext::with_store("orders", &store, &store, &options);
        let pipeline = Pipeline::from_json(&json!([{"$skip": 0}, {"$limit": 1}])).unwrap();
        let err = compile(&pipeline, &mut ctx).unwrap_err();
        assert!(err.as_fallback().is_some());
    }

    #[test]
    fn test_missing_collection_is_empty() {
        let store = store();
        let options = ExecutionOptions::default();
        let mut ctx = PipelineContext::with_store("absent", &store, &store, &options);
        let pipeline = Pipeline::from_json(&json!([{"$limit": 5}])).unwrap();
        assert!(execute(&pipeline, &mut ctx).unwrap().is_empty());
    }
}
