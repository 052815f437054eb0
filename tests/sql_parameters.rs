//! SQL Parameter Tests
//!
//! User-supplied values and field names reach the engine as bound
//! parameters, never as statement text.

use aeropipe::compiler::{self, CompiledQuery};
use aeropipe::pipeline::{Pipeline, PipelineContext};
use aeropipe::storage::{DocumentStore, SqlValue};
use aeropipe::{Aggregator, ExecutionOptions, SqliteStore, Tier};
use serde_json::{json, Value};

// =============================================================================
// Helper Functions
// =============================================================================

const HOSTILE: &str = "o'hara\"); DROP TABLE people; --";

fn store() -> SqliteStore {
    let store = SqliteStore::open_in_memory().unwrap();
    store
        .insert_many(
            "people",
            &[
                json!({"name": HOSTILE, "age": 41}),
                json!({"name": "ann", "age": 29}),
            ],
        )
        .unwrap();
    store
}

fn compile(store: &SqliteStore, pipeline: Value) -> CompiledQuery {
    let pipeline = Pipeline::from_json(&pipeline).unwrap();
    let options = ExecutionOptions::default();
    let mut ctx = PipelineContext::with_store("people", store, store, &options);
    compiler::compile(&pipeline, &mut ctx).unwrap()
}

fn has_text_param(query: &CompiledQuery, text: &str) -> bool {
    query
        .params
        .iter()
        .any(|p| matches!(p, SqlValue::Text(t) if t == text))
}

// =============================================================================
// Binding Tests
// =============================================================================

/// Filter literals are bound.
#[test]
fn test_filter_literal_is_bound() {
    let store = store();
    let query = compile(&store, json!([{"$match": {"name": HOSTILE}}]));

    assert!(!query.sql.contains("o'hara"));
    assert!(!query.sql.contains("DROP TABLE"));
    assert!(has_text_param(&query, HOSTILE));
}

/// Field names used as output keys are bound too.
#[test]
fn test_output_field_names_are_bound() {
    let store = store();
    let query = compile(
        &store,
        json!([
            {"$addFields": {"it's": {"$concat": ["$name", "!"]}}},
            {"$group": {"_id": "$age", "who'": {"$push": "$name"}}}
        ]),
    );

    assert!(!query.sql.contains("it's"));
    assert!(!query.sql.contains("who'"));
    assert!(has_text_param(&query, "who'"));
}

/// Integer literals travel as integer parameters.
#[test]
fn test_numeric_literal_is_bound() {
    let store = store();
    let query = compile(&store, json!([{"$match": {"age": {"$gt": 987654}}}]));

    assert!(!query.sql.contains("987654"));
    assert!(query.params.contains(&SqlValue::Integer(987654)));
}

// =============================================================================
// Execution Tests
// =============================================================================

/// A hostile value matches as plain data and leaves the table intact.
#[test]
fn test_hostile_value_matches_as_data() {
    let store = store();
    let out = Aggregator::new(&store)
        .aggregate_json(
            "people",
            &json!([{"$match": {"name": HOSTILE}}, {"$project": {"_id": 0, "age": 1}}]),
            &ExecutionOptions::default(),
        )
        .unwrap();

    assert_eq!(out.tier(), Tier::Sql);
    assert_eq!(out.into_vec(), vec![json!({"age": 41})]);

    let rows = store.query_rows("SELECT count(*) FROM people", &[]).unwrap();
    assert_eq!(rows[0][0].as_i64(), Some(2));
}

/// The compiled statement runs as-is against the store.
#[test]
fn test_compiled_query_runs() {
    let store = store();
    let query = compile(&store, json!([{"$sort": {"age": 1}}, {"$project": {"_id": 0, "name": 1}}]));
    let out = compiler::run(&store, &query).unwrap().into_vec();
    assert_eq!(out, vec![json!({"name": "ann"}), json!({"name": HOSTILE})]);
}
