//! Tier Selection Tests
//!
//! Which tier answers a pipeline:
//! - SQL when every stage compiles
//! - staged after a decline, or when the heuristic skips SQL
//! - interpreter when forced or without a store
//!
//! The answer itself never depends on the tier.

use std::collections::{HashMap, HashSet};

use aeropipe::storage::{Capabilities, SearchIndex, StoreResult};
use aeropipe::value::Document;
use aeropipe::{Aggregator, ExecutionOptions, SqliteStore, Tier};
use serde_json::{json, Value};
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn store() -> SqliteStore {
    let store = SqliteStore::open_in_memory().unwrap();
    store
        .insert_many(
            "notes",
            &[
                json!({"title": "The quick brown fox", "score": 3, "tags": ["a", "b"]}),
                json!({"title": "Lazy dogs sleep", "score": 8, "tags": ["b"]}),
                json!({"title": "A fox and a dog", "score": 5, "tags": []}),
            ],
        )
        .unwrap();
    store
}

/// Search collaborator backed by a fixed term table
struct FixedSearch {
    terms: HashMap<String, HashSet<i64>>,
}

impl FixedSearch {
    fn new(entries: &[(&str, &[i64])]) -> Self {
        Self {
            terms: entries
                .iter()
                .map(|(term, ids)| (term.to_string(), ids.iter().copied().collect()))
                .collect(),
        }
    }
}

impl SearchIndex for FixedSearch {
    fn text_match(&self, _collection: &str, term: &str) -> StoreResult<HashSet<i64>> {
        Ok(self.terms.get(term).cloned().unwrap_or_default())
    }
}

fn ids(docs: Vec<Value>) -> Vec<i64> {
    docs.iter().filter_map(|d| d["_id"].as_i64()).collect()
}

// =============================================================================
// Tier Selection Tests
// =============================================================================

/// Plain pipelines stay on the SQL tier.
#[test]
fn test_sql_tier_for_compilable_pipeline() {
    let store = store();
    let aggregator = Aggregator::new(&store);
    let out = aggregator
        .aggregate_json(
            "notes",
            &json!([{"$match": {"score": {"$gt": 4}}}, {"$sort": {"score": -1}}]),
            &ExecutionOptions::default(),
        )
        .unwrap();

    assert_eq!(out.tier(), Tier::Sql);
    assert_eq!(ids(out.into_vec()), vec![2, 3]);
    assert_eq!(aggregator.metrics().snapshot().fallbacks, 0);
}

/// Too many stages for one statement hands the pipeline to the staged tier.
#[test]
fn test_stage_limit_falls_back_to_staged() {
    let store = store();
    let aggregator = Aggregator::new(&store);
    let options = ExecutionOptions::default().with_max_sql_stages(2);
    let out = aggregator
        .aggregate_json(
            "notes",
            &json!([
                {"$match": {"score": {"$gte": 3}}},
                {"$sort": {"score": 1}},
                {"$limit": 2}
            ]),
            &options,
        )
        .unwrap();

    assert_eq!(out.tier(), Tier::Staged);
    assert_eq!(ids(out.into_vec()), vec![1, 3]);
    assert_eq!(aggregator.metrics().snapshot().fallbacks, 1);
}

/// An engine without ordered aggregates declines `$push`.
#[test]
fn test_missing_capability_falls_back() {
    let store = store().with_capabilities(Capabilities {
        ordered_aggregates: false,
        ..Capabilities::full()
    });
    let aggregator = Aggregator::new(&store);
    let out = aggregator
        .aggregate_json(
            "notes",
            &json!([{"$group": {"_id": null, "scores": {"$push": "$score"}}}]),
            &ExecutionOptions::default(),
        )
        .unwrap();

    assert_eq!(out.tier(), Tier::Staged);
    assert_eq!(out.into_vec(), vec![json!({"_id": null, "scores": [3, 8, 5]})]);
}

/// A complex expression skips the SQL attempt without counting a fallback.
#[test]
fn test_heuristic_skips_sql() {
    let store = store();
    let aggregator = Aggregator::new(&store);
    let pipeline = json!([{"$addFields": {
        "hasTags": {"$cond": [{"$gt": [{"$size": "$tags"}, 0]}, 1, 0]}
    }}]);

    let out = aggregator
        .aggregate_json("notes", &pipeline, &ExecutionOptions::default())
        .unwrap();
    assert_eq!(out.tier(), Tier::Staged);
    assert_eq!(aggregator.metrics().snapshot().fallbacks, 0);

    let flags: Vec<Value> = out.into_vec().iter().map(|d| d["hasTags"].clone()).collect();
    assert_eq!(flags, vec![json!(1), json!(1), json!(0)]);
}

/// Forcing the fallback always answers from the interpreter, with the
/// same documents.
#[test]
fn test_force_fallback_matches_sql() {
    let store = store();
    let pipeline = json!([
        {"$unwind": "$tags"},
        {"$group": {"_id": "$tags", "total": {"$sum": "$score"}}}
    ]);

    let sql = Aggregator::new(&store)
        .aggregate_json("notes", &pipeline, &ExecutionOptions::default())
        .unwrap();
    let forced = Aggregator::new(&store)
        .aggregate_json("notes", &pipeline, &ExecutionOptions::interpreter_only())
        .unwrap();

    assert_eq!(sql.tier(), Tier::Sql);
    assert_eq!(forced.tier(), Tier::Interpreter);
    assert_eq!(sql.into_vec(), forced.into_vec());
}

/// Without a store only the interpreter is available.
#[test]
fn test_in_memory_source_uses_interpreter() {
    let mut source = HashMap::new();
    source.insert(
        "notes".to_string(),
        vec![
            Document::new(2, json!({"score": 8})),
            Document::new(1, json!({"score": 3})),
        ],
    );
    let out = Aggregator::in_memory(&source)
        .aggregate_json(
            "notes",
            &json!([{"$match": {"score": {"$gt": 1}}}]),
            &ExecutionOptions::default(),
        )
        .unwrap();

    assert_eq!(out.tier(), Tier::Interpreter);
    assert_eq!(ids(out.into_vec()), vec![1, 2]);
}

// =============================================================================
// Text Search Tests
// =============================================================================

/// With a search collaborator, `$text` compiles to an id filter.
#[test]
fn test_text_with_search_index_runs_on_sql() {
    let store = store();
    let search = FixedSearch::new(&[("fox", &[1, 3])]);
    let out = Aggregator::new(&store)
        .with_search_index(&search)
        .aggregate_json(
            "notes",
            &json!([{"$match": {"$text": {"$search": "fox"}}}]),
            &ExecutionOptions::default(),
        )
        .unwrap();

    assert_eq!(out.tier(), Tier::Sql);
    assert_eq!(ids(out.into_vec()), vec![1, 3]);
}

/// Without one, `$text` matches whole words and leaves the SQL tier.
#[test]
fn test_text_without_search_index_matches_words() {
    let store = store();
    let out = Aggregator::new(&store)
        .aggregate_json(
            "notes",
            &json!([{"$match": {"$text": {"$search": "FOX"}}}]),
            &ExecutionOptions::default(),
        )
        .unwrap();

    assert_ne!(out.tier(), Tier::Sql);
    assert_eq!(ids(out.into_vec()), vec![1, 3]);
}

// =============================================================================
// Options Tests
// =============================================================================

/// Options load from a JSON file; absent fields keep their defaults.
#[test]
fn test_options_file() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("options.json");
    std::fs::write(&path, r#"{"force_fallback": true, "batch_size": 64}"#).unwrap();

    let options = ExecutionOptions::load(&path).unwrap();
    assert!(options.force_fallback);
    assert_eq!(options.batch_size, 64);
    assert_eq!(options.max_sql_stages, 32);

    let store = store();
    let out = Aggregator::new(&store)
        .aggregate_json("notes", &json!([{"$limit": 1}]), &options)
        .unwrap();
    assert_eq!(out.tier(), Tier::Interpreter);
}

/// Out-of-range options are rejected before anything runs.
#[test]
fn test_invalid_options_are_rejected() {
    assert!(ExecutionOptions::from_json_str(r#"{"batch_size": 0}"#).is_err());

    let store = store();
    let options = ExecutionOptions::default().with_max_sql_stages(0);
    let err = Aggregator::new(&store)
        .aggregate_json("notes", &json!([]), &options)
        .unwrap_err();
    assert!(err.is_fatal());
}
